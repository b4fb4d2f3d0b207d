//! Threaded orchestrator around the synchronous [`Estimator`].
//!
//! Producers submit measurements through a bounded channel (blocking when
//! it is full). A single estimation thread merges them into a time-ordered
//! queue, processes them in order and publishes a snapshot after every
//! successfully processed event.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::GrayImage;
use nalgebra::{Matrix6, Vector3};
use tracing::{debug, error, info, warn};

use super::messages::{Command, Event};
use super::queue::EventQueue;
use super::shared_state::SharedState;
use super::snapshot::FilterSnapshot;
use crate::config::FilterConfig;
use crate::error::{VioError, VioResult};
use crate::filter::{Estimator, PoseMeasurement};
use crate::geometry::SE3;
use crate::imu::ImuSample;

/// Cloneable producer handle, e.g. one per driver thread.
#[derive(Clone)]
pub struct MeasurementSender {
    tx: Sender<Command>,
    shared: Arc<SharedState>,
}

impl MeasurementSender {
    fn admit(&self, timestamp: f64) -> VioResult<()> {
        if self.shared.is_shutdown_requested() {
            return Err(VioError::Disconnected);
        }
        if let Some(reason) = self.shared.divergence() {
            return Err(VioError::EstimationDivergence(reason));
        }
        if !timestamp.is_finite() {
            return Err(VioError::InvalidMeasurement(format!("timestamp {}", timestamp)));
        }
        let committed = self.shared.committed_timestamp();
        if timestamp < committed {
            return Err(VioError::StaleTimestamp { timestamp, committed });
        }
        Ok(())
    }

    fn send(&self, command: Command) -> VioResult<()> {
        self.tx.send(command).map_err(|_| VioError::Disconnected)
    }

    /// Queue an IMU sample: angular velocity (rad/s) and specific force (m/s²).
    pub fn submit_imu(
        &self,
        timestamp: f64,
        gyro: Vector3<f64>,
        accel: Vector3<f64>,
    ) -> VioResult<()> {
        let sample = ImuSample::new(timestamp, accel, gyro);
        self.admit(timestamp)?;
        if !sample.is_finite() {
            return Err(VioError::InvalidMeasurement("non-finite IMU sample".to_string()));
        }
        self.send(Command::Event(Event::Imu(sample)))
    }

    /// Queue a grayscale image from camera `camera`.
    pub fn submit_image(
        &self,
        timestamp: f64,
        camera: usize,
        image: impl Into<Arc<GrayImage>>,
    ) -> VioResult<()> {
        self.admit(timestamp)?;
        self.send(Command::Event(Event::Image { timestamp, camera, image: image.into() }))
    }

    /// Queue an absolute body pose `T_EB` in external frame `aux_index`.
    pub fn submit_pose(
        &self,
        timestamp: f64,
        aux_index: usize,
        pose: SE3,
        covariance: Matrix6<f64>,
    ) -> VioResult<()> {
        self.admit(timestamp)?;
        let measurement = PoseMeasurement {
            timestamp,
            aux_index,
            position: pose.translation,
            attitude: pose.rotation,
            covariance,
        };
        if !measurement.is_finite() {
            return Err(VioError::InvalidMeasurement("non-finite pose measurement".to_string()));
        }
        self.send(Command::Event(Event::Pose(measurement)))
    }
}

/// Visual-inertial estimator running on its own thread.
pub struct VioSystem {
    shared: Arc<SharedState>,
    sender: MeasurementSender,
    worker: Option<JoinHandle<()>>,
}

impl VioSystem {
    /// Validate `config`, build the estimator and spawn the estimation thread.
    pub fn new(config: FilterConfig) -> VioResult<Self> {
        let orchestrator = config.orchestrator.clone();
        let estimator = Estimator::new(config)?;
        let shared = SharedState::new(estimator.snapshot());
        let (tx, rx) = bounded::<Command>(orchestrator.queue_capacity.max(1));

        let worker = Worker {
            estimator,
            shared: shared.clone(),
            queue: EventQueue::new(orchestrator.reorder_horizon),
            idle: Duration::from_millis(orchestrator.idle_flush_ms.max(1)),
        };
        let handle = thread::spawn(move || worker.run(rx));
        info!("estimation thread started");

        Ok(Self {
            sender: MeasurementSender { tx, shared: shared.clone() },
            shared,
            worker: Some(handle),
        })
    }

    pub fn sender(&self) -> MeasurementSender {
        self.sender.clone()
    }

    pub fn submit_imu(
        &self,
        timestamp: f64,
        gyro: Vector3<f64>,
        accel: Vector3<f64>,
    ) -> VioResult<()> {
        self.sender.submit_imu(timestamp, gyro, accel)
    }

    pub fn submit_image(
        &self,
        timestamp: f64,
        camera: usize,
        image: impl Into<Arc<GrayImage>>,
    ) -> VioResult<()> {
        self.sender.submit_image(timestamp, camera, image)
    }

    pub fn submit_pose(
        &self,
        timestamp: f64,
        aux_index: usize,
        pose: SE3,
        covariance: Matrix6<f64>,
    ) -> VioResult<()> {
        self.sender.submit_pose(timestamp, aux_index, pose, covariance)
    }

    /// Most recently published snapshot.
    pub fn get_safe_state(&self) -> Arc<FilterSnapshot> {
        self.shared.snapshot()
    }

    /// Divergence of the current session, if any.
    pub fn divergence(&self) -> Option<crate::error::DivergenceReason> {
        self.shared.divergence()
    }

    /// Process everything queued, ignoring the reorder horizon. Returns
    /// once the estimation thread has caught up.
    pub fn flush(&self) -> VioResult<()> {
        let (ack, done) = bounded(1);
        self.sender.send(Command::Flush(ack))?;
        done.recv().map_err(|_| VioError::Disconnected)
    }

    /// Discard queued events and reinitialize to the configured prior.
    /// Returns once the reset snapshot is published.
    pub fn request_reset(&self) -> VioResult<()> {
        let (ack, done) = bounded(1);
        self.sender.send(Command::Reset(ack))?;
        done.recv().map_err(|_| VioError::Disconnected)
    }

    /// Run `f` on the estimation thread between two events and return its
    /// result.
    pub fn with_estimator<R, F>(&self, f: F) -> VioResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Estimator) -> R + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.sender.send(Command::Inspect(Box::new(move |estimator| {
            let _ = tx.send(f(estimator));
        })))?;
        rx.recv().map_err(|_| VioError::Disconnected)
    }

    /// Process what is queued and stop the estimation thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.sender.send(Command::Shutdown);
            self.shared.request_shutdown();
            if handle.join().is_err() {
                error!("estimation thread panicked");
            }
            info!("estimation thread stopped");
        }
    }
}

impl Drop for VioSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the estimation thread.
struct Worker {
    estimator: Estimator,
    shared: Arc<SharedState>,
    queue: EventQueue,
    idle: Duration,
}

impl Worker {
    fn run(mut self, rx: Receiver<Command>) {
        loop {
            match rx.recv_timeout(self.idle) {
                Ok(Command::Event(event)) => {
                    self.queue.push(event);
                    self.drain(false);
                }
                Ok(Command::Flush(ack)) => {
                    self.drain(true);
                    let _ = ack.send(());
                }
                Ok(Command::Reset(ack)) => {
                    self.queue.clear();
                    self.estimator.reset();
                    self.shared.set_divergence(None);
                    self.shared.republish(self.estimator.snapshot());
                    let _ = ack.send(());
                }
                Ok(Command::Inspect(f)) => f(&mut self.estimator),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.drain(true);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => self.drain(true),
            }
        }
    }

    fn drain(&mut self, all: bool) {
        loop {
            let next = if all { self.queue.pop_any() } else { self.queue.pop_ready() };
            match next {
                Some(event) => self.process(event),
                None => break,
            }
        }
    }

    fn process(&mut self, event: Event) {
        if self.estimator.is_diverged() {
            return;
        }
        let timestamp = event.timestamp();
        let committed = self.estimator.state().timestamp;
        if timestamp < committed {
            self.estimator.record_late_event();
            warn!(
                "dropping late {} event at t={:.6} (state at t={:.6})",
                event.kind(),
                timestamp,
                committed
            );
            return;
        }

        let result = match &event {
            Event::Imu(sample) => self.estimator.process_imu(*sample),
            Event::Image { timestamp, camera, image } => {
                self.estimator.process_image(*timestamp, *camera, image).map(|report| {
                    debug!(
                        "image t={:.6} cam {}: {} used, {} converged, +{} -{} features",
                        report.timestamp,
                        report.camera,
                        report.used,
                        report.converged,
                        report.added,
                        report.removed
                    );
                })
            }
            Event::Pose(measurement) => self.estimator.process_pose(measurement).map(|_| ()),
        };

        match result {
            Ok(()) => self.shared.publish(self.estimator.snapshot()),
            Err(e) if e.is_fatal() => {
                error!("{} event at t={:.6} failed: {}", event.kind(), timestamp, e);
                if let VioError::EstimationDivergence(reason) = e {
                    self.shared.set_divergence(Some(reason));
                }
            }
            Err(e) => warn!("dropping {} event at t={:.6}: {}", event.kind(), timestamp, e),
        }
    }
}
