//! Dashboard orchestrator.
//!
//! Composes capture, sampling, the request queue and the viewport mapper into one
//! session, driven cooperatively by `Dashboard::poll`:
//!
//! 1. poll the capture source and apply its state-change events
//! 2. drain recognition completions delivered by the dispatcher
//! 3. run a sampling tick when the timer is due and the camera is active
//!
//! Three state machines are tracked: the camera state, a connection state that
//! reflects the queue's last outcome, and a processing state for the current tick.
//! Component failures arrive as values (events, completions); nothing here panics or
//! propagates an error out of `poll`.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;

pub mod events;
pub mod metrics;

pub use events::{EventLog, RecognitionEvent, EVENT_LOG_CAPACITY};
pub use metrics::{PipelineMetrics, FPS_WINDOW};

use crate::capture::{open_device, CameraError, CameraState, CaptureEvent, CaptureSource, DeviceConstraints};
use crate::config::PipelineConfig;
use crate::frame::FrameSampler;
use crate::identity::{Directory, IdentityResolver};
use crate::overlay::{DisplayDims, Overlay, Viewport};
use crate::recognize::http::{HttpTransport, RecognitionTransport, ThreadDispatcher};
use crate::recognize::mock::MockTransport;
use crate::recognize::{
    Completion, Detection, Dispatcher, EnqueueOutcome, QueueEvent, QueueStats, RequestId,
    RequestQueue,
};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// Link to the recognition backend, as last observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

/// Phase of the current sampling tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Idle,
    Capturing,
    Sending,
    Processing,
    Complete,
    Error,
}

// ----------------------------------------------------------------------------
// Sample timer
// ----------------------------------------------------------------------------

/// Fixed-interval timer with a single owned schedule.
///
/// `start` replaces any running schedule. `fire` reports at most one tick per call
/// and skips ticks missed while the caller was busy, so ticks never pile up.
#[derive(Clone, Debug)]
pub struct SampleTimer {
    interval: Duration,
    next_due: Option<Instant>,
    schedules: u64,
}

impl SampleTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_SAMPLE_INTERVAL),
            next_due: None,
            schedules: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&mut self, now: Instant) {
        if self.next_due.is_some() {
            log::debug!("SampleTimer: replacing running schedule");
        }
        self.next_due = Some(now + self.interval);
        self.schedules += 1;
    }

    pub fn cancel(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Number of schedules ever started.
    pub fn schedules(&self) -> u64 {
        self.schedules
    }

    pub fn fire(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_due else {
            return false;
        };
        if now < due {
            return false;
        }
        let interval = self.interval.as_nanos().max(1);
        let late = now.duration_since(due).as_nanos();
        let missed = late / interval;
        if missed > 0 {
            log::debug!("SampleTimer: skipped {} missed ticks", missed);
        }
        // Next grid point strictly after `now`; the remainder is below one interval.
        let until_next = u64::try_from(interval - late % interval).unwrap_or(u64::MAX);
        self.next_due = Some(now + Duration::from_nanos(until_next));
        true
    }
}

// ----------------------------------------------------------------------------
// Status snapshot
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub camera: CameraState,
    pub camera_message: &'static str,
    pub camera_error: Option<String>,
    pub connection: ConnectionState,
    pub processing: ProcessingState,
    pub frame_count: u64,
    pub fps: usize,
    pub latency_ms: Option<u64>,
    pub detections: usize,
    pub active_tracks: usize,
    pub timer_running: bool,
    pub request_in_flight: bool,
    pub frame_pending: bool,
    pub failed_requests: u64,
}

/// Orchestrator settings taken from configuration.
#[derive(Clone, Debug)]
pub struct DashboardSettings {
    pub sample_interval: Duration,
    pub display: DisplayDims,
    pub mirrored: bool,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            display: DisplayDims::new(640.0, 480.0),
            mirrored: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Dashboard
// ----------------------------------------------------------------------------

pub struct Dashboard<D: Dispatcher> {
    capture: CaptureSource,
    sampler: FrameSampler,
    queue: RequestQueue<D>,
    completions: Receiver<Completion>,
    viewport: Viewport,
    resolver: Box<dyn IdentityResolver>,
    timer: SampleTimer,
    camera: CameraState,
    camera_error: Option<CameraError>,
    connection: ConnectionState,
    processing: ProcessingState,
    metrics: PipelineMetrics,
    events: EventLog,
    detections: Vec<Detection>,
    /// Requests with a lower id belong to an earlier session.
    session_floor: RequestId,
    last_failure_network: bool,
}

impl<D: Dispatcher> Dashboard<D> {
    pub fn new(
        capture: CaptureSource,
        sampler: FrameSampler,
        dispatcher: D,
        completions: Receiver<Completion>,
        resolver: Box<dyn IdentityResolver>,
        settings: DashboardSettings,
    ) -> Self {
        let queue = RequestQueue::new(dispatcher);
        let session_floor = queue.next_request_id();
        Self {
            capture,
            sampler,
            queue,
            completions,
            viewport: Viewport::new(settings.display, settings.mirrored),
            resolver,
            timer: SampleTimer::new(settings.sample_interval),
            camera: CameraState::Idle,
            camera_error: None,
            connection: ConnectionState::Disconnected,
            processing: ProcessingState::Idle,
            metrics: PipelineMetrics::new(),
            events: EventLog::default(),
            detections: Vec::new(),
            session_floor,
            last_failure_network: false,
        }
    }

    /// Start (or restart) the camera. Any live session is torn down first.
    pub fn start_camera(&mut self, now: Instant) {
        log::info!("Dashboard: starting camera {}", self.capture.device_name());
        self.timer.cancel();
        self.queue.clear();
        self.reset_session();
        self.session_floor = self.queue.next_request_id();
        self.capture.start();
        self.apply_capture_events(now);
    }

    /// Stop the camera from any state. In-flight requests are left to complete and
    /// are ignored when they do.
    pub fn stop_camera(&mut self, now: Instant) {
        self.timer.cancel();
        self.queue.clear();
        self.capture.stop();
        self.apply_capture_events(now);
        self.reset_session();
        self.session_floor = self.queue.next_request_id();
        log::info!("Dashboard: camera stopped");
    }

    /// Container resize notification.
    pub fn resize(&mut self, width: f64, height: f64) {
        if self.viewport.on_resize(width, height) {
            log::debug!("Dashboard: viewport resized to {}x{}", width, height);
        }
    }

    /// One cooperative step: capture, completions, then the timer.
    pub fn poll(&mut self, now: Instant) {
        self.capture.poll();
        self.apply_capture_events(now);

        loop {
            match self.completions.try_recv() {
                Ok(completion) => self.handle_completion(completion, now),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("Dashboard: completion channel closed");
                    break;
                }
            }
        }

        if self.timer.fire(now) {
            self.tick(now);
        }
    }

    /// Sample one frame and hand it to the queue. Only acts while the camera is
    /// active; a failed sample skips the tick.
    pub fn tick(&mut self, now: Instant) {
        if self.camera != CameraState::Active {
            return;
        }
        self.processing = ProcessingState::Capturing;
        let frame = self.capture.current_frame();
        let Some(sampled) = self.sampler.sample(frame, SystemTime::now()) else {
            log::debug!("Dashboard: frame not ready, skipping tick");
            self.processing = ProcessingState::Error;
            return;
        };

        self.metrics.record_frame(now);
        self.processing = ProcessingState::Sending;
        match self.queue.enqueue(sampled, now) {
            EnqueueOutcome::Dispatched(id) => {
                log::debug!("Dashboard: request {} dispatched", id);
                self.processing = ProcessingState::Processing;
                self.connection = if self.last_failure_network {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Connecting
                };
            }
            EnqueueOutcome::Coalesced { replaced } => {
                log::debug!("Dashboard: request in flight, frame held (replaced={})", replaced);
            }
        }
    }

    /// Apply one completed request.
    pub fn handle_completion(&mut self, completion: Completion, now: Instant) {
        let Some(event) = self.queue.complete(completion, now) else {
            return;
        };
        let request_id = event.request_id();
        if request_id < self.session_floor || self.camera != CameraState::Active {
            log::debug!(
                "Dashboard: ignoring result of request {} from an inactive session",
                request_id
            );
            return;
        }

        match event {
            QueueEvent::Response {
                response,
                frame,
                latency,
                ..
            } => {
                self.processing = ProcessingState::Complete;
                self.connection = ConnectionState::Connected;
                self.last_failure_network = false;
                self.metrics.record_response(now, latency);
                self.viewport.set_frame(frame);

                if !response.detections.is_empty() {
                    let batch: Vec<_> = response
                        .detections
                        .iter()
                        .map(|d| {
                            (
                                self.resolver.resolve(&d.identity),
                                d.identity.clone(),
                                d.confidence(),
                            )
                        })
                        .collect();
                    let added = self.events.push_batch(batch, SystemTime::now());
                    log::info!(
                        "Dashboard: {} detection(s) in {} ms",
                        added,
                        latency.as_millis()
                    );
                }
                self.detections = response.detections;
            }
            QueueEvent::Failure { error, latency, .. } => {
                log::warn!("Dashboard: recognition request {} failed: {}", request_id, error);
                self.processing = ProcessingState::Error;
                self.connection = if error.is_network() {
                    ConnectionState::Error
                } else {
                    ConnectionState::Disconnected
                };
                self.last_failure_network = error.is_network();
                self.metrics.record_failure(latency);
            }
        }
    }

    pub fn overlays(&self) -> Vec<Overlay> {
        self.viewport.map(&self.detections, self.resolver.as_ref())
    }

    pub fn status(&self, now: Instant) -> SystemStatus {
        SystemStatus {
            camera: self.camera,
            camera_message: self
                .camera_error
                .as_ref()
                .map_or(self.camera.describe(), |err| err.explanation()),
            camera_error: self.camera_error.as_ref().map(|err| err.to_string()),
            connection: self.connection,
            processing: self.processing,
            frame_count: self.metrics.frame_count(),
            fps: self.metrics.fps(now),
            latency_ms: self.metrics.latency().map(|l| l.as_millis() as u64),
            detections: self.detections.len(),
            active_tracks: self.capture.active_tracks(),
            timer_running: self.timer.is_running(),
            request_in_flight: self.queue.is_busy(),
            frame_pending: self.queue.has_pending(),
            failed_requests: self.metrics.failed_requests(),
        }
    }

    pub fn recent_events(&self) -> impl Iterator<Item = &RecognitionEvent> {
        self.events.iter()
    }

    pub fn camera_state(&self) -> CameraState {
        self.camera
    }

    pub fn camera_error(&self) -> Option<&CameraError> {
        self.camera_error.as_ref()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn processing(&self) -> ProcessingState {
        self.processing
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn timer(&self) -> &SampleTimer {
        &self.timer
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn dispatcher(&self) -> &D {
        self.queue.dispatcher()
    }

    pub fn device_name(&self) -> &str {
        self.capture.device_name()
    }

    fn apply_capture_events(&mut self, now: Instant) {
        for CaptureEvent { state, error } in self.capture.drain_events() {
            let was = self.camera;
            self.camera = state;
            match state {
                CameraState::Active => {
                    self.camera_error = None;
                    if was != CameraState::Active {
                        self.timer.start(now);
                        log::info!(
                            "Dashboard: sampling every {} ms",
                            self.timer.interval().as_millis()
                        );
                    }
                }
                CameraState::Error | CameraState::Denied => {
                    self.timer.cancel();
                    self.queue.clear();
                    self.detections.clear();
                    self.processing = ProcessingState::Idle;
                    if let Some(err) = error {
                        log::warn!("Dashboard: {} ({})", err.explanation(), err);
                        self.camera_error = Some(err);
                    }
                }
                CameraState::Idle => {
                    self.timer.cancel();
                    self.camera_error = None;
                }
                CameraState::Requesting | CameraState::Initializing => {}
            }
        }
    }

    fn reset_session(&mut self) {
        self.metrics.reset();
        self.detections.clear();
        self.processing = ProcessingState::Idle;
        self.connection = ConnectionState::Disconnected;
        self.last_failure_network = false;
        self.camera_error = None;
    }
}

impl Dashboard<ThreadDispatcher> {
    /// Dashboard backed by a transport running on per-request threads.
    pub fn with_transport(
        capture: CaptureSource,
        sampler: FrameSampler,
        transport: Arc<dyn RecognitionTransport>,
        resolver: Box<dyn IdentityResolver>,
        settings: DashboardSettings,
    ) -> Self {
        let (dispatcher, completions) = ThreadDispatcher::new(transport);
        Self::new(capture, sampler, dispatcher, completions, resolver, settings)
    }

    /// Wire a full pipeline from configuration: device, sampler, HTTP or demo
    /// transport and the identity directory.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let device = open_device(&config.camera.device)
            .with_context(|| format!("open camera device {}", config.camera.device))?;
        let constraints = DeviceConstraints {
            facing: config.camera.facing,
            ideal_width: config.camera.ideal_width,
            ideal_height: config.camera.ideal_height,
        };
        let capture = CaptureSource::new(device, constraints);
        let sampler = FrameSampler::new(config.sampler.to_sampler_config());
        let directory = Directory::new(config.identities.clone());

        let transport: Arc<dyn RecognitionTransport> = if config.backend.demo {
            log::info!("Dashboard: demo mode, using mock recognition backend");
            Arc::new(MockTransport::new(directory.tokens()))
        } else {
            Arc::new(HttpTransport::new(config.backend.to_http_config())?)
        };

        let settings = DashboardSettings {
            sample_interval: config.sampler.interval,
            display: DisplayDims::new(config.viewport.width, config.viewport.height),
            mirrored: config.camera.mirrored,
        };
        Ok(Self::with_transport(
            capture,
            sampler,
            transport,
            Box::new(directory),
            settings,
        ))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
