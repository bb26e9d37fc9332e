//! Camera capture source.
//!
//! `CaptureSource` owns the single video device handle of a dashboard and drives it
//! through the camera state machine:
//!
//! ```text
//! idle -(start)-> requesting -(granted)-> initializing -(dimensions)-> active
//! requesting | initializing -(permission denied)-> denied
//! requesting | initializing | active -(device error)-> error
//! any -(stop)-> idle
//! ```
//!
//! Device backends:
//! - Synthetic devices (`stub://...`) for tests and demos
//! - V4L2 devices (feature: camera-v4l2)
//!
//! The capture source MUST NOT:
//! - Hold two live device handles at once (start tears down first)
//! - Report `active` before the sink has decoded frame dimensions
//! - Surface device failures as panics; they become states and events

use std::collections::VecDeque;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticCamera;
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Camera;

use crate::frame::VideoFrame;

/// Camera lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    #[default]
    Idle,
    Requesting,
    Initializing,
    Active,
    Error,
    Denied,
}

impl CameraState {
    pub fn describe(self) -> &'static str {
        match self {
            CameraState::Idle => "camera inactive",
            CameraState::Requesting => "requesting camera permission",
            CameraState::Initializing => "initializing camera",
            CameraState::Active => "camera active",
            CameraState::Error => "camera error",
            CameraState::Denied => "camera permission denied",
        }
    }

    /// States that only an explicit user retry can leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, CameraState::Error | CameraState::Denied)
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Failure taxonomy for device acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraErrorKind {
    Permission,
    NotFound,
    NotReadable,
    Overconstrained,
    Unknown,
}

impl CameraErrorKind {
    pub fn explanation(self) -> &'static str {
        match self {
            CameraErrorKind::Permission => {
                "Camera access was denied. Grant camera permission and try again."
            }
            CameraErrorKind::NotFound => {
                "No camera was found. Make sure a camera is connected to this device."
            }
            CameraErrorKind::NotReadable => {
                "The camera cannot be read. It may be in use by another application."
            }
            CameraErrorKind::Overconstrained => {
                "The requested camera configuration is not supported by this device."
            }
            CameraErrorKind::Unknown => "An unknown camera error occurred.",
        }
    }
}

/// A device-level failure. Carries the kind and an optional backend detail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraError {
    pub kind: CameraErrorKind,
    pub detail: Option<String>,
}

impl CameraError {
    pub fn new(kind: CameraErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: CameraErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn explanation(&self) -> &'static str {
        self.kind.explanation()
    }

    /// Camera state this failure leaves the source in.
    pub fn resulting_state(&self) -> CameraState {
        match self.kind {
            CameraErrorKind::Permission => CameraState::Denied,
            _ => CameraState::Error,
        }
    }
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({})", self.kind.explanation(), detail),
            None => f.write_str(self.kind.explanation()),
        }
    }
}

impl std::error::Error for CameraError {}

/// Which way the requested camera should face.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

/// Constraints passed to the device when requesting a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for DeviceConstraints {
    fn default() -> Self {
        Self {
            facing: FacingMode::User,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// A camera that can be asked for a stream.
///
/// `open` is the permission/acquisition suspension point. Implementations map their
/// native failures onto `CameraErrorKind`.
pub trait CameraDevice: Send {
    /// Device identifier (path or URL).
    fn name(&self) -> &str;

    fn open(&mut self, constraints: &DeviceConstraints) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// A live stream attached to the video sink.
pub trait VideoStream: Send {
    /// Decoded frame dimensions. `Ok(None)` while the sink is still initializing.
    fn poll_metadata(&mut self) -> Result<Option<(u32, u32)>, CameraError>;

    /// Latest decodable frame, if any.
    fn current_frame(&mut self) -> Option<VideoFrame>;

    /// Number of tracks still running.
    fn active_tracks(&self) -> usize;

    /// Stop every track. Must be idempotent.
    fn stop(&mut self);
}

/// State change emitted by the capture source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureEvent {
    pub state: CameraState,
    pub error: Option<CameraError>,
}

/// Owns one camera device and its live stream.
pub struct CaptureSource {
    device: Box<dyn CameraDevice>,
    constraints: DeviceConstraints,
    stream: Option<Box<dyn VideoStream>>,
    state: CameraState,
    last_error: Option<CameraError>,
    dimensions: Option<(u32, u32)>,
    events: VecDeque<CaptureEvent>,
}

impl CaptureSource {
    pub fn new(device: Box<dyn CameraDevice>, constraints: DeviceConstraints) -> Self {
        Self {
            device,
            constraints,
            stream: None,
            state: CameraState::Idle,
            last_error: None,
            dimensions: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn last_error(&self) -> Option<&CameraError> {
        self.last_error.as_ref()
    }

    /// True once the sink has reported dimensions and the source is active.
    pub fn is_ready(&self) -> bool {
        self.state == CameraState::Active && self.dimensions.is_some()
    }

    /// Decoded video dimensions of the active stream.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn active_tracks(&self) -> usize {
        self.stream.as_ref().map_or(0, |s| s.active_tracks())
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Request the device. Any live stream is torn down first.
    ///
    /// On success the source is `initializing`; `poll` promotes it to `active` once
    /// the sink reports its dimensions.
    pub fn start(&mut self) {
        if self.stream.is_some() || self.state != CameraState::Idle {
            log::info!(
                "CaptureSource: restarting {} (was {:?})",
                self.device.name(),
                self.state
            );
            self.teardown();
        }

        self.last_error = None;
        self.transition(CameraState::Requesting, None);
        log::info!(
            "CaptureSource: requesting {} facing={:?} ideal={}x{}",
            self.device.name(),
            self.constraints.facing,
            self.constraints.ideal_width,
            self.constraints.ideal_height
        );

        match self.device.open(&self.constraints) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.transition(CameraState::Initializing, None);
                // Some sinks report metadata immediately.
                self.poll();
            }
            Err(err) => self.fail(err),
        }
    }

    /// Advance initialization and watch the active stream for device errors.
    pub fn poll(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match self.state {
            CameraState::Initializing => match stream.poll_metadata() {
                Ok(Some((width, height))) if width > 0 && height > 0 => {
                    self.dimensions = Some((width, height));
                    log::info!(
                        "CaptureSource: {} active ({}x{})",
                        self.device.name(),
                        width,
                        height
                    );
                    self.transition(CameraState::Active, None);
                }
                Ok(_) => {}
                Err(err) => self.fail(err),
            },
            CameraState::Active => {
                if let Err(err) = stream.poll_metadata() {
                    self.fail(err);
                }
            }
            _ => {}
        }
    }

    /// Latest frame from the sink. `None` unless the source is active.
    pub fn current_frame(&mut self) -> Option<VideoFrame> {
        if self.state != CameraState::Active {
            return None;
        }
        self.stream.as_mut().and_then(|s| s.current_frame())
    }

    /// Stop all tracks, detach the sink and return to `idle`.
    ///
    /// Safe in every state, including mid-initialization.
    pub fn stop(&mut self) {
        let was = self.state;
        self.teardown();
        self.last_error = None;
        if was != CameraState::Idle {
            self.transition(CameraState::Idle, None);
            log::info!("CaptureSource: {} stopped", self.device.name());
        }
    }

    /// Drain state-change events emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<CaptureEvent> {
        self.events.drain(..).collect()
    }

    fn fail(&mut self, err: CameraError) {
        log::warn!("CaptureSource: {} failed: {}", self.device.name(), err);
        self.teardown();
        let state = err.resulting_state();
        self.last_error = Some(err.clone());
        self.transition(state, Some(err));
    }

    fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        self.dimensions = None;
    }

    fn transition(&mut self, state: CameraState, error: Option<CameraError>) {
        self.state = state;
        self.events.push_back(CaptureEvent { state, error });
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Select a device backend for a configured path.
pub fn open_device(path: &str) -> Result<Box<dyn CameraDevice>> {
    if path.trim().is_empty() {
        return Err(anyhow!("camera device path must not be empty"));
    }
    if path.starts_with("stub://") {
        return Ok(Box::new(SyntheticCamera::new(path)));
    }
    if path.contains("://") {
        return Err(anyhow!(
            "unsupported camera device '{}'; expected a local device path or stub://",
            path
        ));
    }
    #[cfg(feature = "camera-v4l2")]
    {
        Ok(Box::new(V4l2Camera::new(path)))
    }
    #[cfg(not(feature = "camera-v4l2"))]
    {
        Err(anyhow!(
            "camera device '{}' requires the camera-v4l2 feature",
            path
        ))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn source(path: &str) -> (CaptureSource, SyntheticCamera) {
        let camera = SyntheticCamera::new(path);
        let observer = camera.clone();
        (
            CaptureSource::new(Box::new(camera), DeviceConstraints::default()),
            observer,
        )
    }

    fn states(events: &[CaptureEvent]) -> Vec<CameraState> {
        events.iter().map(|e| e.state).collect()
    }

    #[test]
    fn start_walks_through_requesting_and_initializing() {
        let (mut src, _) = source("stub://front");
        src.start();
        assert_eq!(src.state(), CameraState::Initializing);
        assert!(!src.is_ready());

        src.poll();
        assert_eq!(src.state(), CameraState::Active);
        assert!(src.is_ready());
        assert_eq!(src.dimensions(), Some((1280, 720)));
        assert_eq!(
            states(&src.drain_events()),
            vec![
                CameraState::Requesting,
                CameraState::Initializing,
                CameraState::Active
            ]
        );
    }

    #[test]
    fn permission_failure_lands_in_denied() {
        let (mut src, _) = source("stub://denied");
        src.start();
        assert_eq!(src.state(), CameraState::Denied);
        assert_eq!(
            src.last_error().map(|e| e.kind),
            Some(CameraErrorKind::Permission)
        );
        assert_eq!(src.active_tracks(), 0);
    }

    #[test]
    fn device_failures_land_in_error() {
        for (path, kind) in [
            ("stub://missing", CameraErrorKind::NotFound),
            ("stub://busy", CameraErrorKind::NotReadable),
            ("stub://overconstrained", CameraErrorKind::Overconstrained),
        ] {
            let (mut src, _) = source(path);
            src.start();
            assert_eq!(src.state(), CameraState::Error, "{}", path);
            assert_eq!(src.last_error().map(|e| e.kind), Some(kind));
            assert!(src.state().is_terminal());
        }
    }

    #[test]
    fn stop_from_every_state_returns_to_idle() {
        let (mut src, observer) = source("stub://front");
        src.stop();
        assert_eq!(src.state(), CameraState::Idle);

        src.start();
        assert_eq!(src.state(), CameraState::Initializing);
        src.stop();
        assert_eq!(src.state(), CameraState::Idle);
        assert_eq!(src.active_tracks(), 0);
        assert_eq!(observer.live_handles(), 0);

        // A stopped initialization must not come back to life.
        src.poll();
        assert_eq!(src.state(), CameraState::Idle);

        src.start();
        src.poll();
        assert_eq!(src.state(), CameraState::Active);
        src.stop();
        src.stop();
        assert_eq!(src.state(), CameraState::Idle);
        assert_eq!(observer.live_handles(), 0);

        let (mut denied, _) = source("stub://denied");
        denied.start();
        denied.stop();
        assert_eq!(denied.state(), CameraState::Idle);
        assert!(denied.last_error().is_none());
    }

    #[test]
    fn restart_never_holds_two_handles() {
        let (mut src, observer) = source("stub://front");
        src.start();
        src.poll();
        assert_eq!(observer.live_handles(), 1);

        src.start();
        assert_eq!(observer.live_handles(), 1);
        assert_eq!(observer.peak_handles(), 1);
        src.poll();
        assert_eq!(src.state(), CameraState::Active);
    }

    #[test]
    fn device_error_while_active_moves_to_error() {
        let (mut src, observer) = source("stub://front");
        src.start();
        src.poll();
        observer.inject_failure(CameraErrorKind::NotReadable);
        src.poll();
        assert_eq!(src.state(), CameraState::Error);
        assert_eq!(src.active_tracks(), 0);
        assert!(src.current_frame().is_none());
    }

    #[test]
    fn frames_only_flow_while_active() {
        let (mut src, _) = source("stub://front");
        assert!(src.current_frame().is_none());
        src.start();
        assert!(src.current_frame().is_none());
        src.poll();
        let frame = src.current_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (1280, 720));
    }

    #[test]
    fn open_device_rejects_remote_urls() {
        assert!(open_device("http://camera/stream").is_err());
        assert!(open_device("").is_err());
        assert!(open_device("stub://front").is_ok());
    }

    #[test]
    fn error_display_includes_explanation() {
        let err = CameraError::with_detail(CameraErrorKind::NotFound, "/dev/video9");
        let text = err.to_string();
        assert!(text.contains("No camera was found"));
        assert!(text.contains("/dev/video9"));
        assert_eq!(err.resulting_state(), CameraState::Error);
    }
}
