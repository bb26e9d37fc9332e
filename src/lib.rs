//! Presence Pipeline
//!
//! Live camera capture and face-recognition pipeline for attendance dashboards.
//!
//! # Architecture
//!
//! One cycle flows leaf to root:
//!
//! 1. **Capture**: a camera device is driven through
//!    idle / requesting / initializing / active / error / denied.
//! 2. **Sampling**: on a fixed timer the current video frame is rasterized and JPEG
//!    encoded, either at exact dimensions or proportionally capped.
//! 3. **Recognition**: frames go to the backend under a single-flight policy; a busy
//!    queue keeps only the newest frame.
//! 4. **Mapping**: detections (in sampled-frame coordinates) are scaled and optionally
//!    mirrored into viewport coordinates.
//!
//! The dashboard orchestrator owns all of it and is advanced cooperatively with
//! `Dashboard::poll`.
//!
//! # Module Structure
//!
//! - `capture`: camera state machine and device backends (synthetic, V4L2)
//! - `frame`: video frames, sampled frames, the sampler
//! - `recognize`: detection model, request queue, HTTP and mock transports
//! - `identity`: token to display-name resolution
//! - `overlay`: frame-to-viewport mapping
//! - `dashboard`: orchestration, metrics, event log
//! - `config`: file and environment configuration

pub mod capture;
pub mod config;
pub mod dashboard;
pub mod frame;
pub mod identity;
pub mod overlay;
pub mod recognize;

pub use capture::{
    open_device, CameraDevice, CameraError, CameraErrorKind, CameraState, CaptureEvent,
    CaptureSource, DeviceConstraints, FacingMode, SyntheticCamera, VideoStream,
};
#[cfg(feature = "camera-v4l2")]
pub use capture::V4l2Camera;
pub use config::PipelineConfig;
pub use dashboard::{
    ConnectionState, Dashboard, DashboardSettings, EventLog, PipelineMetrics, ProcessingState,
    RecognitionEvent, SampleTimer, SystemStatus,
};
pub use frame::{FrameDims, FrameSampler, SampledFrame, SamplerConfig, SamplingMode, VideoFrame};
pub use identity::{Directory, IdentityResolver};
pub use overlay::{mirror_x, DisplayDims, Overlay, ScaleFactors, Viewport};
pub use recognize::{
    BoundingBox, Completion, Detection, Dispatcher, EnqueueOutcome, HttpTransport, Identity,
    MockTransport, QueueEvent, RecognitionError, RecognitionErrorKind, RecognitionResponse,
    RecognitionTransport, RequestId, RequestQueue, RequestTicket, ThreadDispatcher,
};
