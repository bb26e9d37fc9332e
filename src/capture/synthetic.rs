//! Synthetic camera (`stub://...`) for tests and demos.
//!
//! The device path selects the behaviour:
//! - `stub://denied` fails with a permission error
//! - `stub://missing` fails with device-not-found
//! - `stub://busy` fails with device-not-readable
//! - `stub://overconstrained` fails with an unsupported configuration
//! - anything else yields a stream at the ideal resolution
//!
//! Streams report their dimensions after a short warm-up so the `initializing`
//! state is observable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{CameraDevice, CameraError, CameraErrorKind, DeviceConstraints, VideoStream};
use crate::frame::VideoFrame;

const MAX_SYNTHETIC_DIMENSION: u32 = 4096;

#[derive(Default)]
struct Shared {
    live: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
    frames_dropped: AtomicBool,
    failure: Mutex<Option<CameraErrorKind>>,
}

/// Synthetic camera device. Clones share handle accounting.
#[derive(Clone)]
pub struct SyntheticCamera {
    path: String,
    warmup_polls: u32,
    shared: Arc<Shared>,
}

impl SyntheticCamera {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            warmup_polls: 1,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Number of metadata polls that report "not ready" before dimensions appear.
    pub fn with_warmup(mut self, polls: u32) -> Self {
        self.warmup_polls = polls;
        self
    }

    /// Streams currently holding the device.
    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of streams ever alive at once.
    pub fn peak_handles(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    /// Total successful opens.
    pub fn opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Make live streams report a device error on their next poll.
    pub fn inject_failure(&self, kind: CameraErrorKind) {
        if let Ok(mut failure) = self.shared.failure.lock() {
            *failure = Some(kind);
        }
    }

    /// While set, live streams stay healthy but have no decodable frame.
    pub fn drop_frames(&self, dropped: bool) {
        self.shared.frames_dropped.store(dropped, Ordering::SeqCst);
    }

    pub fn clear_failure(&self) {
        if let Ok(mut failure) = self.shared.failure.lock() {
            *failure = None;
        }
    }

    fn scripted_failure(&self) -> Option<CameraErrorKind> {
        match self.path.trim_start_matches("stub://") {
            "denied" => Some(CameraErrorKind::Permission),
            "missing" => Some(CameraErrorKind::NotFound),
            "busy" => Some(CameraErrorKind::NotReadable),
            "overconstrained" => Some(CameraErrorKind::Overconstrained),
            _ => None,
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self, constraints: &DeviceConstraints) -> Result<Box<dyn VideoStream>, CameraError> {
        if let Some(kind) = self.scripted_failure() {
            return Err(CameraError::with_detail(kind, self.path.clone()));
        }
        let (width, height) = (constraints.ideal_width, constraints.ideal_height);
        if width == 0
            || height == 0
            || width > MAX_SYNTHETIC_DIMENSION
            || height > MAX_SYNTHETIC_DIMENSION
        {
            return Err(CameraError::with_detail(
                CameraErrorKind::Overconstrained,
                format!("{}x{} unsupported", width, height),
            ));
        }

        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak.fetch_max(live, Ordering::SeqCst);
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "SyntheticCamera: opened {} ({}x{}, {:?})",
            self.path,
            width,
            height,
            constraints.facing
        );

        Ok(Box::new(SyntheticStream {
            width,
            height,
            warmup_remaining: self.warmup_polls,
            frame_count: 0,
            running: true,
            shared: self.shared.clone(),
        }))
    }
}

struct SyntheticStream {
    width: u32,
    height: u32,
    warmup_remaining: u32,
    frame_count: u64,
    running: bool,
    shared: Arc<Shared>,
}

impl SyntheticStream {
    /// Static gradient with a slowly drifting offset.
    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl VideoStream for SyntheticStream {
    fn poll_metadata(&mut self) -> Result<Option<(u32, u32)>, CameraError> {
        if !self.running {
            return Err(CameraError::with_detail(
                CameraErrorKind::NotReadable,
                "stream stopped",
            ));
        }
        let injected = self.shared.failure.lock().ok().and_then(|f| *f);
        if let Some(kind) = injected {
            return Err(CameraError::with_detail(kind, "injected failure"));
        }
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return Ok(None);
        }
        Ok(Some((self.width, self.height)))
    }

    fn current_frame(&mut self) -> Option<VideoFrame> {
        if !self.running
            || self.warmup_remaining > 0
            || self.shared.frames_dropped.load(Ordering::SeqCst)
        {
            return None;
        }
        self.frame_count += 1;
        Some(VideoFrame::new(self.generate_pixels(), self.width, self.height))
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.running)
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
    }
}
