//! Frame sampling.
//!
//! - `VideoFrame`: decoded RGB8 pixels of the live stream.
//! - `SampledFrame`: immutable encoded snapshot produced once per sampling tick.
//! - `FrameSampler`: rasterizes a `VideoFrame` onto its canvas and encodes it as JPEG.
//!
//! Sampling never fails loudly: when the stream is not decodable, or reports zero
//! dimensions, `sample` returns `None` and the caller skips the tick.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub const DEFAULT_JPEG_QUALITY: f32 = 0.85;
pub const DEFAULT_MAX_DIMENSION: u32 = 800;
pub const DEFAULT_EXACT_WIDTH: u32 = 1280;
pub const DEFAULT_EXACT_HEIGHT: u32 = 740;

// ----------------------------------------------------------------------------
// VideoFrame: decoded pixels from the sink
// ----------------------------------------------------------------------------

/// Decoded RGB8 frame as delivered by a video stream.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl VideoFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn into_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels)
    }
}

// ----------------------------------------------------------------------------
// SampledFrame: encoded snapshot in its own coordinate space
// ----------------------------------------------------------------------------

/// Width and height of a sampled frame. Detection boxes live in this space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Encoded frame produced by one sampling tick.
#[derive(Clone, Debug)]
pub struct SampledFrame {
    payload: Vec<u8>,
    /// Output dimensions (after scaling).
    pub width: u32,
    pub height: u32,
    /// Source dimensions (before scaling).
    pub source_width: u32,
    pub source_height: u32,
    pub captured_at: SystemTime,
}

impl SampledFrame {
    pub fn new(
        payload: Vec<u8>,
        width: u32,
        height: u32,
        source_width: u32,
        source_height: u32,
        captured_at: SystemTime,
    ) -> Self {
        Self {
            payload,
            width,
            height,
            source_width,
            source_height,
            captured_at,
        }
    }

    /// JPEG bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn dims(&self) -> FrameDims {
        FrameDims::new(self.width, self.height)
    }

    /// Base64 payload without a data-URL prefix, as sent to the backend.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(&self.payload)
    }
}

// ----------------------------------------------------------------------------
// FrameSampler
// ----------------------------------------------------------------------------

/// How sampled frames are sized.
///
/// Which one applies is deployment specific: fixed-contract backends expect
/// `Exact`, generic backends are served by `Proportional`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingMode {
    Exact { width: u32, height: u32 },
    Proportional { max_dimension: u32 },
}

impl Default for SamplingMode {
    fn default() -> Self {
        SamplingMode::Exact {
            width: DEFAULT_EXACT_WIDTH,
            height: DEFAULT_EXACT_HEIGHT,
        }
    }
}

impl SamplingMode {
    /// Output dimensions for a source of the given size.
    pub fn output_dimensions(&self, source_width: u32, source_height: u32) -> (u32, u32) {
        match *self {
            SamplingMode::Exact { width, height } => (width, height),
            SamplingMode::Proportional { max_dimension } => {
                proportional_dimensions(source_width, source_height, max_dimension)
            }
        }
    }
}

/// Scale `width`x`height` so the longer side is at most `max_dimension`.
///
/// Never upscales. Aspect ratio is preserved up to rounding.
pub fn proportional_dimensions(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width <= max_dimension && height <= max_dimension {
        return (width, height);
    }
    let scale = f64::min(
        max_dimension as f64 / width as f64,
        max_dimension as f64 / height as f64,
    );
    let scaled_width = (width as f64 * scale).round().max(1.0) as u32;
    let scaled_height = (height as f64 * scale).round().max(1.0) as u32;
    (scaled_width, scaled_height)
}

/// Sampler configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerConfig {
    pub mode: SamplingMode,
    /// JPEG quality in (0, 1].
    pub jpeg_quality: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            mode: SamplingMode::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Rasterizes video frames into encoded `SampledFrame`s.
///
/// The canvas is owned exclusively; `sample` takes `&mut self`, so a draw and a read
/// can never overlap.
pub struct FrameSampler {
    config: SamplerConfig,
    canvas: RgbImage,
    frames_sampled: u64,
}

impl FrameSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            canvas: RgbImage::new(0, 0),
            frames_sampled: 0,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn frames_sampled(&self) -> u64 {
        self.frames_sampled
    }

    /// Produce a sampled frame, or `None` when this tick should be skipped.
    pub fn sample(&mut self, frame: Option<VideoFrame>, captured_at: SystemTime) -> Option<SampledFrame> {
        let Some(frame) = frame else {
            log::debug!("FrameSampler: video not ready, skipping tick");
            return None;
        };
        let (source_width, source_height) = (frame.width, frame.height);
        if source_width == 0 || source_height == 0 {
            log::debug!("FrameSampler: zero video dimensions, skipping tick");
            return None;
        }
        let (width, height) = self.config.mode.output_dimensions(source_width, source_height);
        if width == 0 || height == 0 {
            log::warn!("FrameSampler: zero output dimensions, skipping tick");
            return None;
        }
        let Some(image) = frame.into_image() else {
            log::warn!(
                "FrameSampler: pixel buffer does not match {}x{}, skipping tick",
                source_width,
                source_height
            );
            return None;
        };

        self.canvas = if (width, height) == (source_width, source_height) {
            image
        } else {
            image::imageops::resize(&image, width, height, FilterType::Triangle)
        };

        let mut payload = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut payload, jpeg_quality_percent(self.config.jpeg_quality));
        if let Err(err) = self.canvas.write_with_encoder(encoder) {
            log::warn!("FrameSampler: jpeg encode failed: {}", err);
            return None;
        }

        self.frames_sampled += 1;
        Some(SampledFrame::new(
            payload,
            width,
            height,
            source_width,
            source_height,
            captured_at,
        ))
    }
}

fn jpeg_quality_percent(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> VideoFrame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128]);
            }
        }
        VideoFrame::new(pixels, width, height)
    }

    #[test]
    fn proportional_caps_longer_side() {
        assert_eq!(proportional_dimensions(1280, 720, 800), (800, 450));
        assert_eq!(proportional_dimensions(720, 1280, 800), (450, 800));
        assert_eq!(proportional_dimensions(640, 480, 800), (640, 480));
        assert_eq!(proportional_dimensions(800, 800, 800), (800, 800));
    }

    #[test]
    fn exact_mode_ignores_source_aspect() {
        let mode = SamplingMode::Exact {
            width: 1280,
            height: 740,
        };
        assert_eq!(mode.output_dimensions(640, 480), (1280, 740));
    }

    #[test]
    fn sample_produces_decodable_jpeg() {
        let mut sampler = FrameSampler::new(SamplerConfig {
            mode: SamplingMode::Proportional { max_dimension: 64 },
            jpeg_quality: 0.85,
        });
        let frame = sampler
            .sample(Some(gradient(128, 96)), SystemTime::now())
            .expect("sampled frame");
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!((frame.source_width, frame.source_height), (128, 96));
        assert_eq!(&frame.payload()[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(frame.payload()).expect("decode jpeg");
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        assert!(!frame.to_base64().starts_with("data:"));
        assert_eq!(sampler.frames_sampled(), 1);
    }

    #[test]
    fn sample_skips_when_not_ready() {
        let mut sampler = FrameSampler::new(SamplerConfig::default());
        assert!(sampler.sample(None, SystemTime::now()).is_none());
        assert!(sampler
            .sample(Some(VideoFrame::new(vec![], 0, 0)), SystemTime::now())
            .is_none());
        assert!(sampler
            .sample(Some(VideoFrame::new(vec![0; 10], 4, 4)), SystemTime::now())
            .is_none());
        assert_eq!(sampler.frames_sampled(), 0);
    }

    #[test]
    fn quality_maps_to_percent() {
        assert_eq!(jpeg_quality_percent(0.85), 85);
        assert_eq!(jpeg_quality_percent(1.0), 100);
        assert_eq!(jpeg_quality_percent(0.0), 1);
    }
}
