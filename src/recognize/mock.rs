//! Demo recognition backend.
//!
//! Produces plausible randomised detections with simulated latency, so a dashboard
//! can run end to end without a recognition service.

use std::time::Duration;

use rand::Rng;

use super::http::RecognitionTransport;
use super::{BoundingBox, Detection, Identity, RecognitionError, RecognitionResponse};
use crate::frame::SampledFrame;

/// Mock transport. Roughly 30% of calls return no detections.
pub struct MockTransport {
    tokens: Vec<String>,
    latency: (Duration, Duration),
}

impl MockTransport {
    /// `tokens` are the identity tokens the mock may report; an unrecognized face is
    /// always a possible outcome as well.
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            latency: (Duration::from_millis(100), Duration::from_millis(300)),
        }
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = (min, max.max(min));
        self
    }

    pub fn generate(&self, frame_width: u32, frame_height: u32) -> RecognitionResponse {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(0.3) {
            return RecognitionResponse::default();
        }

        let count = if rng.gen_bool(0.5) { 1 } else { rng.gen_range(1..=3) };
        let detections = (0..count)
            .map(|index| {
                let pick = rng.gen_range(0..=self.tokens.len());
                let identity = match self.tokens.get(pick) {
                    Some(token) => Identity::Known(token.clone()),
                    None => Identity::Unrecognized,
                };
                let width: f64 = 120.0 + rng.gen_range(0.0..40.0);
                let height: f64 = 150.0 + rng.gen_range(0.0..50.0);
                let x = 150.0 + index as f64 * 150.0 + rng.gen_range(0.0..50.0);
                let y: f64 = 100.0 + rng.gen_range(0.0..50.0);
                Detection {
                    identity,
                    bounding_box: BoundingBox::new(
                        x.min((frame_width as f64 - width).max(0.0)),
                        y.min((frame_height as f64 - height).max(0.0)),
                        width,
                        height,
                    ),
                    distance: Some(0.85 + rng.gen_range(0.0..0.14)),
                }
            })
            .collect();

        RecognitionResponse {
            detections,
            processing_time: Some(Duration::from_millis(rng.gen_range(50..150))),
        }
    }
}

impl RecognitionTransport for MockTransport {
    fn recognize(&self, frame: &SampledFrame) -> Result<RecognitionResponse, RecognitionError> {
        let (min, max) = self.latency;
        let (min_ms, max_ms) = (min.as_millis() as u64, max.as_millis() as u64);
        let delay_ms = if max_ms > min_ms {
            rand::thread_rng().gen_range(min_ms..=max_ms)
        } else {
            min_ms
        };
        std::thread::sleep(Duration::from_millis(delay_ms));
        Ok(self.generate(frame.width, frame.height))
    }
}
