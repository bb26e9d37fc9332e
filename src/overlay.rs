//! Result-to-viewport mapping.
//!
//! Detection boxes arrive in sampled-frame coordinates. The viewport renders the live
//! video at some other size, possibly mirrored (front camera preview). Mapping:
//!
//! ```text
//! scale_x = display_width  / frame_width    (1 when frame_width == 0)
//! scale_y = display_height / frame_height   (1 when frame_height == 0)
//! x' = x * scale_x, y' = y * scale_y, w' = w * scale_x, h' = h * scale_y
//! mirrored: x'' = display_width - x' - w'   (y is never flipped)
//! ```
//!
//! Scale factors are recomputed on every resize as well as on every new frame size,
//! so overlays stay aligned between samples.

use serde::Serialize;

use crate::frame::FrameDims;
use crate::identity::IdentityResolver;
use crate::recognize::{BoundingBox, Detection, Identity};

/// Rendered size of the viewport, in display pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DisplayDims {
    pub width: f64,
    pub height: f64,
}

impl DisplayDims {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ScaleFactors {
    pub x: f64,
    pub y: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self { x: 1.0, y: 1.0 }
    }
}

impl ScaleFactors {
    pub fn compute(frame: FrameDims, display: DisplayDims) -> Self {
        let x = if frame.width == 0 {
            1.0
        } else {
            display.width / frame.width as f64
        };
        let y = if frame.height == 0 {
            1.0
        } else {
            display.height / frame.height as f64
        };
        Self { x, y }
    }

    pub fn apply(&self, bbox: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            bbox.x * self.x,
            bbox.y * self.y,
            bbox.width * self.x,
            bbox.height * self.y,
        )
    }
}

/// Horizontal flip of a box inside a display of the given width.
///
/// Applying it twice with the same width restores x.
pub fn mirror_x(x: f64, width: f64, display_width: f64) -> f64 {
    display_width - x - width
}

/// A positioned overlay in display space.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Overlay {
    pub label: String,
    pub identity: Identity,
    pub confidence: Option<f64>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Viewport geometry shared by the mapper.
///
/// Written only by resize notifications and new-frame updates; read by `map`.
#[derive(Clone, Debug)]
pub struct Viewport {
    display: DisplayDims,
    frame: FrameDims,
    mirrored: bool,
    scale: ScaleFactors,
}

impl Viewport {
    pub fn new(display: DisplayDims, mirrored: bool) -> Self {
        let frame = FrameDims::default();
        Self {
            display,
            frame,
            mirrored,
            scale: ScaleFactors::compute(frame, display),
        }
    }

    pub fn display(&self) -> DisplayDims {
        self.display
    }

    pub fn frame(&self) -> FrameDims {
        self.frame
    }

    pub fn scale(&self) -> ScaleFactors {
        self.scale
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn set_mirrored(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }

    /// Resize notification from the container. Returns true if the size changed.
    pub fn on_resize(&mut self, width: f64, height: f64) -> bool {
        let display = DisplayDims::new(width.max(0.0), height.max(0.0));
        if display == self.display {
            return false;
        }
        self.display = display;
        self.recompute();
        true
    }

    /// Record the dimensions of the frame the current detections refer to.
    pub fn set_frame(&mut self, frame: FrameDims) {
        if frame != self.frame {
            self.frame = frame;
            self.recompute();
        }
    }

    /// Map one box from frame space into display space.
    pub fn map_box(&self, bbox: &BoundingBox) -> BoundingBox {
        let mut scaled = self.scale.apply(bbox);
        if self.mirrored {
            scaled.x = mirror_x(scaled.x, scaled.width, self.display.width);
        }
        scaled
    }

    pub fn map(&self, detections: &[Detection], resolver: &dyn IdentityResolver) -> Vec<Overlay> {
        detections
            .iter()
            .map(|detection| {
                let placed = self.map_box(&detection.bounding_box);
                Overlay {
                    label: resolver.resolve(&detection.identity),
                    identity: detection.identity.clone(),
                    confidence: detection.confidence(),
                    x: placed.x,
                    y: placed.y,
                    width: placed.width,
                    height: placed.height,
                }
            })
            .collect()
    }

    fn recompute(&mut self) {
        self.scale = ScaleFactors::compute(self.frame, self.display);
    }
}
