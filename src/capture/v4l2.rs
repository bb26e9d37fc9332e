//! V4L2 camera device.
//!
//! This module provides `V4l2Camera` for capturing from local V4L2 device nodes
//! (e.g., /dev/video0).
//!
//! The V4L2 camera is responsible for:
//! - Opening the device node with the requested ideal resolution
//! - Negotiating a pixel format (MJPG, then YUYV, then RGB3)
//! - Mapping OS failures onto the camera failure taxonomy
//! - Reporting decoded dimensions once the first buffer arrives
//! - Releasing the device when the stream stops
//!
//! Buffer dequeues wait at most `STREAM_TIMEOUT`, so a stalled device never blocks the
//! caller's loop; an expired wait reads as "no frame yet".
//!
//! V4L2 has no facing-mode concept; the facing preference is advisory and logged.

use std::io;
use std::time::Duration;

use ouroboros::self_referencing;

use super::{CameraDevice, CameraError, CameraErrorKind, DeviceConstraints, VideoStream};
use crate::frame::VideoFrame;

const EBUSY: i32 = 16;
const STREAM_BUFFERS: u32 = 4;
const STREAM_TIMEOUT: Duration = Duration::from_millis(100);

/// V4L2 camera device.
pub struct V4l2Camera {
    path: String,
}

impl V4l2Camera {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelLayout {
    Mjpeg,
    Yuyv,
    Rgb,
}

impl PixelLayout {
    /// Negotiation order. UVC webcams offer MJPG and YUYV; RGB3 is rare.
    const PREFERRED: [PixelLayout; 3] = [PixelLayout::Mjpeg, PixelLayout::Yuyv, PixelLayout::Rgb];

    fn fourcc(self) -> v4l::FourCC {
        match self {
            PixelLayout::Mjpeg => v4l::FourCC::new(b"MJPG"),
            PixelLayout::Yuyv => v4l::FourCC::new(b"YUYV"),
            PixelLayout::Rgb => v4l::FourCC::new(b"RGB3"),
        }
    }

    fn from_fourcc(fourcc: v4l::FourCC) -> Option<Self> {
        Self::PREFERRED.into_iter().find(|layout| layout.fourcc() == fourcc)
    }
}

impl CameraDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.path
    }

    fn open(&mut self, constraints: &DeviceConstraints) -> Result<Box<dyn VideoStream>, CameraError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.path).map_err(|err| map_io_error(&self.path, err))?;
        let mut requested = device.format().map_err(|err| map_io_error(&self.path, err))?;
        requested.width = constraints.ideal_width;
        requested.height = constraints.ideal_height;

        let mut negotiated = None;
        for layout in PixelLayout::PREFERRED {
            requested.fourcc = layout.fourcc();
            match device.set_format(&requested) {
                Ok(actual) => {
                    if let Some(layout) = PixelLayout::from_fourcc(actual.fourcc) {
                        negotiated = Some((actual, layout));
                        break;
                    }
                    log::debug!(
                        "V4l2Camera: {} answered {:?} with {:?}",
                        self.path,
                        layout,
                        actual.fourcc
                    );
                }
                Err(err) => log::debug!("V4l2Camera: {} rejected {:?}: {}", self.path, layout, err),
            }
        }
        let Some((format, layout)) = negotiated else {
            return Err(CameraError::with_detail(
                CameraErrorKind::Overconstrained,
                format!("{}: no supported pixel format", self.path),
            ));
        };

        log::info!(
            "V4l2Camera: opened {} ({}x{} {:?}, facing {:?} advisory)",
            self.path,
            format.width,
            format.height,
            layout,
            constraints.facing
        );

        let path = self.path.clone();
        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)?;
                stream.set_timeout(STREAM_TIMEOUT);
                Ok::<_, io::Error>(stream)
            },
        }
        .try_build()
        .map_err(|err| map_io_error(&path, err))?;

        Ok(Box::new(V4l2Stream {
            path: self.path.clone(),
            state: Some(state),
            layout,
            width: format.width,
            height: format.height,
            stride: format.stride,
            dimensions: None,
            first: None,
            fault: None,
        }))
    }
}

struct V4l2Stream {
    path: String,
    state: Option<DeviceState>,
    layout: PixelLayout,
    width: u32,
    height: u32,
    stride: u32,
    /// Set once the first buffer decoded.
    dimensions: Option<(u32, u32)>,
    /// First decoded frame, handed out by the next `current_frame`.
    first: Option<VideoFrame>,
    /// Device error seen while grabbing, reported by the next `poll_metadata`.
    fault: Option<CameraError>,
}

impl V4l2Stream {
    /// Dequeue and decode one buffer. `Ok(None)` when the wait expired or the buffer
    /// did not decode; `Err` only for device failures.
    fn grab(&mut self) -> Result<Option<VideoFrame>, CameraError> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().ok_or_else(|| {
            CameraError::with_detail(CameraErrorKind::NotReadable, "stream stopped")
        })?;
        let path = &self.path;
        let (layout, width, height, stride) = (self.layout, self.width, self.height, self.stride);
        state.with_mut(|fields| {
            let (buf, meta) = match fields.stream.next() {
                Ok(next) => next,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(err) => return Err(map_io_error(path, err)),
            };
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            let frame = match layout {
                PixelLayout::Mjpeg => match image::load_from_memory(&buf[..used]) {
                    Ok(image) => {
                        let rgb = image.into_rgb8();
                        let (w, h) = rgb.dimensions();
                        Some(VideoFrame::new(rgb.into_raw(), w, h))
                    }
                    Err(err) => {
                        log::warn!("V4l2Camera: {} dropped corrupt mjpeg buffer: {}", path, err);
                        None
                    }
                },
                PixelLayout::Yuyv => yuyv_to_rgb(buf, width, height, stride)
                    .map(|pixels| VideoFrame::new(pixels, width, height)),
                PixelLayout::Rgb => pack_rows(buf, width as usize * 3, height, stride)
                    .map(|pixels| VideoFrame::new(pixels, width, height)),
            };
            if frame.is_none() {
                log::debug!("V4l2Camera: {} dropped {} byte buffer", path, used);
            }
            Ok(frame)
        })
    }
}

impl VideoStream for V4l2Stream {
    fn poll_metadata(&mut self) -> Result<Option<(u32, u32)>, CameraError> {
        if let Some(err) = self.fault.take() {
            return Err(err);
        }
        if self.dimensions.is_some() {
            return Ok(self.dimensions);
        }
        let Some(frame) = self.grab()? else {
            return Ok(None);
        };
        self.dimensions = Some((frame.width, frame.height));
        self.first = Some(frame);
        Ok(self.dimensions)
    }

    fn current_frame(&mut self) -> Option<VideoFrame> {
        if let Some(frame) = self.first.take() {
            return Some(frame);
        }
        match self.grab() {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("V4l2Camera: {} frame unavailable: {}", self.path, err);
                self.fault = Some(err);
                None
            }
        }
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.state.is_some())
    }

    fn stop(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Camera: released {}", self.path);
        }
        self.first = None;
        self.dimensions = None;
    }
}

/// Copy `height` rows of `row_bytes` out of a buffer whose rows are `stride` apart.
fn pack_rows(buf: &[u8], row_bytes: usize, height: u32, stride: u32) -> Option<Vec<u8>> {
    let stride = (stride as usize).max(row_bytes);
    let height = height as usize;
    if height == 0 || buf.len() < stride * (height - 1) + row_bytes {
        return None;
    }
    if stride == row_bytes {
        return Some(buf[..row_bytes * height].to_vec());
    }
    let mut out = Vec::with_capacity(row_bytes * height);
    for row in buf.chunks(stride).take(height) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Some(out)
}

/// Convert packed YUYV 4:2:2 to RGB8 (BT.601, limited range).
fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32, stride: u32) -> Option<Vec<u8>> {
    let packed = pack_rows(buf, width as usize * 2, height, stride)?;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for quad in packed.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    Some(rgb)
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (i32::from(y) - 16).max(0) * 298;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |value: i32| ((value + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

fn map_io_error(path: &str, err: io::Error) -> CameraError {
    let kind = match err.kind() {
        io::ErrorKind::PermissionDenied => CameraErrorKind::Permission,
        io::ErrorKind::NotFound => CameraErrorKind::NotFound,
        _ if err.raw_os_error() == Some(EBUSY) => CameraErrorKind::NotReadable,
        io::ErrorKind::InvalidInput => CameraErrorKind::Overconstrained,
        _ => CameraErrorKind::Unknown,
    };
    CameraError::with_detail(kind, format!("{}: {}", path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_errors_map_onto_taxonomy() {
        let cases = [
            (io::Error::from(io::ErrorKind::PermissionDenied), CameraErrorKind::Permission),
            (io::Error::from(io::ErrorKind::NotFound), CameraErrorKind::NotFound),
            (io::Error::from_raw_os_error(EBUSY), CameraErrorKind::NotReadable),
            (io::Error::from(io::ErrorKind::InvalidInput), CameraErrorKind::Overconstrained),
            (io::Error::from(io::ErrorKind::Other), CameraErrorKind::Unknown),
        ];
        for (err, kind) in cases {
            assert_eq!(map_io_error("/dev/video0", err).kind, kind);
        }
    }

    #[test]
    fn missing_device_reports_not_found() {
        let mut camera = V4l2Camera::new("/dev/video-does-not-exist");
        let err = camera.open(&DeviceConstraints::default()).err().unwrap();
        assert_eq!(err.kind, CameraErrorKind::NotFound);
    }

    #[test]
    fn mjpeg_is_negotiated_first() {
        assert_eq!(PixelLayout::PREFERRED[0], PixelLayout::Mjpeg);
        assert_eq!(
            PixelLayout::from_fourcc(v4l::FourCC::new(b"YUYV")),
            Some(PixelLayout::Yuyv)
        );
        assert_eq!(PixelLayout::from_fourcc(v4l::FourCC::new(b"NV12")), None);
    }

    #[test]
    fn yuyv_converts_to_rgb() {
        // 2x2 image: white and black on the first row, mid grey on the second.
        let buf = [235, 128, 16, 128, 126, 128, 126, 128];
        let rgb = yuyv_to_rgb(&buf, 2, 2, 4).expect("converted");
        assert_eq!(rgb.len(), 2 * 2 * 3);
        assert_eq!(&rgb[0..3], &[255, 255, 255]);
        assert_eq!(&rgb[3..6], &[0, 0, 0]);
        assert!(rgb[6..].iter().all(|&c| (127..=129).contains(&c)));
    }

    #[test]
    fn yuyv_honours_row_stride() {
        // One 2x2 image with two bytes of padding per row.
        let buf = [16, 128, 16, 128, 9, 9, 235, 128, 235, 128, 9, 9];
        let rgb = yuyv_to_rgb(&buf, 2, 2, 6).expect("converted");
        assert_eq!(&rgb[0..6], &[0; 6]);
        assert_eq!(&rgb[6..12], &[255; 6]);
        assert!(yuyv_to_rgb(&buf[..7], 2, 2, 6).is_none());
    }
}
