//! V4L2 capture via memory-mapped streaming.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{CaptureError, CaptureSource, FrameSink};
use crate::convert;
use crate::pipeline::PipelineContext;
use crate::{CaptureConfig, VideoConfig};

/// A V4L2 device streaming YUYV, converted to BGRA on the capture thread.
pub struct V4l2Source {
    device: Device,
    width: u32,
    height: u32,
    buffer_count: u32,
}

impl V4l2Source {
    /// Opens and configures the device; auto-detects one when no path is
    /// given. The driver must accept the exact geometry, a silently
    /// adjusted format would corrupt every downstream buffer.
    pub fn open(capture: &CaptureConfig, video: &VideoConfig) -> Result<Self, CaptureError> {
        let path = if capture.device.is_empty() {
            detect()?
        } else {
            capture.device.clone()
        };
        info!("opening capture device {path}");

        let device = Device::with_path(&path)?;
        let caps = device.query_caps()?;
        info!("device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Format(format!(
                "{path} does not support video capture"
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = video.width;
        fmt.height = video.height;
        fmt.fourcc = FourCC::new(b"YUYV");
        let fmt = device.set_format(&fmt)?;

        if fmt.fourcc != FourCC::new(b"YUYV") {
            return Err(CaptureError::Format(format!(
                "driver kept fourcc {}",
                fmt.fourcc
            )));
        }
        if fmt.width != video.width || fmt.height != video.height {
            return Err(CaptureError::Format(format!(
                "driver kept {}x{} instead of {}x{}",
                fmt.width, fmt.height, video.width, video.height
            )));
        }

        Ok(Self {
            device,
            width: video.width,
            height: video.height,
            buffer_count: capture.buffer_count,
        })
    }
}

impl CaptureSource for V4l2Source {
    fn run(
        self: Box<Self>,
        sink: Arc<dyn FrameSink>,
        ctx: Arc<PipelineContext>,
    ) -> Result<(), CaptureError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
        info!("capture stream started with {} buffers", self.buffer_count);

        let yuyv_len = (self.width * self.height * 2) as usize;
        let mut bgra = vec![0u8; (self.width * self.height * 4) as usize];

        while !ctx.shutdown_requested() {
            let (buf, _meta) = stream.next()?;
            if buf.len() < yuyv_len {
                sink.format_changed(&format!(
                    "driver delivered {} of {yuyv_len} bytes",
                    buf.len()
                ));
                break;
            }
            convert::yuyv_to_bgra(
                &buf[..yuyv_len],
                self.width as usize,
                self.height as usize,
                &mut bgra,
            );
            sink.frame(&bgra);
        }

        info!("capture stream stopped");
        Ok(())
    }
}

/// Scans /dev/video0..9 for a YUYV-capable capture device.
fn detect() -> Result<String, CaptureError> {
    for i in 0..10 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(device) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = device.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = device.enum_formats() else {
            continue;
        };
        if formats.iter().any(|f| f.fourcc == FourCC::new(b"YUYV")) {
            info!("found YUYV device {path} ({})", caps.card);
            return Ok(path);
        }
    }
    Err(CaptureError::NoDevice)
}
