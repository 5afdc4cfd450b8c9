//! A device-free source that synthesizes frames at the configured rate.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::capture::{CaptureError, CaptureSource, FrameSink};
use crate::pipeline::PipelineContext;
use crate::VideoConfig;

/// Paints a gradient with a bar sweeping one column per frame, so motion
/// is visible end to end without any hardware.
pub struct SyntheticSource {
    width: usize,
    height: usize,
    interval: Duration,
}

impl SyntheticSource {
    pub fn new(video: &VideoConfig) -> Self {
        Self {
            width: video.width as usize,
            height: video.height as usize,
            interval: Duration::from_secs(1) / video.fps.max(1),
        }
    }

    fn paint(&self, tick: u64, frame: &mut [u8]) {
        let bar = tick as usize % self.width;
        for row in 0..self.height {
            let shade_v = (row * 255 / self.height) as u8;
            for col in 0..self.width {
                let px = (row * self.width + col) * 4;
                if col == bar {
                    frame[px..px + 4].copy_from_slice(&[255, 255, 255, 255]);
                } else {
                    let shade_h = (col * 255 / self.width) as u8;
                    frame[px] = shade_h;
                    frame[px + 1] = shade_v;
                    frame[px + 2] = 255 - shade_h;
                    frame[px + 3] = 255;
                }
            }
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn run(
        self: Box<Self>,
        sink: Arc<dyn FrameSink>,
        ctx: Arc<PipelineContext>,
    ) -> Result<(), CaptureError> {
        info!(
            "synthetic source running, {}x{} every {:?}",
            self.width, self.height, self.interval
        );

        let mut frame = vec![0u8; self.width * self.height * 4];
        let mut tick = 0u64;
        let mut next = Instant::now();

        while !ctx.shutdown_requested() {
            self.paint(tick, &mut frame);
            sink.frame(&frame);
            tick += 1;

            next += self.interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                // fell behind, resync instead of bursting
                next = now;
            }
        }

        info!("synthetic source stopped after {tick} frames");
        Ok(())
    }
}
