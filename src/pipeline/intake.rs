//! The stage that runs inside the capture callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::capture::FrameSink;
use crate::frame::FramePool;
use crate::pipeline::{DelayBuffer, PipelineContext};
use crate::PipelineConfig;

/// Accepts raw frames on the capture thread and feeds the delay buffer.
///
/// Everything here is constant-time and lock-light: cadence filtering,
/// the backpressure check, one buffer copy, one push. The capture thread
/// is never made to wait, frames are shed instead.
pub struct Intake {
    ctx: Arc<PipelineContext>,
    delay: Arc<DelayBuffer>,
    pool: Arc<FramePool>,
    delay_depth: usize,
    cadence_divisor: u64,
    accepted: AtomicU64,
}

impl Intake {
    pub fn new(
        ctx: Arc<PipelineContext>,
        delay: Arc<DelayBuffer>,
        pool: Arc<FramePool>,
        config: &PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            delay,
            pool,
            delay_depth: config.delay_depth,
            cadence_divisor: u64::from(config.cadence_divisor.max(1)),
            accepted: AtomicU64::new(0),
        })
    }

    /// Frames accepted so far; also the next sequence number.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl FrameSink for Intake {
    fn frame(&self, data: &[u8]) {
        if self.ctx.shutdown_requested() {
            return;
        }

        // counts every delivery and may trip the frame limit; the frame
        // that trips it still goes through
        let delivered = self.ctx.note_captured();

        if (delivered - 1) % self.cadence_divisor != 0 {
            return;
        }

        if data.len() != self.pool.frame_size() {
            warn!(
                got = data.len(),
                need = self.pool.frame_size(),
                "capture delivered a frame of the wrong size"
            );
            return;
        }

        if self.delay.len() >= self.delay_depth {
            let dropped = self.ctx.counters.add_intake_dropped();
            debug!(dropped, "delay buffer full, dropping frame at intake");
            return;
        }

        let mut frame = self.pool.acquire();
        frame.bytes_mut().copy_from_slice(data);
        frame.set_sequence(self.accepted.fetch_add(1, Ordering::Relaxed));
        self.delay.push(frame);
    }

    fn format_changed(&self, description: &str) {
        warn!("capture format changed ({description}), ending the run");
        self.ctx.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(
        depth: usize,
        cadence: u32,
        max_frames: Option<u64>,
    ) -> (Arc<Intake>, Arc<PipelineContext>, Arc<DelayBuffer>) {
        let ctx = PipelineContext::new(max_frames);
        let delay = Arc::new(DelayBuffer::new());
        let pool = FramePool::new(4, 2);
        let config = PipelineConfig {
            delay_depth: depth,
            cadence_divisor: cadence,
            poll_interval_ms: 1,
            max_frames,
        };
        let intake = Intake::new(ctx.clone(), delay.clone(), pool, &config);
        (intake, ctx, delay)
    }

    #[test]
    fn cadence_forwards_every_nth_frame() {
        let (intake, ctx, delay) = setup(8, 2, None);
        for i in 0..4u8 {
            intake.frame(&[i; 4]);
        }

        assert_eq!(ctx.counters.snapshot().captured, 4);
        assert_eq!(intake.accepted(), 2);
        assert_eq!(delay.len(), 2);
        // frames 0 and 2 made it through, tagged 0 and 1
        let first = delay.try_pop_if_at_least(1).unwrap();
        assert_eq!(first.sequence(), 0);
        assert_eq!(first.bytes(), &[0; 4]);
        let second = delay.try_pop_if_at_least(1).unwrap();
        assert_eq!(second.sequence(), 1);
        assert_eq!(second.bytes(), &[2; 4]);
    }

    #[test]
    fn drops_exactly_the_overflow_and_keeps_the_bound() {
        let (intake, ctx, delay) = setup(2, 1, None);
        for i in 0..5u8 {
            intake.frame(&[i; 4]);
            assert!(delay.len() <= 2);
        }

        let snap = ctx.counters.snapshot();
        assert_eq!(snap.captured, 5);
        assert_eq!(snap.intake_dropped, 3);
        assert_eq!(delay.len(), 2);
        // the survivors are the first two, in order
        assert_eq!(delay.try_pop_if_at_least(1).unwrap().bytes(), &[0; 4]);
        assert_eq!(delay.try_pop_if_at_least(1).unwrap().bytes(), &[1; 4]);
    }

    #[test]
    fn frame_limit_requests_shutdown_and_keeps_the_last_frame() {
        let (intake, ctx, delay) = setup(8, 1, Some(3));
        for i in 0..3u8 {
            intake.frame(&[i; 4]);
        }
        assert!(ctx.shutdown_requested());
        assert_eq!(delay.len(), 3);

        // deliveries after the limit are ignored entirely
        intake.frame(&[9; 4]);
        assert_eq!(ctx.counters.snapshot().captured, 3);
        assert_eq!(delay.len(), 3);
    }

    #[test]
    fn wrong_size_frames_are_refused_without_counting_as_drops() {
        let (intake, ctx, delay) = setup(2, 1, None);
        intake.frame(&[1, 2, 3]);

        let snap = ctx.counters.snapshot();
        assert_eq!(snap.captured, 1);
        assert_eq!(snap.intake_dropped, 0);
        assert!(delay.is_empty());
    }

    #[test]
    fn format_change_ends_the_run() {
        let (intake, ctx, _delay) = setup(2, 1, None);
        intake.format_changed("1280x720 -> 720x480");
        assert!(ctx.shutdown_requested());
    }
}
