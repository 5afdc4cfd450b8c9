//! Lateness tracking on the device completion callback.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::output::{CompletionEvent, CompletionHandler};
use crate::pipeline::PipelineContext;

struct LastCompletion {
    completed_at_us: u64,
    hardware_now_us: u64,
}

/// Consumes completion events on the device thread.
///
/// A frame is late when either timestamp advanced by more than one frame
/// interval plus the margin since the previous completion. Lateness is
/// diagnostic: it warns and counts, nothing else. The completed counter
/// advances and the device slot is released for every event, shutdown or
/// not.
pub struct CompletionTracker {
    ctx: Arc<PipelineContext>,
    threshold_us: u64,
    last: Mutex<Option<LastCompletion>>,
}

impl CompletionTracker {
    pub fn new(ctx: Arc<PipelineContext>, frame_interval: Duration, margin: Duration) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            threshold_us: (frame_interval + margin).as_micros() as u64,
            last: Mutex::new(None),
        })
    }

    /// The closure handed to `ScheduledOutput::start`.
    pub fn handler(self: &Arc<Self>) -> CompletionHandler {
        let tracker = Arc::clone(self);
        Arc::new(move |event| tracker.on_completed(event))
    }

    fn on_completed(&self, event: CompletionEvent) {
        if !self.ctx.shutdown_requested() {
            let mut last = self.last.lock();
            if let Some(prev) = last.as_ref() {
                let completed_delta = event.completed_at_us.saturating_sub(prev.completed_at_us);
                let hardware_delta = event.hardware_now_us.saturating_sub(prev.hardware_now_us);
                if completed_delta > self.threshold_us || hardware_delta > self.threshold_us {
                    self.ctx.counters.add_late();
                    warn!(
                        tick = event.tick,
                        completed_delta,
                        hardware_delta,
                        threshold_us = self.threshold_us,
                        "frame displayed late"
                    );
                }
            }
            *last = Some(LastCompletion {
                completed_at_us: event.completed_at_us,
                hardware_now_us: event.hardware_now_us,
            });
        }

        self.ctx.counters.add_completed();
        // event drops here, returning the slot to the device pool
    }
}
