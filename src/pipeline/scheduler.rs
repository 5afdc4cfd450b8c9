//! The loop that moves frames from the delay buffer to the output device.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::degrade::DegraderSlot;
use crate::frame::{Frame, FramePool};
use crate::output::{OutputError, ScheduledOutput};
use crate::pipeline::{DegraderFactory, DelayBuffer, FramePair, PipelineContext, RecordQueue};

/// What a single scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing buffered and nothing to repeat.
    Idle,
    /// A fresh frame was degraded, scheduled and recorded.
    Scheduled,
    /// The most recent degraded frame was scheduled again.
    Repeated,
    /// The device refused the tick; any frame already popped for it is
    /// still recorded.
    Skipped,
}

/// Pulls, degrades, schedules and records frames.
///
/// The delay depth is an arming threshold: until the buffer first fills to
/// depth, ticks do nothing, which is what creates the configured delay.
/// Once armed, any buffered frame is pulled; an empty poll repeats the most
/// recent degraded frame so the device is never starved. Pacing is a fixed
/// sleep, the device clock drives actual presentation.
pub struct OutputScheduler {
    ctx: Arc<PipelineContext>,
    delay: Arc<DelayBuffer>,
    delay_depth: usize,
    degrader: Arc<DegraderSlot>,
    factory: DegraderFactory,
    control: flume::Receiver<crate::CodecConfig>,
    device: Box<dyn ScheduledOutput>,
    record: Arc<RecordQueue>,
    pool: Arc<FramePool>,
    poll: Duration,
    last: Option<Frame>,
    armed: bool,
    next_tick: u64,
}

impl OutputScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<PipelineContext>,
        delay: Arc<DelayBuffer>,
        delay_depth: usize,
        degrader: Arc<DegraderSlot>,
        factory: DegraderFactory,
        control: flume::Receiver<crate::CodecConfig>,
        device: Box<dyn ScheduledOutput>,
        record: Arc<RecordQueue>,
        pool: Arc<FramePool>,
        poll: Duration,
    ) -> Self {
        Self {
            ctx,
            delay,
            delay_depth,
            degrader,
            factory,
            control,
            device,
            record,
            pool,
            poll,
            last: None,
            armed: false,
            next_tick: 0,
        }
    }

    /// One tick: apply pending reconfiguration, then feed the device.
    pub fn step(&mut self) -> TickOutcome {
        self.apply_control();

        // slot before pop, so a refused tick never costs a buffered frame
        let slot = match self.device.acquire_slot() {
            Ok(slot) => slot,
            Err(OutputError::NoSlot) => {
                debug!("all output slots in flight, skipping tick");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                warn!("output slot unavailable: {e}");
                return TickOutcome::Skipped;
            }
        };

        let threshold = if self.armed { 1 } else { self.delay_depth };
        match self.delay.try_pop_if_at_least(threshold) {
            Some(original) => {
                self.armed = true;
                self.emit(original, slot)
            }
            None => self.repeat_last(slot),
        }
    }

    fn emit(&mut self, original: Frame, mut slot: Frame) -> TickOutcome {
        let mut degraded = self.pool.acquire();

        let started = Instant::now();
        if let Err(e) = self.degrader.process(original.bytes(), degraded.bytes_mut()) {
            error!(
                sequence = original.sequence(),
                "degrade failed ({e}), passing the original through"
            );
            degraded.bytes_mut().copy_from_slice(original.bytes());
        }
        metrics::histogram!("degrade_time_us").record(started.elapsed().as_micros() as f64);

        slot.bytes_mut().copy_from_slice(degraded.bytes());
        // a refusal here costs the tick, never the pair: the frame was
        // popped and degraded, so it still goes to the recorder
        let outcome = match self.schedule_slot(slot) {
            Ok(()) => TickOutcome::Scheduled,
            Err(e) => {
                warn!(
                    sequence = original.sequence(),
                    "device refused the frame ({e}), recording it unshown"
                );
                TickOutcome::Skipped
            }
        };

        if self.last.is_none() {
            self.last = Some(self.pool.acquire());
        }
        if let Some(last) = self.last.as_mut() {
            last.bytes_mut().copy_from_slice(degraded.bytes());
        }

        self.record.push(FramePair {
            sequence: original.sequence(),
            original,
            degraded,
        });
        outcome
    }

    fn repeat_last(&mut self, mut slot: Frame) -> TickOutcome {
        let Some(last) = self.last.as_ref() else {
            // still accumulating, the slot goes back unused
            return TickOutcome::Idle;
        };
        slot.bytes_mut().copy_from_slice(last.bytes());
        if let Err(e) = self.schedule_slot(slot) {
            warn!("device refused the repeated frame ({e}), skipping tick");
            return TickOutcome::Skipped;
        }
        TickOutcome::Repeated
    }

    fn schedule_slot(&mut self, slot: Frame) -> Result<(), OutputError> {
        self.device.schedule(slot, self.next_tick)?;
        self.next_tick += 1;
        self.ctx.counters.add_scheduled();
        Ok(())
    }

    fn apply_control(&mut self) {
        while let Ok(params) = self.control.try_recv() {
            // the successor is built outside the lock, swapped under it
            match (self.factory)(&params) {
                Ok(next) => {
                    self.degrader.replace(next);
                    info!("degrader reconfigured: {}", self.degrader.describe());
                }
                Err(e) => error!("degrader reconfiguration failed: {e}"),
            }
        }
    }

    pub fn run(mut self) {
        info!(
            "output scheduler running, delay depth {}, poll {:?}",
            self.delay_depth, self.poll
        );

        loop {
            if self.ctx.shutdown_requested() {
                break;
            }
            self.step();
            thread::sleep(self.poll);
        }

        self.drain();
        // nothing pushes to the record queue past this point
        self.record.close();
        self.await_completions();
        if let Err(e) = self.device.stop() {
            warn!("device stop failed: {e}");
        }
        info!("output scheduler stopped after {} ticks", self.next_tick);
    }

    /// Pushes everything still buffered through the normal emit path, so an
    /// accepted frame is never lost to shutdown timing.
    fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.delay.is_empty() {
                break;
            }
            if Instant::now() > deadline {
                warn!(
                    "drain gave up with {} frames still buffered",
                    self.delay.len()
                );
                break;
            }
            match self.device.acquire_slot() {
                Ok(slot) => {
                    if let Some(original) = self.delay.try_pop_if_at_least(1) {
                        self.emit(original, slot);
                    }
                }
                // slots free up as the device displays what is queued
                Err(_) => thread::sleep(self.poll),
            }
        }
    }

    /// Lets outstanding scheduled frames finish displaying, within a budget
    /// derived from the device's own pace.
    fn await_completions(&self) {
        let target = self.next_tick;
        let outstanding = target.saturating_sub(self.ctx.counters.snapshot().completed);
        if outstanding == 0 {
            return;
        }

        let interval = self.device.frame_interval();
        let budget = interval * (outstanding as u32 + 4) + Duration::from_millis(200);
        let deadline = Instant::now() + budget;

        while self.ctx.counters.snapshot().completed < target {
            if Instant::now() > deadline {
                warn!(
                    "gave up waiting for completions ({} of {target})",
                    self.ctx.counters.snapshot().completed
                );
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}
