//! The bounded-delay degradation pipeline.
//!
//! Frames flow capture -> [`Intake`] -> [`DelayBuffer`] -> [`OutputScheduler`]
//! -> output device, with every scheduled pair teed through [`RecordQueue`]
//! to the [`DiskRecorder`]. A shared [`PipelineContext`] carries the run
//! counters and the shutdown flag; [`launch`] wires the stages together and
//! spawns the worker threads.

pub mod completion;
pub mod delay;
pub mod intake;
pub mod record;
pub mod scheduler;

pub use completion::CompletionTracker;
pub use delay::DelayBuffer;
pub use intake::Intake;
pub use record::{DiskRecorder, FramePair, RecordQueue};
pub use scheduler::{OutputScheduler, TickOutcome};

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use thiserror::Error;
use tracing::{error, info};

use crate::degrade::{DegradeError, Degrader, DegraderSlot};
use crate::frame::FramePool;
use crate::output::{OutputError, ScheduledOutput};
use crate::{CodecConfig, Config};

/// Builds a degrader from codec parameters, both at startup and on every
/// runtime reconfiguration.
pub type DegraderFactory =
    Box<dyn Fn(&CodecConfig) -> Result<Box<dyn Degrader>, DegradeError> + Send>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not open record files: {0}")]
    Record(#[source] io::Error),
    #[error("could not spawn pipeline thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Degrade(#[from] DegradeError),
}

/// Run counters, one cache line each since every lane has its own writer
/// thread.
#[derive(Default)]
pub struct Counters {
    captured: CachePadded<AtomicU64>,
    intake_dropped: CachePadded<AtomicU64>,
    scheduled: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,
    late: CachePadded<AtomicU64>,
}

impl Counters {
    /// Bumps the lane and returns the new total.
    pub fn add_captured(&self) -> u64 {
        self.captured.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_intake_dropped(&self) -> u64 {
        self.intake_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_scheduled(&self) -> u64 {
        self.scheduled.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_completed(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_late(&self) -> u64 {
        self.late.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            intake_dropped: self.intake_dropped.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
        }
    }
}

/// A consistent-enough point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub captured: u64,
    pub intake_dropped: u64,
    pub scheduled: u64,
    pub completed: u64,
    pub late: u64,
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured={} dropped={} scheduled={} completed={} late={}",
            self.captured, self.intake_dropped, self.scheduled, self.completed, self.late
        )
    }
}

/// State every stage shares: counters, the shutdown flag and the optional
/// frame limit.
pub struct PipelineContext {
    pub counters: Counters,
    shutdown: AtomicBool,
    max_frames: Option<u64>,
}

impl PipelineContext {
    pub fn new(max_frames: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
            max_frames,
        })
    }

    /// Idempotent; the first caller gets the log line.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Counts a capture delivery and trips the frame limit when configured.
    /// The delivery that reaches the limit is still a valid frame.
    pub fn note_captured(&self) -> u64 {
        let delivered = self.counters.add_captured();
        if let Some(limit) = self.max_frames {
            if delivered >= limit {
                info!("frame limit of {limit} reached");
                self.request_shutdown();
            }
        }
        delivered
    }
}

/// Wires the stages together, spawns the scheduler and recorder threads and
/// starts the output device. The capture side is the caller's: feed the
/// returned [`Intake`] from whatever source thread delivers frames.
pub fn launch(
    config: &Config,
    factory: DegraderFactory,
    mut device: Box<dyn ScheduledOutput>,
) -> Result<Running, PipelineError> {
    let frame_size = config.video.frame_size();
    let pool = FramePool::new(frame_size, config.pipeline.delay_depth + 4);
    let ctx = PipelineContext::new(config.pipeline.max_frames);
    let delay = Arc::new(DelayBuffer::new());
    let record = Arc::new(RecordQueue::new());

    let recorder = DiskRecorder::create(
        Path::new(&config.record.before_path),
        Path::new(&config.record.after_path),
        frame_size,
    )
    .map_err(PipelineError::Record)?;

    let degrader = Arc::new(DegraderSlot::new(factory(&config.codec)?));
    info!("degrader ready: {}", degrader.describe());

    let tracker = CompletionTracker::new(
        ctx.clone(),
        device.frame_interval(),
        Duration::from_millis(config.output.late_margin_ms),
    );
    device.start(tracker.handler())?;

    let (control_tx, control_rx) = flume::unbounded();
    let intake = Intake::new(ctx.clone(), delay.clone(), pool.clone(), &config.pipeline);

    let scheduler = OutputScheduler::new(
        ctx.clone(),
        delay.clone(),
        config.pipeline.delay_depth,
        degrader,
        factory,
        control_rx,
        device,
        record.clone(),
        pool,
        Duration::from_millis(config.pipeline.poll_interval_ms),
    );
    let scheduler = thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler.run())
        .map_err(PipelineError::Spawn)?;

    let recorder = {
        let queue = record.clone();
        let ctx = ctx.clone();
        let idle = Duration::from_millis(config.record.idle_sleep_ms);
        thread::Builder::new()
            .name("recorder".into())
            .spawn(move || recorder.run(queue, ctx, idle))
            .map_err(PipelineError::Spawn)?
    };

    Ok(Running {
        intake,
        ctx,
        delay,
        record,
        control: control_tx,
        scheduler: Some(scheduler),
        recorder: Some(recorder),
    })
}

/// Handle to a launched pipeline.
pub struct Running {
    intake: Arc<Intake>,
    ctx: Arc<PipelineContext>,
    delay: Arc<DelayBuffer>,
    record: Arc<RecordQueue>,
    control: flume::Sender<CodecConfig>,
    scheduler: Option<JoinHandle<()>>,
    recorder: Option<JoinHandle<()>>,
}

impl Running {
    /// The sink to hand to the capture source.
    pub fn intake(&self) -> Arc<Intake> {
        self.intake.clone()
    }

    pub fn context(&self) -> Arc<PipelineContext> {
        self.ctx.clone()
    }

    /// Queues new codec parameters; the scheduler swaps the degrader in
    /// before its next tick. Returns false once the pipeline is gone.
    pub fn reconfigure(&self, params: CodecConfig) -> bool {
        self.control.send(params).is_ok()
    }

    pub fn delay_len(&self) -> usize {
        self.delay.len()
    }

    pub fn record_len(&self) -> usize {
        self.record.len()
    }

    /// Stops the pipeline: the scheduler drains the delay buffer, waits for
    /// outstanding completions and stops the device, the recorder empties
    /// its queue. Returns the final counters.
    pub fn shutdown(mut self) -> CounterSnapshot {
        self.ctx.request_shutdown();
        self.join_workers();
        let snapshot = self.ctx.counters.snapshot();
        info!(%snapshot, "pipeline stopped");
        snapshot
    }

    fn join_workers(&mut self) {
        if let Some(handle) = self.scheduler.take() {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
        // the scheduler closes the queue on its way out; a panicked
        // scheduler never got there, so close again before waiting
        self.record.close();
        if let Some(handle) = self.recorder.take() {
            if handle.join().is_err() {
                error!("recorder thread panicked");
            }
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.ctx.request_shutdown();
        self.join_workers();
    }
}
