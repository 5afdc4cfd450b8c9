//! Paired recording of original and degraded frames.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::frame::Frame;
use crate::pipeline::PipelineContext;

/// An original frame and its degraded twin, tagged with the acceptance
/// sequence both halves share.
pub struct FramePair {
    pub sequence: u64,
    pub original: Frame,
    pub degraded: Frame,
}

/// Queue depth past which sustained growth gets reported.
const DEPTH_WARN: usize = 64;

/// Unbounded FIFO of pairs between the scheduler and the disk recorder.
///
/// Unbounded on purpose: shedding happens at intake, and losing recorded
/// pairs would defeat the point of the run. A slow disk shows up as depth
/// growth, which is reported rather than absorbed silently. The producer
/// closes the queue when it has pushed its last pair; closing does not
/// discard anything still queued.
#[derive(Default)]
pub struct RecordQueue {
    inner: Mutex<VecDeque<FramePair>>,
    closed: AtomicBool,
}

impl RecordQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, pair: FramePair) {
        let depth = {
            let mut inner = self.inner.lock();
            inner.push_back(pair);
            inner.len()
        };
        metrics::gauge!("record_queue_depth").set(depth as f64);
        if depth == DEPTH_WARN {
            warn!("record queue reached {depth} pairs, disk is not keeping up");
        }
    }

    /// Pops exactly one pair; the caller writes with the lock released.
    pub fn pop_one(&self) -> Option<FramePair> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Marks the producing side finished. Queued pairs stay poppable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Appends each pair to two flat files in fixed frame-size chunks.
pub struct DiskRecorder {
    before: File,
    after: File,
    frame_size: usize,
}

impl DiskRecorder {
    /// Opens both destination files. Failure here is fatal to the run.
    pub fn create(before: &Path, after: &Path, frame_size: usize) -> io::Result<Self> {
        let recorder = Self {
            before: File::create(before)?,
            after: File::create(after)?,
            frame_size,
        };
        info!(
            "recording originals to {} and degraded frames to {}",
            before.display(),
            after.display()
        );
        Ok(recorder)
    }

    fn write_pair(&mut self, pair: &FramePair) -> io::Result<()> {
        debug_assert_eq!(pair.original.bytes().len(), self.frame_size);
        debug_assert_eq!(pair.degraded.bytes().len(), self.frame_size);
        self.before.write_all(pair.original.bytes())?;
        self.after.write_all(pair.degraded.bytes())?;
        Ok(())
    }

    /// Writes pairs one at a time until the queue is closed and empty.
    ///
    /// The shutdown flag alone is not an exit condition: the scheduler's
    /// own shutdown drain keeps producing pairs after the flag is set, and
    /// it closes the queue only once the last of them is pushed.
    pub fn run(mut self, queue: Arc<RecordQueue>, ctx: Arc<PipelineContext>, idle: Duration) {
        info!("disk recorder running");
        let mut written = 0u64;

        loop {
            // read before popping: a close seen here means every push
            // already happened, so an empty pop below is the real end
            let producers_done = queue.is_closed();
            match queue.pop_one() {
                Some(pair) => {
                    if let Err(e) = self.write_pair(&pair) {
                        error!("record write failed at pair {}: {e}", pair.sequence);
                        ctx.request_shutdown();
                        break;
                    }
                    written += 1;
                }
                None if producers_done => break,
                None => std::thread::sleep(idle),
            }
        }

        info!("disk recorder stopped after {written} pairs");
    }
}
