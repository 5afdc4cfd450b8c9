//! The FIFO that creates the intentional output delay.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::frame::Frame;

/// Mutex-protected FIFO between intake and the output scheduler.
///
/// Every operation takes the lock once, does constant work and returns;
/// nothing here ever waits, so the capture callback can touch it safely.
/// The length bound is enforced by the producer, not the buffer.
#[derive(Default)]
pub struct DelayBuffer {
    inner: Mutex<VecDeque<Frame>>,
}

impl DelayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Frame) {
        self.inner.lock().push_back(frame);
    }

    /// Pops the oldest frame iff at least `threshold` frames are buffered.
    pub fn try_pop_if_at_least(&self, threshold: usize) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if inner.len() >= threshold.max(1) {
            inner.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FramePool;

    fn tagged(pool: &std::sync::Arc<FramePool>, seq: u64) -> Frame {
        let mut f = pool.acquire();
        f.set_sequence(seq);
        f
    }

    #[test]
    fn pops_in_fifo_order() {
        let pool = FramePool::new(4, 0);
        let buf = DelayBuffer::new();
        for seq in 0..3 {
            buf.push(tagged(&pool, seq));
        }

        for expected in 0..3 {
            let frame = buf.try_pop_if_at_least(1).unwrap();
            assert_eq!(frame.sequence(), expected);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn threshold_gates_the_pop() {
        let pool = FramePool::new(4, 0);
        let buf = DelayBuffer::new();
        buf.push(tagged(&pool, 0));
        buf.push(tagged(&pool, 1));

        assert!(buf.try_pop_if_at_least(3).is_none());
        assert_eq!(buf.len(), 2);

        buf.push(tagged(&pool, 2));
        let frame = buf.try_pop_if_at_least(3).unwrap();
        assert_eq!(frame.sequence(), 0);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn empty_poll_returns_none() {
        let buf = DelayBuffer::new();
        assert!(buf.try_pop_if_at_least(1).is_none());
    }
}
