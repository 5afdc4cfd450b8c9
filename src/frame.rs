//! Pooled raw frames with single-owner semantics

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Pixel formats the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit blue/green/red/alpha, 4 bytes per pixel
    Bgra8,
    /// Packed 4:2:2, 2 bytes per pixel (camera native)
    Yuyv4,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 => 4,
            PixelFormat::Yuyv4 => 2,
        }
    }
}

/// Recycling allocator for fixed-size frame buffers.
///
/// Every stage that needs a frame draws from a pool and the buffer returns
/// on drop, so ownership transfers by moving the [`Frame`] handle. `acquire`
/// grows the pool on demand; `try_acquire` is bounded by what has been
/// released and models a device with a fixed number of slots.
pub struct FramePool {
    frame_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    live: AtomicUsize,
}

impl FramePool {
    pub fn new(frame_size: usize, prealloc: usize) -> Arc<Self> {
        let mut free = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            free.push(vec![0u8; frame_size].into_boxed_slice());
        }
        Arc::new(Self {
            frame_size,
            free: Mutex::new(free),
            live: AtomicUsize::new(0),
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Frames handed out and not yet returned.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Pops a recycled buffer or allocates a fresh one.
    pub fn acquire(self: &Arc<Self>) -> Frame {
        let data = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.frame_size].into_boxed_slice());
        self.live.fetch_add(1, Ordering::Relaxed);
        Frame {
            data,
            sequence: 0,
            pool: Arc::clone(self),
        }
    }

    /// Like `acquire` but never allocates; `None` once the pool is empty.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Frame> {
        let data = self.free.lock().pop()?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(Frame {
            data,
            sequence: 0,
            pool: Arc::clone(self),
        })
    }

    fn recycle(&self, data: Box<[u8]>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(data);
    }
}

/// An owned fixed-size frame buffer tagged with its acceptance sequence.
pub struct Frame {
    data: Box<[u8]>,
    sequence: u64,
    pool: Arc<FramePool>,
}

impl Frame {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if !data.is_empty() {
            self.pool.recycle(data);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}
