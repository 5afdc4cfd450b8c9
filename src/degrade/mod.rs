//! The lossy transform applied to every frame before display.
//!
//! A [`Degrader`] runs a full codec round-trip: raw frame in, encode at the
//! configured bitrate/quantization, decode straight back, raw frame out.
//! The pipeline talks to it through [`DegraderSlot`], which serializes
//! frame processing against runtime reconfiguration.

#[cfg(feature = "h264")]
pub mod h264;
#[cfg(feature = "h264")]
pub use h264::H264Degrader;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DegradeError {
    #[error("unsupported frame geometry {width}x{height}: {reason}")]
    Geometry {
        width: u32,
        height: u32,
        reason: &'static str,
    },
    #[error("buffer size mismatch: got {got}, need {need}")]
    BufferSize { got: usize, need: usize },
    #[error("encoder: {0}")]
    Encode(String),
    #[error("decoder: {0}")]
    Decode(String),
}

/// A stateful lossy frame transform.
///
/// Implementations keep encoder/decoder state across calls, so consecutive
/// frames share inter-frame prediction exactly like a live stream would.
pub trait Degrader: Send {
    /// Writes the degraded rendition of `original` into `degraded`.
    /// Both buffers have the full raw frame size.
    fn process(&mut self, original: &[u8], degraded: &mut [u8]) -> Result<(), DegradeError>;

    /// One-line parameter summary for logs.
    fn describe(&self) -> String;
}

/// Holds the active degrader behind the lock that both frame processing and
/// reconfiguration must take.
///
/// `replace` swaps in a prebuilt successor and drops the old instance only
/// after the lock has been released, so codec teardown never stalls a frame.
pub struct DegraderSlot {
    inner: Mutex<Box<dyn Degrader>>,
}

impl DegraderSlot {
    pub fn new(degrader: Box<dyn Degrader>) -> Self {
        Self {
            inner: Mutex::new(degrader),
        }
    }

    /// Runs the round-trip under the lock.
    pub fn process(&self, original: &[u8], degraded: &mut [u8]) -> Result<(), DegradeError> {
        self.inner.lock().process(original, degraded)
    }

    pub fn describe(&self) -> String {
        self.inner.lock().describe()
    }

    /// Installs `next` and returns only after the previous instance has been
    /// dropped outside the lock.
    pub fn replace(&self, next: Box<dyn Degrader>) {
        let old = {
            let mut guard = self.inner.lock();
            std::mem::replace(&mut *guard, next)
        };
        drop(old);
    }
}
