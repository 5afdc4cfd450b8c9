//! Frame sources.
//!
//! A [`CaptureSource`] owns its device and its pacing; it pushes raw BGRA
//! frames into a [`FrameSink`] until shutdown. The pipeline's intake stage
//! is the sink, the source never sees anything past it.

pub mod synthetic;
pub mod v4l2;

pub use synthetic::SyntheticSource;
pub use v4l2::V4l2Source;

use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::PipelineContext;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no suitable capture device found")]
    NoDevice,
    #[error("capture format not usable: {0}")]
    Format(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Receives frames on the source's thread.
///
/// Implementations must return quickly and never block, the source owns
/// the delivery cadence.
pub trait FrameSink: Send + Sync {
    /// One frame of tightly packed BGRA pixels.
    fn frame(&self, data: &[u8]);

    /// The source can no longer deliver the negotiated format.
    fn format_changed(&self, description: &str);
}

/// Pushes frames into a sink until shutdown is requested.
pub trait CaptureSource: Send {
    fn run(
        self: Box<Self>,
        sink: Arc<dyn FrameSink>,
        ctx: Arc<PipelineContext>,
    ) -> Result<(), CaptureError>;
}
