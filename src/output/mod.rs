//! Scheduled-playback output seam.
//!
//! The pipeline never talks to display hardware directly. It borrows a frame
//! slot from a [`ScheduledOutput`], fills it, and schedules it for a display
//! tick; the device paces actual presentation on its own clock and reports
//! each displayed frame through the completion handler registered at start.

pub mod display;
pub use display::VirtualDisplay;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::frame::Frame;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no output slot available")]
    NoSlot,
    #[error("playback already started")]
    AlreadyStarted,
    #[error("playback not started")]
    NotStarted,
    #[error("slot size {got} does not match device frame size {need}")]
    SlotSize { got: usize, need: usize },
}

/// One displayed-frame notification.
///
/// Dropping the event returns the slot to the device, which is how the
/// device-side resource is released; handlers run on the device thread and
/// must not fail.
#[derive(Debug)]
pub struct CompletionEvent {
    /// The tick the frame was scheduled at.
    pub tick: u64,
    /// Device clock when this frame finished displaying, in microseconds.
    pub completed_at_us: u64,
    /// Device clock sampled inside the callback, in microseconds.
    pub hardware_now_us: u64,
    /// The displayed slot, returned to the device pool on drop.
    pub frame: Frame,
}

pub type CompletionHandler = Arc<dyn Fn(CompletionEvent) + Send + Sync>;

pub trait ScheduledOutput: Send {
    /// Registers the completion handler and starts scheduled playback.
    /// Until the first frame is scheduled the device shows black.
    fn start(&mut self, on_complete: CompletionHandler) -> Result<(), OutputError>;

    /// Borrows a device frame slot. Fails transiently while every slot is
    /// still in flight.
    fn acquire_slot(&mut self) -> Result<Frame, OutputError>;

    /// Queues a filled slot for display at the given tick.
    fn schedule(&mut self, slot: Frame, tick: u64) -> Result<(), OutputError>;

    /// Stops playback. Frames still queued are released unshown.
    fn stop(&mut self) -> Result<(), OutputError>;

    /// Nominal display interval.
    fn frame_interval(&self) -> Duration;
}
