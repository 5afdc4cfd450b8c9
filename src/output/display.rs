//! Clock-paced virtual display.
//!
//! Stands in for scheduled-playback hardware: a fixed budget of frame
//! slots, an internal queue of scheduled frames, and a worker thread that
//! "displays" the head of the queue once per frame interval and fires the
//! completion handler with device-clock timestamps. An empty tick leaves
//! the previous image up (black before the first frame), like a real
//! output card idling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::frame::{Frame, FramePool};
use crate::output::{CompletionEvent, CompletionHandler, OutputError, ScheduledOutput};

pub struct VirtualDisplay {
    interval: Duration,
    frame_size: usize,
    slots: Arc<FramePool>,
    queue: Arc<Mutex<VecDeque<(u64, Frame)>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl VirtualDisplay {
    pub fn new(frame_size: usize, slots: usize, interval: Duration) -> Self {
        Self {
            interval,
            frame_size,
            slots: FramePool::new(frame_size, slots),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Frames scheduled but not yet displayed.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn join_worker(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl ScheduledOutput for VirtualDisplay {
    fn start(&mut self, on_complete: CompletionHandler) -> Result<(), OutputError> {
        if self.worker.is_some() {
            return Err(OutputError::AlreadyStarted);
        }

        self.running.store(true, Ordering::Relaxed);
        let running = self.running.clone();
        let queue = self.queue.clone();
        let interval = self.interval;

        let worker = thread::spawn(move || {
            info!("virtual display running at {:?} per frame", interval);
            let epoch = Instant::now();
            let mut next = epoch + interval;

            while running.load(Ordering::Relaxed) {
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                    next += interval;
                } else {
                    // fell behind, resync to the wall clock
                    next = now + interval;
                }

                let popped = queue.lock().pop_front();
                if let Some((tick, frame)) = popped {
                    let completed_at_us = epoch.elapsed().as_micros() as u64;
                    on_complete(CompletionEvent {
                        tick,
                        completed_at_us,
                        hardware_now_us: epoch.elapsed().as_micros() as u64,
                        frame,
                    });
                }
            }

            // anything still queued is released unshown
            let leftover = {
                let mut queue = queue.lock();
                let n = queue.len();
                queue.clear();
                n
            };
            if leftover > 0 {
                debug!("virtual display dropped {leftover} undisplayed frames at stop");
            }
        });

        self.worker = Some(worker);
        Ok(())
    }

    fn acquire_slot(&mut self) -> Result<Frame, OutputError> {
        self.slots.try_acquire().ok_or(OutputError::NoSlot)
    }

    fn schedule(&mut self, slot: Frame, tick: u64) -> Result<(), OutputError> {
        if self.worker.is_none() {
            return Err(OutputError::NotStarted);
        }
        if slot.bytes().len() != self.frame_size {
            return Err(OutputError::SlotSize {
                got: slot.bytes().len(),
                need: self.frame_size,
            });
        }
        self.queue.lock().push_back((tick, slot));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), OutputError> {
        if self.worker.is_none() {
            return Err(OutputError::NotStarted);
        }
        self.join_worker();
        info!("virtual display stopped");
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for VirtualDisplay {
    fn drop(&mut self) {
        self.join_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for<F: Fn() -> bool>(cond: F, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn displays_in_tick_order_and_recycles_slots() {
        let mut display = VirtualDisplay::new(8, 4, Duration::from_millis(2));
        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        display
            .start(Arc::new(move |ev: CompletionEvent| {
                sink.lock().push((ev.tick, ev.completed_at_us));
            }))
            .unwrap();

        for tick in 0..3 {
            let mut slot = display.acquire_slot().unwrap();
            slot.bytes_mut().fill(tick as u8);
            display.schedule(slot, tick).unwrap();
        }

        assert!(wait_for(|| seen.lock().len() == 3, Duration::from_secs(1)));
        let events = seen.lock().clone();
        assert_eq!(
            events.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(events.windows(2).all(|w| w[0].1 <= w[1].1));

        // all slots are back once displayed
        assert!(wait_for(|| display.slots.live() == 0, Duration::from_secs(1)));
        display.stop().unwrap();
    }

    #[test]
    fn slot_budget_is_enforced() {
        let mut display = VirtualDisplay::new(8, 2, Duration::from_millis(50));
        let a = display.acquire_slot().unwrap();
        let _b = display.acquire_slot().unwrap();
        assert!(matches!(display.acquire_slot(), Err(OutputError::NoSlot)));
        drop(a);
        assert!(display.acquire_slot().is_ok());
    }

    #[test]
    fn schedule_requires_start() {
        let mut display = VirtualDisplay::new(8, 2, Duration::from_millis(2));
        let slot = display.acquire_slot().unwrap();
        assert!(matches!(
            display.schedule(slot, 0),
            Err(OutputError::NotStarted)
        ));
    }

    #[test]
    fn stop_releases_undisplayed_frames() {
        let mut display = VirtualDisplay::new(8, 3, Duration::from_millis(250));
        display.start(Arc::new(|_ev| {})).unwrap();

        for tick in 0..3 {
            let slot = display.acquire_slot().unwrap();
            display.schedule(slot, tick).unwrap();
        }
        // worker is still asleep before its first tick
        display.stop().unwrap();
        assert_eq!(display.slots.live(), 0);
        assert_eq!(display.queued(), 0);
    }
}
