//! End-to-end runs against the virtual display, with marker degraders so
//! the recorded files prove which frames went through which codec.

use std::fs;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;

use lossy::capture::FrameSink;
use lossy::degrade::{DegradeError, Degrader};
use lossy::output::VirtualDisplay;
use lossy::pipeline::{self, DegraderFactory};
use lossy::{CodecConfig, Config, PipelineConfig, PixelFormat, VideoConfig};

struct InvertDegrader;

impl Degrader for InvertDegrader {
    fn process(&mut self, original: &[u8], degraded: &mut [u8]) -> Result<(), DegradeError> {
        for (dst, src) in degraded.iter_mut().zip(original) {
            *dst = !src;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "invert".into()
    }
}

struct XorDegrader {
    key: u8,
}

impl Degrader for XorDegrader {
    fn process(&mut self, original: &[u8], degraded: &mut [u8]) -> Result<(), DegradeError> {
        for (dst, src) in degraded.iter_mut().zip(original) {
            *dst = src ^ self.key;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("xor key={}", self.key)
    }
}

/// Inverts like [`InvertDegrader`] but holds each frame for a while, the
/// way a real codec stalls under load.
struct SlowInvertDegrader {
    hold: Duration,
}

impl Degrader for SlowInvertDegrader {
    fn process(&mut self, original: &[u8], degraded: &mut [u8]) -> Result<(), DegradeError> {
        thread::sleep(self.hold);
        for (dst, src) in degraded.iter_mut().zip(original) {
            *dst = !src;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "slow invert".into()
    }
}

#[test]
fn ten_frames_flow_through_and_land_in_both_files() {
    let dir = tempdir().unwrap();
    let before_path = dir.path().join("before.raw");
    let after_path = dir.path().join("after.raw");

    let mut config = Config::default();
    config.video = VideoConfig {
        width: 1280,
        height: 720,
        format: PixelFormat::Bgra8,
        fps: 60,
    };
    config.pipeline = PipelineConfig {
        delay_depth: 3,
        cadence_divisor: 1,
        poll_interval_ms: 1,
        max_frames: Some(10),
    };
    config.record.before_path = before_path.to_string_lossy().into_owned();
    config.record.after_path = after_path.to_string_lossy().into_owned();
    config.output.slots = 4;
    // loaded test machines stall threads for tens of milliseconds
    config.output.late_margin_ms = 500;
    let frame_size = config.video.frame_size();

    let factory: DegraderFactory =
        Box::new(|_codec: &CodecConfig| Ok(Box::new(InvertDegrader) as Box<dyn Degrader>));
    let device = Box::new(VirtualDisplay::new(
        frame_size,
        config.output.slots,
        Duration::from_millis(5),
    ));

    let running = pipeline::launch(&config, factory, device).unwrap();
    let intake = running.intake();
    let ctx = running.context();

    // paced feed: never deliver into a full buffer, so nothing is dropped
    for i in 0..10u64 {
        while running.delay_len() >= 3 {
            thread::sleep(Duration::from_micros(200));
        }
        let fill = (i * 7 + 3) as u8;
        intake.frame(&vec![fill; frame_size]);
    }
    // the tenth delivery is the frame limit
    assert!(ctx.shutdown_requested());

    let snapshot = running.shutdown();
    assert_eq!(snapshot.captured, 10);
    assert_eq!(snapshot.intake_dropped, 0);
    // a stalled feed can add repeat ticks, but never fewer than the real ten
    assert!(snapshot.scheduled >= 10, "scheduled {}", snapshot.scheduled);
    assert_eq!(snapshot.completed, snapshot.scheduled);
    assert_eq!(snapshot.late, 0);

    let before = fs::read(&before_path).unwrap();
    let after = fs::read(&after_path).unwrap();
    assert_eq!(before.len(), 10 * frame_size);
    assert_eq!(after.len(), 10 * frame_size);

    for i in 0..10 {
        let fill = (i as u64 * 7 + 3) as u8;
        let chunk = &before[i * frame_size..(i + 1) * frame_size];
        assert!(chunk.iter().all(|&b| b == fill), "before chunk {i}");
        let chunk = &after[i * frame_size..(i + 1) * frame_size];
        assert!(chunk.iter().all(|&b| b == !fill), "after chunk {i}");
    }
}

#[test]
fn frames_buffered_at_shutdown_still_reach_the_files() {
    let dir = tempdir().unwrap();
    let before_path = dir.path().join("before.raw");
    let after_path = dir.path().join("after.raw");

    let mut config = Config::default();
    config.video = VideoConfig {
        width: 32,
        height: 16,
        format: PixelFormat::Bgra8,
        fps: 60,
    };
    config.pipeline = PipelineConfig {
        delay_depth: 3,
        cadence_divisor: 1,
        poll_interval_ms: 1,
        max_frames: Some(3),
    };
    config.record.before_path = before_path.to_string_lossy().into_owned();
    config.record.after_path = after_path.to_string_lossy().into_owned();
    let frame_size = config.video.frame_size();

    // each frame outlasts many recorder idle polls, so the pairs reach the
    // record queue long after the frame limit set the shutdown flag
    let factory: DegraderFactory = Box::new(|_codec: &CodecConfig| {
        Ok(Box::new(SlowInvertDegrader {
            hold: Duration::from_millis(40),
        }) as Box<dyn Degrader>)
    });
    let device = Box::new(VirtualDisplay::new(
        frame_size,
        config.output.slots,
        Duration::from_millis(2),
    ));

    let running = pipeline::launch(&config, factory, device).unwrap();
    let intake = running.intake();
    let ctx = running.context();

    // back to back: the third delivery trips the limit while all three
    // frames are still waiting in the delay buffer
    for i in 0..3u64 {
        let fill = (i * 31 + 5) as u8;
        intake.frame(&vec![fill; frame_size]);
    }
    assert!(ctx.shutdown_requested());

    let snapshot = running.shutdown();
    assert_eq!(snapshot.captured, 3);
    assert_eq!(snapshot.intake_dropped, 0);
    assert_eq!(snapshot.scheduled, 3);
    assert_eq!(snapshot.completed, 3);

    let before = fs::read(&before_path).unwrap();
    let after = fs::read(&after_path).unwrap();
    assert_eq!(before.len(), 3 * frame_size, "before.raw is missing pairs");
    assert_eq!(after.len(), 3 * frame_size, "after.raw is missing pairs");

    for i in 0..3 {
        let fill = (i as u64 * 31 + 5) as u8;
        let chunk = &before[i * frame_size..(i + 1) * frame_size];
        assert!(chunk.iter().all(|&b| b == fill), "before chunk {i}");
        let chunk = &after[i * frame_size..(i + 1) * frame_size];
        assert!(chunk.iter().all(|&b| b == !fill), "after chunk {i}");
    }
}

#[test]
fn reconfigure_applies_to_later_frames_only() {
    let dir = tempdir().unwrap();
    let before_path = dir.path().join("before.raw");
    let after_path = dir.path().join("after.raw");

    let mut config = Config::default();
    config.video = VideoConfig {
        width: 16,
        height: 8,
        format: PixelFormat::Bgra8,
        fps: 60,
    };
    config.pipeline = PipelineConfig {
        delay_depth: 1,
        cadence_divisor: 1,
        poll_interval_ms: 1,
        max_frames: None,
    };
    config.codec.quantization = 0xF0;
    config.record.before_path = before_path.to_string_lossy().into_owned();
    config.record.after_path = after_path.to_string_lossy().into_owned();
    let frame_size = config.video.frame_size();

    let factory: DegraderFactory = Box::new(|codec: &CodecConfig| {
        Ok(Box::new(XorDegrader {
            key: codec.quantization,
        }) as Box<dyn Degrader>)
    });
    let device = Box::new(VirtualDisplay::new(
        frame_size,
        config.output.slots,
        Duration::from_millis(2),
    ));

    let running = pipeline::launch(&config, factory, device).unwrap();
    let intake = running.intake();
    let ctx = running.context();

    intake.frame(&vec![0x11u8; frame_size]);
    while ctx.counters.snapshot().scheduled < 1 {
        thread::sleep(Duration::from_micros(200));
    }

    // swaps before the next emitted frame, repeats of the first keep its
    // old bytes
    assert!(running.reconfigure(CodecConfig {
        bitrate: 1 << 20,
        quantization: 0x0F,
    }));
    intake.frame(&vec![0x22u8; frame_size]);
    while running.delay_len() > 0 {
        thread::sleep(Duration::from_micros(200));
    }

    ctx.request_shutdown();
    running.shutdown();

    let before = fs::read(&before_path).unwrap();
    let after = fs::read(&after_path).unwrap();
    // repeated frames are scheduled but never recorded
    assert_eq!(before.len(), 2 * frame_size);
    assert_eq!(after.len(), 2 * frame_size);

    assert!(before[..frame_size].iter().all(|&b| b == 0x11));
    assert!(before[frame_size..].iter().all(|&b| b == 0x22));
    assert!(after[..frame_size].iter().all(|&b| b == (0x11 ^ 0xF0)));
    assert!(after[frame_size..].iter().all(|&b| b == (0x22 ^ 0x0F)));
}
