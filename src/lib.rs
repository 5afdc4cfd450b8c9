//! A bounded-delay lossy video pipeline.
//!
//! Frames come off a capture source, wait in a small delay buffer, get
//! degraded through a real codec round trip and go out to a scheduled
//! display, while every original/degraded pair is appended to raw capture
//! files on disk. The delay is bounded by dropping at intake, never by
//! blocking the capture thread.

pub mod capture;
pub mod convert;
pub mod degrade;
pub mod frame;
pub mod output;
pub mod pipeline;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use frame::{Frame, FramePool, PixelFormat};

/// Top-level configuration, one section per subsystem.
///
/// Loaded from `lossy.toml` when present, then overridden by `LOSSY_*`
/// environment variables. Every field has a default, an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub codec: CodecConfig,
    pub record: RecordConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            format: PixelFormat::Bgra8,
            fps: 60,
        }
    }
}

impl VideoConfig {
    /// Bytes in one tightly packed frame.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 device path; empty means auto-detect.
    pub device: String,
    pub buffer_count: u32,
    /// Use the synthetic source instead of real hardware.
    pub synthetic: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            buffer_count: 4,
            synthetic: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames held between intake and output; also the drop threshold.
    pub delay_depth: usize,
    /// Forward every Nth captured frame.
    pub cadence_divisor: u32,
    pub poll_interval_ms: u64,
    /// End the run after this many capture deliveries.
    pub max_frames: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delay_depth: 1,
            cadence_divisor: 2,
            poll_interval_ms: 1,
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub bitrate: u32,
    /// H.264 QP, 0..=51; higher degrades harder.
    pub quantization: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bitrate: 1 << 20,
            quantization: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub before_path: String,
    pub after_path: String,
    pub idle_sleep_ms: u64,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            before_path: "before.raw".into(),
            after_path: "after.raw".into(),
            idle_sleep_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Frames the device will hold in flight.
    pub slots: usize,
    /// Slack on top of the frame interval before a completion counts as
    /// late.
    pub late_margin_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            slots: 8,
            late_margin_ms: 34,
        }
    }
}

impl Config {
    /// Layered load: `lossy.toml` if present, then environment overrides
    /// such as `LOSSY_VIDEO__WIDTH=640`.
    pub fn load() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("lossy").required(false))
            .add_source(config::Environment::with_prefix("LOSSY").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Everything wrong with the configuration; empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.video.width == 0 || self.video.height == 0 {
            problems.push("video dimensions must be non-zero".into());
        }
        if self.video.width % 2 != 0 || self.video.height % 2 != 0 {
            problems.push("4:2:0 coding needs even video dimensions".into());
        }
        if self.video.format != PixelFormat::Bgra8 {
            problems.push("only bgra8 pipeline frames are supported".into());
        }
        if self.video.fps == 0 {
            problems.push("fps must be at least 1".into());
        }
        if self.pipeline.cadence_divisor == 0 {
            problems.push("cadence_divisor must be at least 1".into());
        }
        if self.pipeline.delay_depth == 0 {
            problems.push("delay_depth must be at least 1".into());
        }
        if self.codec.quantization > 51 {
            problems.push("quantization must be 0..=51".into());
        }
        if self.codec.bitrate == 0 {
            problems.push("bitrate must be non-zero".into());
        }
        if self.output.slots < 2 {
            problems.push("output needs at least 2 slots".into());
        }
        if self.record.before_path == self.record.after_path {
            problems.push("record paths must differ".into());
        }
        problems
    }
}
