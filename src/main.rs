//! Lossy pipeline binary: capture, delay, degrade, display, record.

use std::thread;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{error, info, warn};

use lossy::capture::{CaptureSource, SyntheticSource, V4l2Source};
use lossy::output::VirtualDisplay;
use lossy::pipeline::{self, DegraderFactory};
use lossy::{CodecConfig, Config, VideoConfig};

#[cfg(feature = "h264")]
fn degrader_factory(video: &VideoConfig) -> DegraderFactory {
    use lossy::degrade::{Degrader, H264Degrader};

    let video = video.clone();
    Box::new(move |codec: &CodecConfig| {
        H264Degrader::new(&video, codec).map(|d| Box::new(d) as Box<dyn Degrader>)
    })
}

#[cfg(not(feature = "h264"))]
fn degrader_factory(_video: &VideoConfig) -> DegraderFactory {
    Box::new(|_codec: &CodecConfig| {
        Err(lossy::degrade::DegradeError::Encode(
            "built without the h264 feature".into(),
        ))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("lossy=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("lossy starting");

    let config = Config::load()?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("configuration: {problem}");
        }
        return Err(eyre!("configuration is not usable"));
    }

    let device = Box::new(VirtualDisplay::new(
        config.video.frame_size(),
        config.output.slots,
        config.video.frame_interval(),
    ));

    let running = pipeline::launch(&config, degrader_factory(&config.video), device)?;
    let ctx = running.context();

    let source: Box<dyn CaptureSource> = if config.capture.synthetic {
        info!("using the synthetic source");
        Box::new(SyntheticSource::new(&config.video))
    } else {
        match V4l2Source::open(&config.capture, &config.video) {
            Ok(source) => Box::new(source),
            Err(e) => {
                warn!("no usable capture device ({e}), falling back to synthetic");
                Box::new(SyntheticSource::new(&config.video))
            }
        }
    };

    let capture = {
        let sink = running.intake();
        let ctx = ctx.clone();
        thread::Builder::new().name("capture".into()).spawn(move || {
            if let Err(e) = source.run(sink, ctx.clone()) {
                error!("capture stopped with an error: {e}");
                ctx.request_shutdown();
            }
        })?
    };

    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received");
                ctx.request_shutdown();
            }
        });
    }

    let mut beats = 0u32;
    while !ctx.shutdown_requested() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        beats += 1;
        if beats % 10 == 0 {
            info!(
                "status: {} delay={} record={}",
                ctx.counters.snapshot(),
                running.delay_len(),
                running.record_len()
            );
        }
    }

    let snapshot = running.shutdown();
    if capture.join().is_err() {
        error!("capture thread panicked");
    }

    info!("done: {snapshot}");
    Ok(())
}
