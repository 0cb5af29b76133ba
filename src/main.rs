//! Bundlecore demo: ZSL preview and burst capture on a virtual camera

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bundlecore::capture::VirtualSource;
use bundlecore::device::{Device, MsgType, Notification};
use bundlecore::Config;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use demo::{Channels, DemoHardware};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(uptime()));

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();
    #[cfg(not(feature = "profiling"))]
    registry.init();
}

fn on_notification(notification: Notification) {
    match notification {
        Notification::CompressedImage(image) => info!(bytes = image.len(), "picture ready"),
        Notification::Error(e) => warn!("device error: {e}"),
        other => info!(?other, "notification"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    init_tracing(&config);

    info!("Bundlecore launching...");

    let source = Arc::new(VirtualSource::new());
    let mut channels: Option<Channels> = None;
    let device = Device::new(&config.device, |events| {
        let hw = DemoHardware::new(&config, source.clone(), events)?;
        channels = Some(hw.channels());
        Ok(hw)
    })?;

    device.set_callbacks(Some(Arc::new(on_notification)))?;
    device.enable_msg_type(MsgType::ALL)?;
    device.start_no_display_preview()?;

    // let the look-back window fill before the shot
    tokio::time::sleep(Duration::from_millis(500)).await;
    device.take_picture()?;
    info!(state = %device.state(), "picture requested");

    let run = config.simulation.run_seconds;
    if run == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = tokio::time::sleep(Duration::from_secs(run)) => {}
        }
    }

    device.stop_preview()?;
    if let Some(channels) = channels {
        info!(stats = ?channels.preview.stats(), "preview channel");
        info!(stats = ?channels.snapshot.stats(), "snapshot channel");
    }

    info!("Bundlecore shutting down");
    Ok(())
}
