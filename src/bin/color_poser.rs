//! Color poser: tracks colored marker spheres with a webcam and streams their
//! positions to the relay as an HMD + controllers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use hobo_vr::calibration::load_calibration;
use hobo_vr::camera::ThreadedCamera;
use hobo_vr::config::Config;
use hobo_vr::logging;
use hobo_vr::pose::Device;
use hobo_vr::poser::{console_commands, PoserBuilder, PoserCommand, PoserFlags};
use hobo_vr::relay::{RelayServer, RelaySettings};
use hobo_vr::tracker::{has_nan_in_pose, BlobTracker, CameraMapping, TrackerHandle, TrackerSettings};

/// トラッカー位置をデバイスへ写す周期
const TRACK_PERIOD: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "color_poser", version = hobo_vr::VERSION, about = "hobo_vr color marker poser")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Camera index (overrides tracker.camera_index)
    #[arg(long)]
    camera: Option<i32>,
    /// Relay address (overrides poser.addr)
    #[arg(short, long)]
    addr: Option<String>,
    /// Run the relay server in this process
    #[arg(long)]
    standalone: bool,
    /// Do not read commands from stdin
    #[arg(long)]
    no_console: bool,
}

fn track_job(
    tracker: TrackerHandle,
    mapping: CameraMapping,
    flags: Arc<PoserFlags>,
) -> impl FnMut(&mut [Device]) -> Result<()> + Send + 'static {
    move |devices: &mut [Device]| {
        if !tracker.is_alive() {
            bail!("tracker is no longer running");
        }
        tracker.set_learning(flags.learning());
        if !flags.use_positions() {
            return Ok(());
        }
        // マスクの順番 = デバイスの順番
        for (i, (device, position)) in devices.iter_mut().zip(tracker.get_poses()).enumerate() {
            if !has_nan_in_pose(&position) {
                mapping.apply(i, device, position);
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (mut config, load_error) = Config::load_or_default(&args.config);
    if let Some(path) = logging::init(&config.log, "color_poser")? {
        info!("logging to {}", path.display());
    }
    if let Some(e) = load_error {
        warn!("{e:#}, using defaults");
    }
    info!("=== hobo_vr color poser {} ===", hobo_vr::VERSION);

    if let Some(index) = args.camera {
        config.tracker.camera_index = index;
    }
    if let Some(addr) = args.addr {
        config.poser.addr = addr;
    }

    let masks = match &config.tracker.calibration_file {
        Some(path) => {
            let cal = load_calibration(path)?;
            info!("loaded {} masks from {}", cal.masks.len(), path);
            cal.masks
        }
        None => config.tracker.masks.clone(),
    };
    if masks.is_empty() {
        bail!("no color masks configured");
    }

    let camera = ThreadedCamera::start(
        config.tracker.camera_index,
        config.tracker.width,
        config.tracker.height,
    )
    .with_context(|| format!("failed to open camera {}", config.tracker.camera_index))?;
    let settings = TrackerSettings::from_config(&config.tracker, &config.smoother);
    let mut tracker = BlobTracker::new(camera, masks, settings)?;
    tracker.start()?;
    info!("tracking {} markers", tracker.masks().len());

    let relay = if args.standalone {
        let server = RelayServer::bind(&config.server.addr, RelaySettings::from_config(&config.server)).await?;
        let local = server.local_addr()?;
        config.poser.addr = format!("127.0.0.1:{}", local.port());
        info!("standalone relay on {}", local);
        let handle = server.handle();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("relay failed: {e:#}");
            }
        });
        Some(handle)
    } else {
        None
    };

    let mapping = CameraMapping::from_config(&config.mapping);
    let flags = Arc::new(PoserFlags::default());
    flags.apply(PoserCommand::Learning(config.smoother.learning));

    let (tx, mut rx) = mpsc::channel(8);
    if !args.no_console {
        tokio::spawn(console_commands(tx.clone()));
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            let _ = tx.send(PoserCommand::Quit).await;
        }
    });

    let retry_delay = Duration::from_millis(config.poser.retry_delay_ms);
    let result = loop {
        let poser = PoserBuilder::from_config(&config.poser, &config.server)?
            .flags(Arc::clone(&flags))
            .task(
                "track",
                TRACK_PERIOD,
                track_job(tracker.handle(), mapping.clone(), Arc::clone(&flags)),
            )
            .build()?;
        match poser.run(&mut rx).await {
            Ok(()) => break Ok(()),
            Err(e) if config.poser.retry && tracker.is_alive() => {
                warn!("{e:#}, reconnecting in {:?}", retry_delay);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => break Err(e),
        }
    };

    tracker.stop();
    info!("tracker processed {} frames", tracker.frame_count());
    if let Some(relay) = relay {
        relay.shutdown();
    }
    result
}
