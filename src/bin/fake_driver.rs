//! Fake driver: connects to the relay as a driver and logs decoded pose packets.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use hobo_vr::config::{Config, PacketFormat};
use hobo_vr::logging;
use hobo_vr::pose::{decode_binary, parse_text_packet, Device, PoseStruct};
use hobo_vr::poser::{connect_with_retry, RetryPolicy};
use hobo_vr::protocol::{self, TerminatorCodec, CLIENT_MAX_FRAME};

const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "fake_driver", version = hobo_vr::VERSION, about = "hobo_vr test driver")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Relay address (overrides poser.addr)
    #[arg(short, long)]
    addr: Option<String>,
    /// Device layout of incoming packets (overrides poser.pose_struct)
    #[arg(long)]
    pose_struct: Option<String>,
    /// Log every decoded packet instead of a rate summary
    #[arg(short, long)]
    verbose: bool,
}

fn describe(devices: &[Device]) -> String {
    devices
        .iter()
        .map(|d| {
            let [x, y, z] = d.pose().position();
            format!("{}({:.3}, {:.3}, {:.3})", d.kind().as_char(), x, y, z)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode(msg: &[u8], format: PacketFormat, structure: &PoseStruct) -> Result<Vec<Device>> {
    match format {
        PacketFormat::Text => parse_text_packet(&String::from_utf8_lossy(msg), structure),
        PacketFormat::Binary => decode_binary(msg, structure),
    }
}

/// 接続が切れるまで受信し続ける
async fn session(
    addr: &str,
    id: &str,
    terminator: &[u8],
    format: PacketFormat,
    structure: &PoseStruct,
    verbose: bool,
) -> Result<()> {
    let stream = connect_with_retry(addr, RetryPolicy::default()).await?;
    let codec = TerminatorCodec::new(terminator.to_vec(), CLIENT_MAX_FRAME);
    let mut framed = protocol::message_stream(stream, codec);
    framed
        .send(Bytes::from(id.to_string()))
        .await
        .context("failed to send id message")?;
    info!("connected to {} as {:?}", addr, id);

    let mut packets = 0u32;
    let mut stats_timer = Instant::now();
    while let Some(msg) = framed.next().await {
        let msg = msg.context("recv failed")?;
        match decode(&msg, format, structure) {
            Ok(devices) => {
                packets += 1;
                if verbose {
                    info!("{}", describe(&devices));
                } else if stats_timer.elapsed() >= STATS_INTERVAL {
                    info!("{} packets/s, last: {}", packets, describe(&devices));
                    packets = 0;
                    stats_timer = Instant::now();
                }
            }
            Err(e) => debug!("ignoring message {:?}: {e:#}", String::from_utf8_lossy(&msg)),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, load_error) = Config::load_or_default(&args.config);
    logging::init(&config.log, "fake_driver")?;
    if let Some(e) = load_error {
        warn!("{e:#}, using defaults");
    }
    info!("=== hobo_vr fake driver {} ===", hobo_vr::VERSION);

    let addr = args.addr.unwrap_or(config.poser.addr);
    let text = args.pose_struct.unwrap_or(config.poser.pose_struct);
    let structure = PoseStruct::parse(&text).with_context(|| format!("invalid pose struct {:?}", text))?;
    let id = config
        .server
        .driver_tokens
        .first()
        .cloned()
        .unwrap_or_else(|| "hello".to_string());
    let format = config.poser.packet_format;
    info!("expecting {} ({:?} packets)", structure.describe(), format);
    let reconnect_delay = Duration::from_millis(config.poser.retry_delay_ms);

    loop {
        tokio::select! {
            result = session(&addr, &id, config.server.terminator.as_bytes(), format, &structure, args.verbose) => {
                match result {
                    Ok(()) => warn!("relay closed the connection"),
                    Err(e) => warn!("{e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
        info!("reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
    }
}
