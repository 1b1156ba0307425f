//! Poser client: connects to the relay, identifies itself, then streams the
//! device states at a fixed rate while user tasks update them.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control::{PoserCommand, PoserFlags};
use super::task::PoserTask;
use crate::config::{PacketFormat, PoserConfig, ServerConfig};
use crate::pose::{encode_binary, encode_text, Device, PoseStruct};
use crate::protocol::{self, TerminatorCodec};

/// 接続失敗時の再試行方針（固定間隔）
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub delay: Duration,
    /// None なら無制限
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn never() -> Self {
        Self {
            enabled: false,
            delay: Duration::ZERO,
            max_attempts: Some(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

/// `policy` に従って接続できるまで繰り返す
pub async fn connect_with_retry(addr: &str, policy: RetryPolicy) -> Result<TcpStream> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        info!("connecting to the server at {addr:?}...");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed: {e}");
                }
                return Ok(stream);
            }
            Err(e) => {
                let exhausted = policy.max_attempts.map_or(false, |max| attempt >= max);
                if !policy.enabled || exhausted {
                    return Err(e).with_context(|| {
                        format!("failed to connect to {addr} after {attempt} attempt(s)")
                    });
                }
                warn!("connection failed: {e}, retrying in {:?}", policy.delay);
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

pub struct PoserBuilder {
    structure: PoseStruct,
    addr: String,
    id_token: String,
    send_period: Duration,
    format: PacketFormat,
    terminator: Vec<u8>,
    close_token: String,
    retry: RetryPolicy,
    flags: Arc<PoserFlags>,
    tasks: Vec<PoserTask>,
}

impl PoserBuilder {
    pub fn new(structure: PoseStruct) -> Self {
        let poser = PoserConfig::default();
        let server = ServerConfig::default();
        Self {
            structure,
            addr: poser.addr,
            id_token: poser.id_token,
            send_period: period_from_hz(poser.send_hz),
            format: poser.packet_format,
            terminator: server.terminator.into_bytes(),
            close_token: server.close_token,
            retry: RetryPolicy::default(),
            flags: Arc::new(PoserFlags::default()),
            tasks: Vec::new(),
        }
    }

    /// 設定ファイルの [poser] と [server] から組み立てる
    pub fn from_config(poser: &PoserConfig, server: &ServerConfig) -> Result<Self> {
        let structure = PoseStruct::parse(&poser.pose_struct)
            .with_context(|| format!("invalid pose_struct {:?}", poser.pose_struct))?;
        Ok(Self::new(structure)
            .addr(&poser.addr)
            .id_token(&poser.id_token)
            .send_every(period_from_hz(poser.send_hz))
            .packet_format(poser.packet_format)
            .terminator(server.terminator.as_bytes())
            .close_token(&server.close_token)
            .retry(RetryPolicy {
                enabled: poser.retry,
                delay: Duration::from_millis(poser.retry_delay_ms),
                max_attempts: poser.max_attempts,
            }))
    }

    pub fn addr(mut self, addr: &str) -> Self {
        self.addr = addr.to_string();
        self
    }

    pub fn id_token(mut self, token: &str) -> Self {
        self.id_token = token.to_string();
        self
    }

    pub fn send_every(mut self, period: Duration) -> Self {
        self.send_period = period.max(Duration::from_millis(1));
        self
    }

    pub fn packet_format(mut self, format: PacketFormat) -> Self {
        self.format = format;
        self
    }

    pub fn terminator(mut self, terminator: &[u8]) -> Self {
        self.terminator = terminator.to_vec();
        self
    }

    pub fn close_token(mut self, token: &str) -> Self {
        self.close_token = token.to_string();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// 再接続をまたいでフラグを引き継ぐときに使う
    pub fn flags(mut self, flags: Arc<PoserFlags>) -> Self {
        self.flags = flags;
        self
    }

    /// 周期タスクを追加する（名前は重複不可）
    pub fn task<F>(mut self, name: &str, period: Duration, job: F) -> Self
    where
        F: FnMut(&mut [Device]) -> Result<()> + Send + 'static,
    {
        self.tasks.push(PoserTask::new(name, period, job));
        self
    }

    pub fn build(self) -> Result<Poser> {
        for (i, t) in self.tasks.iter().enumerate() {
            if matches!(t.name(), "send" | "recv" | "control")
                || self.tasks[..i].iter().any(|o| o.name() == t.name())
            {
                bail!("task name {:?} is already in use", t.name());
            }
        }
        Ok(Poser {
            devices: Arc::new(Mutex::new(self.structure.devices())),
            flags: self.flags,
            last_read: Arc::new(Mutex::new(None)),
            structure: self.structure,
            addr: self.addr,
            id_token: self.id_token,
            send_period: self.send_period,
            format: self.format,
            terminator: self.terminator,
            close_token: self.close_token,
            retry: self.retry,
            tasks: self.tasks,
        })
    }
}

fn period_from_hz(hz: f64) -> Duration {
    if hz.is_finite() && hz > 0.0 {
        Duration::from_secs_f64(1.0 / hz)
    } else {
        Duration::from_millis(10)
    }
}

pub struct Poser {
    structure: PoseStruct,
    devices: Arc<Mutex<Vec<Device>>>,
    flags: Arc<PoserFlags>,
    last_read: Arc<Mutex<Option<Bytes>>>,
    addr: String,
    id_token: String,
    send_period: Duration,
    format: PacketFormat,
    terminator: Vec<u8>,
    close_token: String,
    retry: RetryPolicy,
    tasks: Vec<PoserTask>,
}

impl Poser {
    pub fn structure(&self) -> &PoseStruct {
        &self.structure
    }

    pub fn devices(&self) -> Arc<Mutex<Vec<Device>>> {
        Arc::clone(&self.devices)
    }

    pub fn flags(&self) -> Arc<PoserFlags> {
        Arc::clone(&self.flags)
    }

    /// サーバーから最後に受け取ったメッセージ（run中も参照できる）
    pub fn last_read(&self) -> Arc<Mutex<Option<Bytes>>> {
        Arc::clone(&self.last_read)
    }

    fn encode(&self, devices: &[Device]) -> Bytes {
        // 終端はコーデックが付ける
        let packet = match self.format {
            PacketFormat::Text => encode_text(devices, &[]),
            PacketFormat::Binary => encode_binary(devices, &[]),
        };
        Bytes::from(packet)
    }

    /// Quit を受けるまで送信を続ける。接続が切れたらエラー。
    pub async fn run(mut self, control: &mut mpsc::Receiver<PoserCommand>) -> Result<()> {
        let stream = connect_with_retry(&self.addr, self.retry).await?;
        let codec = TerminatorCodec::new(self.terminator.clone(), protocol::CLIENT_MAX_FRAME);
        let (mut sink, mut reader) = protocol::message_stream(stream, codec).split();
        sink.send(Bytes::from(self.id_token.clone().into_bytes()))
            .await
            .context("failed to send id message")?;
        info!("connected as {:?} with devices {}", self.id_token, self.structure);

        let cancel = CancellationToken::new();
        let lost = CancellationToken::new();

        let recv_task = {
            let last_read = Arc::clone(&self.last_read);
            let lost = lost.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = reader.next() => next,
                    };
                    match next {
                        Some(Ok(msg)) => {
                            *last_read.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg);
                        }
                        Some(Err(e)) => {
                            warn!("recv failed: {e}");
                            lost.cancel();
                            break;
                        }
                        None => {
                            warn!("server closed the connection");
                            lost.cancel();
                            break;
                        }
                    }
                }
            })
        };

        let mut handles = vec![recv_task];
        for task in std::mem::take(&mut self.tasks) {
            handles.push(tokio::spawn(task.run(Arc::clone(&self.devices), cancel.clone())));
        }

        let mut ticker = tokio::time::interval(self.send_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut control_open = true;

        let result = loop {
            tokio::select! {
                _ = lost.cancelled() => break Err(anyhow::anyhow!("connection to {} lost", self.addr)),
                cmd = control.recv(), if control_open => match cmd {
                    Some(cmd) => {
                        debug!("command {:?}", cmd);
                        if !self.flags.apply(cmd) {
                            info!("closing...");
                            break Ok(());
                        }
                    }
                    None => control_open = false,
                },
                _ = ticker.tick() => {
                    let packet = {
                        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
                        self.encode(&devices)
                    };
                    if let Err(e) = sink.send(packet).await {
                        warn!("send failed: {e}");
                        break Err(anyhow::anyhow!("connection to {} lost", self.addr));
                    }
                }
            }
        };

        cancel.cancel();
        if result.is_ok() {
            if let Err(e) = sink.send(Bytes::from(self.close_token.clone().into_bytes())).await {
                warn!("failed to send close message: {e}");
            }
        }
        if let Err(e) = sink.close().await {
            debug!("failed to close connection: {e}");
        }
        for h in handles {
            let _ = h.await;
        }
        info!("poser finished");
        result
    }
}
