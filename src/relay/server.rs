//! Relay server: classifies each peer from its first line and fans messages
//! out between drivers and posers.
//!
//! Membership is owned by a single hub task. Connection tasks report joins,
//! messages and departures over one channel, so a sender's messages are
//! dispatched in the order they were read. Every connection has its own writer
//! task fed by a bounded outbox. A full outbox is waited on for up to
//! `send_timeout`, which pushes back on senders through the hub queue and
//! their sockets. A recipient that does not drain within that time is marked
//! stalled and skipped until its outbox has room again.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peers::{Classifier, ConnId, Membership, Peers, Role};
use crate::config::ServerConfig;
use crate::protocol::{self, TerminatorCodec};

const HUB_QUEUE: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub terminator: Vec<u8>,
    pub read_budget: usize,
    pub classifier: Classifier,
    pub close_token: Vec<u8>,
    pub outbox_capacity: usize,
    pub send_timeout: Duration,
    pub show_messages: bool,
}

impl RelaySettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            terminator: config.terminator.as_bytes().to_vec(),
            read_budget: config.read_budget,
            classifier: Classifier::new(config.driver_tokens.as_slice(), config.poser_tokens.as_slice()),
            close_token: config.close_token.as_bytes().to_vec(),
            outbox_capacity: config.outbox_capacity.max(1),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            show_messages: config.show_messages,
        }
    }

    /// Chunks are relayed verbatim, terminator included.
    fn codec(&self) -> TerminatorCodec {
        TerminatorCodec::passthrough(self.terminator.clone(), self.read_budget)
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

enum HubEvent {
    Joined {
        id: ConnId,
        addr: SocketAddr,
        role: Role,
        outbox: mpsc::Sender<Bytes>,
    },
    Message {
        from: ConnId,
        payload: Bytes,
    },
    Left {
        id: ConnId,
    },
    Snapshot(oneshot::Sender<Membership>),
}

pub struct RelayServer {
    listener: TcpListener,
    settings: Arc<RelaySettings>,
    hub_tx: mpsc::Sender<HubEvent>,
    hub_rx: mpsc::Receiver<HubEvent>,
    shutdown: CancellationToken,
}

/// Control handle for a running relay server.
#[derive(Clone)]
pub struct RelayHandle {
    hub: mpsc::Sender<HubEvent>,
    shutdown: CancellationToken,
}

impl RelayHandle {
    /// Current membership, as seen by the hub.
    pub async fn membership(&self) -> Result<Membership> {
        let (tx, rx) = oneshot::channel();
        self.hub
            .send(HubEvent::Snapshot(tx))
            .await
            .map_err(|_| anyhow::anyhow!("relay server stopped"))?;
        rx.await.context("relay server stopped")
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl RelayServer {
    pub async fn bind(addr: &str, settings: RelaySettings) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let (hub_tx, hub_rx) = mpsc::channel(HUB_QUEUE);
        Ok(Self {
            listener,
            settings: Arc::new(settings),
            hub_tx,
            hub_rx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            hub: self.hub_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Serve until `RelayHandle::shutdown` is called.
    pub async fn run(self) -> Result<()> {
        let RelayServer {
            listener,
            settings,
            hub_tx,
            hub_rx,
            shutdown,
        } = self;

        let hub = tokio::spawn(run_hub(hub_rx, settings.send_timeout, shutdown.clone()));
        info!("[relay] serving on {}", listener.local_addr()?);

        let mut next_id: ConnId = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("[relay] {addr}: set_nodelay failed: {e}");
                        }
                        tokio::spawn(handle_connection(
                            next_id,
                            stream,
                            addr,
                            Arc::clone(&settings),
                            hub_tx.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("[relay] accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        drop(hub_tx);
        if let Err(e) = hub.await {
            warn!("[relay] hub task failed: {e}");
        }
        info!("[relay] stopped");
        Ok(())
    }
}

async fn run_hub(mut rx: mpsc::Receiver<HubEvent>, send_timeout: Duration, shutdown: CancellationToken) {
    let mut peers: Peers<mpsc::Sender<Bytes>> = Peers::new();
    // 送信キューが詰まったままの接続
    let mut stalled: HashSet<ConnId> = HashSet::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(e) => e,
                None => break,
            },
        };

        match event {
            HubEvent::Joined { id, addr, role, outbox } => {
                peers.insert(id, addr, role, outbox);
                debug!("[relay] {} peers connected", peers.len());
            }
            HubEvent::Message { from, payload } => {
                for (id, peer) in peers.recipients(from) {
                    if stalled.contains(&id) {
                        match peer.outbox.try_send(payload.clone()) {
                            Ok(()) => {
                                stalled.remove(&id);
                                info!("[relay] {} is draining again", peer.addr);
                            }
                            Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                debug!("[relay] {} already closing", peer.addr);
                            }
                        }
                        continue;
                    }
                    match tokio::time::timeout(send_timeout, peer.outbox.send(payload.clone())).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => debug!("[relay] {} already closing", peer.addr),
                        Err(_) => {
                            warn!(
                                "[relay] {} not reading for {:?}, skipping it until it drains",
                                peer.addr, send_timeout
                            );
                            stalled.insert(id);
                        }
                    }
                }
            }
            HubEvent::Left { id } => {
                stalled.remove(&id);
                if peers.remove(id).is_some() {
                    debug!("[relay] {} peers connected", peers.len());
                }
            }
            HubEvent::Snapshot(reply) => {
                let _ = reply.send(peers.membership());
            }
        }
    }
}

async fn handle_connection(
    id: ConnId,
    stream: TcpStream,
    addr: SocketAddr,
    settings: Arc<RelaySettings>,
    hub: mpsc::Sender<HubEvent>,
    shutdown: CancellationToken,
) {
    info!("[relay] new connection from {addr}");
    let framing = settings.codec();
    let (mut sink, mut reader) = protocol::message_stream(stream, framing.clone()).split();
    let is_close = |frame: &[u8]| framing.content(frame) == settings.close_token.as_slice();

    // 最初のフレームがidトークン
    let token = tokio::select! {
        _ = shutdown.cancelled() => return,
        first = reader.next() => match first {
            Some(Ok(token)) => token,
            Some(Err(e)) => {
                warn!("[relay] {addr} broke before id: {e}");
                return;
            }
            None => {
                info!("[relay] {addr} closed before id");
                return;
            }
        },
    };
    if is_close(&token) {
        info!("[relay] connection to {addr} closed");
        return;
    }

    let role = settings.classifier.classify(framing.content(&token));
    match role {
        Role::Driver => info!("[relay] {addr} is a driver"),
        Role::Poser => info!("[relay] {addr} is a poser"),
        Role::Unclassified => info!(
            "[relay] {addr} sent unknown id {:?}",
            String::from_utf8_lossy(framing.content(&token))
        ),
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(settings.outbox_capacity);
    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                msg = out_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            // 読まない相手への書き込みで止まったままにならないように
            let written = tokio::select! {
                _ = writer_shutdown.cancelled() => break,
                written = sink.send(msg) => written,
            };
            if let Err(e) = written {
                warn!("[relay] write to {addr} failed: {e}");
                break;
            }
        }
        if let Err(e) = sink.close().await {
            debug!("[relay] error on {addr} close: {e}");
        }
    });

    let joined = HubEvent::Joined {
        id,
        addr,
        role,
        outbox: out_tx,
    };
    if hub.send(joined).await.is_ok() {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = reader.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("[relay] {addr} broke: {e}");
                        break;
                    }
                    None => break,
                },
            };
            if is_close(&frame) {
                break;
            }
            if settings.show_messages {
                info!("[relay] {:?} from {addr}", String::from_utf8_lossy(framing.content(&frame)));
            }
            let event = HubEvent::Message {
                from: id,
                payload: frame,
            };
            if hub.send(event).await.is_err() {
                break;
            }
        }
        let _ = hub.send(HubEvent::Left { id }).await;
    }

    // hubが送信側を手放すとwriterは残りを書き切って終わる
    if let Err(e) = writer.await {
        warn!("[relay] writer for {addr} failed: {e}");
    }
    info!("[relay] connection to {addr} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;
    use tokio_util::codec::Framed;

    type Client = Framed<TcpStream, TerminatorCodec>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start() -> (SocketAddr, RelayHandle) {
        start_with(RelaySettings::default()).await
    }

    async fn start_with(settings: RelaySettings) -> (SocketAddr, RelayHandle) {
        let server = RelayServer::bind("127.0.0.1:0", settings).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    async fn connect(addr: SocketAddr, id: &'static [u8]) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, TerminatorCodec::default());
        client.send(Bytes::from_static(id)).await.unwrap();
        client
    }

    async fn wait_until<F: Fn(&Membership) -> bool>(handle: &RelayHandle, cond: F) -> Membership {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let m = handle.membership().await.unwrap();
            if cond(&m) {
                return m;
            }
            assert!(tokio::time::Instant::now() < deadline, "membership never settled: {m:?}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn recv(client: &mut Client) -> Bytes {
        timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_classification() {
        let (addr, handle) = start().await;
        let driver = connect(addr, b"hello").await;
        let poser = connect(addr, b"holla").await;
        let other = connect(addr, b"who dis").await;

        let m = wait_until(&handle, |m| m.len() == 3).await;
        assert_eq!(m.role_of(driver.get_ref().local_addr().unwrap()), Some(Role::Driver));
        assert_eq!(m.role_of(poser.get_ref().local_addr().unwrap()), Some(Role::Poser));
        assert_eq!(m.role_of(other.get_ref().local_addr().unwrap()), Some(Role::Unclassified));
        assert_eq!(m.drivers.len(), 1);
        assert_eq!(m.posers.len(), 1);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_routing_without_echo() {
        let (addr, handle) = start().await;
        let mut driver = connect(addr, b"hello").await;
        let mut poser = connect(addr, b"poser here").await;
        let mut other = connect(addr, b"lurker").await;
        wait_until(&handle, |m| m.len() == 3).await;

        driver.send(Bytes::from_static(b"from driver")).await.unwrap();
        assert_eq!(recv(&mut poser).await, &b"from driver"[..]);
        assert_eq!(recv(&mut other).await, &b"from driver"[..]);

        poser.send(Bytes::from_static(b"0 0 0 1 0 0 0")).await.unwrap();
        // 自分の送ったメッセージは返ってこない
        assert_eq!(recv(&mut driver).await, &b"0 0 0 1 0 0 0"[..]);

        // poserの送信はunclassifiedに届かない
        driver.send(Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(recv(&mut other).await, &b"second"[..]);
        assert_eq!(recv(&mut poser).await, &b"second"[..]);

        other.send(Bytes::from_static(b"hi all")).await.unwrap();
        assert_eq!(recv(&mut driver).await, &b"hi all"[..]);
        assert_eq!(recv(&mut poser).await, &b"hi all"[..]);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_payload_after_id_in_first_read() {
        let (addr, handle) = start().await;
        let mut driver = connect(addr, b"hello").await;
        wait_until(&handle, |m| m.drivers.len() == 1).await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"holla\n1 2 3\n").await.unwrap();
        assert_eq!(recv(&mut driver).await, &b"1 2 3"[..]);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_long_message_relayed_intact() {
        let (addr, handle) = start().await;
        let mut driver = connect(addr, b"hello").await;
        let mut poser = connect(addr, b"holla").await;
        wait_until(&handle, |m| m.len() == 2).await;

        // 読み込み上限(400B)を超えるパケットも分割されたまま順に中継される
        let long: Vec<u8> = (0..1000).map(|i| b'0' + (i % 10) as u8).collect();
        poser.send(Bytes::from(long.clone())).await.unwrap();
        poser.send(Bytes::from_static(b"next")).await.unwrap();
        assert_eq!(recv(&mut driver).await, &long[..]);
        assert_eq!(recv(&mut driver).await, &b"next"[..]);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_cleanup() {
        let (addr, handle) = start().await;
        let mut driver = connect(addr, b"hello").await;
        let gone = connect(addr, b"holla").await;
        let gone_addr = gone.get_ref().local_addr().unwrap();
        wait_until(&handle, |m| m.posers.len() == 1).await;

        drop(gone);
        let m = wait_until(&handle, |m| m.posers.is_empty()).await;
        assert_eq!(m.role_of(gone_addr), None);

        // 切断済みの相手への配送を試みず、新しい相手には届く
        let mut fresh = connect(addr, b"holla").await;
        wait_until(&handle, |m| m.posers.len() == 1).await;
        driver.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(recv(&mut fresh).await, &b"pong"[..]);

        fresh.send(Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(recv(&mut driver).await, &b"back"[..]);
        handle.shutdown();
    }

    fn numbered(i: usize) -> Bytes {
        Bytes::from(format!("{i:06} {}", "x".repeat(290)))
    }

    /// 別タスクから`count`件を送り続ける
    fn flood(mut sender: Client, count: usize) -> tokio::task::JoinHandle<Client> {
        tokio::spawn(async move {
            for i in 0..count {
                sender.send(numbered(i)).await.unwrap();
            }
            sender
        })
    }

    #[tokio::test]
    async fn test_burst_reaches_healthy_driver_in_full() {
        let settings = RelaySettings {
            outbox_capacity: 2,
            ..RelaySettings::default()
        };
        let (addr, handle) = start_with(settings).await;
        let mut driver = connect(addr, b"hello").await;
        let poser = connect(addr, b"holla").await;
        wait_until(&handle, |m| m.len() == 2).await;

        const COUNT: usize = 5000;
        let sending = flood(poser, COUNT);
        for i in 0..COUNT {
            assert_eq!(recv(&mut driver).await, numbered(i));
        }
        timeout(WAIT, sending).await.unwrap().unwrap();
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_stalled_driver_does_not_starve_others() {
        let settings = RelaySettings {
            outbox_capacity: 2,
            send_timeout: Duration::from_millis(50),
            ..RelaySettings::default()
        };
        let (addr, handle) = start_with(settings).await;
        // 接続したまま一切読まない
        let stalled = connect(addr, b"hello").await;
        let mut healthy = connect(addr, b"hello").await;
        let poser = connect(addr, b"holla").await;
        wait_until(&handle, |m| m.drivers.len() == 2 && m.posers.len() == 1).await;

        const COUNT: usize = 20000;
        let sending = flood(poser, COUNT);
        for i in 0..COUNT {
            assert_eq!(recv(&mut healthy).await, numbered(i));
        }
        timeout(WAIT, sending).await.unwrap().unwrap();

        let m = handle.membership().await.unwrap();
        assert_eq!(m.role_of(stalled.get_ref().local_addr().unwrap()), Some(Role::Driver));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_aborted_connection_is_dropped() {
        let (addr, handle) = start().await;
        let mut driver = connect(addr, b"hello").await;
        let mut poser = connect(addr, b"holla").await;
        let aborted = connect(addr, b"holla").await;
        let aborted_addr = aborted.get_ref().local_addr().unwrap();
        wait_until(&handle, |m| m.posers.len() == 2).await;

        // lingerを0にして閉じるとRSTで切れる
        aborted.get_ref().set_linger(Some(Duration::ZERO)).unwrap();
        drop(aborted);
        let m = wait_until(&handle, |m| m.posers.len() == 1).await;
        assert_eq!(m.role_of(aborted_addr), None);

        for i in 0..10 {
            driver.send(numbered(i)).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(recv(&mut poser).await, numbered(i));
        }
        poser.send(Bytes::from_static(b"still here")).await.unwrap();
        assert_eq!(recv(&mut driver).await, &b"still here"[..]);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_close_token() {
        let (addr, handle) = start().await;
        let mut poser = connect(addr, b"holla").await;
        wait_until(&handle, |m| m.posers.len() == 1).await;

        poser.send(Bytes::from_static(b"CLOSE")).await.unwrap();
        let end = timeout(WAIT, poser.next()).await.unwrap();
        assert!(end.is_none() || end.unwrap().is_err());
        wait_until(&handle, |m| m.is_empty()).await;
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_membership_queries() {
        let server = RelayServer::bind("127.0.0.1:0", RelaySettings::default())
            .await
            .unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        assert!(handle.membership().await.unwrap().is_empty());

        handle.shutdown();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert!(handle.membership().await.is_err());
    }
}
