//! Per-websocket client handler: command loop, message mixer, system
//! status, and the adaptive outbound writer.
//!
//! Outbound traffic runs in two lanes. Control messages, acks and status
//! go through the priority queue; show frames and stream status are
//! best-effort and droppable. The writer couples the lanes with a
//! leaky-bucket fairness term so a slow viewer skips frames instead of
//! accumulating lag, and control traffic is never starved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::detmap::DetectorMap;
use crate::storage;

use super::bus::{Bus, Subscription};
use super::message::{Cmd, Msg};
use super::status;
use super::stream::build_player;

const BEST_EFFORT_CAPACITY: usize = 100;
const PRIORITY_CAPACITY: usize = 10000;

pub struct ClientHandler {
    pub bus: Bus,
    pub detmap: Arc<DetectorMap>,
    pub max_npr: f64,
    pub clients: Arc<AtomicU64>,
    /// With auto-shutdown enabled, cancelled when the last client leaves.
    pub shutdown: Option<CancellationToken>,
}

impl ClientHandler {
    pub async fn serve<S>(self, ws: WebSocketStream<S>, nickname: String, namespaces: Vec<String>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        log::info!("starting client ws serve for {nickname} with namespaces {namespaces:?}");
        self.clients.fetch_add(1, Ordering::SeqCst);

        let (ws_sink, mut ws_read) = ws.split();
        let cancel = CancellationToken::new();

        let (subscription, broadcast_rx) = Subscription::new(&self.bus, 10);
        for namespace in &namespaces {
            subscription.subscribe(&format!("{namespace} broadcast"));
        }

        let (resp_tx, resp_rx) = mpsc::channel(16);
        let (best_tx, best_rx) = mpsc::channel(BEST_EFFORT_CAPACITY);
        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_CAPACITY);

        tokio::spawn(mixer(
            resp_rx,
            broadcast_rx,
            best_tx,
            priority_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(system_status(priority_tx, cancel.clone()));
        let writer = tokio::spawn(adaptive_writer(
            ws_sink,
            self.max_npr,
            priority_rx,
            best_rx,
            cancel.clone(),
        ));

        let ctx = ClientCtx {
            bus: self.bus.clone(),
            detmap: self.detmap.clone(),
            namespaces,
            nickname,
            subscription,
            resp_tx,
            cancel: cancel.clone(),
        };

        while let Some(incoming) = ws_read.next().await {
            match incoming {
                Ok(Message::Text(text)) => match serde_json::from_str::<Cmd>(&text) {
                    Ok(cmd) => ctx.execute(cmd).await,
                    Err(_) => break,
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        cancel.cancel();
        let _ = writer.await;
        log::info!("stopped client ws serve");

        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = self.clients.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            if let Some(shutdown) = &self.shutdown {
                log::info!("no clients, shutting down");
                shutdown.cancel();
            }
        }
    }
}

struct ClientCtx {
    bus: Bus,
    detmap: Arc<DetectorMap>,
    namespaces: Vec<String>,
    nickname: String,
    subscription: Subscription,
    resp_tx: mpsc::Sender<Msg>,
    cancel: CancellationToken,
}

impl ClientCtx {
    async fn execute(&self, cmd: Cmd) {
        log::info!("client handler: {}", cmd.command);
        match cmd.command.as_str() {
            "get nickname" => {
                self.resp(Msg::new("nickname").with("name", self.nickname.clone()))
                    .await;
            }
            "list streams" => self.list_streams().await,
            "stream cmd" => self.stream_cmd(cmd),
            "stream sub" => self.stream_sub(cmd, true).await,
            "stream unsub" => self.stream_sub(cmd, false).await,
            "ls" => self.list_runs(cmd),
            "get meta" => self.get_run_metadata(cmd),
            "play run" => self.play_run(cmd).await,
            other => log::warn!("unknown client command {other:?}"),
        }
    }

    async fn resp(&self, msg: Msg) {
        let _ = self.resp_tx.send(msg).await;
    }

    async fn list_streams(&self) {
        for namespace in &self.namespaces {
            let prefix = format!("{namespace} stream cmd ");
            for topic in self.bus.active_topics(&format!("{prefix}*")) {
                let name = topic.strip_prefix(&prefix).unwrap_or(&topic).to_string();
                self.resp(Msg::new("stream announce").with("name", name)).await;
            }
        }
    }

    fn stream_cmd(&self, mut cmd: Cmd) {
        let stream = cmd.meta("stream").to_string();
        cmd.command = cmd.meta("stream cmd").to_string();
        cmd.metadata.remove("stream");
        cmd.metadata.remove("stream cmd");
        let Ok(bytes) = serde_json::to_vec(&cmd) else {
            return;
        };
        for namespace in &self.namespaces {
            self.bus.publish(
                &format!("{namespace} stream cmd {stream}"),
                Bytes::from(bytes.clone()),
            );
        }
    }

    async fn stream_sub(&self, cmd: Cmd, subscribe: bool) {
        let stream = cmd.meta("stream");
        for namespace in &self.namespaces {
            let topic = format!("{namespace} stream {stream}");
            if subscribe {
                log::info!("sub to {topic:?}");
                self.subscription.subscribe(&topic);
            } else {
                log::info!("unsub from {topic:?}");
                self.subscription.unsubscribe(&topic);
            }
        }
        let kind = if subscribe { "stream sub" } else { "stream unsub" };
        self.resp(Msg::new(kind).with("stream", stream)).await;
    }

    fn list_runs(&self, cmd: Cmd) {
        let resp_tx = self.resp_tx.clone();
        tokio::spawn(async move {
            let mut msg = Msg::new("run list")
                .with("name", cmd.meta("name"))
                .with("status", "failure")
                .with("url", cmd.meta("url"));
            let result = storage::list_runs(cmd.meta("url"), cmd.meta("credentials")).await;
            match result.and_then(|runs| Ok(serde_json::to_vec(&runs)?)) {
                Ok(payload) => {
                    msg.payload = payload;
                    msg.metadata.insert("status".into(), "success".into());
                }
                Err(e) => msg.payload = e.to_string().into_bytes(),
            }
            let _ = resp_tx.send(msg).await;
        });
    }

    fn get_run_metadata(&self, cmd: Cmd) {
        let resp_tx = self.resp_tx.clone();
        tokio::spawn(async move {
            let mut msg = Msg::new("run meta")
                .with("status", "failure")
                .with("url", cmd.meta("url"));
            let result = async {
                let mut reader =
                    storage::get_reader(cmd.meta("url"), cmd.meta("credentials")).await?;
                reader.skip(0).await?;
                Ok::<_, crate::error::Error>(serde_json::to_vec(&reader.metadata)?)
            }
            .await;
            match result {
                Ok(payload) => {
                    msg.payload = payload;
                    msg.metadata.insert("status".into(), "success".into());
                }
                Err(e) => msg.payload = e.to_string().into_bytes(),
            }
            let _ = resp_tx.send(msg).await;
        });
    }

    async fn play_run(&self, cmd: Cmd) {
        let url = cmd.meta("url").to_string();
        let credentials = cmd.meta("credentials").to_string();
        log::info!("play run url: {url:?}");

        let mut reader = match storage::get_reader(&url, &credentials).await {
            Ok(reader) => reader,
            Err(e) => {
                self.resp(player_failure(&url, &e.to_string())).await;
                return;
            }
        };

        let stream_name = url.rsplit('/').next().unwrap_or(&url).to_string();
        let namespace = self
            .namespaces
            .last()
            .cloned()
            .unwrap_or_else(|| "everyone".to_string());
        let bus = self.bus.clone();
        let detmap = self.detmap.clone();
        let cancel = self.cancel.child_token();
        let resp_tx = self.resp_tx.clone();

        tokio::spawn(async move {
            if let Err(e) = reader.skip(0).await {
                let _ = resp_tx.send(player_failure(&url, &e.to_string())).await;
                return;
            }
            let uid = reader
                .metadata
                .get("UID")
                .filter(|bytes| bytes.len() == 8)
                .map(|bytes| BigEndian::read_u64(bytes))
                .unwrap_or_else(|| {
                    log::info!("falling back to random UID");
                    BigEndian::read_u64(&Uuid::new_v4().as_bytes()[..8])
                });

            let (input_tx, input_rx) = mpsc::channel(1000);
            {
                let cancel = cancel.clone();
                let url = url.clone();
                let resp_tx = resp_tx.clone();
                tokio::spawn(async move {
                    log::info!("player reader for {url:?} started");
                    let mut pass_events = 0usize;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            next = reader.next_event() => match next {
                                Ok(Some(event)) => {
                                    pass_events += 1;
                                    if input_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) | Err(_) => {
                                    // Loop the recording; an empty pass
                                    // backs off instead of spinning.
                                    if pass_events == 0 {
                                        tokio::time::sleep(Duration::from_millis(100)).await;
                                    }
                                    pass_events = 0;
                                    match storage::get_reader(&url, &credentials).await {
                                        Ok(mut next_reader) => {
                                            let _ = next_reader.skip(0).await;
                                            reader = next_reader;
                                        }
                                        Err(e) => {
                                            let _ = resp_tx
                                                .send(player_failure(&url, &e.to_string()))
                                                .await;
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    log::info!("player reader for {url:?} stopped");
                });
            }

            if let Some(ops) = build_player(&namespace, &stream_name, &bus, uid, &detmap) {
                log::info!("player for {stream_name:?} started");
                ops.sink(input_rx).await;
                log::info!("player for {stream_name:?} stopped");
            }
        });
    }
}

fn player_failure(url: &str, error: &str) -> Msg {
    let mut msg = Msg::new("player failure").with("url", url);
    msg.payload = error.as_bytes().to_vec();
    msg
}

/// Merge command responses and bus traffic, classifying each payload into
/// the priority or best-effort lane. Sends are non-blocking; an overflowing
/// lane drops.
async fn mixer(
    mut resp_rx: mpsc::Receiver<Msg>,
    mut broadcast_rx: mpsc::Receiver<Bytes>,
    best_tx: mpsc::Sender<Vec<u8>>,
    priority_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let (buf, kind) = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = resp_rx.recv() => {
                let Some(msg) = msg else { return };
                let Ok(buf) = serde_json::to_vec(&msg) else { continue };
                (buf, msg.kind)
            }
            payload = broadcast_rx.recv() => {
                let Some(payload) = payload else { return };
                let kind = serde_json::from_slice::<Msg>(&payload)
                    .map(|m| m.kind)
                    .unwrap_or_default();
                (payload.to_vec(), kind)
            }
        };

        let queue = match kind.as_str() {
            "show frame" | "stream status" => &best_tx,
            _ => &priority_tx,
        };
        let _ = queue.try_send(buf);
    }
}

/// Once per second, derive CPU usage from two procfs samples and enqueue a
/// system status message on the priority lane.
async fn system_status(priority_tx: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) {
    loop {
        let first = status::cpu_sample();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        let second = status::cpu_sample();

        let mut msg = Msg::new("system status");
        if let (Some(first), Some(second)) = (first, second) {
            if let Some(usage) = status::cpu_usage(first, second) {
                msg.metadata.insert("usage".into(), usage.to_string());
            }
        }
        if let Some(mem) = status::mem_sample() {
            msg.metadata
                .insert("mem res".into(), (mem.resident_kib / 1024).to_string());
            msg.metadata
                .insert("mem virt".into(), (mem.virtual_kib / 1024).to_string());
        }

        if let Ok(buf) = serde_json::to_vec(&msg) {
            if priority_tx.send(buf).await.is_err() {
                return;
            }
        }
    }
}

/// The adaptive outbound scheduler.
///
/// `npr` decays by `1 - min(1, dt)` per tick. An available priority
/// message drains the whole best-effort queue and goes out; otherwise the
/// two lanes race with priority favored, and a winning best-effort message
/// is sent only while `npr < max_npr` (then charged one token), else
/// dropped on the floor.
pub(crate) async fn adaptive_writer<W>(
    mut sink: W,
    max_npr: f64,
    mut priority_rx: mpsc::Receiver<Vec<u8>>,
    mut best_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    let mut npr = 0f64;
    let mut last = Instant::now();
    loop {
        let now = Instant::now();
        let dt = (now - last).as_secs_f64().min(1.0);
        last = now;
        npr *= 1.0 - dt;

        let buf = match priority_rx.try_recv() {
            Ok(buf) => {
                while best_rx.try_recv().is_ok() {}
                Some(buf)
            }
            Err(mpsc::error::TryRecvError::Disconnected) => return,
            Err(mpsc::error::TryRecvError::Empty) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    buf = priority_rx.recv() => {
                        let Some(buf) = buf else { return };
                        Some(buf)
                    }
                    buf = best_rx.recv() => {
                        let Some(buf) = buf else { return };
                        if npr < max_npr {
                            npr += 1.0;
                            Some(buf)
                        } else {
                            None
                        }
                    }
                }
            }
        };

        if let Some(buf) = buf {
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Err(e) = sink.send(Message::Text(text)).await {
                log::debug!("client write failed: {e}");
                return;
            }
        }
    }
}
