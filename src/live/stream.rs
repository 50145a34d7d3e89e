//! Per-stream controller: owns the active shows, routes commands, feeds
//! source samples, publishes frames, and records runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::detmap::{DetectorMap, Mode};
use crate::event::Event;
use crate::model::{Hv, Temp};
use crate::ops::{EventOp, EventProcessor, Op, OpArray, StreamOp};
use crate::process::{
    assemble_frame, keep_only_raw_frames, merge, BeamReconstruction, Correlator, Mapper, Pedestals,
    Player,
};
use crate::storage;
use crate::wire;

use super::bus::Bus;
use super::message::{Cmd, Msg};
use super::shows::{self, Show, ShowKind, ShowSample, SourceSample};
use super::sources::generate_current_mode_sources;

pub const RUN_DATE_FORMAT: &str = "%Y_%b%-d_%H_%M_%S_UTC";

const SHOW_QUEUE_CAPACITY: usize = 10000;
const RUN_QUEUE_CAPACITY: usize = 10000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SourceKind {
    #[default]
    Normal,
    Advanced,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Normal => "Normal",
            SourceKind::Advanced => "Advanced",
        }
    }
}

/// A logical signal inside the stream (e.g. "Axis 0 Current"), classified
/// on first sample and subscribed to by zero or more shows.
pub struct SourceInfo {
    pub name: String,
    pub show_ids: Vec<Uuid>,
    pub compat_shows: Vec<ShowKind>,
    pub kind: SourceKind,
}

struct ShowEntry {
    show: Arc<dyn Show>,
    cancel: CancellationToken,
    sample_tx: mpsc::Sender<ShowSample>,
}

pub type GenerateSources = fn(&mut StreamManager, &Event);

pub struct StreamManager {
    pub namespace: String,
    pub name: String,
    pub bus: Bus,
    pub generate_sources: GenerateSources,
    pub cleanup_run_data: Vec<EventProcessor>,

    show_info: HashMap<Uuid, ShowEntry>,
    source_info: HashMap<String, SourceInfo>,

    run_tx: Option<mpsc::Sender<Event>>,
    run_filename: String,

    do_pub_desc: bool,
    last_temp_meta: Option<Vec<u8>>,
    last_hv_meta: Option<Vec<u8>>,
    start_time: Instant,
    cancel: CancellationToken,
}

impl StreamManager {
    pub fn new(
        namespace: &str,
        name: &str,
        bus: &Bus,
        generate_sources: GenerateSources,
    ) -> Self {
        StreamManager {
            namespace: namespace.to_string(),
            name: name.to_string(),
            bus: bus.clone(),
            generate_sources,
            cleanup_run_data: Vec::new(),
            show_info: HashMap::new(),
            source_info: HashMap::new(),
            run_tx: None,
            run_filename: String::new(),
            do_pub_desc: false,
            last_temp_meta: None,
            last_hv_meta: None,
            start_time: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    fn stream_topic(&self) -> String {
        format!("{} stream {}", self.namespace, self.name)
    }

    /// The manager's select loop: events from the pipeline on one side,
    /// commands from the bus on the other. Every event is forwarded
    /// downstream after source generation; shows and an active recording
    /// see it on the way through.
    pub async fn manage(mut self, mut input: mpsc::Receiver<Event>, output: mpsc::Sender<Event>) {
        let cmd_topic = format!("{} stream cmd {}", self.namespace, self.name);
        let mut cmds = self.bus.subscribe(&cmd_topic);
        log::info!("listening for commands on {cmd_topic:?}");

        self.announce();
        self.start_time = Instant::now();

        loop {
            tokio::select! {
                event = input.recv() => {
                    let Some(event) = event else { break };
                    self.handle_metadata(&event);
                    let generate = self.generate_sources;
                    generate(&mut self, &event);

                    if let Some(run_tx) = &self.run_tx {
                        // Non-blocking: a stalled recording drops events
                        // rather than stalling the stream.
                        let _ = run_tx.try_send(event.clone());
                    }
                    if output.send(event).await.is_err() {
                        break;
                    }
                }
                cmd = cmds.recv() => {
                    match cmd {
                        Ok(bytes) => {
                            let Ok(cmd) = serde_json::from_slice::<Cmd>(&bytes) else {
                                continue;
                            };
                            if cmd.command == "kill" {
                                break;
                            }
                            self.execute(cmd).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("stream {} dropped {n} commands", self.name);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        self.rm_all_shows();
        self.close_stream();
        self.cancel.cancel();
        log::info!("stream manager {} done", self.name);
    }

    async fn execute(&mut self, mut cmd: Cmd) {
        log::info!("stream manager {}: {}", self.name, cmd.command);
        match cmd.command.as_str() {
            "new show" => self.new_show(&mut cmd),
            "map source" => self.map_source(&cmd),
            "rm show" => self.rm_show(&cmd),
            "rm all shows" => self.rm_all_shows(),
            "show cmd" => self.show_cmd(&mut cmd),
            "pub all shows" => self.pub_all_shows(),
            "list all sources" => self.list_all_sources(),
            "start run" => self.start_run(&mut cmd).await,
            "stop run" => self.stop_run(),
            "pub desc" => self.do_pub_desc = true,
            other => log::warn!("unknown stream command {other:?}"),
        }
    }

    fn announce(&self) {
        let msg = Msg::new("stream announce").with("name", self.name.clone());
        self.bus
            .publish_msg(&format!("{} broadcast", self.namespace), &msg);
    }

    fn close_stream(&self) {
        let msg = Msg::new("stream close").with("name", self.name.clone());
        self.bus
            .publish_msg(&format!("{} broadcast", self.namespace), &msg);
    }

    fn new_show(&mut self, cmd: &mut Cmd) {
        let mut period = Duration::from_nanos(
            cmd.metadata
                .get("period")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0),
        );
        if period.is_zero() {
            period = Duration::from_millis(50);
        } else if period < Duration::from_millis(10) {
            period = Duration::from_millis(10);
        }

        let Some(kind) = ShowKind::from_label(cmd.meta("type")) else {
            return;
        };
        let show = shows::new_show(kind, period);

        let cancel = self.cancel.child_token();
        let show_id = Uuid::new_v4();
        let id_string = show_id.to_string();
        let (sample_tx, mut sample_rx) = mpsc::channel(SHOW_QUEUE_CAPACITY);
        self.show_info.insert(
            show_id,
            ShowEntry {
                show: show.clone(),
                cancel: cancel.clone(),
                sample_tx,
            },
        );

        // Frame publisher.
        {
            let show = show.clone();
            let bus = self.bus.clone();
            let topic = self.stream_topic();
            let stream_name = self.name.clone();
            let id_string = id_string.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                log::info!("starting show {id_string} frame publisher");
                show.update_frame();

                let mut last_frame_count = 0u64;
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let (frame, frame_count) = show.frame();
                    let sleep = if frame_count != last_frame_count {
                        if let Some(mut msg) = frame {
                            msg.kind = "show frame".to_string();
                            msg.metadata.insert("show id".into(), id_string.clone());
                            msg.metadata
                                .insert("stream name".into(), stream_name.clone());
                            bus.publish_msg(&topic, &msg);
                        }
                        period
                    } else {
                        Duration::from_millis(1)
                    };
                    last_frame_count = frame_count;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }

                let msg = Msg::new("show close")
                    .with("stream", stream_name.clone())
                    .with("show id", id_string.clone());
                bus.publish_msg(&topic, &msg);
                log::info!("stopped show {id_string} frame publisher");
            });
        }

        // Sample consumer.
        {
            let show = show.clone();
            let id_string = id_string.clone();
            tokio::spawn(async move {
                log::info!("starting show {id_string} sample consumer");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sample = sample_rx.recv() => {
                            let Some(sample) = sample else { break };
                            show.add_sample(&sample);
                        }
                    }
                }
                log::info!("stopped show {id_string} sample consumer");
            });
        }

        cmd.metadata.insert("show id".into(), id_string);
        self.map_source(cmd);

        cmd.metadata
            .insert("show cmd".into(), "set params".into());
        self.show_cmd(cmd);
    }

    fn map_source(&mut self, cmd: &Cmd) {
        let sources = cmd.meta("source");
        if sources.is_empty() {
            return;
        }
        let Ok(show_id) = Uuid::parse_str(cmd.meta("show id")) else {
            return;
        };
        if !self.show_info.contains_key(&show_id) {
            return;
        }

        for source in sources.split(',') {
            let source = source.trim();
            if source.is_empty() {
                continue;
            }
            let info = self
                .source_info
                .entry(source.to_string())
                .or_insert_with(|| SourceInfo {
                    name: source.to_string(),
                    show_ids: Vec::new(),
                    compat_shows: Vec::new(),
                    kind: SourceKind::Normal,
                });
            if !info.show_ids.contains(&show_id) {
                info.show_ids.push(show_id);
            }
        }
    }

    fn rm_show(&mut self, cmd: &Cmd) {
        let Ok(show_id) = Uuid::parse_str(cmd.meta("show id")) else {
            return;
        };
        if let Some(entry) = self.show_info.remove(&show_id) {
            entry.cancel.cancel();
        }
        for info in self.source_info.values_mut() {
            info.show_ids.retain(|&id| id != show_id);
        }
    }

    fn rm_all_shows(&mut self) {
        for entry in self.show_info.values() {
            entry.cancel.cancel();
        }
        self.show_info.clear();
        for info in self.source_info.values_mut() {
            info.show_ids.clear();
        }
    }

    fn show_cmd(&mut self, cmd: &mut Cmd) {
        let Ok(show_id) = Uuid::parse_str(cmd.meta("show id")) else {
            return;
        };
        let Some(entry) = self.show_info.get(&show_id) else {
            return;
        };
        cmd.command = cmd.meta("show cmd").to_string();
        cmd.metadata.remove("show id");
        cmd.metadata.remove("show cmd");
        entry.show.execute(cmd);
    }

    fn pub_all_shows(&self) {
        for entry in self.show_info.values() {
            entry.show.update_frame_count();
        }
    }

    fn list_all_sources(&self) {
        for name in self.source_info.keys().cloned().collect::<Vec<_>>() {
            self.list_source(&name);
        }
    }

    fn list_source(&self, name: &str) {
        let Some(info) = self.source_info.get(name) else {
            return;
        };
        let compat = info
            .compat_shows
            .iter()
            .map(|kind| kind.label())
            .collect::<Vec<_>>()
            .join(", ");
        let msg = Msg::new("source announce")
            .with("stream", self.name.clone())
            .with("source", name)
            .with("compat shows", compat)
            .with("type", info.kind.label());
        self.bus.publish_msg(&self.stream_topic(), &msg);
    }

    /// Lazily create the bookkeeping entry for a source.
    pub fn get_source_info(&mut self, name: &str) -> &mut SourceInfo {
        self.source_info
            .entry(name.to_string())
            .or_insert_with(|| SourceInfo {
                name: name.to_string(),
                show_ids: Vec::new(),
                compat_shows: Vec::new(),
                kind: SourceKind::Normal,
            })
    }

    /// Classify and deliver one source value. The first sample fixes the
    /// source's compatible show kind and announces it; delivery to show
    /// queues is non-blocking, overflow drops the sample.
    pub fn handle_source(&mut self, name: &str, kind: SourceKind, value: SourceSample) {
        let compat = value.kind();
        let (announce, show_ids) = {
            let info = self.get_source_info(name);
            info.kind = kind;
            let announce = info.compat_shows.is_empty();
            if announce {
                info.compat_shows = vec![compat];
            }
            (announce, info.show_ids.clone())
        };
        if announce {
            self.list_source(name);
        }

        if show_ids.is_empty() {
            return;
        }
        let sample = ShowSample {
            source: name.to_string(),
            value,
        };
        for show_id in show_ids {
            if let Some(entry) = self.show_info.get(&show_id) {
                if entry.show.kind() == compat {
                    let _ = entry.sample_tx.try_send(sample.clone());
                }
            }
        }
    }

    async fn start_run(&mut self, cmd: &mut Cmd) {
        let stamp = chrono::Utc::now().format(RUN_DATE_FORMAT);
        let url = format!("{}/{stamp}.proio", cmd.meta("url"));
        let credentials = cmd.metadata.remove("credentials").unwrap_or_default();
        cmd.metadata.remove("url");

        let mut writer = match storage::get_writer(&url, &credentials).await {
            Ok(writer) => writer,
            Err(e) => {
                log::warn!("cannot start run at {url:?}: {e}");
                return;
            }
        };
        self.run_filename = url
            .split_once("://")
            .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
            .unwrap_or("")
            .to_string();

        // Replacing the sender ends any previous recording task.
        let (run_tx, mut run_rx) = mpsc::channel(RUN_QUEUE_CAPACITY);
        self.run_tx = Some(run_tx);
        log::info!("starting run {url}");

        writer.set_compression(wire::Compression::Lz4);
        for (key, value) in &cmd.metadata {
            if let Err(e) = writer.push_metadata(key, value.as_bytes()).await {
                log::warn!("cannot write run metadata {key:?}: {e}");
            }
        }

        let msg = Msg::new("stream status")
            .with("stream", self.name.clone())
            .with("Run", self.run_filename.clone());
        self.bus.publish_msg(&self.stream_topic(), &msg);

        let strip_keys: Vec<String> = cmd.metadata.keys().cloned().collect();
        let cleanup = self.cleanup_run_data.clone();
        let cancel = self.cancel.child_token();
        let bus = self.bus.clone();
        let topic = self.stream_topic();
        let stream_name = self.name.clone();
        let run_url = url.clone();
        tokio::spawn(async move {
            let ticker_cancel = cancel.child_token();
            {
                let ticker_cancel = ticker_cancel.clone();
                let bus = bus.clone();
                let topic = topic.clone();
                let stream_name = stream_name.clone();
                tokio::spawn(async move {
                    let start = Instant::now();
                    loop {
                        tokio::select! {
                            _ = ticker_cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                        }
                        let run_time = Duration::from_millis(
                            start.elapsed().as_millis() as u64 / 100 * 100,
                        );
                        let msg = Msg::new("stream status")
                            .with("stream", stream_name.clone())
                            .with("Run Time", format!("{run_time:?}"));
                        bus.publish_msg(&topic, &msg);
                    }
                });
            }

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => None,
                    event = run_rx.recv() => event,
                };
                let Some(mut event) = event else { break };
                for key in &strip_keys {
                    event.metadata.remove(key);
                }
                for processor in &cleanup {
                    processor(&mut event);
                }
                if let Err(e) = writer.push(&event).await {
                    log::warn!("run write failed: {e}");
                    break;
                }
            }

            ticker_cancel.cancel();
            if let Err(e) = writer.close().await {
                log::warn!("run close failed: {e}");
            }
            log::info!("stopping run {run_url}");
        });
    }

    fn stop_run(&mut self) {
        log::info!("stopping run");
        self.run_tx = None;
    }

    fn handle_metadata(&mut self, event: &Event) {
        if self.do_pub_desc {
            self.do_pub_desc = false;
            let description = event
                .metadata
                .get("Description")
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            let msg = Msg::new("stream status")
                .with("stream", self.name.clone())
                .with("Description", description);
            self.bus.publish_msg(&self.stream_topic(), &msg);
        }

        if let Some(temp_meta) = event.metadata.get("Temp") {
            if !temp_meta.is_empty() && self.last_temp_meta.as_ref() != Some(temp_meta) {
                self.last_temp_meta = Some(temp_meta.clone());
                if let Ok(temp) = serde_json::from_slice::<Temp>(temp_meta) {
                    let msg = Msg::new("stream status")
                        .with("stream", self.name.clone())
                        .with("Temp", format!("{temp:?}"));
                    self.bus.publish_msg(&self.stream_topic(), &msg);

                    let tstamp = self.start_time.elapsed().as_secs_f64();
                    for (i, &val) in temp.som.iter().enumerate() {
                        self.handle_source(
                            &format!("SoM {i} Temp"),
                            SourceKind::Advanced,
                            SourceSample::RollXy(tstamp, val),
                        );
                    }
                    for (i, &val) in temp.fem.iter().enumerate() {
                        self.handle_source(
                            &format!("FEM {i} Temp"),
                            SourceKind::Advanced,
                            SourceSample::RollXy(tstamp, val),
                        );
                    }
                    for (i, &val) in temp.board.iter().enumerate() {
                        self.handle_source(
                            &format!("Board Temp {i}"),
                            SourceKind::Advanced,
                            SourceSample::RollXy(tstamp, val),
                        );
                    }
                }
            }
        }

        if let Some(hv_meta) = event.metadata.get("HV") {
            if !hv_meta.is_empty() && self.last_hv_meta.as_ref() != Some(hv_meta) {
                self.last_hv_meta = Some(hv_meta.clone());
                if let Ok(hv) = serde_json::from_slice::<Hv>(hv_meta) {
                    let msg = Msg::new("stream status")
                        .with("stream", self.name.clone())
                        .with("HV", format!("{hv:?}"));
                    self.bus.publish_msg(&self.stream_topic(), &msg);

                    let tstamp = self.start_time.elapsed().as_secs_f64();
                    for (i, &val) in hv.dac_value.iter().enumerate() {
                        self.handle_source(
                            &format!("DAC {i} Value"),
                            SourceKind::Advanced,
                            SourceSample::RollXy(tstamp, val as f32),
                        );
                    }
                }
            }
        }
    }
}

/// The standard current-mode pipeline for one stream, ending in a stream
/// manager. Returns `None` when the UID's detector mode has no pipeline.
pub fn build_op_array(
    namespace: &str,
    stream: &str,
    bus: &Bus,
    uid: u64,
    detmap: &Arc<DetectorMap>,
) -> Option<OpArray> {
    if detmap.mode(uid) != Mode::Current {
        return None;
    }

    let mapper = Mapper::new(detmap.clone());
    let correlator = Correlator::default();
    let pedestals = Pedestals::default();
    let recon = BeamReconstruction::new(uid, detmap);
    let mut manager = StreamManager::new(namespace, stream, bus, generate_current_mode_sources);
    let cleanup: EventProcessor = Arc::new(keep_only_raw_frames);
    manager.cleanup_run_data = vec![cleanup];

    let ops: Vec<Box<dyn Op>> = vec![
        Box::new(EventOp::new("assemble frames", 16, 1, assemble_frame)),
        Box::new(StreamOp::new("merge stream aggregate", 1, merge)),
        Box::new(EventOp::new("apply detector map", 16, 1, move |event| {
            mapper.process(event)
        })),
        Box::new(StreamOp::new("correlate frames", 1, move |input, output| {
            correlator.run(input, output)
        })),
        Box::new(StreamOp::new("subtract pedestals", 1, move |input, output| {
            pedestals.subtract(input, output)
        })),
        Box::new(EventOp::new("reconstruct beam", 16, 1, move |event| {
            recon.process(event)
        })),
        Box::new(StreamOp::new("manage stream", 1000, move |input, output| {
            manager.manage(input, output)
        })),
    ];
    Some(OpArray(ops))
}

/// The playback pipeline: a pacing player in front of the standard chain.
pub fn build_player(
    namespace: &str,
    stream: &str,
    bus: &Bus,
    uid: u64,
    detmap: &Arc<DetectorMap>,
) -> Option<OpArray> {
    if detmap.mode(uid) != Mode::Current {
        return None;
    }
    let mut ops = build_op_array(namespace, stream, bus, uid, detmap)?;
    let player = Player::default();
    let mut chain: Vec<Box<dyn Op>> = vec![Box::new(StreamOp::new(
        "pace recorded stream",
        1,
        move |input, output| player.play(input, output),
    ))];
    chain.append(&mut ops.0);
    Some(OpArray(chain))
}
