//! Websocket ingress: raw event streams from acquisition nodes.
//!
//! The collector relays incoming wire bytes onto the stream's ingress
//! topic and lazily spawns the per-stream data handler that subscribes to
//! that topic, rebuilds events, and sinks them through the processing
//! pipeline.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::detmap::DetectorMap;
use crate::event::Event;
use crate::live::bus::{byte_reader, Bus, BusWriter};
use crate::live::message::Msg;
use crate::live::stream::build_op_array;
use crate::wire;

const READ_DEADLINE: Duration = Duration::from_secs(10);

/// Serve one ingress websocket connection until the stream dries up, the
/// read deadline lapses, or the downstream handler goes away.
pub async fn collect<S>(ws: WebSocketStream<S>, bus: Bus, namespace: String, detmap: Arc<DetectorMap>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (_ws_sink, ws_read) = ws.split();
    let bytes = ws_read.filter_map(|message| async move {
        match message {
            Ok(Message::Binary(data)) => Some(Ok::<_, io::Error>(bytes::Bytes::from(data))),
            Ok(Message::Close(_)) => None,
            Ok(_) => None,
            Err(e) => Some(Err(io::Error::other(e))),
        }
    });
    let mut reader = wire::Reader::new(StreamReader::new(Box::pin(bytes)));

    // Read the stream head so the UID metadata is available.
    match timeout(READ_DEADLINE, reader.skip(0)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            log::warn!("ingress stream head unreadable: {e}");
            return;
        }
        Err(_) => {
            log::warn!("ingress stream head timed out");
            return;
        }
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

    let stream_name = match detmap.det_name(uid) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{uid:x}"),
    };
    let topic = format!("{namespace} ingress {stream_name}");

    let handler_cancel = CancellationToken::new();
    if bus.subscriber_count(&topic) == 0 {
        spawn_data_handler(
            &bus,
            &namespace,
            &stream_name,
            uid,
            &detmap,
            handler_cancel.clone(),
        );
    }

    let mut writer = wire::Writer::new(BusWriter {
        bus: bus.clone(),
        topic: topic.clone(),
    });
    writer.bucket_dump_thres = 1;
    writer.set_compression(wire::Compression::Uncompressed);
    log::info!("data collector writing to {topic:?}");

    loop {
        let event = match timeout(READ_DEADLINE, reader.next_event()).await {
            Ok(Ok(Some(event))) => event,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                log::warn!("ingress stream ended: {e}");
                break;
            }
            Err(_) => {
                log::warn!("ingress read deadline lapsed");
                break;
            }
        };

        if bus.subscriber_count(&topic) == 0 {
            log::warn!("no stream handler for {topic:?}");
            break;
        }
        if let Err(e) = writer.push(&event).await {
            log::warn!("ingress republish failed: {e}");
            break;
        }
    }

    handler_cancel.cancel();
    log::info!("data collector done writing to {topic:?}");
}

/// The per-stream data handler: subscribe to the ingress topic, rebuild
/// events, and run them through the standard pipeline. Lives until the
/// collector that spawned it goes away.
fn spawn_data_handler(
    bus: &Bus,
    namespace: &str,
    stream_name: &str,
    uid: u64,
    detmap: &Arc<DetectorMap>,
    cancel: CancellationToken,
) {
    let topic = format!("{namespace} ingress {stream_name}");
    log::info!("subscribing new data handler to {topic:?}");

    // Subscribe before returning so the collector sees the handler.
    let subscription = bus.subscribe(&topic);
    let bus = bus.clone();
    let namespace = namespace.to_string();
    let stream_name = stream_name.to_string();
    let detmap = detmap.clone();

    tokio::spawn(async move {
        let reader = wire::Reader::new(byte_reader(subscription, cancel.clone()));
        let mut scanned = reader.scan_events(1000);

        // Re-buffer through a gauged channel so the status task can report
        // the input backlog.
        let (input_tx, input_rx) = mpsc::channel::<Event>(1000);
        {
            let input_tx = input_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = scanned.recv().await {
                    if input_tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        {
            let bus = bus.clone();
            let status_topic = format!("{namespace} stream {stream_name}");
            let stream_name = stream_name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let backlog =
                        input_tx.max_capacity() - input_tx.capacity();
                    let msg = Msg::new("stream status")
                        .with("stream", stream_name.clone())
                        .with("Buffer Size", backlog.to_string());
                    bus.publish_msg(&status_topic, &msg);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let msg = Msg::new("stream status")
                                .with("stream", stream_name.clone())
                                .with("Buffer Size", "stream disconnected, wrapping up");
                            bus.publish_msg(&status_topic, &msg);
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            });
        }

        if let Some(ops) = build_op_array(&namespace, &stream_name, &bus, uid, &detmap) {
            ops.sink(input_rx).await;
        }
        log::info!("quitting data handler on {topic:?}");
    });
}
