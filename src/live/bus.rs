//! In-process topic-based broadcast bus.
//!
//! Topics exist while someone is subscribed; publishing to a topic with no
//! subscribers drops the payload, matching the pub/sub bus the pipeline was
//! built against. Payloads are opaque bytes: JSON messages on the command
//! and fan-out topics, raw wire buckets on the ingress topics.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::message::Msg;

const TOPIC_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct Bus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }

    /// Publish to a topic. Payloads sent to a topic with no subscribers are
    /// dropped.
    pub fn publish(&self, topic: &str, payload: Bytes) {
        let mut topics = self.topics.lock().unwrap();
        if let Some(sender) = topics.get(topic) {
            if sender.send(payload).is_err() {
                // Last subscriber left; retire the topic.
                topics.remove(topic);
            }
        }
    }

    pub fn publish_msg(&self, topic: &str, msg: &Msg) {
        match serde_json::to_vec(msg) {
            Ok(bytes) => self.publish(topic, Bytes::from(bytes)),
            Err(e) => log::error!("failed to encode message for {topic:?}: {e}"),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap();
        topics.get(topic).map(|s| s.receiver_count()).unwrap_or(0)
    }

    /// Topics with at least one live subscriber matching `pattern`, where a
    /// trailing `*` matches any suffix.
    pub fn active_topics(&self, pattern: &str) -> Vec<String> {
        let mut topics = self.topics.lock().unwrap();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        let mut matching: Vec<String> = topics
            .keys()
            .filter(|topic| match pattern.strip_suffix('*') {
                Some(prefix) => topic.starts_with(prefix),
                None => topic.as_str() == pattern,
            })
            .cloned()
            .collect();
        matching.sort();
        matching
    }
}

/// A dynamic set of topic subscriptions merged onto one channel, as a
/// websocket client's view of the bus. Dropping the handle (or the
/// receiver) tears the forwarding tasks down.
pub struct Subscription {
    bus: Bus,
    tx: mpsc::Sender<Bytes>,
    topics: Mutex<HashMap<String, AbortHandle>>,
}

impl Subscription {
    pub fn new(bus: &Bus, buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Subscription {
                bus: bus.clone(),
                tx,
                topics: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    pub fn subscribe(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap();
        if topics.contains_key(topic) {
            return;
        }
        let mut rx = self.bus.subscribe(topic);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("subscription lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        topics.insert(topic.to_string(), task.abort_handle());
    }

    pub fn unsubscribe(&self, topic: &str) {
        if let Some(handle) = self.topics.lock().unwrap().remove(topic) {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for handle in self.topics.lock().unwrap().values() {
            handle.abort();
        }
    }
}

/// AsyncWrite adapter that publishes every chunk to a topic; the write end
/// of an ingress relay.
pub struct BusWriter {
    pub bus: Bus,
    pub topic: String,
}

impl AsyncWrite for BusWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.bus.publish(&self.topic, Bytes::copy_from_slice(buf));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// AsyncRead adapter over a topic subscription; the read end of an ingress
/// relay. The stream ends when `until` is cancelled. Lagged stretches are
/// skipped, which a record reader surfaces as framing corruption rather
/// than silently resynchronizing.
pub fn byte_reader(
    rx: broadcast::Receiver<Bytes>,
    until: CancellationToken,
) -> impl AsyncRead + Unpin + Send + 'static {
    let chunks = tokio_stream::StreamExt::filter_map(BroadcastStream::new(rx), |item| match item {
        Ok(bytes) => Some(Ok::<_, io::Error>(bytes)),
        Err(e) => {
            log::warn!("ingress byte stream lagged: {e}");
            None
        }
    });
    let bounded = futures_util::StreamExt::take_until(chunks, Box::pin(until.cancelled_owned()));
    StreamReader::new(bounded)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("a topic");
        bus.publish("a topic", Bytes::from_static(b"hello"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = Bus::new();
        bus.publish("nobody listens", Bytes::from_static(b"x"));
        assert_eq!(bus.subscriber_count("nobody listens"), 0);
        assert!(bus.active_topics("*").is_empty());
    }

    #[tokio::test]
    async fn active_topics_glob_matches_prefix() {
        let bus = Bus::new();
        let _a = bus.subscribe("everyone stream cmd alpha");
        let _b = bus.subscribe("everyone stream cmd beta");
        let _c = bus.subscribe("everyone stream alpha");

        let topics = bus.active_topics("everyone stream cmd *");
        assert_eq!(
            topics,
            vec![
                "everyone stream cmd alpha".to_string(),
                "everyone stream cmd beta".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn topics_retire_after_last_subscriber() {
        let bus = Bus::new();
        let rx = bus.subscribe("short lived");
        assert_eq!(bus.subscriber_count("short lived"), 1);
        drop(rx);
        bus.publish("short lived", Bytes::from_static(b"x"));
        assert!(bus.active_topics("short lived").is_empty());
    }

    #[tokio::test]
    async fn subscription_merges_and_unsubscribes() {
        let bus = Bus::new();
        let (sub, mut rx) = Subscription::new(&bus, 16);
        sub.subscribe("t1");
        sub.subscribe("t2");
        // Forwarding tasks need a moment to start listening.
        tokio::task::yield_now().await;

        bus.publish("t1", Bytes::from_static(b"one"));
        bus.publish("t2", Bytes::from_static(b"two"));
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);

        sub.unsubscribe("t1");
        bus.publish("t2", Bytes::from_static(b"still here"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"still here"));
    }
}
