//! Operator runtime: composable pipeline stages over bounded channels.
//!
//! Two operator flavors share one contract: given a receiver of events,
//! return a receiver of events. `EventOp` fans a per-event function out to
//! parallel workers while preserving input order at the output; `StreamOp`
//! hands the whole stream to one worker (used by processors that keep
//! cross-event state).

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::event::Event;

pub type EventProcessor = Arc<dyn Fn(&mut Event) + Send + Sync>;

pub type StreamFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type StreamProcessor =
    Box<dyn FnOnce(mpsc::Receiver<Event>, mpsc::Sender<Event>) -> StreamFuture + Send>;

pub trait Op: Send {
    fn description(&self) -> &str;
    fn run(self: Box<Self>, input: mpsc::Receiver<Event>) -> mpsc::Receiver<Event>;
}

/// Ordered parallel per-event stage.
///
/// Events are indexed on arrival and processed by at most `concurrency`
/// workers at a time; outputs are emitted strictly in input-index order.
/// Input consumption stops while either `concurrency` events are in flight
/// or `max_event_buf` processed events are waiting for an earlier index, so
/// back-pressure propagates upstream. A processor panic is caught and the
/// event is forwarded as-is; an in-flight index is never abandoned, since
/// the reordering buffer would stall forever waiting for it.
pub struct EventOp {
    pub description: String,
    pub processor: EventProcessor,
    pub concurrency: usize,
    pub max_event_buf: usize,
}

impl EventOp {
    pub fn new(
        description: impl Into<String>,
        concurrency: usize,
        max_event_buf: usize,
        processor: impl Fn(&mut Event) + Send + Sync + 'static,
    ) -> Self {
        EventOp {
            description: description.into(),
            processor: Arc::new(processor),
            concurrency,
            max_event_buf,
        }
    }
}

impl Op for EventOp {
    fn description(&self) -> &str {
        &self.description
    }

    fn run(self: Box<Self>, mut input: mpsc::Receiver<Event>) -> mpsc::Receiver<Event> {
        let concurrency = self.concurrency.max(1);
        let max_event_buf = self.max_event_buf.max(1);
        let description: Arc<str> = self.description.into();
        let processor = self.processor;

        let (tx, rx) = mpsc::channel(max_event_buf);
        tokio::spawn(async move {
            let (done_tx, mut done_rx) = mpsc::channel::<(u64, Event)>(concurrency);
            let mut in_flight = 0usize;
            let mut done_events: HashMap<u64, Event> = HashMap::new();
            let mut n_read = 0u64;
            let mut n_written = 0u64;

            while let Some(event) = input.recv().await {
                let processor = processor.clone();
                let description = description.clone();
                let done_tx = done_tx.clone();
                let index = n_read;
                n_read += 1;
                in_flight += 1;
                tokio::spawn(async move {
                    let mut event = event;
                    if catch_unwind(AssertUnwindSafe(|| processor(&mut event))).is_err() {
                        log::error!("processor {description:?} panicked on event {index}");
                    }
                    let _ = done_tx.send((index, event)).await;
                });

                while in_flight >= concurrency || done_events.len() >= max_event_buf {
                    // done_rx cannot be closed here: we hold done_tx.
                    let Some((index, event)) = done_rx.recv().await else {
                        return;
                    };
                    in_flight -= 1;
                    done_events.insert(index, event);
                    while let Some(event) = done_events.remove(&n_written) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        n_written += 1;
                    }
                }
            }

            // Input closed: drain every in-flight worker, then flush in order.
            while in_flight > 0 {
                let Some((index, event)) = done_rx.recv().await else {
                    return;
                };
                in_flight -= 1;
                done_events.insert(index, event);
            }
            while let Some(event) = done_events.remove(&n_written) {
                if tx.send(event).await.is_err() {
                    return;
                }
                n_written += 1;
            }
        });
        rx
    }
}

/// Whole-stream stage: one worker owns the input and output ends for the
/// lifetime of the stream. The output closes when the worker returns.
pub struct StreamOp {
    pub description: String,
    pub processor: StreamProcessor,
    pub max_event_buf: usize,
}

impl StreamOp {
    pub fn new<F, Fut>(description: impl Into<String>, max_event_buf: usize, processor: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<Event>, mpsc::Sender<Event>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        StreamOp {
            description: description.into(),
            processor: Box::new(move |input, output| Box::pin(processor(input, output))),
            max_event_buf,
        }
    }
}

impl Op for StreamOp {
    fn description(&self) -> &str {
        &self.description
    }

    fn run(self: Box<Self>, input: mpsc::Receiver<Event>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.max_event_buf.max(1));
        tokio::spawn((self.processor)(input, tx));
        rx
    }
}

/// A linear chain of operators; the output of stage k feeds stage k+1.
pub struct OpArray(pub Vec<Box<dyn Op>>);

impl OpArray {
    pub fn run(self, mut stream: mpsc::Receiver<Event>) -> mpsc::Receiver<Event> {
        for op in self.0 {
            stream = op.run(stream);
        }
        stream
    }

    /// Run the chain and discard the tail stage's output.
    pub async fn sink(self, stream: mpsc::Receiver<Event>) {
        let mut output = self.run(stream);
        while output.recv().await.is_some() {}
    }
}
