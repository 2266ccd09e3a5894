//! Bounded queue that carries structured log lines to the relay writer, and the
//! `tracing` layer that feeds it.
//!
//! Producers block when the queue is full; log completeness wins over latency.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub type LogReceiver = mpsc::Receiver<String>;

#[derive(Clone)]
pub struct LogQueue {
    tx: mpsc::Sender<String>,
    overflow: Arc<OnceLock<mpsc::UnboundedSender<String>>>,
    backlog: Arc<AtomicUsize>,
}

pub fn log_queue(capacity: usize) -> (LogQueue, LogReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let queue = LogQueue {
        tx,
        overflow: Arc::new(OnceLock::new()),
        backlog: Arc::new(AtomicUsize::new(0)),
    };
    (queue, rx)
}

impl LogQueue {
    /// Waits for space. Fails only when the writer side is gone.
    pub async fn push(&self, line: String) -> anyhow::Result<()> {
        self.tx
            .send(line)
            .await
            .map_err(|_| anyhow::anyhow!("log queue closed"))
    }

    /// Blocking push for synchronous call sites such as subscriber layers.
    pub fn push_blocking(&self, line: String) {
        if self.backlog.load(Ordering::Acquire) > 0 {
            if let Some(overflow) = self.overflow.get() {
                self.enqueue(overflow, line);
                return;
            }
        }
        let line = match self.tx.try_send(line) {
            Ok(()) | Err(TrySendError::Closed(_)) => return,
            Err(TrySendError::Full(line)) => line,
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    let _ = handle.block_on(self.tx.send(line));
                });
            }
            // A current-thread runtime cannot block on its own consumer.
            Ok(handle) => self.push_overflow(&handle, line),
            Err(_) => {
                let _ = self.tx.blocking_send(line);
            }
        }
    }

    /// Queues behind a single forwarder task. While the backlog is non-empty
    /// every later line goes through it too, so the stream keeps its order.
    fn push_overflow(&self, handle: &Handle, line: String) {
        let overflow = self.overflow.get_or_init(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let queue = self.tx.clone();
            let backlog = self.backlog.clone();
            handle.spawn(async move {
                while let Some(line) = rx.recv().await {
                    let _ = queue.send(line).await;
                    backlog.fetch_sub(1, Ordering::AcqRel);
                }
            });
            tx
        });
        self.enqueue(overflow, line);
    }

    fn enqueue(&self, overflow: &mpsc::UnboundedSender<String>, line: String) {
        self.backlog.fetch_add(1, Ordering::AcqRel);
        if overflow.send(line).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }
}

/// Late-bound handle to the queue; the layer is installed at startup but only
/// forwards once the relay connection exists.
#[derive(Clone, Default)]
pub struct LogSink {
    queue: Arc<OnceLock<LogQueue>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a queue was already attached.
    pub fn attach(&self, queue: LogQueue) -> bool {
        self.queue.set(queue).is_ok()
    }

    fn queue(&self) -> Option<&LogQueue> {
        self.queue.get()
    }

    pub fn layer(&self) -> ForwardLayer {
        ForwardLayer { sink: self.clone() }
    }
}

pub struct ForwardLayer {
    sink: LogSink,
}

/// The relay and tail modules run on the writer path; forwarding their own
/// events could block the task that drains the queue.
fn forwards(target: &str, level: &Level) -> bool {
    *level <= Level::INFO
        && target.starts_with("devtunnel")
        && !target.starts_with("devtunnel::relay")
        && !target.starts_with("devtunnel::tail")
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }
}

pub fn event_to_json(event: &Event<'_>) -> String {
    let meta = event.metadata();
    let mut obj = Map::new();
    obj.insert(
        "level".into(),
        Value::String(meta.level().as_str().to_ascii_lowercase()),
    );
    obj.insert("target".into(), Value::String(meta.target().to_string()));
    obj.insert(
        "timestamp".into(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    event.record(&mut JsonVisitor(&mut obj));
    Value::Object(obj).to_string()
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !forwards(meta.target(), meta.level()) {
            return;
        }
        let Some(queue) = self.sink.queue() else {
            return;
        };
        queue.push_blocking(event_to_json(event));
    }
}
