//! Bounded, non-blocking event queue with a draining worker.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{io::AsyncWriteExt, sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::events::TraceEvent;

/// Shared handle to the event queue. `emit` never blocks; on overflow the
/// oldest event is dropped and a counter incremented.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    queue: Mutex<VecDeque<TraceEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn emit(&self, event: TraceEvent) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() == self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.inner.notify.notify_one();
    }

    /// Take every queued event. Used by the worker and by tests.
    pub fn drain(&self) -> Vec<TraceEvent> {
        let mut queue = self.inner.queue.lock();
        queue.drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

/// Drain the bus into the structured log and, when configured, a JSONL file.
/// Runs until cancelled; performs a final drain so shutdown does not lose
/// queued events.
pub fn spawn_event_worker(
    bus: EventBus,
    file_sink: Option<PathBuf>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = bus.notified() => {}
                _ = cancel.cancelled() => {
                    flush(&bus, file_sink.as_deref()).await;
                    return;
                }
            }
            flush(&bus, file_sink.as_deref()).await;
        }
    })
}

async fn flush(bus: &EventBus, file_sink: Option<&std::path::Path>) {
    let events = bus.drain();
    if events.is_empty() {
        return;
    }

    let mut lines = String::new();
    for event in &events {
        match serde_json::to_string(event) {
            Ok(json) => {
                info!(target: "toolgate::trace", kind = event.kind.name(), trace_id = %event.trace_id, "{}", json);
                if file_sink.is_some() {
                    lines.push_str(&json);
                    lines.push('\n');
                }
            }
            Err(e) => warn!("failed to serialize trace event: {}", e),
        }
    }

    if let Some(path) = file_sink {
        if let Err(e) = append_lines(path, lines.as_bytes()).await {
            warn!("trace file sink write failed: {}", e);
        }
    }
}

async fn append_lines(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}
