use crate::dlq::{DlqEntry, DlqStore};
use crate::event::CapturedEvent;
use crate::metrics_defs::{QUEUE_DEPTH, QUEUE_SHED, SUBMIT_REJECTED};
use crate::sink::EventSink;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, sleep_until};

/// Utilization above which every submit is diverted straight to the DLQ.
const SHED_RATIO: f64 = 0.9;
/// Utilization above which a warning is logged.
const WARN_RATIO: f64 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The event sits in the bounded in-memory queue.
    Accepted,
    /// The queue was full or above the shed threshold; the event is durable
    /// in the DLQ and the request proceeds normally.
    ShedToDlq,
    /// Queue and DLQ both refused. The only outcome that surfaces a 503.
    Rejected,
}

#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_max_size: usize,
    pub batch_max_age: Duration,
}

/// Submit side of the async pipeline. Cheap to clone; handlers keep one.
#[derive(Clone)]
pub struct PipelineHandle {
    senders: Arc<Vec<mpsc::Sender<CapturedEvent>>>,
    depth: Arc<AtomicUsize>,
    above_warn: Arc<AtomicBool>,
    capacity: usize,
    warn_threshold: usize,
    shed_threshold: usize,
    dlq: Arc<dyn DlqStore>,
}

impl PipelineHandle {
    /// Hands an event to the pipeline without ever waiting for queue space.
    pub async fn submit(&self, event: CapturedEvent) -> SubmitOutcome {
        if self.depth.load(Ordering::Relaxed) >= self.shed_threshold {
            return self.shed(event).await;
        }

        let index = worker_index(&event.tenant_id, &event.click_id, self.senders.len());
        match self.senders[index].try_send(event) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::gauge!(QUEUE_DEPTH.name).set(depth as f64);
                if depth >= self.warn_threshold {
                    if !self.above_warn.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            depth,
                            capacity = self.capacity,
                            "event queue above warning threshold"
                        );
                    }
                } else {
                    self.above_warn.store(false, Ordering::Relaxed);
                }
                SubmitOutcome::Accepted
            }
            Err(mpsc::error::TrySendError::Full(event))
            | Err(mpsc::error::TrySendError::Closed(event)) => self.shed(event).await,
        }
    }

    async fn shed(&self, event: CapturedEvent) -> SubmitOutcome {
        let tenant_id = event.tenant_id.clone();
        match self.dlq.push(&[DlqEntry::shed(event)]).await {
            Ok(()) => {
                metrics::counter!(QUEUE_SHED.name).increment(1);
                tracing::warn!(tenant_id, "event queue saturated, event shed to DLQ");
                SubmitOutcome::ShedToDlq
            }
            Err(e) => {
                metrics::counter!(SUBMIT_REJECTED.name).increment(1);
                tracing::error!(
                    tenant_id,
                    error = %e,
                    "event queue saturated and DLQ unavailable, rejecting"
                );
                SubmitOutcome::Rejected
            }
        }
    }
}

/// Fixed worker pool draining the bounded queue into the event sink.
///
/// Sustained throughput is a function of the pool, not of request
/// concurrency: handlers only ever try-send.
pub struct EventPipeline {
    handle: PipelineHandle,
    workers: Vec<JoinHandle<()>>,
}

impl EventPipeline {
    pub fn start(
        config: PipelineConfig,
        sink: Arc<dyn EventSink>,
        dlq: Arc<dyn DlqStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = config.workers.max(1);
        let per_worker_capacity = (config.queue_capacity / workers).max(1);
        let depth = Arc::new(AtomicUsize::new(0));

        let mut senders = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(per_worker_capacity);
            senders.push(tx);
            tasks.push(tokio::spawn(worker_loop(
                index,
                rx,
                sink.clone(),
                dlq.clone(),
                depth.clone(),
                config.batch_max_size.max(1),
                config.batch_max_age,
                shutdown.clone(),
            )));
        }

        let capacity = per_worker_capacity * workers;
        EventPipeline {
            handle: PipelineHandle {
                senders: Arc::new(senders),
                depth,
                above_warn: Arc::new(AtomicBool::new(false)),
                capacity,
                warn_threshold: ((capacity as f64) * WARN_RATIO) as usize,
                shed_threshold: (((capacity as f64) * SHED_RATIO) as usize).max(1),
                dlq,
            },
            workers: tasks,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Waits for every worker to drain its queue and flush. Call after the
    /// shutdown signal has fired.
    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Deterministically maps (tenant, click id) to a worker so a stream of
/// related events keeps batch locality. Stability matters for predictable
/// performance, not correctness; no ordering is promised across workers.
fn worker_index(tenant_id: &str, click_id: &str, worker_count: usize) -> usize {
    if worker_count == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    tenant_id.hash(&mut hasher);
    click_id.hash(&mut hasher);
    (hasher.finish() as usize) % worker_count
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    index: usize,
    mut rx: mpsc::Receiver<CapturedEvent>,
    sink: Arc<dyn EventSink>,
    dlq: Arc<dyn DlqStore>,
    depth: Arc<AtomicUsize>,
    batch_max_size: usize,
    batch_max_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch: Vec<CapturedEvent> = Vec::with_capacity(batch_max_size);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Drain whatever is already queued, flush, and exit.
                while let Ok(event) = rx.try_recv() {
                    depth.fetch_sub(1, Ordering::Relaxed);
                    batch.push(event);
                    if batch.len() >= batch_max_size {
                        flush(&mut batch, &sink, &dlq, &shutdown).await;
                    }
                }
                flush(&mut batch, &sink, &dlq, &shutdown).await;
                tracing::info!(worker = index, "pipeline worker shutting down");
                return;
            }
            maybe_event = rx.recv() => match maybe_event {
                Some(event) => {
                    let remaining = depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                    metrics::gauge!(QUEUE_DEPTH.name).set(remaining as f64);
                    batch.push(event);
                    if batch.len() >= batch_max_size {
                        flush(&mut batch, &sink, &dlq, &shutdown).await;
                        deadline = None;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + batch_max_age);
                    }
                }
                None => {
                    flush(&mut batch, &sink, &dlq, &shutdown).await;
                    return;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                flush(&mut batch, &sink, &dlq, &shutdown).await;
                deadline = None;
            }
        }
    }
}

/// Appends the batch to the sink; on failure every event moves to the DLQ
/// with an incremented retry count. The DLQ write is retried until it is
/// accepted, because giving up would drop traffic data.
async fn flush(
    batch: &mut Vec<CapturedEvent>,
    sink: &Arc<dyn EventSink>,
    dlq: &Arc<dyn DlqStore>,
    shutdown: &watch::Receiver<bool>,
) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);

    let class = match sink.append_batch(&events).await {
        Ok(()) => return,
        Err(e) => {
            tracing::error!(
                error = %e,
                count = events.len(),
                "sink append failed, moving batch to DLQ"
            );
            e.class()
        }
    };

    let entries: Vec<DlqEntry> = events
        .into_iter()
        .map(|event| DlqEntry::failed_append(event, class))
        .collect();

    loop {
        match dlq.push(&entries).await {
            Ok(()) => return,
            Err(e) => {
                if *shutdown.borrow() {
                    tracing::error!(
                        count = entries.len(),
                        error = %e,
                        "shutdown while DLQ unavailable, batch lost"
                    );
                    return;
                }
                tracing::error!(error = %e, "DLQ push failed, retrying");
                sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
