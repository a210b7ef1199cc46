use crate::event::CapturedEvent;
use crate::metrics_defs::{DLQ_ENQUEUED, DLQ_PERMANENT, DLQ_RECLAIMED};
use crate::sink::EventSink;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

const QUEUE_KEY: &str = "dlq:events";
const PERMANENT_KEY: &str = "dlq:permanent";

/// An event whose sink write failed or whose queue slot never existed.
/// Entries survive until the sink accepts them or they age past the retry
/// ceiling into the permanent-failure sink; they are never dropped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    pub event: CapturedEvent,
    pub retry_count: u32,
    pub first_seen_ms: u64,
    pub last_attempt_ms: u64,
    pub failure_class: String,
}

impl DlqEntry {
    /// Entry for an event shed before it reached the in-memory queue.
    pub fn shed(event: CapturedEvent) -> Self {
        Self::with_retries(event, "queue_full", 0)
    }

    /// Entry for an event whose batch failed its sink append.
    pub fn failed_append(event: CapturedEvent, failure_class: &str) -> Self {
        Self::with_retries(event, failure_class, 1)
    }

    fn with_retries(event: CapturedEvent, failure_class: &str, retry_count: u32) -> Self {
        let now = Utc::now().timestamp_millis() as u64;
        DlqEntry {
            event,
            retry_count,
            first_seen_ms: now,
            last_attempt_ms: now,
            failure_class: failure_class.to_string(),
        }
    }

    fn record_attempt(&mut self, failure_class: &str) {
        self.retry_count += 1;
        self.last_attempt_ms = Utc::now().timestamp_millis() as u64;
        self.failure_class = failure_class.to_string();
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DlqError {
    #[error("DLQ backend error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("could not serialize DLQ entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable dead-letter queue plus the permanent-failure sink.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn push(&self, entries: &[DlqEntry]) -> Result<(), DlqError>;
    async fn pop_batch(&self, max: usize) -> Result<Vec<DlqEntry>, DlqError>;
    async fn push_permanent(&self, entries: &[DlqEntry]) -> Result<(), DlqError>;
    async fn ping(&self) -> Result<(), DlqError>;
}

/// Redis-list backed DLQ. Entries are serialized JSON on `dlq:events`;
/// permanently failed entries land on `dlq:permanent`.
pub struct RedisDlq {
    conn: ConnectionManager,
}

impl RedisDlq {
    pub async fn connect(url: &str) -> Result<Self, DlqError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisDlq { conn })
    }
}

#[async_trait]
impl DlqStore for RedisDlq {
    async fn push(&self, entries: &[DlqEntry]) -> Result<(), DlqError> {
        if entries.is_empty() {
            return Ok(());
        }
        let payloads = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn.clone();
        let _: () = conn.lpush(QUEUE_KEY, payloads).await?;

        for entry in entries {
            metrics::counter!(DLQ_ENQUEUED.name, "class" => entry.failure_class.clone())
                .increment(1);
        }
        Ok(())
    }

    async fn pop_batch(&self, max: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.rpop(QUEUE_KEY, NonZeroUsize::new(max)).await?;

        let mut entries = Vec::with_capacity(raw.len());
        for payload in raw {
            match serde_json::from_str::<DlqEntry>(&payload) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // Still traffic data; park the raw payload rather than drop it.
                    tracing::error!(error = %e, "undecodable DLQ entry moved to permanent-failure sink");
                    let _: () = conn.lpush(PERMANENT_KEY, payload).await?;
                    metrics::counter!(DLQ_PERMANENT.name).increment(1);
                }
            }
        }
        Ok(entries)
    }

    async fn push_permanent(&self, entries: &[DlqEntry]) -> Result<(), DlqError> {
        if entries.is_empty() {
            return Ok(());
        }
        let payloads = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(PERMANENT_KEY, payloads).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), DlqError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Background loop that replays DLQ entries into the sink.
///
/// Failed cycles back off exponentially with jitter, keyed by the highest
/// retry count seen in the batch. Entries past the retry ceiling move to the
/// permanent-failure sink with a critical alert.
pub struct Reclaimer {
    dlq: Arc<dyn DlqStore>,
    sink: Arc<dyn EventSink>,
    retry_ceiling: u32,
    base_backoff: Duration,
    batch_size: usize,
    idle_wait: Duration,
}

impl Reclaimer {
    pub fn new(
        dlq: Arc<dyn DlqStore>,
        sink: Arc<dyn EventSink>,
        retry_ceiling: u32,
        base_backoff: Duration,
        batch_size: usize,
    ) -> Self {
        Reclaimer {
            dlq,
            sink,
            retry_ceiling,
            base_backoff,
            batch_size,
            idle_wait: Duration::from_secs(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                tracing::info!("DLQ reclaimer shutting down");
                return;
            }

            let wait = self.cycle(&shutdown).await;
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    /// One reclaim attempt. Returns how long to wait before the next.
    async fn cycle(&self, shutdown: &watch::Receiver<bool>) -> Duration {
        let entries = match self.dlq.pop_batch(self.batch_size).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "DLQ pop failed");
                return self.idle_wait;
            }
        };
        if entries.is_empty() {
            return self.idle_wait;
        }

        let events: Vec<CapturedEvent> = entries.iter().map(|e| e.event.clone()).collect();
        match self.sink.append_batch(&events).await {
            Ok(()) => {
                metrics::counter!(DLQ_RECLAIMED.name).increment(entries.len() as u64);
                Duration::ZERO
            }
            Err(e) => {
                let class = e.class();
                let mut requeue = Vec::new();
                let mut permanent = Vec::new();
                let mut max_retries = 0;

                for mut entry in entries {
                    entry.record_attempt(class);
                    max_retries = max_retries.max(entry.retry_count);
                    if entry.retry_count > self.retry_ceiling {
                        permanent.push(entry);
                    } else {
                        requeue.push(entry);
                    }
                }

                if !permanent.is_empty() {
                    for entry in &permanent {
                        tracing::error!(
                            tenant_id = %entry.event.tenant_id,
                            event_id = %entry.event.event_id,
                            retry_count = entry.retry_count,
                            "event exceeded DLQ retry ceiling, moved to permanent-failure sink"
                        );
                    }
                    metrics::counter!(DLQ_PERMANENT.name).increment(permanent.len() as u64);
                    self.store_until_accepted(&permanent, true, shutdown).await;
                }
                self.store_until_accepted(&requeue, false, shutdown).await;

                self.backoff(max_retries)
            }
        }
    }

    /// Writes entries back to the DLQ (or the permanent sink), retrying until
    /// the backend accepts them. Giving up here would drop traffic data.
    async fn store_until_accepted(
        &self,
        entries: &[DlqEntry],
        permanent: bool,
        shutdown: &watch::Receiver<bool>,
    ) {
        if entries.is_empty() {
            return;
        }
        loop {
            let result = if permanent {
                self.dlq.push_permanent(entries).await
            } else {
                self.dlq.push(entries).await
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    if *shutdown.borrow() {
                        tracing::error!(
                            count = entries.len(),
                            error = %e,
                            "shutdown while DLQ backend unavailable, entries lost"
                        );
                        return;
                    }
                    tracing::error!(error = %e, "DLQ write failed, retrying");
                    sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(8);
        let base = self.base_backoff * 2u32.pow(exp);
        let jitter_cap = (self.base_backoff.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        base + Duration::from_millis(jitter)
    }
}
