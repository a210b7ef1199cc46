use crate::event::CapturedEvent;
use crate::metrics_defs::{SINK_APPEND_DURATION, SINK_BATCH_SIZE};
use async_trait::async_trait;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("sink append timed out")]
    Timeout,
    #[error("sink rejected the batch with status {0}")]
    Status(u16),
    #[error("sink transport error: {0}")]
    Transport(String),
    #[error("could not serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SinkError {
    /// Failure class recorded on DLQ entries.
    pub fn class(&self) -> &'static str {
        match self {
            SinkError::Timeout => "timeout",
            SinkError::Status(_) => "status",
            SinkError::Transport(_) => "transport",
            SinkError::Serialize(_) => "serialize",
        }
    }
}

/// Durable append target for captured events. The gateway only writes.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append_batch(&self, events: &[CapturedEvent]) -> Result<(), SinkError>;
}

/// HTTP event sink client.
///
/// Batches are posted as newline-delimited JSON, one event per line, with a
/// request deadline. Any non-2xx response fails the whole batch; splitting
/// and retrying is the DLQ reclaimer's job.
pub struct HttpEventSink {
    client: reqwest::Client,
    url: String,
    deadline: Duration,
}

impl HttpEventSink {
    pub fn new(url: String, deadline: Duration) -> Self {
        HttpEventSink {
            client: reqwest::Client::new(),
            url,
            deadline,
        }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn append_batch(&self, events: &[CapturedEvent]) -> Result<(), SinkError> {
        let mut body = String::new();
        for event in events {
            body.push_str(&serde_json::to_string(event)?);
            body.push('\n');
        }

        let start = Instant::now();
        let result = self
            .client
            .post(&self.url)
            .header("content-type", "application/x-ndjson")
            .timeout(self.deadline)
            .body(body)
            .send()
            .await;

        let outcome = match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(SinkError::Status(response.status().as_u16())),
            Err(e) if e.is_timeout() => Err(SinkError::Timeout),
            Err(e) => Err(SinkError::Transport(e.to_string())),
        };

        let status = match &outcome {
            Ok(()) => "success",
            Err(e) => e.class(),
        };
        metrics::histogram!(SINK_APPEND_DURATION.name, "status" => status)
            .record(start.elapsed().as_secs_f64());
        metrics::histogram!(SINK_BATCH_SIZE.name).record(events.len() as f64);

        outcome
    }
}
