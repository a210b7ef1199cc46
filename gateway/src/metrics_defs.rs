//! Metrics definitions for the gateway data plane.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "gateway.request.duration",
    metric_type: MetricType::Histogram,
    description: "Handler wall-time in seconds. Tagged with handler, status.",
};

pub const REDIRECTS: MetricDef = MetricDef {
    name: "gateway.redirects",
    metric_type: MetricType::Counter,
    description: "Redirects emitted. Tagged with tenant_id.",
};

pub const AUTH_FAILURES: MetricDef = MetricDef {
    name: "gateway.auth.failures",
    metric_type: MetricType::Counter,
    description: "Requests rejected with 401. Tagged with reason.",
};

pub const NO_DESTINATION: MetricDef = MetricDef {
    name: "gateway.routing.no_destination",
    metric_type: MetricType::Counter,
    description: "Requests for which no destination was resolvable. Tagged with tenant_id.",
};

pub const DEDUP_DUPLICATES: MetricDef = MetricDef {
    name: "gateway.dedup.duplicates",
    metric_type: MetricType::Counter,
    description: "Claims that reported an already-seen click. Tagged with tenant_id.",
};

pub const DEDUP_UNAVAILABLE: MetricDef = MetricDef {
    name: "gateway.dedup.unavailable",
    metric_type: MetricType::Counter,
    description: "Claims that degraded open because the dedup store was unreachable or slow",
};

pub const QUEUE_DEPTH: MetricDef = MetricDef {
    name: "gateway.pipeline.queue_depth",
    metric_type: MetricType::Gauge,
    description: "Events currently buffered in the in-memory queue",
};

pub const QUEUE_SHED: MetricDef = MetricDef {
    name: "gateway.pipeline.shed",
    metric_type: MetricType::Counter,
    description: "Events diverted to the DLQ because the queue was full or above the shed threshold",
};

pub const SUBMIT_REJECTED: MetricDef = MetricDef {
    name: "gateway.pipeline.rejected",
    metric_type: MetricType::Counter,
    description: "Events refused by both the queue and the DLQ; each one is a 503",
};

pub const SINK_APPEND_DURATION: MetricDef = MetricDef {
    name: "gateway.sink.append.duration",
    metric_type: MetricType::Histogram,
    description: "Time to append a batch to the event sink in seconds. Tagged with status.",
};

pub const SINK_BATCH_SIZE: MetricDef = MetricDef {
    name: "gateway.sink.batch.size",
    metric_type: MetricType::Histogram,
    description: "Number of events per sink append",
};

pub const DLQ_ENQUEUED: MetricDef = MetricDef {
    name: "gateway.dlq.enqueued",
    metric_type: MetricType::Counter,
    description: "Entries written to the DLQ. Tagged with class.",
};

pub const DLQ_RECLAIMED: MetricDef = MetricDef {
    name: "gateway.dlq.reclaimed",
    metric_type: MetricType::Counter,
    description: "DLQ entries successfully replayed into the sink",
};

pub const DLQ_PERMANENT: MetricDef = MetricDef {
    name: "gateway.dlq.permanent",
    metric_type: MetricType::Counter,
    description: "Entries moved to the permanent-failure sink after exhausting retries",
};

pub const SNAPSHOT_REFRESH_DURATION: MetricDef = MetricDef {
    name: "gateway.snapshot.refresh.duration",
    metric_type: MetricType::Histogram,
    description: "Time to rebuild the campaign snapshot in seconds. Tagged with status.",
};

pub const SNAPSHOT_CAMPAIGNS: MetricDef = MetricDef {
    name: "gateway.snapshot.campaigns",
    metric_type: MetricType::Gauge,
    description: "Active campaigns in the current snapshot",
};

pub const ISOLATION_VIOLATIONS: MetricDef = MetricDef {
    name: "gateway.isolation.violations",
    metric_type: MetricType::Counter,
    description: "Rejected cross-tenant access attempts. Every increment is a critical alert.",
};

// TODO: all metrics must be added here for now, this can be done dynamically with a macro in the future.
pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REDIRECTS,
    AUTH_FAILURES,
    NO_DESTINATION,
    DEDUP_DUPLICATES,
    DEDUP_UNAVAILABLE,
    QUEUE_DEPTH,
    QUEUE_SHED,
    SUBMIT_REJECTED,
    SINK_APPEND_DURATION,
    SINK_BATCH_SIZE,
    DLQ_ENQUEUED,
    DLQ_RECLAIMED,
    DLQ_PERMANENT,
    SNAPSHOT_REFRESH_DURATION,
    SNAPSHOT_CAMPAIGNS,
    ISOLATION_VIOLATIONS,
];
