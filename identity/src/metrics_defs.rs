//! Metrics definitions for the identity client.

use shared::metrics_defs::{MetricDef, MetricType};

pub const TOKEN_CACHE_HIT: MetricDef = MetricDef {
    name: "identity.token_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of credential validations served from the token cache",
};

pub const TOKEN_CACHE_MISS: MetricDef = MetricDef {
    name: "identity.token_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of credential validations that missed the token cache",
};

pub const VALIDATE_DURATION: MetricDef = MetricDef {
    name: "identity.validate.duration",
    metric_type: MetricType::Histogram,
    description: "Time to validate a credential against the identity service in seconds. Tagged with status.",
};

pub const ALL_METRICS: &[MetricDef] = &[TOKEN_CACHE_HIT, TOKEN_CACHE_MISS, VALIDATE_DURATION];
