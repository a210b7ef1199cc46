use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration, read from `TOLLGATE_*` environment variables.
/// Startup fails on missing required values or anything that does not parse.
#[derive(Clone, Debug)]
pub struct Config {
    pub listener: Listener,
    pub admin_listener: Listener,
    pub identity: IdentityConfig,
    pub dedup: DedupConfig,
    pub sink: SinkConfig,
    pub pipeline: PipelineSettings,
    pub dlq: DlqSettings,
    pub snapshot: SnapshotSettings,
    pub body_cap_bytes: usize,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub url: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct DedupConfig {
    pub url: String,
    /// Dedup window; seconds, not minutes, on the hot path.
    pub window: Duration,
    pub deadline: Duration,
}

#[derive(Clone, Debug)]
pub struct SinkConfig {
    pub url: String,
    pub batch_max_size: usize,
    pub flush_interval: Duration,
    pub deadline: Duration,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct DlqSettings {
    pub url: String,
    pub retry_ceiling: u32,
    pub reclaim_batch_size: usize,
    pub base_backoff: Duration,
}

#[derive(Clone, Debug)]
pub struct SnapshotSettings {
    pub store_url: String,
    pub store_hmac_secret: Option<String>,
    pub refresh_interval: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any name→value lookup so tests can inject maps.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Config {
            listener: Listener {
                host: optional(&lookup, "TOLLGATE_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_or(&lookup, "TOLLGATE_PORT", 8080)?,
            },
            admin_listener: Listener {
                host: optional(&lookup, "TOLLGATE_ADMIN_HOST")
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_or(&lookup, "TOLLGATE_ADMIN_PORT", 8081)?,
            },
            identity: IdentityConfig {
                url: required(&lookup, "TOLLGATE_IDENTITY_URL")?,
                timeout: Duration::from_millis(parse_or(
                    &lookup,
                    "TOLLGATE_IDENTITY_TIMEOUT_MS",
                    10,
                )?),
                cache_ttl: Duration::from_secs(parse_or(
                    &lookup,
                    "TOLLGATE_IDENTITY_CACHE_TTL_SECS",
                    5,
                )?),
            },
            dedup: DedupConfig {
                url: required(&lookup, "TOLLGATE_DEDUP_URL")?,
                window: Duration::from_secs(parse_or(&lookup, "TOLLGATE_DEDUP_WINDOW_SECS", 5)?),
                deadline: Duration::from_millis(parse_or(
                    &lookup,
                    "TOLLGATE_DEDUP_TIMEOUT_MS",
                    10,
                )?),
            },
            sink: SinkConfig {
                url: required(&lookup, "TOLLGATE_SINK_URL")?,
                batch_max_size: parse_or(&lookup, "TOLLGATE_SINK_BATCH_SIZE", 500)?,
                flush_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "TOLLGATE_SINK_FLUSH_INTERVAL_MS",
                    200,
                )?),
                deadline: Duration::from_millis(parse_or(
                    &lookup,
                    "TOLLGATE_SINK_DEADLINE_MS",
                    2000,
                )?),
            },
            pipeline: PipelineSettings {
                worker_count: parse_or(&lookup, "TOLLGATE_WORKER_COUNT", 4)?,
                queue_capacity: parse_or(&lookup, "TOLLGATE_QUEUE_CAPACITY", 50_000)?,
            },
            dlq: DlqSettings {
                url: required(&lookup, "TOLLGATE_DLQ_URL")?,
                retry_ceiling: parse_or(&lookup, "TOLLGATE_DLQ_RETRY_CEILING", 8)?,
                reclaim_batch_size: parse_or(&lookup, "TOLLGATE_DLQ_RECLAIM_BATCH", 200)?,
                base_backoff: Duration::from_millis(parse_or(
                    &lookup,
                    "TOLLGATE_DLQ_BASE_BACKOFF_MS",
                    500,
                )?),
            },
            snapshot: SnapshotSettings {
                store_url: required(&lookup, "TOLLGATE_STORE_URL")?,
                store_hmac_secret: optional(&lookup, "TOLLGATE_STORE_HMAC_SECRET"),
                refresh_interval: Duration::from_secs(parse_or(
                    &lookup,
                    "TOLLGATE_SNAPSHOT_REFRESH_SECS",
                    30,
                )?),
            },
            body_cap_bytes: parse_or(&lookup, "TOLLGATE_BODY_CAP_BYTES", 65_536)?,
            metrics: metrics_config(&lookup)?,
            logging: optional(&lookup, "TOLLGATE_SENTRY_DSN")
                .map(|sentry_dsn| LoggingConfig { sentry_dsn }),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_http_url("TOLLGATE_IDENTITY_URL", &self.identity.url)?;
        check_http_url("TOLLGATE_SINK_URL", &self.sink.url)?;
        check_http_url("TOLLGATE_STORE_URL", &self.snapshot.store_url)?;
        check_redis_url("TOLLGATE_DEDUP_URL", &self.dedup.url)?;
        check_redis_url("TOLLGATE_DLQ_URL", &self.dlq.url)?;

        check_nonzero("TOLLGATE_WORKER_COUNT", self.pipeline.worker_count as u64)?;
        check_nonzero("TOLLGATE_QUEUE_CAPACITY", self.pipeline.queue_capacity as u64)?;
        check_nonzero("TOLLGATE_SINK_BATCH_SIZE", self.sink.batch_max_size as u64)?;
        check_nonzero("TOLLGATE_BODY_CAP_BYTES", self.body_cap_bytes as u64)?;
        check_nonzero(
            "TOLLGATE_DEDUP_WINDOW_SECS",
            self.dedup.window.as_secs(),
        )?;

        if self.pipeline.queue_capacity < self.pipeline.worker_count {
            return Err(ConfigError::Invalid {
                name: "TOLLGATE_QUEUE_CAPACITY",
                reason: "must be at least the worker count".to_string(),
            });
        }
        Ok(())
    }
}

fn metrics_config(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<MetricsConfig>, ConfigError> {
    match (
        optional(lookup, "TOLLGATE_STATSD_HOST"),
        optional(lookup, "TOLLGATE_STATSD_PORT"),
    ) {
        (Some(statsd_host), Some(port)) => Ok(Some(MetricsConfig {
            statsd_host,
            statsd_port: port.parse().map_err(|_| ConfigError::Invalid {
                name: "TOLLGATE_STATSD_PORT",
                reason: format!("not a valid port: {port}"),
            })?,
        })),
        (None, None) => Ok(None),
        _ => Err(ConfigError::Invalid {
            name: "TOLLGATE_STATSD_HOST",
            reason: "statsd host and port must be set together".to_string(),
        }),
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional(lookup, name).ok_or(ConfigError::Missing(name))
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|value| !value.is_empty())
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match optional(lookup, name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("could not parse {value:?}"),
        }),
        None => Ok(default),
    }
}

fn check_http_url(name: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(value).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("expected an http(s) URL, got scheme {:?}", url.scheme()),
        });
    }
    Ok(())
}

fn check_redis_url(name: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(value).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    if !url.scheme().starts_with("redis") {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("expected a redis URL, got scheme {:?}", url.scheme()),
        });
    }
    Ok(())
}

fn check_nonzero(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
