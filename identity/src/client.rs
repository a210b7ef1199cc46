use crate::cache::{CachedOutcome, TokenCache};
use crate::metrics_defs::VALIDATE_DURATION;
use crate::types::{RateLimit, TenantContext};
use http::StatusCode;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Credentials issued by the identity service carry this prefix. Anything
/// else short-circuits to a rejection without an RPC.
pub const TOKEN_PREFIX: &str = "tgk_";

#[derive(thiserror::Error, Debug)]
pub enum IdentityError {
    #[error("malformed credential")]
    Malformed,

    #[error("credential rejected")]
    Rejected,

    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Client for the external credential-validation service.
///
/// Remote mode talks HTTP to the identity service; fixed mode resolves
/// tokens from a static map and is used in tests and local development.
/// Validation results are cached for a short TTL in both directions.
#[derive(Clone)]
pub struct IdentityClient {
    inner: Arc<IdentityInner>,
}

struct IdentityInner {
    provider: Provider,
    cache: TokenCache,
}

enum Provider {
    Http(HttpClient),
    Fixed(HashMap<String, TenantContext>),
}

impl IdentityClient {
    pub fn http(base_url: String, timeout: Duration, cache_ttl: Duration) -> Self {
        IdentityClient {
            inner: Arc::new(IdentityInner {
                provider: Provider::Http(HttpClient::new(base_url, timeout)),
                cache: TokenCache::new(cache_ttl),
            }),
        }
    }

    /// Resolves tokens from a static map. Unknown tokens are rejected.
    pub fn fixed(tokens: HashMap<String, TenantContext>) -> Self {
        IdentityClient {
            inner: Arc::new(IdentityInner {
                provider: Provider::Fixed(tokens),
                cache: TokenCache::new(Duration::from_secs(5)),
            }),
        }
    }

    /// Validates a bearer credential and returns the owning tenant's context.
    ///
    /// Never logs or caches token material alongside failures other than the
    /// token-keyed cache entries themselves.
    pub async fn validate(&self, token: &str) -> Result<TenantContext, IdentityError> {
        if !token.starts_with(TOKEN_PREFIX) {
            return Err(IdentityError::Malformed);
        }

        match self.inner.cache.get(token) {
            Some(CachedOutcome::Valid(ctx)) => return Ok(ctx),
            Some(CachedOutcome::Rejected) => return Err(IdentityError::Rejected),
            None => {}
        }

        let start = Instant::now();
        let result = match &self.inner.provider {
            Provider::Http(client) => client.validate(token).await,
            Provider::Fixed(tokens) => tokens.get(token).cloned().ok_or(IdentityError::Rejected),
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(IdentityError::Rejected) | Err(IdentityError::Malformed) => "rejected",
            Err(IdentityError::Unavailable(_)) => "unavailable",
        };
        metrics::histogram!(VALIDATE_DURATION.name, "status" => status)
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(ctx) => self.inner.cache.insert_valid(token, ctx.clone()),
            Err(IdentityError::Rejected) => self.inner.cache.insert_rejected(token),
            // Outages are transient; never cache them.
            Err(_) => {}
        }

        result
    }
}

#[derive(Deserialize)]
struct CredentialResponse {
    tenant_id: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    rate_limit: Option<RateLimit>,
}

struct HttpClient {
    client: reqwest::Client,
    validate_url: String,
    timeout: Duration,
}

impl HttpClient {
    fn new(base_url: String, timeout: Duration) -> Self {
        let validate_url = format!(
            "{}/v1/credentials/validate",
            base_url.trim_end_matches('/')
        );
        HttpClient {
            client: reqwest::Client::new(),
            validate_url,
            timeout,
        }
    }

    async fn validate(&self, token: &str) -> Result<TenantContext, IdentityError> {
        let response = self
            .client
            .get(&self.validate_url)
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IdentityError::Unavailable("timeout".to_string())
                } else {
                    IdentityError::Unavailable("transport error".to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .json::<CredentialResponse>()
                    .await
                    .map_err(|_| IdentityError::Unavailable("invalid response".to_string()))?;
                Ok(TenantContext {
                    tenant_id: body.tenant_id,
                    permissions: HashSet::from_iter(body.permissions),
                    rate_limit: body.rate_limit,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(IdentityError::Rejected),
            status => Err(IdentityError::Unavailable(format!(
                "unexpected status {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn identity_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let authorization = req
            .headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let response = if authorization == "Bearer tgk_valid" {
            Response::new(Full::new(Bytes::from(
                r#"{"tenant_id": "org_A", "permissions": ["campaigns:write"], "rate_limit": {"requests_per_second": 100, "burst": 200}}"#,
            )))
        } else {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = hyper::StatusCode::UNAUTHORIZED;
            response
        };
        Ok(response)
    }

    async fn start_test_server() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to address");
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                let hits = server_hits.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        identity_handler(req)
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        (port, hits)
    }

    fn http_client(port: u16) -> IdentityClient {
        IdentityClient::http(
            format!("http://127.0.0.1:{port}"),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn malformed_token_short_circuits() {
        // Pointed at a port nobody listens on: a malformed token must be
        // rejected before any RPC is attempted.
        let client = IdentityClient::http(
            "http://127.0.0.1:1".to_string(),
            Duration::from_millis(100),
            Duration::from_secs(5),
        );

        let result = client.validate("sk-not-ours").await;
        assert!(matches!(result, Err(IdentityError::Malformed)));
    }

    #[tokio::test]
    async fn validates_against_service() {
        let (port, _hits) = start_test_server().await;
        let client = http_client(port);

        let ctx = client.validate("tgk_valid").await.unwrap();
        assert_eq!(ctx.tenant_id, "org_A");
        assert!(ctx.has_permission("campaigns:write"));
        assert_eq!(
            ctx.rate_limit,
            Some(RateLimit {
                requests_per_second: 100,
                burst: 200
            })
        );

        let rejected = client.validate("tgk_unknown").await;
        assert!(matches!(rejected, Err(IdentityError::Rejected)));
    }

    #[tokio::test]
    async fn rejections_are_cached() {
        let (port, hits) = start_test_server().await;
        let client = http_client(port);

        let _ = client.validate("tgk_cached_reject").await;
        let _ = client.validate("tgk_cached_reject").await;

        assert_eq!(
            hits.load(Ordering::SeqCst),
            1,
            "second validation must hit the cache"
        );
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let client = IdentityClient::http(
            "http://127.0.0.1:1".to_string(),
            Duration::from_millis(200),
            Duration::from_secs(5),
        );

        let result = client.validate("tgk_whatever").await;
        assert!(matches!(result, Err(IdentityError::Unavailable(_))));
    }

    #[tokio::test]
    async fn fixed_provider_resolves_known_tokens() {
        let client = IdentityClient::fixed(HashMap::from([(
            "tgk_test".to_string(),
            TenantContext::new("org_test"),
        )]));

        assert_eq!(
            client.validate("tgk_test").await.unwrap().tenant_id,
            "org_test"
        );
        assert!(matches!(
            client.validate("tgk_other").await,
            Err(IdentityError::Rejected)
        ));
    }
}
