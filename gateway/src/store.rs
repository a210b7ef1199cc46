use crate::campaign::Campaign;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use tokio::time::{Duration, sleep};

/// Base delay for retrying a failed page fetch, doubled per attempt.
const BASE_DELAY: u64 = 500;

/// Everything needed to rebuild the campaign snapshot: every active campaign
/// across all tenants plus the per-tenant fallback URLs.
#[derive(Debug, Default)]
pub struct StoreListing {
    pub campaigns: Vec<Campaign>,
    pub tenant_fallbacks: HashMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("campaign store request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("campaign store unavailable")]
    RetriesExceeded,
    #[error("campaign not found")]
    NotFound,
    #[error("missing cursor in response")]
    MissingCursor,
    #[error("campaign store rejected the request with status {0}")]
    Rejected(u16),
    #[error("could not serialize campaign: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Source-of-truth for campaign definitions. Read by the refresh loop and
/// written by the admin surface; never touched on the request path.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn list_active(&self) -> Result<StoreListing, StoreError>;
    async fn create(&self, campaign: &Campaign) -> Result<(), StoreError>;
    async fn update(&self, campaign: &Campaign) -> Result<(), StoreError>;
    async fn delete(&self, tenant_id: &str, campaign_id: &str) -> Result<(), StoreError>;
}

#[derive(Deserialize)]
struct ListingMetadata {
    cursor: Option<String>,
    has_more: bool,
    #[serde(default)]
    tenant_fallbacks: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ListingPage {
    data: Vec<Campaign>,
    metadata: ListingMetadata,
}

/// HTTP campaign store client.
///
/// # HMAC Authentication
///
/// When a secret is configured, requests carry an HMAC-SHA256 signature of
/// `path:body` in the `Authorization` header:
///
/// ```text
/// Authorization: Signature tollgate0:<base64-encoded-hmac-sha256-signature>
/// ```
///
/// For GET requests the body is empty bytes. Without a secret the header is
/// omitted and a warning is logged at startup.
pub struct HttpCampaignStore {
    client: reqwest::Client,
    base_url: String,
    hmac_secret: Option<String>,
}

impl HttpCampaignStore {
    pub fn new(base_url: String, hmac_secret: Option<String>) -> Self {
        if hmac_secret.is_none() {
            tracing::warn!("campaign store HMAC secret not set, request signing disabled");
        }
        HttpCampaignStore {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            hmac_secret,
        }
    }

    fn signature_header(&self, path: &str, body: &[u8]) -> Option<String> {
        let secret = self.hmac_secret.as_ref()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(path.as_bytes());
        mac.update(b":");
        mac.update(body);
        let signature = BASE64.encode(mac.finalize().into_bytes());
        Some(format!("Signature tollgate0:{signature}"))
    }

    fn signed(&self, request: reqwest::RequestBuilder, path: &str, body: &[u8]) -> reqwest::RequestBuilder {
        match self.signature_header(path, body) {
            Some(header) => request.header("authorization", header),
            None => request,
        }
    }

    async fn send_mutation(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(), StoreError> {
        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound),
            status => Err(StoreError::Rejected(status.as_u16())),
        }
    }
}

#[async_trait]
impl CampaignStore for HttpCampaignStore {
    async fn list_active(&self) -> Result<StoreListing, StoreError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let path = "/v1/campaigns/active";
        let mut listing = StoreListing::default();
        let mut next_cursor: Option<String> = None;
        let mut page_fetches = 0;

        // 3 retries per page fetch
        let mut retries = 0;

        loop {
            let mut url = reqwest::Url::parse(&format!("{}{path}", self.base_url))
                .map_err(|e| StoreError::InvalidUrl(e.to_string()))?;

            if let Some(ref cursor) = next_cursor {
                url.query_pairs_mut().append_pair("cursor", cursor);
            }

            let request = self.signed(self.client.get(url), path, b"");
            let response = request.send().await?;

            if !response.status().is_success() {
                if RETRIABLE_STATUS_CODES.contains(&response.status()) && retries < 3 {
                    // Backoff between retries
                    let retry_millis = BASE_DELAY * 2_u64.pow(retries);
                    sleep(Duration::from_millis(retry_millis)).await;
                    retries += 1;
                    continue;
                } else {
                    return Err(StoreError::RetriesExceeded);
                }
            }

            // Response successful, reset retries counter
            retries = 0;

            let page = response.json::<ListingPage>().await?;
            listing.campaigns.extend(page.data);
            listing
                .tenant_fallbacks
                .extend(page.metadata.tenant_fallbacks);

            page_fetches += 1;
            next_cursor = page.metadata.cursor;

            if !page.metadata.has_more {
                break;
            }
            if next_cursor.is_none() {
                return Err(StoreError::MissingCursor);
            }
        }

        tracing::info!("Fetched {page_fetches} pages from campaign store");

        Ok(listing)
    }

    async fn create(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let path = "/v1/campaigns";
        let body = serde_json::to_vec(campaign)?;
        let request = self
            .signed(self.client.post(format!("{}{path}", self.base_url)), path, &body)
            .header("content-type", "application/json")
            .body(body);
        self.send_mutation(request).await
    }

    async fn update(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let path = format!(
            "/v1/campaigns/{}/{}",
            campaign.tenant_id, campaign.campaign_id
        );
        let body = serde_json::to_vec(campaign)?;
        let request = self
            .signed(self.client.put(format!("{}{path}", self.base_url)), &path, &body)
            .header("content-type", "application/json")
            .body(body);
        self.send_mutation(request).await
    }

    async fn delete(&self, tenant_id: &str, campaign_id: &str) -> Result<(), StoreError> {
        let path = format!("/v1/campaigns/{tenant_id}/{campaign_id}");
        let request = self.signed(
            self.client.delete(format!("{}{path}", self.base_url)),
            &path,
            b"",
        );
        self.send_mutation(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::campaign;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    static LIST_CALLS: AtomicUsize = AtomicUsize::new(0);

    async fn store_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        assert_eq!(req.uri().path(), "/v1/campaigns/active");

        let call = LIST_CALLS.fetch_add(1, Ordering::SeqCst);
        let cursor = req.uri().query().unwrap_or("").to_string();

        // First hit is retriable to exercise the backoff path.
        if call == 0 {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = hyper::StatusCode::SERVICE_UNAVAILABLE;
            return Ok(response);
        }

        let body = if cursor.contains("cursor=page2") {
            serde_json::json!({
                "data": [campaign("org_B", "launch", "https://b.example.com/")],
                "metadata": {"cursor": null, "has_more": false, "tenant_fallbacks": {"org_B": "https://b.example.com/fallback"}}
            })
        } else {
            serde_json::json!({
                "data": [campaign("org_A", "summer", "https://shop.example.com/s")],
                "metadata": {"cursor": "page2", "has_more": true, "tenant_fallbacks": {}}
            })
        };

        Ok(Response::new(Full::new(Bytes::from(body.to_string()))))
    }

    async fn start_store_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(store_handler))
                        .await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn lists_across_pages_with_retry() {
        let port = start_store_server().await;
        let store = HttpCampaignStore::new(format!("http://127.0.0.1:{port}"), None);

        let listing = store.list_active().await.unwrap();

        assert_eq!(listing.campaigns.len(), 2);
        assert_eq!(listing.campaigns[0].campaign_id, "summer");
        assert_eq!(listing.campaigns[1].tenant_id, "org_B");
        assert_eq!(
            listing.tenant_fallbacks.get("org_B").map(String::as_str),
            Some("https://b.example.com/fallback")
        );
    }

    #[test]
    fn signature_is_stable_for_path_and_body() {
        let store = HttpCampaignStore::new(
            "http://store.internal".to_string(),
            Some("topsecret".to_string()),
        );

        let a = store.signature_header("/v1/campaigns", b"{}").unwrap();
        let b = store.signature_header("/v1/campaigns", b"{}").unwrap();
        let c = store.signature_header("/v1/campaigns", b"{ }").unwrap();

        assert!(a.starts_with("Signature tollgate0:"));
        assert_eq!(a, b);
        assert_ne!(a, c, "different body must produce a different signature");
    }

    #[test]
    fn no_secret_means_no_header() {
        let store = HttpCampaignStore::new("http://store.internal".to_string(), None);
        assert!(store.signature_header("/v1/campaigns", b"").is_none());
    }
}
