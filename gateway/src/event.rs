use crate::errors::{GatewayError, Result};
use chrono::Utc;
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;
use uuid::Uuid;

/// Parameter names a click id may arrive under, in resolution order.
pub const CLICK_ID_ALIASES: &[&str] = &["click_id", "clickid", "cid", "transaction_id", "tid"];

pub const DUPLICATE_CLICK_FLAG: &str = "duplicate_click";

/// Headers whose values must never reach the event sink.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie"];

// Process-monotonic tie breaker for events sharing a wall-clock millisecond.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A fully captured tracking request, queued for the event sink.
///
/// Invariant: `tenant_id` is non-empty. Construction through [`capture`]
/// rejects the empty case; nothing else creates events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapturedEvent {
    pub event_id: String,
    pub timestamp_ms: u64,
    pub sequence: u64,
    pub tenant_id: String,
    pub click_id: String,
    #[serde(default)]
    pub campaign_id: String,
    pub request: CapturedRequest,
    #[serde(default)]
    pub enriched: Enriched,
    #[serde(default)]
    pub fraud_flags: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub client_ip: String,
}

/// Coarse request attributes derived at capture time. Everything here comes
/// from headers and parameters the client already sent; no lookups.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Enriched {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_bot: bool,
}

impl CapturedEvent {
    /// First value of a query parameter, if present and non-empty.
    pub fn first_param(&self, name: &str) -> Option<&str> {
        self.request
            .query
            .get(name)
            .and_then(|values| values.iter().find(|v| !v.is_empty()))
            .map(String::as_str)
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.request
            .headers
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn flag_duplicate(&mut self) {
        self.fraud_flags.push(DUPLICATE_CLICK_FLAG.to_string());
    }
}

pub struct CaptureContext<'a> {
    pub tenant_id: &'a str,
    pub click_id: String,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub peer: Option<SocketAddr>,
    pub body_cap: usize,
}

/// Captures the full request context into an event.
///
/// The body is truncated at `body_cap` bytes, never rejected. Credential
/// material is dropped from the header copy before it can reach storage.
pub fn capture(ctx: CaptureContext<'_>) -> Result<CapturedEvent> {
    if ctx.tenant_id.is_empty() {
        return Err(GatewayError::Invariant(
            "captured event without tenant id".to_string(),
        ));
    }

    let query = parse_query(ctx.uri.query());

    let mut headers = BTreeMap::new();
    for key in ctx.headers.keys() {
        let name = key.as_str().to_ascii_lowercase();
        if REDACTED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let values: Vec<String> = ctx
            .headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(String::from)
            .collect();
        headers.insert(name, values);
    }

    let truncated = &ctx.body[..ctx.body.len().min(ctx.body_cap)];
    let body = if truncated.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(truncated).into_owned())
    };

    let enriched = enrich(&query, &headers);

    Ok(CapturedEvent {
        event_id: Uuid::new_v4().to_string(),
        timestamp_ms: Utc::now().timestamp_millis() as u64,
        sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
        tenant_id: ctx.tenant_id.to_string(),
        click_id: ctx.click_id,
        campaign_id: String::new(),
        request: CapturedRequest {
            method: ctx.method.to_string(),
            path: ctx.uri.path().to_string(),
            client_ip: client_ip(ctx.headers, ctx.peer),
            query,
            headers,
            body,
        },
        enriched,
        fraud_flags: Vec::new(),
    })
}

/// Parses a raw query string into a multi-value map. All values are kept;
/// rule evaluation uses the first, redirects re-emit every one.
pub fn parse_query(raw: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(raw) = raw {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            query
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }
    query
}

/// First non-empty click id among the known aliases.
pub fn extract_click_id(query: &BTreeMap<String, Vec<String>>) -> Option<String> {
    for alias in CLICK_ID_ALIASES {
        if let Some(values) = query.get(*alias)
            && let Some(value) = values.iter().find(|v| !v.is_empty())
        {
            return Some(value.clone());
        }
    }
    None
}

pub fn mint_click_id() -> String {
    Uuid::new_v4().to_string()
}

/// Resolves the client IP: first entry of `X-Forwarded-For`, then
/// `X-Real-IP`, then the transport peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        let first = xff.split(',').next().unwrap_or(xff).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(xri) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && !xri.is_empty()
    {
        return xri.to_string();
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn enrich(
    query: &BTreeMap<String, Vec<String>>,
    headers: &BTreeMap<String, Vec<String>>,
) -> Enriched {
    let first = |name: &str| -> Option<String> {
        query
            .get(name)
            .and_then(|values| values.iter().find(|v| !v.is_empty()))
            .cloned()
    };

    let referrer = headers
        .get("referer")
        .and_then(|values| values.first())
        .cloned();
    let referrer_domain = referrer
        .as_deref()
        .and_then(|r| Url::parse(r).ok())
        .and_then(|u| u.host_str().map(String::from));

    let user_agent = headers
        .get("user-agent")
        .and_then(|values| values.first())
        .map(String::as_str)
        .unwrap_or_default();
    let agent = classify_user_agent(user_agent);

    Enriched {
        source: first("source").or_else(|| first("utm_source")),
        medium: first("medium").or_else(|| first("utm_medium")),
        referrer,
        referrer_domain,
        device_type: agent.device_type,
        os: agent.os,
        browser: agent.browser,
        is_bot: agent.is_bot,
    }
}

struct AgentProfile {
    device_type: Option<String>,
    os: Option<String>,
    browser: Option<String>,
    is_bot: bool,
}

// Coarse substring classification. Deliberately not a full UA parser; the
// router only needs broad buckets.
fn classify_user_agent(user_agent: &str) -> AgentProfile {
    if user_agent.is_empty() {
        return AgentProfile {
            device_type: None,
            os: None,
            browser: None,
            is_bot: false,
        };
    }

    let ua = user_agent.to_ascii_lowercase();

    let is_bot = ["bot", "crawler", "spider", "curl", "wget", "python-requests"]
        .iter()
        .any(|marker| ua.contains(marker));

    let device_type = if ua.contains("ipad") || ua.contains("tablet") {
        "tablet"
    } else if ua.contains("mobile") || ua.contains("iphone") {
        "mobile"
    } else if ua.contains("android") {
        "tablet"
    } else {
        "desktop"
    };

    let os = if ua.contains("windows") {
        Some("windows")
    } else if ua.contains("android") {
        Some("android")
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        Some("ios")
    } else if ua.contains("mac os") {
        Some("macos")
    } else if ua.contains("linux") {
        Some("linux")
    } else {
        None
    };

    let browser = if ua.contains("edg/") {
        Some("edge")
    } else if ua.contains("opr/") || ua.contains("opera") {
        Some("opera")
    } else if ua.contains("firefox") {
        Some("firefox")
    } else if ua.contains("chrome") {
        Some("chrome")
    } else if ua.contains("safari") {
        Some("safari")
    } else {
        None
    };

    AgentProfile {
        device_type: Some(device_type.to_string()),
        os: os.map(String::from),
        browser: browser.map(String::from),
        is_bot,
    }
}
