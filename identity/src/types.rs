use serde::Deserialize;
use std::collections::HashSet;

/// Per-request tenant context produced by credential validation.
///
/// Lives for the request only and is passed explicitly to every component on
/// the hot path; it is never persisted and never shared between requests.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub permissions: HashSet<String>,
    pub rate_limit: Option<RateLimit>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        TenantContext {
            tenant_id: tenant_id.into(),
            permissions: HashSet::new(),
            rate_limit: None,
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

/// Rate-limit descriptor attached to a credential by the identity service.
/// The gateway carries it through; enforcement lives upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub requests_per_second: u32,
    pub burst: u32,
}
