// Short-TTL caches in front of the identity service. The positive cache
// absorbs repeated validations of the same token within a refresh window; the
// negative cache prevents repeated RPCs for tokens the service already
// rejected.
use crate::metrics_defs::{TOKEN_CACHE_HIT, TOKEN_CACHE_MISS};
use crate::types::TenantContext;
use moka::sync::Cache;
use std::time::Duration;

const SIZE: u64 = 100_000;
const NEGATIVE_SIZE: u64 = 10_000;

pub struct TokenCache {
    positive: Cache<String, TenantContext>,
    negative: Cache<String, ()>,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        let positive = Cache::builder()
            .max_capacity(SIZE)
            .time_to_live(ttl)
            .build();
        let negative = Cache::builder()
            .max_capacity(NEGATIVE_SIZE)
            .time_to_live(ttl)
            .build();

        TokenCache { positive, negative }
    }

    pub fn get(&self, token: &str) -> Option<CachedOutcome> {
        if let Some(ctx) = self.positive.get(token) {
            metrics::counter!(TOKEN_CACHE_HIT.name).increment(1);
            return Some(CachedOutcome::Valid(ctx));
        }
        if self.negative.contains_key(token) {
            metrics::counter!(TOKEN_CACHE_HIT.name).increment(1);
            return Some(CachedOutcome::Rejected);
        }
        metrics::counter!(TOKEN_CACHE_MISS.name).increment(1);
        None
    }

    pub fn insert_valid(&self, token: &str, ctx: TenantContext) {
        self.positive.insert(token.to_string(), ctx);
    }

    pub fn insert_rejected(&self, token: &str) {
        self.negative.insert(token.to_string(), ());
    }
}

pub enum CachedOutcome {
    Valid(TenantContext),
    Rejected,
}
