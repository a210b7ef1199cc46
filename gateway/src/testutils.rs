use crate::campaign::{Campaign, CampaignStatus};
use crate::dedup::{DedupBackend, DedupError};
use crate::dlq::{DlqEntry, DlqError, DlqStore};
use crate::event::{self, CapturedEvent};
use crate::sink::{EventSink, SinkError};
use crate::store::{CampaignStore, StoreError, StoreListing};
use async_trait::async_trait;
use chrono::Utc;
use http::{HeaderMap, Method, Uri};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub fn campaign(tenant_id: &str, campaign_id: &str, destination_url: &str) -> Campaign {
    Campaign {
        tenant_id: tenant_id.to_string(),
        campaign_id: campaign_id.to_string(),
        name: campaign_id.to_string(),
        status: CampaignStatus::Active,
        rules: Vec::new(),
        destination_url: destination_url.to_string(),
        append_params: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn paused_campaign(tenant_id: &str, campaign_id: &str, destination_url: &str) -> Campaign {
    Campaign {
        status: CampaignStatus::Paused,
        ..campaign(tenant_id, campaign_id, destination_url)
    }
}

pub fn test_event(tenant_id: &str, path_and_query: &str) -> CapturedEvent {
    let uri: Uri = path_and_query.parse().unwrap();
    let headers = HeaderMap::new();
    let query = event::parse_query(uri.query());
    let click_id = event::extract_click_id(&query).unwrap_or_else(event::mint_click_id);
    event::capture(event::CaptureContext {
        tenant_id,
        click_id,
        method: &Method::GET,
        uri: &uri,
        headers: &headers,
        body: b"",
        peer: None,
        body_cap: 1024,
    })
    .unwrap()
}

#[derive(Default)]
pub struct InMemorySink {
    events: Mutex<Vec<CapturedEvent>>,
    failing: AtomicBool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for InMemorySink {
    async fn append_batch(&self, events: &[CapturedEvent]) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("injected failure".to_string()));
        }
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDlq {
    queue: Mutex<VecDeque<DlqEntry>>,
    permanent: Mutex<Vec<DlqEntry>>,
    failing: AtomicBool,
}

impl InMemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn permanent(&self) -> Vec<DlqEntry> {
        self.permanent.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlq {
    async fn push(&self, entries: &[DlqEntry]) -> Result<(), DlqError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DlqError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "injected failure",
            ))));
        }
        let mut queue = self.queue.lock();
        for entry in entries {
            queue.push_front(entry.clone());
        }
        Ok(())
    }

    async fn pop_batch(&self, max: usize) -> Result<Vec<DlqEntry>, DlqError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DlqError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "injected failure",
            ))));
        }
        let mut queue = self.queue.lock();
        let mut entries = Vec::new();
        while entries.len() < max {
            match queue.pop_back() {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn push_permanent(&self, entries: &[DlqEntry]) -> Result<(), DlqError> {
        self.permanent.lock().extend_from_slice(entries);
        Ok(())
    }

    async fn ping(&self) -> Result<(), DlqError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DlqError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "injected failure",
            ))));
        }
        Ok(())
    }
}

pub struct InMemoryDedup {
    keys: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedup {
    pub fn new() -> Self {
        InMemoryDedup {
            keys: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DedupBackend for InMemoryDedup {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        keys.retain(|_, expires| *expires > now);
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

enum DedupMode {
    Slow(Duration),
    Erroring,
    Healthy,
}

/// Dedup backend with a switchable failure mode, for outage tests.
pub struct FailingDedup {
    mode: Mutex<DedupMode>,
    inner: InMemoryDedup,
    calls: AtomicUsize,
}

impl FailingDedup {
    pub fn slow(delay: Duration) -> Self {
        Self::with_mode(DedupMode::Slow(delay))
    }

    pub fn erroring() -> Self {
        Self::with_mode(DedupMode::Erroring)
    }

    fn with_mode(mode: DedupMode) -> Self {
        FailingDedup {
            mode: Mutex::new(mode),
            inner: InMemoryDedup::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self) {
        *self.mode.lock() = DedupMode::Healthy;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DedupBackend for FailingDedup {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, DedupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = {
            match &*self.mode.lock() {
                DedupMode::Slow(delay) => Some(*delay),
                DedupMode::Erroring => None,
                DedupMode::Healthy => None,
            }
        };
        let is_healthy = matches!(&*self.mode.lock(), DedupMode::Healthy);
        if is_healthy {
            return self.inner.set_if_absent(key, ttl).await;
        }
        match delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                self.inner.set_if_absent(key, ttl).await
            }
            None => Err(DedupError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "injected failure",
            )))),
        }
    }
}

#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: Mutex<Vec<Campaign>>,
    fallbacks: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
}

impl InMemoryCampaignStore {
    pub fn new(campaigns: Vec<Campaign>) -> Self {
        InMemoryCampaignStore {
            campaigns: Mutex::new(campaigns),
            fallbacks: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn insert(&self, campaign: Campaign) {
        self.campaigns.lock().push(campaign);
    }

    pub fn campaigns(&self) -> Vec<Campaign> {
        self.campaigns.lock().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::RetriesExceeded);
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for InMemoryCampaignStore {
    async fn list_active(&self) -> Result<StoreListing, StoreError> {
        self.check()?;
        Ok(StoreListing {
            campaigns: self
                .campaigns
                .lock()
                .iter()
                .filter(|c| c.is_active())
                .cloned()
                .collect(),
            tenant_fallbacks: self.fallbacks.lock().clone(),
        })
    }

    async fn create(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.check()?;
        self.campaigns.lock().push(campaign.clone());
        Ok(())
    }

    async fn update(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.check()?;
        let mut campaigns = self.campaigns.lock();
        match campaigns
            .iter_mut()
            .find(|c| c.tenant_id == campaign.tenant_id && c.campaign_id == campaign.campaign_id)
        {
            Some(existing) => {
                *existing = campaign.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, tenant_id: &str, campaign_id: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut campaigns = self.campaigns.lock();
        let before = campaigns.len();
        campaigns.retain(|c| !(c.tenant_id == tenant_id && c.campaign_id == campaign_id));
        if campaigns.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
