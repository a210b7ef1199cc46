use crate::campaign::Campaign;
use crate::metrics_defs::{SNAPSHOT_CAMPAIGNS, SNAPSHOT_REFRESH_DURATION};
use crate::store::CampaignStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Process-local, read-mostly view of every active campaign, keyed by tenant.
///
/// Rebuilt as a whole by the refresh loop; readers only ever observe a fully
/// constructed snapshot.
#[derive(Clone, Debug, Default)]
pub struct CampaignSnapshot {
    tenants: HashMap<String, TenantCampaigns>,
}

#[derive(Clone, Debug, Default)]
pub struct TenantCampaigns {
    pub campaigns: HashMap<String, Arc<Campaign>>,
    pub fallback_url: Option<String>,
}

impl CampaignSnapshot {
    /// Builds a snapshot from the campaign store's listing. Anything that is
    /// not active is dropped here so the router never has to re-check.
    pub fn from_parts(campaigns: Vec<Campaign>, tenant_fallbacks: HashMap<String, String>) -> Self {
        let mut tenants: HashMap<String, TenantCampaigns> = HashMap::new();

        for campaign in campaigns {
            if !campaign.is_active() {
                continue;
            }
            tenants
                .entry(campaign.tenant_id.clone())
                .or_default()
                .campaigns
                .insert(campaign.campaign_id.clone(), Arc::new(campaign));
        }

        for (tenant_id, fallback_url) in tenant_fallbacks {
            tenants.entry(tenant_id).or_default().fallback_url = Some(fallback_url);
        }

        CampaignSnapshot { tenants }
    }

    /// The tenant's slice of the snapshot. Router lookups go through here so
    /// no decision can ever see another tenant's campaigns.
    pub fn tenant(&self, tenant_id: &str) -> Option<&TenantCampaigns> {
        self.tenants.get(tenant_id)
    }

    pub fn campaign_count(&self) -> usize {
        self.tenants.values().map(|t| t.campaigns.len()).sum()
    }
}

/// Shared handle to the current snapshot.
///
/// Readers clone the inner `Arc` under a briefly held read lock; the
/// refresher swaps in a complete replacement under the write lock. Admin
/// mutations patch a copy and swap it the same way.
pub struct SnapshotHandle {
    current: RwLock<Arc<CampaignSnapshot>>,
    // Used by the readiness probe. Initially false and set to true once any
    // snapshot has been loaded.
    ready: AtomicBool,
}

impl SnapshotHandle {
    pub fn new() -> Self {
        SnapshotHandle {
            current: RwLock::new(Arc::new(CampaignSnapshot::default())),
            ready: AtomicBool::new(false),
        }
    }

    pub fn load(&self) -> Arc<CampaignSnapshot> {
        self.current.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn replace(&self, snapshot: CampaignSnapshot) {
        metrics::gauge!(SNAPSHOT_CAMPAIGNS.name).set(snapshot.campaign_count() as f64);
        *self.current.write() = Arc::new(snapshot);
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Optimistically applies an admin create/update ahead of the next
    /// refresh. Inactive statuses remove the campaign from the live view.
    pub fn apply_upsert(&self, campaign: Campaign) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        let tenant = next.tenants.entry(campaign.tenant_id.clone()).or_default();
        if campaign.is_active() {
            tenant
                .campaigns
                .insert(campaign.campaign_id.clone(), Arc::new(campaign));
        } else {
            tenant.campaigns.remove(&campaign.campaign_id);
        }
        *guard = Arc::new(next);
    }

    pub fn apply_delete(&self, tenant_id: &str, campaign_id: &str) {
        let mut guard = self.current.write();
        let mut next = (**guard).clone();
        if let Some(tenant) = next.tenants.get_mut(tenant_id) {
            tenant.campaigns.remove(campaign_id);
        }
        *guard = Arc::new(next);
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loop that rebuilds the snapshot from the campaign store on a
/// fixed interval. Transient load failures keep the previous snapshot.
pub struct Refresher {
    handle: Arc<SnapshotHandle>,
    store: Arc<dyn CampaignStore>,
    interval: Duration,
}

impl Refresher {
    pub fn new(
        handle: Arc<SnapshotHandle>,
        store: Arc<dyn CampaignStore>,
        interval: Duration,
    ) -> Self {
        Refresher {
            handle,
            store,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("snapshot refresher shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
            }
        }
    }

    async fn refresh_once(&self) {
        let start = Instant::now();

        match self.store.list_active().await {
            Ok(listing) => {
                let snapshot =
                    CampaignSnapshot::from_parts(listing.campaigns, listing.tenant_fallbacks);
                let count = snapshot.campaign_count();
                self.handle.replace(snapshot);
                metrics::histogram!(SNAPSHOT_REFRESH_DURATION.name, "status" => "success")
                    .record(start.elapsed().as_secs_f64());
                tracing::debug!(campaigns = count, "campaign snapshot refreshed");
            }
            Err(e) => {
                metrics::histogram!(SNAPSHOT_REFRESH_DURATION.name, "status" => "failure")
                    .record(start.elapsed().as_secs_f64());
                tracing::warn!(error = %e, "campaign snapshot refresh failed, keeping previous snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{InMemoryCampaignStore, campaign, paused_campaign};

    #[test]
    fn from_parts_keeps_only_active_campaigns() {
        let snapshot = CampaignSnapshot::from_parts(
            vec![
                campaign("org_A", "summer", "https://shop.example.com/s"),
                paused_campaign("org_A", "winter", "https://shop.example.com/w"),
                campaign("org_B", "launch", "https://b.example.com/"),
            ],
            HashMap::new(),
        );

        let org_a = snapshot.tenant("org_A").unwrap();
        assert!(org_a.campaigns.contains_key("summer"));
        assert!(!org_a.campaigns.contains_key("winter"));
        assert!(!org_a.campaigns.contains_key("launch"));
        assert_eq!(snapshot.campaign_count(), 2);
    }

    #[test]
    fn tenant_fallbacks_are_scoped() {
        let snapshot = CampaignSnapshot::from_parts(
            vec![],
            HashMap::from([("org_A".to_string(), "https://a.example.com/".to_string())]),
        );
        assert_eq!(
            snapshot.tenant("org_A").unwrap().fallback_url.as_deref(),
            Some("https://a.example.com/")
        );
        assert!(snapshot.tenant("org_B").is_none());
    }

    #[test]
    fn handle_not_ready_until_first_replace() {
        let handle = SnapshotHandle::new();
        assert!(!handle.is_ready());

        handle.replace(CampaignSnapshot::default());
        assert!(handle.is_ready());
    }

    #[test]
    fn readers_keep_their_snapshot_across_replace() {
        let handle = SnapshotHandle::new();
        handle.replace(CampaignSnapshot::from_parts(
            vec![campaign("org_A", "one", "https://one.example.com/")],
            HashMap::new(),
        ));

        let before = handle.load();
        handle.replace(CampaignSnapshot::from_parts(
            vec![campaign("org_A", "two", "https://two.example.com/")],
            HashMap::new(),
        ));

        // The earlier reader still sees the complete old view.
        assert!(before.tenant("org_A").unwrap().campaigns.contains_key("one"));
        let after = handle.load();
        assert!(after.tenant("org_A").unwrap().campaigns.contains_key("two"));
        assert!(!after.tenant("org_A").unwrap().campaigns.contains_key("one"));
    }

    #[test]
    fn upsert_and_delete_patch_the_live_view() {
        let handle = SnapshotHandle::new();
        handle.replace(CampaignSnapshot::default());

        handle.apply_upsert(campaign("org_A", "summer", "https://shop.example.com/s"));
        assert!(
            handle
                .load()
                .tenant("org_A")
                .unwrap()
                .campaigns
                .contains_key("summer")
        );

        // Pausing through an update drops it from the live view.
        handle.apply_upsert(paused_campaign("org_A", "summer", "https://shop.example.com/s"));
        assert!(
            !handle
                .load()
                .tenant("org_A")
                .unwrap()
                .campaigns
                .contains_key("summer")
        );

        handle.apply_upsert(campaign("org_A", "fall", "https://shop.example.com/f"));
        handle.apply_delete("org_A", "fall");
        assert!(
            !handle
                .load()
                .tenant("org_A")
                .unwrap()
                .campaigns
                .contains_key("fall")
        );
    }

    #[tokio::test]
    async fn refresh_failure_keeps_previous_snapshot() {
        let store = Arc::new(InMemoryCampaignStore::new(vec![campaign(
            "org_A",
            "summer",
            "https://shop.example.com/s",
        )]));
        let handle = Arc::new(SnapshotHandle::new());
        let refresher = Refresher::new(handle.clone(), store.clone(), Duration::from_secs(60));

        refresher.refresh_once().await;
        assert!(handle.is_ready());
        assert_eq!(handle.load().campaign_count(), 1);

        store.set_failing(true);
        refresher.refresh_once().await;
        assert_eq!(
            handle.load().campaign_count(),
            1,
            "failed refresh must keep the previous snapshot"
        );

        store.set_failing(false);
        store.insert(campaign("org_A", "fall", "https://shop.example.com/f"));
        refresher.refresh_once().await;
        assert_eq!(handle.load().campaign_count(), 2);
    }
}
