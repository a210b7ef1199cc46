//! Campaign admin API, served on the admin listener.
//!
//! Every mutation goes to the campaign store first and then patches the
//! local snapshot optimistically; the next refresh reconciles. Payload
//! tenant ids must match the authenticated tenant; a mismatch is treated as
//! an isolation violation, not a validation error.

use crate::campaign::Campaign;
use crate::config::Listener;
use crate::errors::GatewayError;
use crate::metrics_defs::ISOLATION_VIOLATIONS;
use crate::snapshot::SnapshotHandle;
use crate::store::{CampaignStore, StoreError};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use identity::{IdentityClient, IdentityError, TenantContext};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AdminState {
    pub identity: IdentityClient,
    pub store: Arc<dyn CampaignStore>,
    pub snapshot: Arc<SnapshotHandle>,
}

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/v1/campaigns", get(list_campaigns).post(create_campaign))
        .route(
            "/v1/campaigns/{campaign_id}",
            put(update_campaign).delete(delete_campaign),
        )
        .with_state(state)
}

pub async fn serve(
    listener: Listener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AdminError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let tcp = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "admin API listening");

    axum::serve(tcp, admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[derive(thiserror::Error, Debug)]
enum AdminApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("invalid payload: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for AdminApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminApiError::Gateway(e) => e.status(),
            AdminApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            AdminApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            AdminApiError::Store(_) => StatusCode::BAD_GATEWAY,
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

async fn authenticate(
    state: &AdminState,
    headers: &HeaderMap,
) -> Result<TenantContext, AdminApiError> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(GatewayError::AuthFailure)?;

    match state.identity.validate(token).await {
        Ok(tenant) => Ok(tenant),
        Err(IdentityError::Unavailable(_)) => Err(GatewayError::AuthUnavailable.into()),
        Err(_) => Err(GatewayError::AuthFailure.into()),
    }
}

/// Rejects any payload claiming a tenant other than the authenticated one.
fn guard_tenant(tenant: &TenantContext, payload_tenant: &str) -> Result<(), AdminApiError> {
    if tenant.tenant_id != payload_tenant {
        metrics::counter!(ISOLATION_VIOLATIONS.name, "tenant_id" => tenant.tenant_id.clone())
            .increment(1);
        tracing::error!(
            authenticated = %tenant.tenant_id,
            payload = %payload_tenant,
            "cross-tenant campaign mutation rejected"
        );
        return Err(GatewayError::IsolationViolation.into());
    }
    Ok(())
}

async fn list_campaigns(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Campaign>>, AdminApiError> {
    let tenant = authenticate(&state, &headers).await?;

    let snapshot = state.snapshot.load();
    let mut campaigns: Vec<Campaign> = snapshot
        .tenant(&tenant.tenant_id)
        .map(|t| t.campaigns.values().map(|c| (**c).clone()).collect())
        .unwrap_or_default();
    campaigns.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));

    Ok(Json(campaigns))
}

async fn create_campaign(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(campaign): Json<Campaign>,
) -> Result<StatusCode, AdminApiError> {
    let tenant = authenticate(&state, &headers).await?;
    guard_tenant(&tenant, &campaign.tenant_id)?;

    if campaign.campaign_id.is_empty() {
        return Err(AdminApiError::Invalid(
            "campaign_id must not be empty".to_string(),
        ));
    }

    state.store.create(&campaign).await?;
    state.snapshot.apply_upsert(campaign);
    Ok(StatusCode::CREATED)
}

async fn update_campaign(
    State(state): State<AdminState>,
    Path(campaign_id): Path<String>,
    headers: HeaderMap,
    Json(campaign): Json<Campaign>,
) -> Result<StatusCode, AdminApiError> {
    let tenant = authenticate(&state, &headers).await?;
    guard_tenant(&tenant, &campaign.tenant_id)?;

    if campaign.campaign_id != campaign_id {
        return Err(AdminApiError::Invalid(
            "campaign_id in path and payload differ".to_string(),
        ));
    }

    state.store.update(&campaign).await?;
    state.snapshot.apply_upsert(campaign);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_campaign(
    State(state): State<AdminState>,
    Path(campaign_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AdminApiError> {
    let tenant = authenticate(&state, &headers).await?;

    state.store.delete(&tenant.tenant_id, &campaign_id).await?;
    state.snapshot.apply_delete(&tenant.tenant_id, &campaign_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::CampaignSnapshot;
    use crate::testutils::{InMemoryCampaignStore, campaign};
    use std::collections::HashMap;

    struct TestAdmin {
        base_url: String,
        client: reqwest::Client,
        store: Arc<InMemoryCampaignStore>,
        snapshot: Arc<SnapshotHandle>,
    }

    async fn start_admin(campaigns: Vec<Campaign>) -> TestAdmin {
        let identity = IdentityClient::fixed(HashMap::from([
            ("tgk_org_a".to_string(), TenantContext::new("org_A")),
            ("tgk_org_b".to_string(), TenantContext::new("org_B")),
        ]));
        let store = Arc::new(InMemoryCampaignStore::new(campaigns.clone()));
        let snapshot = Arc::new(SnapshotHandle::new());
        snapshot.replace(CampaignSnapshot::from_parts(campaigns, HashMap::new()));

        let state = AdminState {
            identity,
            store: store.clone(),
            snapshot: snapshot.clone(),
        };

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(tcp, admin_router(state)).await;
        });

        TestAdmin {
            base_url: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            store,
            snapshot,
        }
    }

    #[tokio::test]
    async fn create_updates_store_and_snapshot() {
        let admin = start_admin(vec![]).await;

        let status = admin
            .client
            .post(format!("{}/v1/campaigns", admin.base_url))
            .bearer_auth("tgk_org_a")
            .json(&campaign("org_A", "summer", "https://shop.example.com/s"))
            .send()
            .await
            .unwrap()
            .status();

        assert_eq!(status, reqwest::StatusCode::CREATED);
        assert_eq!(admin.store.campaigns().len(), 1);
        assert!(
            admin
                .snapshot
                .load()
                .tenant("org_A")
                .unwrap()
                .campaigns
                .contains_key("summer")
        );
    }

    #[tokio::test]
    async fn cross_tenant_payload_is_rejected_with_403() {
        let admin = start_admin(vec![]).await;

        // Authenticated as org_A, payload claims org_B.
        let status = admin
            .client
            .post(format!("{}/v1/campaigns", admin.base_url))
            .bearer_auth("tgk_org_a")
            .json(&campaign("org_B", "stolen", "https://evil.example.com/"))
            .send()
            .await
            .unwrap()
            .status();

        assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
        assert!(admin.store.campaigns().is_empty(), "no store mutation");
        assert!(
            admin.snapshot.load().tenant("org_B").is_none(),
            "no snapshot mutation"
        );
    }

    #[tokio::test]
    async fn listing_is_scoped_to_the_authenticated_tenant() {
        let admin = start_admin(vec![
            campaign("org_A", "summer", "https://shop.example.com/s"),
            campaign("org_B", "launch", "https://b.example.com/"),
        ])
        .await;

        let campaigns: Vec<Campaign> = admin
            .client
            .get(format!("{}/v1/campaigns", admin.base_url))
            .bearer_auth("tgk_org_a")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].tenant_id, "org_A");
    }

    #[tokio::test]
    async fn requests_without_credentials_are_401() {
        let admin = start_admin(vec![]).await;

        let status = admin
            .client
            .get(format!("{}/v1/campaigns", admin.base_url))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn update_of_missing_campaign_is_404() {
        let admin = start_admin(vec![]).await;

        let status = admin
            .client
            .put(format!("{}/v1/campaigns/ghost", admin.base_url))
            .bearer_auth("tgk_org_a")
            .json(&campaign("org_A", "ghost", "https://shop.example.com/g"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_from_store_and_snapshot() {
        let admin =
            start_admin(vec![campaign("org_A", "summer", "https://shop.example.com/s")]).await;

        let status = admin
            .client
            .delete(format!("{}/v1/campaigns/summer", admin.base_url))
            .bearer_auth("tgk_org_a")
            .send()
            .await
            .unwrap()
            .status();

        assert_eq!(status, reqwest::StatusCode::NO_CONTENT);
        assert!(admin.store.campaigns().is_empty());
        assert!(
            !admin
                .snapshot
                .load()
                .tenant("org_A")
                .unwrap()
                .campaigns
                .contains_key("summer")
        );
    }

    #[tokio::test]
    async fn deleting_another_tenants_campaign_is_invisible_404() {
        let admin =
            start_admin(vec![campaign("org_A", "summer", "https://shop.example.com/s")]).await;

        // org_B deletes by the same id; the store lookup is tenant-scoped.
        let status = admin
            .client
            .delete(format!("{}/v1/campaigns/summer", admin.base_url))
            .bearer_auth("tgk_org_b")
            .send()
            .await
            .unwrap()
            .status();

        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
        assert_eq!(admin.store.campaigns().len(), 1);
    }
}
