pub mod admin;
pub mod campaign;
pub mod config;
pub mod dedup;
pub mod dlq;
pub mod errors;
pub mod event;
mod handlers;
pub mod metrics_defs;
pub mod pipeline;
pub mod router;
pub mod sink;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod testutils;

use crate::config::Config;
use crate::dedup::{DedupCache, RedisDedup};
use crate::dlq::{DlqStore, Reclaimer, RedisDlq};
use crate::errors::GatewayError;
use crate::metrics_defs::{AUTH_FAILURES, REQUEST_DURATION};
use crate::pipeline::{EventPipeline, PipelineConfig, PipelineHandle};
use crate::router::CampaignRouter;
use crate::sink::{EventSink, HttpEventSink};
use crate::snapshot::{Refresher, SnapshotHandle};
use crate::store::{CampaignStore, HttpCampaignStore};
use http::header::AUTHORIZATION;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use identity::{IdentityClient, IdentityError, TenantContext};
use shared::http::{make_error_response, make_text_response, run_http_service};
use shared::routing::{Route, RouteTable};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Deadline for the DLQ ping issued by the readiness probe.
const READY_PING_DEADLINE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Traffic,
    Pixel,
    Postback,
    Health,
    Ready,
}

impl Endpoint {
    fn name(&self) -> &'static str {
        match self {
            Endpoint::Traffic => "traffic",
            Endpoint::Pixel => "pixel",
            Endpoint::Postback => "postback",
            Endpoint::Health => "health",
            Endpoint::Ready => "ready",
        }
    }
}

fn route_table() -> RouteTable<Endpoint> {
    RouteTable::new(vec![
        Route::new(
            Some(vec![Method::GET, Method::POST]),
            "/in",
            Endpoint::Traffic,
        ),
        Route::new(
            Some(vec![Method::GET, Method::POST]),
            "/in/{campaign_id}",
            Endpoint::Traffic,
        ),
        Route::new(Some(vec![Method::GET]), "/pixel.gif", Endpoint::Pixel),
        Route::new(Some(vec![Method::POST]), "/postback", Endpoint::Postback),
        Route::new(Some(vec![Method::GET]), "/health", Endpoint::Health),
        Route::new(Some(vec![Method::GET]), "/ready", Endpoint::Ready),
    ])
}

/// The assembled data plane: everything a handler touches, wired once at
/// startup. The tenant context is the only per-request state and is passed
/// explicitly; nothing here is keyed by anything but the current request.
pub struct Gateway {
    identity: IdentityClient,
    pub(crate) router: CampaignRouter,
    pub(crate) dedup: DedupCache,
    pub(crate) pipeline: PipelineHandle,
    dlq: Arc<dyn DlqStore>,
    snapshot: Arc<SnapshotHandle>,
    routes: RouteTable<Endpoint>,
    pub(crate) body_cap: usize,
}

impl Gateway {
    pub fn new(
        identity: IdentityClient,
        snapshot: Arc<SnapshotHandle>,
        dedup: DedupCache,
        pipeline: PipelineHandle,
        dlq: Arc<dyn DlqStore>,
        body_cap: usize,
    ) -> Self {
        Gateway {
            identity,
            router: CampaignRouter::new(snapshot.clone()),
            dedup,
            pipeline,
            dlq,
            snapshot,
            routes: route_table(),
            body_cap,
        }
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let start = Instant::now();
        let path = req.uri().path().to_string();

        let (endpoint, campaign_param) = match self.routes.resolve(req.method(), &path) {
            Some(matched) => (
                *matched.action,
                matched.params.get("campaign_id").map(|v| v.to_string()),
            ),
            None => return make_error_response(StatusCode::NOT_FOUND),
        };

        let response = match endpoint {
            Endpoint::Health => make_text_response(StatusCode::OK, "OK".to_string()),
            Endpoint::Ready => self.ready().await,
            _ => self.ingest(endpoint, campaign_param, req).await,
        };

        metrics::histogram!(
            REQUEST_DURATION.name,
            "handler" => endpoint.name(),
            "status" => response.status().as_u16().to_string(),
        )
        .record(start.elapsed().as_secs_f64());

        response
    }

    async fn ingest<B>(
        &self,
        endpoint: Endpoint,
        campaign_param: Option<String>,
        req: Request<B>,
    ) -> Response<Full<Bytes>>
    where
        B: BodyExt<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let tenant = match self.authenticate(req.headers()).await {
            Ok(tenant) => tenant,
            Err(e) => return e.response(),
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return make_error_response(StatusCode::BAD_REQUEST),
        };

        handlers::ingest(self, endpoint, campaign_param, tenant, parts, body).await
    }

    /// Turns the bearer credential into a tenant context, or the error the
    /// caller gets instead. A default tenant is never synthesized.
    async fn authenticate(
        &self,
        headers: &http::HeaderMap,
    ) -> Result<TenantContext, GatewayError> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        let Some(token) = token else {
            metrics::counter!(AUTH_FAILURES.name, "reason" => "missing").increment(1);
            tracing::warn!("request without bearer credential");
            return Err(GatewayError::AuthFailure);
        };

        match self.identity.validate(token).await {
            Ok(tenant) => Ok(tenant),
            Err(IdentityError::Malformed) | Err(IdentityError::Rejected) => {
                metrics::counter!(AUTH_FAILURES.name, "reason" => "rejected").increment(1);
                tracing::warn!("credential rejected");
                Err(GatewayError::AuthFailure)
            }
            Err(IdentityError::Unavailable(reason)) => {
                metrics::counter!(AUTH_FAILURES.name, "reason" => "unavailable").increment(1);
                tracing::warn!(reason, "identity service unavailable");
                Err(GatewayError::AuthUnavailable)
            }
        }
    }

    async fn ready(&self) -> Response<Full<Bytes>> {
        if !self.snapshot.is_ready() {
            return make_text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "campaign snapshot not loaded".to_string(),
            );
        }
        match tokio::time::timeout(READY_PING_DEADLINE, self.dlq.ping()).await {
            Ok(Ok(())) => make_text_response(StatusCode::OK, "OK".to_string()),
            _ => make_text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "DLQ unreachable".to_string(),
            ),
        }
    }
}

#[derive(Clone)]
pub struct GatewayService {
    gateway: Arc<Gateway>,
}

impl GatewayService {
    pub fn new(gateway: Gateway) -> Self {
        GatewayService {
            gateway: Arc::new(gateway),
        }
    }
}

impl<B> Service<Request<B>> for GatewayService
where
    B: BodyExt<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B: Unpin,
{
    type Response = Response<Full<Bytes>>;
    type Error = GatewayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let gateway = self.gateway.clone();
        Box::pin(async move { Ok(gateway.handle(req).await) })
    }
}

/// Builds every component from config and serves until a shutdown signal
/// arrives, then drains the pipeline.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let identity = IdentityClient::http(
        config.identity.url.clone(),
        config.identity.timeout,
        config.identity.cache_ttl,
    );

    let dedup_backend = RedisDedup::connect(&config.dedup.url).await?;
    let dedup = DedupCache::new(
        Arc::new(dedup_backend),
        config.dedup.window,
        config.dedup.deadline,
    );

    let dlq: Arc<dyn DlqStore> = Arc::new(RedisDlq::connect(&config.dlq.url).await?);
    let sink: Arc<dyn EventSink> = Arc::new(HttpEventSink::new(
        config.sink.url.clone(),
        config.sink.deadline,
    ));

    let snapshot = Arc::new(SnapshotHandle::new());
    let store: Arc<dyn CampaignStore> = Arc::new(HttpCampaignStore::new(
        config.snapshot.store_url.clone(),
        config.snapshot.store_hmac_secret.clone(),
    ));
    tokio::spawn(
        Refresher::new(
            snapshot.clone(),
            store.clone(),
            config.snapshot.refresh_interval,
        )
        .run(shutdown_rx.clone()),
    );

    let pipeline = EventPipeline::start(
        PipelineConfig {
            workers: config.pipeline.worker_count,
            queue_capacity: config.pipeline.queue_capacity,
            batch_max_size: config.sink.batch_max_size,
            batch_max_age: config.sink.flush_interval,
        },
        sink.clone(),
        dlq.clone(),
        shutdown_rx.clone(),
    );

    tokio::spawn(
        Reclaimer::new(
            dlq.clone(),
            sink,
            config.dlq.retry_ceiling,
            config.dlq.base_backoff,
            config.dlq.reclaim_batch_size,
        )
        .run(shutdown_rx.clone()),
    );

    let admin_state = admin::AdminState {
        identity: identity.clone(),
        store,
        snapshot: snapshot.clone(),
    };
    let admin_listener = config.admin_listener.clone();
    let admin_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = admin::serve(admin_listener, admin_state, admin_shutdown).await {
            tracing::error!(error = %e, "admin API failed");
        }
    });

    let service = GatewayService::new(Gateway::new(
        identity,
        snapshot,
        dedup,
        pipeline.handle(),
        dlq,
        config.body_cap_bytes,
    ));

    tracing::info!(port = config.listener.port, "gateway listening");

    let server = run_http_service(
        &config.listener.host,
        config.listener.port,
        service,
        shutdown_rx,
    );
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining pipeline");
            let _ = shutdown_tx.send(true);
        }
    }

    pipeline.join().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "could not install SIGTERM handler");
                return std::future::pending().await;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
