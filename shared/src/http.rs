use http::header::{CACHE_CONTROL, HeaderValue};
use http_body_util::Full;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Transport peer address of the connection a request arrived on.
///
/// Inserted into request extensions by [`run_http_service`] so handlers can
/// fall back to it when no forwarding headers are present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Accept loop for a hot-path HTTP service.
///
/// Hands each connection to hyper with h1/h2 auto-detection. Stops accepting
/// when the shutdown signal fires; in-flight connections finish on their own
/// tasks.
pub async fn run_http_service<S, B, E>(
    host: &str,
    port: u16,
    service: S,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let service_arc = Arc::new(service);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!(port, "listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let _ = stream.set_nodelay(true);
                let io = TokioIo::new(stream);
                let svc = WithPeerAddr {
                    inner: service_arc.clone(),
                    peer: peer_addr,
                };

                // Hand the connection to hyper; auto-detect h1/h2 on this socket
                tokio::spawn(async move {
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await;
                });
            }
        }
    }
}

/// Wraps a service and stamps the connection's peer address into every
/// request's extensions.
struct WithPeerAddr<S> {
    inner: Arc<S>,
    peer: SocketAddr,
}

impl<S> Service<Request<Incoming>> for WithPeerAddr<S>
where
    S: Service<Request<Incoming>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<Incoming>) -> Self::Future {
        req.extensions_mut().insert(PeerAddr(self.peer));
        self.inner.call(req)
    }
}

pub fn no_store() -> HeaderValue {
    HeaderValue::from_static("no-store")
}

/// Creates a response with the status message as body.
///
/// Every response from the gateway carries `Cache-Control: no-store`;
/// tracking responses must never be replayed from an intermediary cache.
pub fn make_error_response(status_code: StatusCode) -> Response<Full<Bytes>> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    make_text_response(status_code, message.to_string())
}

pub fn make_text_response(status_code: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status_code;
    response.headers_mut().insert(CACHE_CONTROL, no_store());
    response
}
