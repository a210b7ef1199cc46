use crate::dedup::ClaimOutcome;
use crate::errors::GatewayError;
use crate::event;
use crate::metrics_defs::{NO_DESTINATION, REDIRECTS};
use crate::pipeline::SubmitOutcome;
use crate::router::Destination;
use crate::{Endpoint, Gateway};
use http::HeaderValue;
use http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use identity::TenantContext;
use shared::http::{PeerAddr, make_error_response, make_text_response, no_store};

/// Fixed 1×1 transparent GIF served for pixel hits.
const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x04, 0x01, 0x00, 0x3B,
];

/// Shared ingestion path for `/in`, `/in/{campaign}`, `/pixel.gif` and
/// `/postback`. The step order is load-bearing: capture, route, claim,
/// submit, respond. Nothing after capture may block on storage.
pub(crate) async fn ingest(
    gateway: &Gateway,
    endpoint: Endpoint,
    campaign_param: Option<String>,
    tenant: TenantContext,
    parts: http::request::Parts,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let query = event::parse_query(parts.uri.query());
    let click_id = match event::extract_click_id(&query) {
        Some(click_id) => click_id,
        None if endpoint == Endpoint::Postback => {
            tracing::debug!(tenant_id = %tenant.tenant_id, "postback without click id");
            return GatewayError::MissingParameter("click_id").response();
        }
        None => event::mint_click_id(),
    };

    let peer = parts.extensions.get::<PeerAddr>().map(|p| p.0);
    let mut event = match event::capture(event::CaptureContext {
        tenant_id: &tenant.tenant_id,
        click_id,
        method: &parts.method,
        uri: &parts.uri,
        headers: &parts.headers,
        body: &body,
        peer,
        body_cap: gateway.body_cap,
    }) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(tenant_id = %tenant.tenant_id, error = %e, "event capture failed");
            return e.response();
        }
    };

    let destination =
        gateway
            .router
            .resolve(&tenant.tenant_id, campaign_param.as_deref(), &event);
    if let Ok(dest) = &destination {
        event.campaign_id = dest.campaign_id.clone();
    }

    // A duplicate tags the event; it never changes the response.
    if gateway.dedup.claim(&tenant.tenant_id, &event.click_id).await == ClaimOutcome::Duplicate {
        event.flag_duplicate();
    }

    let tenant_id = tenant.tenant_id;
    if gateway.pipeline.submit(event).await == SubmitOutcome::Rejected {
        return GatewayError::TotalSaturation.response();
    }

    match endpoint {
        Endpoint::Traffic => match destination {
            Ok(dest) => redirect(&tenant_id, dest),
            Err(e) => {
                metrics::counter!(NO_DESTINATION.name, "tenant_id" => tenant_id.clone())
                    .increment(1);
                tracing::info!(tenant_id = %tenant_id, "no destination resolvable");
                e.response()
            }
        },
        Endpoint::Pixel => pixel_response(),
        Endpoint::Postback => make_text_response(StatusCode::OK, String::new()),
        // Routed before ingest; reaching this arm is a bug.
        Endpoint::Health | Endpoint::Ready => {
            make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn redirect(tenant_id: &str, destination: Destination) -> Response<Full<Bytes>> {
    let built = Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, &destination.url)
        .header(CACHE_CONTROL, no_store())
        .body(Full::new(Bytes::new()));

    match built {
        Ok(response) => {
            metrics::counter!(REDIRECTS.name, "tenant_id" => tenant_id.to_string()).increment(1);
            response
        }
        Err(e) => {
            tracing::error!(
                tenant_id,
                url = %destination.url,
                error = %e,
                "destination is not a valid Location header"
            );
            GatewayError::NoDestination.response()
        }
    }
}

fn pixel_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(&PIXEL_GIF)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    response.headers_mut().insert(CACHE_CONTROL, no_store());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_is_the_fixed_43_byte_gif() {
        let response = pixel_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "image/gif"
        );
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "no-store");
        assert_eq!(PIXEL_GIF.len(), 43);
        assert_eq!(&PIXEL_GIF[..6], b"GIF89a");
    }
}
