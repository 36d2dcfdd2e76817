#![cfg(feature = "metrics")]

use anyhow::Result;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::AppState;

/// Route label for requests no route matched, keeping label cardinality bounded.
const UNMATCHED_ROUTE: &str = "unmatched";

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub auth_events_total: IntCounterVec,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "quillhub_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let auth_events_total = IntCounterVec::new(
            Opts::new(
                "quillhub_auth_events_total",
                "Session lifecycle events, labeled by event",
            ),
            &["event"],
        )?;
        registry.register(Box::new(auth_events_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            auth_events_total,
        }))
    }

    pub fn record_http_request(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    pub fn increment_auth_event(&self, event: &str) {
        self.auth_events_total.with_label_values(&[event]).inc();
    }

    pub fn add_auth_events(&self, event: &str, count: u64) {
        self.auth_events_total.with_label_values(&[event]).inc_by(count);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Counts every response by matched route template and status.
pub async fn track_http(
    State(metrics): State<Arc<MetricsContext>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or(UNMATCHED_ROUTE, MatchedPath::as_str)
        .to_owned();
    let response = next.run(request).await;
    metrics.record_http_request(&route, response.status().as_u16());
    response
}

pub async fn handler(State(state): State<AppState>) -> Response {
    let Some(metrics) = state.metrics().filter(|_| state.metrics_enabled()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Router for the dedicated metrics listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handler))
        .with_state(state)
}

/// Serves `/metrics` on its own listener until `shutdown` is cancelled.
pub async fn serve(
    bind_addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("metrics listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http};
    use tower::ServiceExt;

    #[test]
    fn counters_render_in_text_format() {
        let metrics = MetricsContext::init().unwrap();
        metrics.record_http_request("/auth/login", 200);
        metrics.increment_auth_event("login");
        metrics.add_auth_events("cleanup_deleted", 3);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains(
            "quillhub_http_requests_total{route=\"/auth/login\",status=\"200\"} 1"
        ));
        assert!(text.contains("quillhub_auth_events_total{event=\"login\"} 1"));
        assert!(text.contains("quillhub_auth_events_total{event=\"cleanup_deleted\"} 3"));
    }

    #[tokio::test]
    async fn unmatched_requests_share_one_route_label() {
        let metrics = MetricsContext::init().unwrap();
        let app = Router::new()
            .route("/security/devices/{device_id}", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(
                metrics.clone(),
                track_http,
            ));

        for uri in ["/security/devices/d-1", "/security/devices/d-2", "/nope/1", "/nope/2"] {
            app.clone()
                .oneshot(http::Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
        }

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains(
            "quillhub_http_requests_total{route=\"/security/devices/{device_id}\",status=\"200\"} 2"
        ));
        assert!(text.contains(
            "quillhub_http_requests_total{route=\"unmatched\",status=\"404\"} 2"
        ));
        assert!(!text.contains("d-1"));
    }
}
