use axum::{
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::codec::ProbeLayout;
use crate::events::EventCounters;

pub struct AppState {
    pub registry: Registry,
    pub counters: Arc<EventCounters>,
    pub layout: ProbeLayout,
    pub attached: Vec<String>,
    pub start_time: Instant,
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    layout: String,
    attached: Vec<String>,
    new_flows: u64,
    lost_samples: u64,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let mut app = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/api/health", get(get_health));

    // Apply IP allowlist middleware if configured.
    let nets = allowlist(allowed_ips);
    if !nets.is_empty() {
        let nets = Arc::new(nets);
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Parse the configured CIDRs. A bare address is taken as a host route.
fn allowlist(allowed_ips: &[String]) -> Vec<IpNet> {
    allowed_ips
        .iter()
        .filter_map(|s| {
            let parsed = s
                .parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from));
            if parsed.is_err() {
                tracing::warn!(entry = %s, "ignoring invalid allowlist entry");
            }
            parsed.ok()
        })
        .collect()
}

fn is_allowed(allowed: &[IpNet], ip: IpAddr) -> bool {
    allowed.iter().any(|net| net.contains(&ip))
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        if is_allowed(&allowed, connect_info.0.ip()) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    // If there is no ConnectInfo, allow (should not happen with into_make_service_with_connect_info).
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_seconds: state.start_time.elapsed().as_secs(),
        layout: state.layout.to_string(),
        attached: state.attached.clone(),
        new_flows: state.counters.new.load(Ordering::Relaxed),
        lost_samples: state.counters.lost.load(Ordering::Relaxed),
    })
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &state.registry) {
        tracing::error!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response()
}
