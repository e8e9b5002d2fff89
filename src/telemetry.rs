use actix_web::{HttpResponse, Responder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::EnvFilter;

pub const MESSAGES_CREATED: &str = "nevermind_messages_created_total";
pub const PUBLIC_POSTS_CREATED: &str = "nevermind_public_posts_created_total";
pub const NOTIFICATIONS_INGESTED: &str = "nevermind_notifications_ingested_total";
pub const NOTIFICATIONS_DELIVERED: &str = "nevermind_notifications_delivered_total";
pub const LOGIN_FAILURES: &str = "nevermind_login_failures_total";

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Structured logging; `RUST_LOG` refines the default `info` level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();
}

/// Install the global Prometheus recorder. Safe to call more than once.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS
        .get_or_try_init(|| PrometheusBuilder::new().install_recorder())
        .map_err(|e| tracing::warn!("metrics recorder not installed: {e}"))
        .ok()
}

pub async fn metrics_endpoint() -> impl Responder {
    match PROMETHEUS.get() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}
