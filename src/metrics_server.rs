//! Prometheus scrape endpoint
//!
//! Serves the orchestrator's metrics registry over HTTP. Gated behind the
//! `metrics-server` feature so library consumers embedding their own
//! exporter pay nothing for it.
//!
//! ## Endpoints
//!
//! - `GET /metrics` — Prometheus metrics in text format
//! - `GET /health` — liveness check with coarse counters
//!
//! ## Scraping with Prometheus
//!
//! ```yaml
//! scrape_configs:
//!   - job_name: 'candidate-orchestrator'
//!     static_configs:
//!       - targets: ['localhost:9090']
//! ```

#[cfg(feature = "metrics-server")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;
#[cfg(feature = "metrics-server")]
use tower_http::trace::TraceLayer;

#[cfg(feature = "metrics-server")]
/// Serve the metrics registry on `addr` until the task is aborted.
///
/// # Errors
///
/// Returns an error when the address cannot be parsed or bound.
pub async fn start_server(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = addr.parse()?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        target: "orchestrator::metrics",
        %addr,
        "metrics endpoint listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "metrics-server")]
async fn metrics_handler() -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        crate::metrics::gather_metrics(),
    )
        .into_response()
}

#[cfg(feature = "metrics-server")]
async fn health_handler() -> Response {
    let families = crate::metrics::gather();
    let samples: usize = families.iter().map(|f| f.get_metric().len()).sum();
    let health = serde_json::json!({
        "status": "healthy",
        "metric_families": families.len(),
        "samples": samples,
    });

    (
        StatusCode::OK,
        [("Content-Type", "application/json")],
        serde_json::to_string_pretty(&health)
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string()),
    )
        .into_response()
}

#[cfg(not(feature = "metrics-server"))]
/// Stub when built without the `metrics-server` feature.
///
/// # Errors
///
/// Always returns an error directing the caller to the feature flag.
pub async fn start_server(_addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    Err("metrics endpoint requires the 'metrics-server' feature".into())
}
