//! REST API for domain enrichment

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::enrichment::domain::DomainEnricher;
use crate::models::domain_utils::{is_plausible_domain, normalize_domain};
use crate::error::EnrichError;
use crate::models::{DocKind, DomainDoc, DomainEnrichment};

/// Application state shared across handlers
pub struct AppState {
    pub enricher: Arc<DomainEnricher>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
pub struct BulkEnrichRequest {
    pub domains: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkEnrichResult {
    pub domain: String,
    pub enrichment: Option<DomainEnrichment>,
}

#[derive(Debug, Serialize)]
pub struct BulkEnrichResponse {
    pub total: usize,
    pub enriched: usize,
    pub failed: usize,
    pub rejected: Vec<String>,
    pub results: Vec<BulkEnrichResult>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Domains
        .route("/api/v1/domains/bulk", post(bulk_enrich))
        .route("/api/v1/domains/:name", get(get_domain))
        .route("/api/v1/domains/:name/doc", get(get_domain_doc))

        // Point budget
        .route("/api/v1/budget", get(get_budget))
        .route("/api/v1/budget/refresh", post(refresh_budget))

        .route("/metrics", get(render_metrics))
        .with_state(state)
}

// ==================== Handlers ====================

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "domainforge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn checked_domain(raw: &str) -> Result<String, ApiError> {
    let name = normalize_domain(raw);
    if !is_plausible_domain(&name) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("not a domain name: {}", raw),
        ));
    }
    Ok(name)
}

async fn get_domain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<DomainEnrichment>, ApiError> {
    let name = checked_domain(&name)?;

    state
        .enricher
        .enrich_domain(&name)
        .await
        .map(Json)
        .ok_or_else(|| {
            tracing::warn!(domain = %name, "Enrichment unavailable");
            api_error(
                StatusCode::BAD_GATEWAY,
                format!("enrichment unavailable for {}", name),
            )
        })
}

async fn get_domain_doc(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<DomainDoc>, ApiError> {
    let name = checked_domain(&name)?;

    state
        .enricher
        .cached_doc(&name)
        .await
        .map_err(|e| {
            tracing::error!(domain = %name, error = %e, "Failed to read domain doc");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?
        .map(Json)
        .ok_or_else(|| {
            let missing = EnrichError::NotFound {
                kind: DocKind::Domain,
                id: name.clone(),
            };
            api_error(StatusCode::NOT_FOUND, missing.to_string())
        })
}

async fn bulk_enrich(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkEnrichRequest>,
) -> Json<BulkEnrichResponse> {
    let total = req.domains.len();
    let mut accepted = vec![];
    let mut rejected = vec![];

    for raw in req.domains {
        match checked_domain(&raw) {
            Ok(name) => accepted.push(name),
            Err(_) => rejected.push(raw),
        }
    }

    let results: Vec<BulkEnrichResult> = state
        .enricher
        .enrich_batch(&accepted)
        .await
        .into_iter()
        .map(|(domain, enrichment)| BulkEnrichResult { domain, enrichment })
        .collect();

    let enriched = results.iter().filter(|r| r.enrichment.is_some()).count();

    Json(BulkEnrichResponse {
        total,
        enriched,
        failed: results.len() - enriched,
        rejected,
        results,
    })
}

async fn get_budget(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let governor = state.enricher.governor();

    let bucket = governor.stored_stats().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read af-details");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(json!({
        "bucket": bucket,
        "slow_mode": governor.context().is_slow_mode(),
    })))
}

async fn refresh_budget(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let governor = state.enricher.governor();

    let bucket = governor.update_stats().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to update af-details");
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    Ok(Json(json!({
        "bucket": bucket,
        "slow_mode": governor.context().is_slow_mode(),
    })))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}
