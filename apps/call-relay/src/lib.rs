//! Signaling relay: maps participant ids to live websocket links and routes
//! call envelopes between them without inspecting payloads.

pub mod config;
pub mod registry;
pub mod relay;
pub mod telemetry;
mod websocket;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{registry::ParticipantRegistry, relay::Relay};

pub struct AppState {
    pub registry: ParticipantRegistry,
    pub relay: Relay,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(registry: ParticipantRegistry, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            relay: Relay::new(registry.clone()),
            registry,
            metrics,
        }
    }

    async fn stats(&self) -> StatsResponse {
        let snapshot = self.registry.snapshot().await;
        let mut participants = Vec::with_capacity(snapshot.len());
        let mut active_links = 0usize;
        for entry in snapshot {
            active_links += entry.links;
            participants.push(ParticipantStatsEntry {
                participant_id: entry.participant_id.to_string(),
                links: entry.links,
            });
        }
        StatsResponse {
            active_participants: participants.len(),
            active_links,
            participants,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_participants: usize,
    active_links: usize,
    participants: Vec<ParticipantStatsEntry>,
}

#[derive(Debug, Serialize)]
struct ParticipantStatsEntry {
    participant_id: String,
    links: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats().await)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            String::from("metrics recorder not installed"),
        ),
    }
}
