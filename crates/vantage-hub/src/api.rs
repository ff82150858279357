use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};
use vantage_core::contracts::{IngestFailure, RulesResponse};
use vantage_core::AttributionParameters;
use vantage_ingest::{IngestError, IngestRouter, RuleMatcher};
use vantage_storage::TrackingStore;

pub struct AppState {
    store: Mutex<TrackingStore>,
    router: IngestRouter,
    matcher: RuleMatcher,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: TrackingStore, matcher: RuleMatcher) -> Self {
        Self {
            store: Mutex::new(store),
            router: IngestRouter::new(),
            matcher,
        }
    }

    fn store(&self) -> MutexGuard<'_, TrackingStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn app(state: SharedState) -> Router {
    Router::new()
        .route("/track", post(track))
        .route("/rules", get(rules))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Accepts JSON bodies whatever their declared content type; beacons arrive as text/plain.
pub async fn track(State(state): State<SharedState>, body: String) -> Response {
    let received_at = Utc::now();
    let worker_state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let store = worker_state.store();
        worker_state.router.ingest_str(&*store, &body, received_at)
    })
    .await;

    match outcome {
        Ok(Ok(ack)) => (StatusCode::OK, Json(ack)).into_response(),
        Ok(Err(err)) => ingest_failure(err, received_at),
        Err(err) => {
            error!(event = "track_worker_failed", error = %err);
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
                Vec::new(),
                received_at,
            )
        }
    }
}

pub async fn rules(
    State(state): State<SharedState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let requested_at = Utc::now();
    let params = AttributionParameters::from_query_pairs(query);
    let worker_state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let store = worker_state.store();
        worker_state
            .matcher
            .match_rules(&*store, &params, requested_at)
    })
    .await;

    match outcome {
        Ok(Ok(rules)) => {
            info!(event = "rules_served", count = rules.len());
            (StatusCode::OK, Json(RulesResponse { rules })).into_response()
        }
        Ok(Err(err)) => {
            error!(event = "rules_failed", error = %err);
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                Vec::new(),
                requested_at,
            )
        }
        Err(err) => {
            error!(event = "rules_worker_failed", error = %err);
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
                Vec::new(),
                requested_at,
            )
        }
    }
}

fn ingest_failure(err: IngestError, at: DateTime<Utc>) -> Response {
    match err {
        IngestError::InvalidPayload(reason) => {
            warn!(event = "payload_invalid", error = %reason);
            failure(StatusCode::BAD_REQUEST, reason, Vec::new(), at)
        }
        IngestError::SchemaMismatch { fields } => {
            error!(event = "schema_mismatch", fields = ?fields);
            failure(
                StatusCode::UNPROCESSABLE_ENTITY,
                "event store schema is missing fields".to_string(),
                fields,
                at,
            )
        }
        IngestError::Store(err) => {
            error!(event = "store_error", error = %err);
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
                Vec::new(),
                at,
            )
        }
    }
}

fn failure(status: StatusCode, error: String, fields: Vec<String>, at: DateTime<Utc>) -> Response {
    let body = IngestFailure {
        success: false,
        error,
        fields,
        timestamp: at,
    };
    (status, Json(body)).into_response()
}
