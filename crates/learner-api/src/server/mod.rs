use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{ApiError, ErrorCode, ModelSummary, QueryResponse, RankRequest, SCHEMA_VERSION_V1};
use learner_core::{rank, RuntimeGraph};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::{PersistenceError, SqliteModelStore};

include!("error.rs");
include!("state.rs");
include!("routes/models.rs");

pub async fn serve(addr: SocketAddr, sqlite_path: PathBuf) -> Result<(), ServerError> {
    let store = SqliteModelStore::open(&sqlite_path)?;
    let state = AppState::new(store);
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/{model_id}", get(get_model_summary))
        .route("/api/v1/models/{model_id}/nodes", get(list_nodes))
        .route(
            "/api/v1/models/{model_id}/nodes/{node_key}",
            get(get_node_detail),
        )
        .route("/api/v1/models/{model_id}/rank", post(rank_candidates))
        .with_state(state)
}
