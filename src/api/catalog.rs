// src/api/catalog.rs

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::{ApiError, AppState};
use crate::store::NodeDetail;

const CATEGORIES: [&str; 4] = ["Trigger", "Action", "Condition", "Delay"];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/node-details/list", get(list_node_details))
        .route("/node-details/category/{category}", get(node_details_by_category))
        .route("/node-details/{node_id}", get(node_detail_by_id))
}

async fn list_node_details(
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeDetail>>, ApiError> {
    Ok(Json(state.store.all_node_details().await?))
}

async fn node_detail_by_id(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeDetail>, ApiError> {
    state
        .store
        .node_detail(&node_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("node detail not found for node_id: {node_id}")))
}

async fn node_details_by_category(
    State(state): State<AppState>,
    Path(category): Path<String>,
) -> Result<Json<Vec<NodeDetail>>, ApiError> {
    if !CATEGORIES.contains(&category.as_str()) {
        return Err(ApiError::bad_request(format!(
            "invalid category, must be one of: {}",
            CATEGORIES.join(", ")
        )));
    }
    Ok(Json(state.store.node_details_by_category(&category).await?))
}
