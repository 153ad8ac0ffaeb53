// src/api/flow.rs
//
// Flow authoring surface. Flows are owned by their author; status mutations
// check ownership, and no endpoint leaves a partial write behind.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::{require_user_id, ApiError, AppState};
use crate::flow::{Flow, FlowStatus};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/flow/create", post(create_flow))
        .route("/flow/list", get(list_flows))
        .route("/flow/detail/{flow_id}", get(flow_detail))
        .route("/flow/update/{flow_id}", put(update_flow))
        .route("/flow/status/{flow_id}", post(update_flow_status))
}

async fn create_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<Json<Flow>, ApiError> {
    let user_id = require_user_id(&headers)?;

    // New flows start life as drafts unless the author says otherwise.
    match body.as_object_mut() {
        Some(obj) => {
            obj.entry("status").or_insert(json!("draft"));
        }
        None => return Err(ApiError::bad_request("flow document must be an object")),
    }
    let mut flow: Flow = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("invalid flow document: {e}")))?;
    flow.user_id = user_id;

    let unreachable = flow.unreachable_nodes();
    if !unreachable.is_empty() {
        warn!(flow = %flow.name, nodes = ?unreachable, "flow has unreachable nodes");
    }

    let saved = state.store.create_flow(flow).await?;
    Ok(Json(saved))
}

async fn list_flows(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Flow>>, ApiError> {
    let user_id = require_user_id(&headers)?;
    let flows = state.store.flows_for_user(user_id).await?;
    Ok(Json(flows))
}

/// Flow detail. Once a flow has been live (published or stopped), each node
/// carries its transaction count.
async fn flow_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_user_id(&headers)?;
    let flow = state
        .store
        .get_flow(&flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {flow_id} not found")))?;

    let mut doc = serde_json::to_value(&flow)
        .map_err(|e| ApiError::bad_request(format!("flow serialization failed: {e}")))?;

    if matches!(flow.status, FlowStatus::Published | FlowStatus::Stop) {
        let counts = state.store.transaction_counts(&flow_id).await?;
        if let Some(nodes) = doc.get_mut("flowNodes").and_then(Value::as_array_mut) {
            for node in nodes {
                let count = node
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|id| counts.get(id).copied())
                    .unwrap_or(0);
                node["transactionCount"] = json!(count);
            }
        }
    }
    Ok(Json(doc))
}

async fn update_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Flow>, ApiError> {
    let user_id = require_user_id(&headers)?;
    let existing = state
        .store
        .get_flow(&flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {flow_id} not found")))?;
    if existing.user_id != user_id {
        return Err(ApiError::forbidden("flow does not belong to this user"));
    }

    // Provided arrays replace the stored ones wholesale; omitted fields keep
    // their current value.
    let mut doc = serde_json::to_value(&existing)
        .map_err(|e| ApiError::bad_request(format!("flow serialization failed: {e}")))?;
    if let Some(obj) = body.as_object() {
        for field in ["name", "flowNodes", "flowEdges", "transform"] {
            if let Some(value) = obj.get(field) {
                doc[field] = value.clone();
            }
        }
    }
    let mut flow: Flow = serde_json::from_value(doc)
        .map_err(|e| ApiError::bad_request(format!("invalid flow document: {e}")))?;
    flow.id = flow_id;
    flow.user_id = existing.user_id;
    flow.brand_id = existing.brand_id;
    flow.status = existing.status;
    flow.created_at = existing.created_at;

    let saved = state.store.update_flow(flow).await?;
    Ok(Json(saved))
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

async fn update_flow_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Flow>, ApiError> {
    let user_id = require_user_id(&headers)?;
    let next = match body.status.as_str() {
        "published" => FlowStatus::Published,
        "stop" => FlowStatus::Stop,
        other => {
            return Err(ApiError::bad_request(format!(
                "invalid status '{other}', expected 'published' or 'stop'"
            )))
        }
    };

    let flow = state
        .store
        .get_flow(&flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {flow_id} not found")))?;
    if flow.user_id != user_id {
        return Err(ApiError::forbidden("flow does not belong to this user"));
    }
    if !flow.status.can_transition_to(next) {
        return Err(ApiError::bad_request(format!(
            "cannot transition flow from {:?} to {:?}",
            flow.status, next
        )));
    }

    if next == FlowStatus::Published {
        let unreachable = flow.unreachable_nodes();
        if !unreachable.is_empty() {
            warn!(flow_id = %flow_id, nodes = ?unreachable, "publishing flow with unreachable nodes");
        }
    }

    let updated = state.store.set_flow_status(&flow_id, next).await?;
    info!(flow_id = %flow_id, status = ?next, "flow status changed");
    Ok(Json(updated))
}
