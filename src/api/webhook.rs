// src/api/webhook.rs
//
// Inbound entry point for channel connectors. The raw webhook and its
// normalized form are stored before any processing; the record's status
// tracks what happened to the event.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::api::AppState;
use crate::engine::state::EventOutcome;
use crate::engine::EventMetadata;
use crate::store::{WebhookRecord, WebhookStatus};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/webhook/message", post(receive_message))
        .route("/health", get(health))
}

#[derive(Debug, Deserialize)]
pub struct WebhookMessageRequest {
    pub sender: String,
    pub brand_id: i64,
    pub user_id: i64,
    pub channel: String,
    #[serde(default)]
    pub channel_identifier: Option<String>,
    #[serde(default)]
    pub channel_account_id: Option<String>,
    pub message_type: String,
    pub message_body: Value,
}

#[derive(Debug, Serialize)]
pub struct WebhookMessageResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

async fn receive_message(
    State(state): State<AppState>,
    Json(request): Json<WebhookMessageRequest>,
) -> Json<WebhookMessageResponse> {
    info!(
        sender = %request.sender,
        brand_id = request.brand_id,
        channel = %request.channel,
        message_type = %request.message_type,
        "webhook received"
    );

    let channel_account_id = request
        .channel_account_id
        .clone()
        .or_else(|| request.channel_identifier.clone());
    let normalized =
        state
            .adapter
            .normalize(&request.channel, &request.message_type, &request.message_body);

    let record = WebhookRecord {
        id: String::new(),
        sender: request.sender.clone(),
        brand_id: request.brand_id,
        user_id: request.user_id,
        channel: request.channel.clone(),
        channel_account_id: channel_account_id.clone(),
        message_type: request.message_type.clone(),
        message_body: request.message_body.clone(),
        normalized: Some(normalized.clone()),
        status: WebhookStatus::Pending,
        received_at: Utc::now(),
    };
    let webhook_id = match state.store.save_webhook(record).await {
        Ok(id) => Some(id),
        Err(e) => {
            error!(error = %e, "failed to persist webhook record");
            None
        }
    };

    let metadata = EventMetadata {
        sender: request.sender,
        brand_id: request.brand_id,
        user_id: request.user_id,
        channel: request.channel,
        channel_account_id,
        message_type: request.message_type,
    };

    let (status, record_status, detail) =
        match state.state_service.process_event(metadata, normalized).await {
            Ok(EventOutcome::Triggered { flow_id }) => (
                "accepted",
                WebhookStatus::Processed,
                Some(format!("flow {flow_id} started")),
            ),
            Ok(EventOutcome::Advanced) | Ok(EventOutcome::ValidationExited) => {
                ("accepted", WebhookStatus::Processed, None)
            }
            Ok(EventOutcome::NoTrigger) => (
                "dropped",
                WebhookStatus::Dropped,
                Some("no trigger matched".to_string()),
            ),
            Ok(EventOutcome::Ignored) => ("dropped", WebhookStatus::Dropped, None),
            Err(e) => {
                error!(error = %e, "event processing failed");
                ("error", WebhookStatus::Error, Some(e.to_string()))
            }
        };

    if let Some(id) = webhook_id {
        if let Err(e) = state.store.update_webhook_status(&id, record_status).await {
            error!(webhook_id = %id, error = %e, "failed to update webhook status");
        }
    }

    Json(WebhookMessageResponse { status, detail })
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "pulseflow" }))
}
