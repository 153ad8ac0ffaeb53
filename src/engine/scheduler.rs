// src/engine/scheduler.rs
//
// Background sweep over persisted delay timers. Expired rows are claimed
// atomically, turned into synthetic `delay_complete` events and fed through
// the same entry point as inbound webhooks, so they serialize with real
// replies for the same user.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::channel::NormalizedMessage;
use crate::engine::state::UserStateService;
use crate::engine::{EngineError, EventMetadata};
use crate::store::{DelayTimer, FlowStore};

pub struct DelayScheduler {
    store: Arc<dyn FlowStore>,
    state_service: Arc<UserStateService>,
    tick_seconds: u64,
}

impl DelayScheduler {
    pub fn new(
        store: Arc<dyn FlowStore>,
        state_service: Arc<UserStateService>,
        tick_seconds: u64,
    ) -> Self {
        Self {
            store,
            state_service,
            tick_seconds: tick_seconds.max(1),
        }
    }

    /// Run the sweep loop until the returned handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                tick_seconds = scheduler.tick_seconds,
                "delay scheduler started"
            );
            let mut ticker = interval(Duration::from_secs(scheduler.tick_seconds));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.tick().await;
            }
        })
    }

    /// One sweep. A failing timer is released for the next tick; it never
    /// blocks the others.
    pub async fn tick(&self) {
        let due = match self.store.claim_due_delays(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "delay sweep failed to claim timers");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        info!(count = due.len(), "expired delay timers claimed");

        for timer in due {
            if let Err(e) = self.fire(&timer).await {
                error!(
                    delay_id = %timer.id,
                    user = %timer.key,
                    error = %e,
                    "delay completion failed, releasing timer for retry"
                );
                if let Err(e) = self.store.release_delay(&timer.id).await {
                    error!(delay_id = %timer.id, error = %e, "failed to release timer");
                }
            }
        }
    }

    async fn fire(&self, timer: &DelayTimer) -> Result<(), EngineError> {
        let user_id = self
            .store
            .get_user(&timer.key)
            .await?
            .map(|u| u.user_id)
            .unwrap_or_default();
        let metadata = EventMetadata {
            sender: timer.key.user_identifier.clone(),
            brand_id: timer.key.brand_id,
            user_id,
            channel: timer.key.channel.clone(),
            channel_account_id: timer.key.channel_account_id.clone(),
            message_type: "delay_complete".to_string(),
        };
        let normalized = NormalizedMessage {
            raw: json!({ "user_state_id": timer.key.user_identifier }),
            ..Default::default()
        };
        // A user who already left the delay makes this a logged no-op
        // inside the state service; the claim stays consumed.
        self.state_service
            .process_event(metadata, normalized)
            .await
            .map(|_| ())
    }
}
