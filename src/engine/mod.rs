// src/engine/mod.rs

pub mod condition;
pub mod context;
pub mod identifier;
pub mod internal;
pub mod scheduler;
pub mod state;
pub mod trigger;
pub mod validator;

use std::sync::Arc;

use thiserror::Error;

use crate::channel::adapter::ChannelAdapter;
use crate::outbound::OutboundRenderer;
use crate::store::FlowStore;

use self::context::VariableContext;
use self::identifier::NodeIdentifier;
use self::scheduler::DelayScheduler;
use self::state::UserStateService;
use self::trigger::TriggerMatcher;
use self::validator::ReplyValidator;

/// Event envelope handed from the webhook layer (or the delay scheduler) to
/// the user state service.
#[derive(Debug, Clone)]
pub struct EventMetadata {
    pub sender: String,
    pub brand_id: i64,
    pub user_id: i64,
    pub channel: String,
    pub channel_account_id: Option<String>,
    pub message_type: String,
}

impl EventMetadata {
    pub fn user_key(&self) -> crate::store::UserKey {
        crate::store::UserKey {
            user_identifier: self.sender.clone(),
            brand_id: self.brand_id,
            channel: self.channel.clone(),
            channel_account_id: self.channel_account_id.clone(),
        }
    }
}

/// Typed failure surface of the runtime core. Components return these to the
/// user state service, which logs and aborts the event; no state is written
/// on error.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("processing failed: {0}")]
    ProcessingFailed(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("rendering failed: {0}")]
    RenderingFailed(String),
}

/// Wires the runtime components around a store and a renderer. The store and
/// renderer are trait objects so deployments can swap persistence and
/// connector transports without touching the engine.
pub struct Engine {
    pub store: Arc<dyn FlowStore>,
    pub adapter: ChannelAdapter,
    pub state_service: Arc<UserStateService>,
    pub scheduler: Arc<DelayScheduler>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn FlowStore>,
        renderer: Arc<dyn OutboundRenderer>,
        delay_tick_seconds: u64,
    ) -> Self {
        let context = Arc::new(VariableContext::new(store.clone()));
        let validator = Arc::new(ReplyValidator::new(store.clone()));
        let matcher = Arc::new(TriggerMatcher::new(store.clone()));
        let identifier = Arc::new(NodeIdentifier::new(
            store.clone(),
            renderer,
            context.clone(),
        ));
        let state_service = Arc::new(UserStateService::new(
            store.clone(),
            identifier,
            validator,
            matcher,
            context,
        ));
        let scheduler = Arc::new(DelayScheduler::new(
            store.clone(),
            state_service.clone(),
            delay_tick_seconds,
        ));
        Self {
            store,
            adapter: ChannelAdapter::new(),
            state_service,
            scheduler,
        }
    }
}
