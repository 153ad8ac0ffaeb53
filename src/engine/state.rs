// src/engine/state.rs
//
// Top-level per-event dispatcher. Owns the user state machine: start a new
// flow, resume an existing one, validate a pending reply or process a timer
// expiry. All state writes for a user happen here, serialized by a keyed
// mutex so concurrent events for the same user cannot interleave.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::channel::NormalizedMessage;
use crate::engine::context::VariableContext;
use crate::engine::identifier::{IdentifyRequest, NodeIdentifier, NodeOutcome};
use crate::engine::internal::InternalOutcome;
use crate::engine::trigger::TriggerMatcher;
use crate::engine::validator::{ReplyValidator, ReplyVerdict};
use crate::engine::{EngineError, EventMetadata};
use crate::flow::FlowNode;
use crate::store::{DelayTimer, FlowStore, UserKey, UserState};

/// How an event was absorbed, reported back to the webhook layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A trigger matched and the flow started.
    Triggered { flow_id: String },
    /// No trigger matched; the event was dropped without state changes.
    NoTrigger,
    /// The user advanced inside their active flow.
    Advanced,
    /// Retry budget exhausted; the user left automation.
    ValidationExited,
    /// The event was consumed without advancing (stale delay completion,
    /// reply during a pending delay).
    Ignored,
}

pub struct UserStateService {
    store: Arc<dyn FlowStore>,
    identifier: Arc<NodeIdentifier>,
    validator: Arc<ReplyValidator>,
    matcher: Arc<TriggerMatcher>,
    context: Arc<VariableContext>,
    /// Per-user guards. Entries are tiny and keyed by active users only.
    locks: DashMap<UserKey, Arc<Mutex<()>>>,
}

impl UserStateService {
    pub fn new(
        store: Arc<dyn FlowStore>,
        identifier: Arc<NodeIdentifier>,
        validator: Arc<ReplyValidator>,
        matcher: Arc<TriggerMatcher>,
        context: Arc<VariableContext>,
    ) -> Self {
        Self {
            store,
            identifier,
            validator,
            matcher,
            context,
            locks: DashMap::new(),
        }
    }

    /// Single entry point for inbound webhooks and synthetic scheduler
    /// events. Events for one user key run strictly one at a time; distinct
    /// users proceed in parallel.
    pub async fn process_event(
        &self,
        metadata: EventMetadata,
        normalized: NormalizedMessage,
    ) -> Result<EventOutcome, EngineError> {
        let mut metadata = metadata;
        if metadata.message_type == "delay_complete" {
            // Scheduler events address the user through the timer record.
            if let Some(id) = normalized.user_state_id() {
                metadata.sender = id.to_string();
            }
        }
        let key = metadata.user_key();

        let lock = {
            let entry = self.locks.entry(key.clone()).or_default();
            entry.value().clone()
        };
        let _guard = lock.lock().await;

        let user = self.store.get_user(&key).await?;
        let user = match user {
            Some(user) => user,
            None => {
                self.store
                    .save_user(UserState::new(key.clone(), metadata.user_id))
                    .await?;
                info!(user = %key, "created user state");
                return self.try_trigger(&metadata, &normalized).await;
            }
        };

        if metadata.message_type == "delay_complete" {
            if user.delay_node_data.is_none() {
                warn!(
                    user = %key,
                    "delay completion for user without pending delay, dropping"
                );
                return Ok(EventOutcome::Ignored);
            }
            if !user.is_in_automation || user.current_flow_id.is_none() {
                warn!(user = %key, "delay completion for user outside automation, dropping");
                return Ok(EventOutcome::Ignored);
            }
            return self.resume_from_delay(&metadata, &user).await;
        }

        if user.delay_node_data.is_some() {
            // Delay interrupts are stored but not implemented; the reply is
            // consumed and the timer fires later as usual.
            info!(user = %key, "reply during pending delay consumed");
            return Ok(EventOutcome::Ignored);
        }

        match (
            user.is_in_automation,
            user.current_flow_id.as_deref(),
            user.current_node_id.as_deref(),
        ) {
            (true, Some(flow_id), Some(node_id)) => {
                let flow_id = flow_id.to_string();
                let node_id = node_id.to_string();
                self.advance_in_automation(&metadata, &normalized, &user, &flow_id, &node_id)
                    .await
            }
            _ => self.try_trigger(&metadata, &normalized).await,
        }
    }

    /// Users outside automation only react to triggers. A miss drops the
    /// event with no state change.
    async fn try_trigger(
        &self,
        metadata: &EventMetadata,
        normalized: &NormalizedMessage,
    ) -> Result<EventOutcome, EngineError> {
        let matched = self
            .matcher
            .match_trigger(
                metadata.brand_id,
                &metadata.channel,
                &metadata.message_type,
                normalized,
            )
            .await?;
        let Some(matched) = matched else {
            info!(user = %metadata.user_key(), "no trigger matched, event dropped");
            return Ok(EventOutcome::NoTrigger);
        };

        info!(
            user = %metadata.user_key(),
            flow_id = %matched.flow_id,
            trigger_node_id = %matched.trigger_node_id,
            "trigger matched, starting flow"
        );
        let outcome = self
            .identifier
            .identify_and_process_node(
                metadata,
                IdentifyRequest {
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: None,
                    current_node_id: matched.trigger_node_id.clone(),
                    flow_id: matched.flow_id.clone(),
                },
            )
            .await?;
        self.reconcile(metadata, &matched.flow_id, outcome, None)
            .await?;
        Ok(EventOutcome::Triggered {
            flow_id: matched.flow_id,
        })
    }

    async fn advance_in_automation(
        &self,
        metadata: &EventMetadata,
        normalized: &NormalizedMessage,
        user: &UserState,
        flow_id: &str,
        current_node_id: &str,
    ) -> Result<EventOutcome, EngineError> {
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("flow {flow_id}")))?;
        let current = flow
            .node(current_node_id)
            .ok_or_else(|| EngineError::NotFound(format!("current node {current_node_id}")))?;

        let expects_reply = match self.store.node_detail(current.type_name()).await? {
            Some(detail) => detail.user_input_required,
            None => {
                warn!(
                    node_type = current.type_name(),
                    "node type missing from catalog, using structural fallback"
                );
                matches!(
                    current,
                    FlowNode::Question(_)
                        | FlowNode::ButtonQuestion(_)
                        | FlowNode::ListQuestion(_)
                        | FlowNode::TriggerTemplate(_)
                )
            }
        };

        if !expects_reply {
            let outcome = self
                .identifier
                .identify_and_process_node(
                    metadata,
                    IdentifyRequest {
                        is_validation_error: false,
                        fallback_message: None,
                        node_id_to_process: None,
                        current_node_id: current_node_id.to_string(),
                        flow_id: flow_id.to_string(),
                    },
                )
                .await?;
            self.reconcile(metadata, flow_id, outcome, None).await?;
            return Ok(EventOutcome::Advanced);
        }

        let is_text = matches!(current, FlowNode::Question(_));
        let verdict = self
            .validator
            .validate_and_match(
                normalized,
                current_node_id,
                flow_id,
                is_text,
                user.validation.failure_count,
            )
            .await?;

        let reply = normalized.get_text_content();
        match verdict {
            ReplyVerdict::ValidationExit { fallback } => {
                // One fallback-only delivery, then the user leaves
                // automation and the failure counters reset.
                self.identifier
                    .identify_and_process_node(
                        metadata,
                        IdentifyRequest {
                            is_validation_error: true,
                            fallback_message: Some(fallback),
                            node_id_to_process: None,
                            current_node_id: current_node_id.to_string(),
                            flow_id: flow_id.to_string(),
                        },
                    )
                    .await?;
                self.store
                    .update_automation_state(&metadata.user_key(), false, None, None)
                    .await?;
                info!(user = %metadata.user_key(), "validation limit reached, automation exited");
                Ok(EventOutcome::ValidationExited)
            }
            ReplyVerdict::Matched { answer_id } => {
                self.persist_reply(metadata, flow_id, current, &reply).await?;
                let outcome = self
                    .identifier
                    .identify_and_process_node(
                        metadata,
                        IdentifyRequest {
                            is_validation_error: false,
                            fallback_message: None,
                            node_id_to_process: None,
                            current_node_id: answer_id,
                            flow_id: flow_id.to_string(),
                        },
                    )
                    .await?;
                self.reconcile(metadata, flow_id, outcome, None).await?;
                Ok(EventOutcome::Advanced)
            }
            ReplyVerdict::MatchedOtherNode { node_id } => {
                let outcome = self
                    .identifier
                    .identify_and_process_node(
                        metadata,
                        IdentifyRequest {
                            is_validation_error: false,
                            fallback_message: None,
                            node_id_to_process: Some(node_id),
                            current_node_id: current_node_id.to_string(),
                            flow_id: flow_id.to_string(),
                        },
                    )
                    .await?;
                self.reconcile(metadata, flow_id, outcome, None).await?;
                Ok(EventOutcome::Advanced)
            }
            ReplyVerdict::UseDefaultEdge => {
                self.persist_reply(metadata, flow_id, current, &reply).await?;
                let outcome = self
                    .identifier
                    .identify_and_process_node(
                        metadata,
                        IdentifyRequest {
                            is_validation_error: false,
                            fallback_message: None,
                            node_id_to_process: None,
                            current_node_id: current_node_id.to_string(),
                            flow_id: flow_id.to_string(),
                        },
                    )
                    .await?;
                self.reconcile(metadata, flow_id, outcome, None).await?;
                Ok(EventOutcome::Advanced)
            }
            ReplyVerdict::MismatchRetry { fallback } => {
                let outcome = self
                    .identifier
                    .identify_and_process_node(
                        metadata,
                        IdentifyRequest {
                            is_validation_error: true,
                            fallback_message: Some(fallback.clone()),
                            node_id_to_process: Some(current_node_id.to_string()),
                            current_node_id: current_node_id.to_string(),
                            flow_id: flow_id.to_string(),
                        },
                    )
                    .await?;
                self.reconcile(metadata, flow_id, outcome, Some(&fallback))
                    .await?;
                Ok(EventOutcome::Advanced)
            }
        }
    }

    /// Resume a user whose timer expired: the delay's `__not_interrupted`
    /// branch names the node to process.
    async fn resume_from_delay(
        &self,
        metadata: &EventMetadata,
        user: &UserState,
    ) -> Result<EventOutcome, EngineError> {
        let delay_node = user
            .delay_node_data
            .as_ref()
            .ok_or_else(|| EngineError::NotFound("delay node data".into()))?;
        let flow_id = user
            .current_flow_id
            .clone()
            .ok_or_else(|| EngineError::NotFound("current flow".into()))?;
        let target = delay_node
            .result_entries()
            .iter()
            .find(|entry| entry.id.ends_with("__not_interrupted"))
            .and_then(|entry| entry.node_result_id.clone())
            .ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "delay node {} has no __not_interrupted result",
                    delay_node.id()
                ))
            })?;

        info!(
            user = %metadata.user_key(),
            delay_node_id = delay_node.id(),
            target = %target,
            "delay complete, resuming flow"
        );
        let outcome = self
            .identifier
            .identify_and_process_node(
                metadata,
                IdentifyRequest {
                    is_validation_error: false,
                    fallback_message: None,
                    node_id_to_process: Some(target),
                    current_node_id: delay_node.id().to_string(),
                    flow_id: flow_id.clone(),
                },
            )
            .await?;

        // Clear before reconciling: the resumed walk may enter a fresh
        // delay, which writes its own node data and timer.
        self.store
            .set_delay_node(&metadata.user_key(), None)
            .await?;
        self.reconcile(metadata, &flow_id, outcome, None).await?;
        Ok(EventOutcome::Advanced)
    }

    /// Post-response reconciliation: fold identifier outcomes back into the
    /// persisted user state until the event comes to rest at a node
    /// awaiting input, inside a delay, or outside automation.
    async fn reconcile(
        &self,
        metadata: &EventMetadata,
        flow_id: &str,
        outcome: NodeOutcome,
        retry_fallback: Option<&str>,
    ) -> Result<(), EngineError> {
        let key = metadata.user_key();
        match retry_fallback {
            Some(message) => {
                self.store
                    .update_validation_state(&key, true, Some(message.to_string()))
                    .await?
            }
            None => self.store.update_validation_state(&key, false, None).await?,
        }

        // Bounded: flows may cycle, and a condition loop with no delay in
        // it must not spin inside one event.
        let mut outcome = outcome;
        for _ in 0..128 {
            match outcome {
                NodeOutcome::FallbackOnly => return Ok(()),
                NodeOutcome::Internal {
                    node_id,
                    outcome: InternalOutcome::ConditionBranch { branch_node_id, matched },
                } => {
                    info!(
                        condition_node_id = %node_id,
                        matched,
                        branch = %branch_node_id,
                        "condition branch taken"
                    );
                    outcome = self
                        .identifier
                        .identify_and_process_node(
                            metadata,
                            IdentifyRequest {
                                is_validation_error: false,
                                fallback_message: None,
                                node_id_to_process: Some(branch_node_id),
                                current_node_id: node_id,
                                flow_id: flow_id.to_string(),
                            },
                        )
                        .await?;
                }
                NodeOutcome::Internal {
                    node_id,
                    outcome: InternalOutcome::Delay(plan),
                } => {
                    let flow = self
                        .store
                        .get_flow(flow_id)
                        .await?
                        .ok_or_else(|| EngineError::NotFound(format!("flow {flow_id}")))?;
                    let node = flow
                        .node(&node_id)
                        .ok_or_else(|| EngineError::NotFound(format!("delay node {node_id}")))?
                        .clone();

                    // Timer first, then the user flag: a scheduler pickup
                    // that finds no delay_node_data treats the timer as
                    // interrupted and no-ops.
                    let now = Utc::now();
                    let timer = self
                        .store
                        .save_delay(DelayTimer {
                            id: String::new(),
                            key: key.clone(),
                            flow_id: flow_id.to_string(),
                            delay_node_id: node_id.clone(),
                            wait_time_seconds: plan.wait_time_seconds,
                            started_at: now,
                            completes_at: now + Duration::seconds(plan.wait_time_seconds),
                            processed: false,
                        })
                        .await?;
                    let current = self
                        .store
                        .get_user(&key)
                        .await?
                        .and_then(|u| u.current_node_id);
                    self.store
                        .update_automation_state(&key, true, Some(flow_id.to_string()), current)
                        .await?;
                    self.store.set_delay_node(&key, Some(node)).await?;
                    info!(
                        user = %key,
                        delay_node_id = %node_id,
                        completes_at = %timer.completes_at,
                        wait_seconds = plan.wait_time_seconds,
                        "delay timer armed"
                    );
                    return Ok(());
                }
                NodeOutcome::Actionable { node_id } => {
                    let flow = self
                        .store
                        .get_flow(flow_id)
                        .await?
                        .ok_or_else(|| EngineError::NotFound(format!("flow {flow_id}")))?;
                    let node = flow
                        .node(&node_id)
                        .ok_or_else(|| EngineError::NotFound(format!("node {node_id}")))?;
                    let input_required = match self.store.node_detail(node.type_name()).await? {
                        Some(detail) => detail.user_input_required,
                        None => matches!(
                            node,
                            FlowNode::Question(_)
                                | FlowNode::ButtonQuestion(_)
                                | FlowNode::ListQuestion(_)
                                | FlowNode::TriggerTemplate(_)
                        ),
                    };

                    if input_required {
                        self.store
                            .update_automation_state(
                                &key,
                                true,
                                Some(flow_id.to_string()),
                                Some(node_id),
                            )
                            .await?;
                        return Ok(());
                    }

                    match flow.successor_of(&node_id) {
                        None => {
                            // Terminal node: the flow ends in this event.
                            self.store
                                .update_automation_state(&key, false, None, None)
                                .await?;
                            info!(user = %key, node_id = %node_id, "terminal node reached, automation exited");
                            return Ok(());
                        }
                        Some(_) => {
                            outcome = self
                                .identifier
                                .identify_and_process_node(
                                    metadata,
                                    IdentifyRequest {
                                        is_validation_error: false,
                                        fallback_message: None,
                                        node_id_to_process: None,
                                        current_node_id: node_id,
                                        flow_id: flow_id.to_string(),
                                    },
                                )
                                .await?;
                        }
                    }
                }
            }
        }
        Err(EngineError::ProcessingFailed(format!(
            "event did not come to rest within 128 steps in flow {flow_id}"
        )))
    }

    /// Store the accepted reply under the node's `@variable`, when it has
    /// one.
    async fn persist_reply(
        &self,
        metadata: &EventMetadata,
        flow_id: &str,
        node: &FlowNode,
        reply: &str,
    ) -> Result<(), EngineError> {
        if let Some(variable) = node.user_input_variable() {
            self.context
                .set(&metadata.user_key(), flow_id, variable, reply)
                .await?;
        }
        Ok(())
    }
}
