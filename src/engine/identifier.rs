// src/engine/identifier.rs
//
// Given the caller's position in a flow, find the next reachable node,
// process it and emit its outbound intents. Message nodes chain within one
// event; condition and delay nodes are computed and handed back to the user
// state service to act on.

use std::sync::Arc;

use tracing::{error, info};

use crate::engine::context::VariableContext;
use crate::engine::internal::{InternalNodeProcessor, InternalOutcome};
use crate::engine::{EngineError, EventMetadata};
use crate::flow::{Flow, FlowNode};
use crate::outbound::{intents_for_node, OutboundRenderer, RenderIntent};
use crate::store::{FlowStore, TransactionRecord};

#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub is_validation_error: bool,
    pub fallback_message: Option<String>,
    /// Process exactly this node instead of resolving from
    /// `current_node_id`.
    pub node_id_to_process: Option<String>,
    /// The caller's position: a node id, or an expected-answer/result entry
    /// id whose `nodeResultId` names the node to process.
    pub current_node_id: String,
    pub flow_id: String,
}

/// What the identifier ended on. `Actionable` nodes were rendered;
/// `Internal` nodes carry the processor's computation for the state service.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Actionable { node_id: String },
    Internal { node_id: String, outcome: InternalOutcome },
    /// Validation-exit delivery: only the fallback message went out.
    FallbackOnly,
}

/// Upper bound on nodes processed in one identifier call. Flows may contain
/// cycles; a pure message cycle would otherwise render forever within a
/// single event.
const MAX_CHAIN_STEPS: usize = 128;

pub struct NodeIdentifier {
    store: Arc<dyn FlowStore>,
    renderer: Arc<dyn OutboundRenderer>,
    context: Arc<VariableContext>,
    processor: InternalNodeProcessor,
}

impl NodeIdentifier {
    pub fn new(
        store: Arc<dyn FlowStore>,
        renderer: Arc<dyn OutboundRenderer>,
        context: Arc<VariableContext>,
    ) -> Self {
        Self {
            store,
            renderer,
            context,
            processor: InternalNodeProcessor::new(),
        }
    }

    pub async fn identify_and_process_node(
        &self,
        metadata: &EventMetadata,
        request: IdentifyRequest,
    ) -> Result<NodeOutcome, EngineError> {
        let flow = self
            .store
            .get_flow(&request.flow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("flow {}", request.flow_id)))?;

        // Validation exit carries no node to process, just the fallback.
        if request.is_validation_error && request.node_id_to_process.is_none() {
            if let Some(message) = &request.fallback_message {
                self.deliver(
                    metadata,
                    &RenderIntent::Text {
                        body: message.clone(),
                    },
                )
                .await;
            }
            return Ok(NodeOutcome::FallbackOnly);
        }

        let mut target = self.resolve_target(metadata, &flow, &request).await?;
        let mut fallback = if request.is_validation_error {
            request.fallback_message.clone()
        } else {
            None
        };

        let mut steps = 0;
        loop {
            steps += 1;
            if steps > MAX_CHAIN_STEPS {
                return Err(EngineError::ProcessingFailed(format!(
                    "message chain exceeded {MAX_CHAIN_STEPS} nodes in flow {}",
                    flow.id
                )));
            }
            let node = flow
                .node(&target)
                .ok_or_else(|| EngineError::NotFound(format!("next node {target}")))?;

            if node.is_internal() {
                let vars = self
                    .context
                    .snapshot(&metadata.user_key(), &flow.id)
                    .await?;
                let outcome = self.processor.process(node, &vars)?;
                self.record(&flow, node, metadata).await?;
                return Ok(NodeOutcome::Internal {
                    node_id: target,
                    outcome,
                });
            }

            self.record(&flow, node, metadata).await?;
            for intent in intents_for_node(node, fallback.as_deref()) {
                self.deliver(metadata, &intent).await;
            }
            fallback = None;

            // Message nodes have no expected reply; keep walking so one
            // event produces the whole chain of outbound intents.
            if matches!(node, FlowNode::Message(_)) {
                if let Some(next) = flow.successor_of(&target) {
                    target = next.to_string();
                    continue;
                }
            }
            return Ok(NodeOutcome::Actionable { node_id: target });
        }
    }

    /// Resolution step: pick the node to process from the request.
    async fn resolve_target(
        &self,
        metadata: &EventMetadata,
        flow: &Flow,
        request: &IdentifyRequest,
    ) -> Result<String, EngineError> {
        if let Some(node_id) = &request.node_id_to_process {
            flow.node(node_id)
                .ok_or_else(|| EngineError::NotFound(format!("node to process {node_id}")))?;
            return Ok(node_id.clone());
        }

        let current = request.current_node_id.as_str();
        match flow.node(current) {
            Some(node) if node.is_trigger() => {
                // Entering the flow counts as entering the trigger.
                self.record(flow, node, metadata).await?;
                flow.successor_of(current)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("no edge out of trigger {current}"))
                    })
            }
            Some(_) => flow
                .successor_of(current)
                .map(str::to_string)
                .ok_or_else(|| EngineError::NotFound(format!("no edge out of node {current}"))),
            None => {
                // Not a node: an expected-answer or result entry id. Follow
                // an edge keyed on it if one exists, else its nodeResultId.
                if let Some(next) = flow.successor_of(current) {
                    return Ok(next.to_string());
                }
                flow.branch_target(current)
                    .map(str::to_string)
                    .ok_or_else(|| EngineError::NotFound(format!("current node {current}")))
            }
        }
    }

    async fn record(
        &self,
        flow: &Flow,
        node: &FlowNode,
        metadata: &EventMetadata,
    ) -> Result<(), EngineError> {
        self.store
            .record_transaction(TransactionRecord::new(
                &flow.id,
                node.id(),
                node.type_name(),
                metadata.user_key(),
            ))
            .await
    }

    /// Fire-and-forget delivery. A failed render is logged and the event
    /// still advances; a flapping outbound channel must not wedge a user.
    async fn deliver(&self, metadata: &EventMetadata, intent: &RenderIntent) {
        if let Err(e) = self
            .renderer
            .render(&metadata.channel, &metadata.sender, intent)
            .await
        {
            error!(
                channel = %metadata.channel,
                recipient = %metadata.sender,
                error = %e,
                "outbound render failed, state advances regardless"
            );
        } else {
            info!(
                channel = %metadata.channel,
                recipient = %metadata.sender,
                "outbound intent delivered"
            );
        }
    }
}
