// src/engine/trigger.rs

use std::sync::Arc;

use tracing::{debug, info};

use crate::channel::NormalizedMessage;
use crate::engine::EngineError;
use crate::flow::FlowStatus;
use crate::store::{FlowStore, FlowTrigger, TriggerType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    pub flow_id: String,
    pub trigger_node_id: String,
}

/// Matches a normalized message against the trigger index of a brand's
/// published flows. Ties between flows go to the most recently updated one.
pub struct TriggerMatcher {
    store: Arc<dyn FlowStore>,
}

impl TriggerMatcher {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    pub async fn match_trigger(
        &self,
        brand_id: i64,
        channel: &str,
        message_type: &str,
        normalized: &NormalizedMessage,
    ) -> Result<Option<TriggerMatch>, EngineError> {
        let text = normalized.get_text_content();
        let text = text.trim();
        if text.is_empty() && normalized.button_payload.is_none() {
            debug!(brand_id, channel, "no text content, skipping trigger check");
            return Ok(None);
        }

        let triggers = self.store.triggers_for_brand(brand_id).await?;
        if triggers.is_empty() {
            debug!(brand_id, "brand has no triggers");
            return Ok(None);
        }

        // Draft and stopped flows never match; candidates are ordered by
        // flow recency so the newest published flow wins a keyword tie.
        let mut candidates = Vec::new();
        for trigger in triggers {
            let Some(flow) = self.store.get_flow(&trigger.flow_id).await? else {
                continue;
            };
            if flow.status != FlowStatus::Published {
                continue;
            }
            candidates.push((flow.updated_at, trigger));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, trigger) in candidates {
            if self.trigger_matches(&trigger, message_type, text, normalized) {
                info!(
                    brand_id,
                    channel,
                    flow_id = %trigger.flow_id,
                    node_id = %trigger.node_id,
                    "trigger matched"
                );
                return Ok(Some(TriggerMatch {
                    flow_id: trigger.flow_id,
                    trigger_node_id: trigger.node_id,
                }));
            }
        }
        Ok(None)
    }

    fn trigger_matches(
        &self,
        trigger: &FlowTrigger,
        message_type: &str,
        text: &str,
        normalized: &NormalizedMessage,
    ) -> bool {
        match trigger.trigger_type {
            // Keyword triggers only fire on plain text messages.
            TriggerType::Keyword => {
                message_type == "text"
                    && trigger
                        .trigger_values
                        .iter()
                        .any(|k| k.trim().to_lowercase() == text.to_lowercase())
            }
            TriggerType::Template => {
                let template_hit = match (&trigger.template_id, &normalized.button_payload) {
                    (Some(template_id), Some(payload)) => {
                        !template_id.trim().is_empty() && template_id == payload
                    }
                    _ => false,
                };
                template_hit
                    || trigger
                        .trigger_values
                        .iter()
                        .any(|v| v.trim().to_lowercase() == text.to_lowercase())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Flow;
    use crate::store::InMemoryFlowStore;
    use serde_json::json;

    fn keyword_flow(id: &str, keyword: &str, status: &str) -> Flow {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "status": status,
            "brand_id": 1,
            "user_id": 7,
            "flowNodes": [
                {
                    "type": "trigger_keyword",
                    "id": format!("{id}-t"),
                    "flowNodeType": "Trigger",
                    "isStartNode": true,
                    "triggerKeywords": [keyword]
                }
            ],
            "flowEdges": []
        }))
        .unwrap()
    }

    fn text(body: &str) -> NormalizedMessage {
        NormalizedMessage {
            text: Some(body.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn keyword_match_is_case_insensitive_and_trimmed() {
        let store = Arc::new(InMemoryFlowStore::new());
        store
            .create_flow(keyword_flow("f1", "Learn", "published"))
            .await
            .unwrap();
        let matcher = TriggerMatcher::new(store);
        let hit = matcher
            .match_trigger(1, "whatsapp", "text", &text("  LEARN "))
            .await
            .unwrap();
        assert_eq!(
            hit,
            Some(TriggerMatch {
                flow_id: "f1".into(),
                trigger_node_id: "f1-t".into()
            })
        );
    }

    #[tokio::test]
    async fn draft_and_stopped_flows_never_match() {
        let store = Arc::new(InMemoryFlowStore::new());
        store
            .create_flow(keyword_flow("f1", "learn", "draft"))
            .await
            .unwrap();
        store
            .create_flow(keyword_flow("f2", "learn", "stop"))
            .await
            .unwrap();
        let matcher = TriggerMatcher::new(store);
        let hit = matcher
            .match_trigger(1, "whatsapp", "text", &text("learn"))
            .await
            .unwrap();
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn keyword_tie_goes_to_most_recently_updated_flow() {
        let store = Arc::new(InMemoryFlowStore::new());
        store
            .create_flow(keyword_flow("old", "learn", "published"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .create_flow(keyword_flow("new", "learn", "published"))
            .await
            .unwrap();
        let matcher = TriggerMatcher::new(store);
        let hit = matcher
            .match_trigger(1, "whatsapp", "text", &text("learn"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.flow_id, "new");
    }

    #[tokio::test]
    async fn keyword_triggers_ignore_non_text_events() {
        let store = Arc::new(InMemoryFlowStore::new());
        store
            .create_flow(keyword_flow("f1", "learn", "published"))
            .await
            .unwrap();
        let matcher = TriggerMatcher::new(store);
        let hit = matcher
            .match_trigger(1, "whatsapp", "button", &text("learn"))
            .await
            .unwrap();
        assert_eq!(hit, None);
    }
}
