// src/outbound.rs
//
// The engine emits rendering intents; connectors turn them into
// channel-specific deliveries. Rendering is fire-and-forget from the
// engine's viewpoint: failures are logged and state still advances.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::EngineError;
use crate::flow::{FlowNode, FlowReply};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChoiceOption {
    pub id: String,
    pub title: String,
}

/// One outbound action for a channel connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderIntent {
    Text {
        body: String,
    },
    Media {
        url: String,
        media_type: String,
        caption: Option<String>,
    },
    Buttons {
        header: Option<String>,
        body: String,
        footer: Option<String>,
        buttons: Vec<ChoiceOption>,
    },
    List {
        body: Option<String>,
        options: Vec<ChoiceOption>,
    },
}

fn reply_intent(reply: &FlowReply) -> RenderIntent {
    if reply.flow_reply_type == "text" {
        RenderIntent::Text {
            body: reply.data.clone(),
        }
    } else {
        RenderIntent::Media {
            url: reply.data.clone(),
            media_type: reply.flow_reply_type.clone(),
            caption: reply.caption.clone().filter(|c| !c.trim().is_empty()),
        }
    }
}

/// Rendering intents for an actionable node, in delivery order. A fallback
/// message (validation failure) is prepended when present.
pub fn intents_for_node(node: &FlowNode, fallback: Option<&str>) -> Vec<RenderIntent> {
    let mut intents = Vec::new();
    if let Some(message) = fallback {
        intents.push(RenderIntent::Text {
            body: message.to_string(),
        });
    }
    match node {
        FlowNode::Message(n) => intents.extend(n.flow_replies.iter().map(reply_intent)),
        FlowNode::Question(n) => intents.extend(n.flow_replies.iter().map(reply_intent)),
        FlowNode::ButtonQuestion(n) => intents.push(RenderIntent::Buttons {
            header: n
                .interactive_buttons_header
                .as_ref()
                .and_then(|h| h.text.clone()),
            body: n.interactive_buttons_body.clone(),
            footer: n.interactive_buttons_footer.clone(),
            buttons: n
                .expected_answers
                .iter()
                .map(|a| ChoiceOption {
                    id: a.id.clone(),
                    title: a.expected_input.clone(),
                })
                .collect(),
        }),
        FlowNode::ListQuestion(n) => {
            intents.extend(n.flow_replies.iter().map(reply_intent));
            intents.push(RenderIntent::List {
                body: None,
                options: n
                    .expected_answers
                    .iter()
                    .map(|a| ChoiceOption {
                        id: a.id.clone(),
                        title: a.expected_input.clone(),
                    })
                    .collect(),
            });
        }
        // Triggers and internal nodes never render.
        _ => {}
    }
    intents
}

#[async_trait]
pub trait OutboundRenderer: Send + Sync {
    async fn render(
        &self,
        channel: &str,
        recipient: &str,
        intent: &RenderIntent,
    ) -> Result<(), EngineError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn OutboundRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRenderer")
            .field("impl", &self.name())
            .finish()
    }
}

/// Ships intents to an external renderer service.
pub struct HttpRenderer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRenderer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl OutboundRenderer for HttpRenderer {
    async fn render(
        &self,
        channel: &str,
        recipient: &str,
        intent: &RenderIntent,
    ) -> Result<(), EngineError> {
        let url = format!("{}/render", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "channel": channel,
                "recipient": recipient,
                "intent": intent,
            }))
            .send()
            .await
            .map_err(|e| EngineError::RenderingFailed(format!("{e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::RenderingFailed(format!(
                "renderer returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "HttpRenderer"
    }
}

/// Default renderer when no connector is configured. Logs the intent and
/// succeeds.
#[derive(Debug, Default)]
pub struct LogRenderer;

impl LogRenderer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutboundRenderer for LogRenderer {
    async fn render(
        &self,
        channel: &str,
        recipient: &str,
        intent: &RenderIntent,
    ) -> Result<(), EngineError> {
        info!(channel, recipient, intent = ?intent, "outbound intent");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LogRenderer"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub channel: String,
    pub recipient: String,
    pub intent: RenderIntent,
}

/// Test renderer that records everything it is asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingRenderer {
    sent: Mutex<Vec<RenderedMessage>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<RenderedMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn take(&self) -> Vec<RenderedMessage> {
        std::mem::take(&mut *self.sent.lock().await)
    }
}

#[async_trait]
impl OutboundRenderer for RecordingRenderer {
    async fn render(
        &self,
        channel: &str,
        recipient: &str,
        intent: &RenderIntent,
    ) -> Result<(), EngineError> {
        self.sent.lock().await.push(RenderedMessage {
            channel: channel.to_string(),
            recipient: recipient.to_string(),
            intent: intent.clone(),
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "RecordingRenderer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ButtonQuestionNode, ExpectedAnswer, MessageNode};

    #[test]
    fn message_node_renders_replies_in_order() {
        let node = FlowNode::Message(MessageNode {
            id: "m1".into(),
            flow_node_type: "Message".into(),
            flow_node_position: None,
            is_start_node: false,
            flow_replies: vec![
                FlowReply {
                    flow_reply_type: "text".into(),
                    data: "hi".into(),
                    caption: None,
                    mime_type: None,
                },
                FlowReply {
                    flow_reply_type: "image".into(),
                    data: "https://cdn/a.png".into(),
                    caption: Some("pic".into()),
                    mime_type: Some("image/png".into()),
                },
            ],
        });
        let intents = intents_for_node(&node, None);
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0], RenderIntent::Text { body: "hi".into() });
        assert!(matches!(intents[1], RenderIntent::Media { .. }));
    }

    #[test]
    fn fallback_is_prepended() {
        let node = FlowNode::ButtonQuestion(ButtonQuestionNode {
            id: "b1".into(),
            flow_node_type: "Question".into(),
            flow_node_position: None,
            is_start_node: false,
            interactive_buttons_header: None,
            interactive_buttons_body: "pick".into(),
            interactive_buttons_footer: None,
            interactive_buttons_user_input_variable: String::new(),
            interactive_buttons_default_node_result_id: None,
            answer_validation: Default::default(),
            expected_answers: vec![ExpectedAnswer {
                id: "b1a".into(),
                expected_input: "Yes".into(),
                is_default: false,
                node_result_id: None,
            }],
        });
        let intents = intents_for_node(&node, Some("not valid, try again"));
        assert_eq!(
            intents[0],
            RenderIntent::Text {
                body: "not valid, try again".into()
            }
        );
        assert!(matches!(intents[1], RenderIntent::Buttons { .. }));
    }
}
