// src/channel/mod.rs

pub mod adapter;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveType {
    #[default]
    None,
    ButtonReply,
    ListReply,
}

/// Canonical shape every channel payload collapses into. All components
/// downstream of the adapter treat this as a plain value; channel variance
/// lives entirely in the normalizer set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub button_text: Option<String>,
    #[serde(default)]
    pub button_payload: Option<String>,
    #[serde(default)]
    pub interactive_type: InteractiveType,
    #[serde(default)]
    pub interactive_value: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    /// Original channel payload, kept for storage and debugging.
    #[serde(default)]
    pub raw: Value,
}

impl NormalizedMessage {
    /// The single string that participates in trigger matching and reply
    /// validation. Precedence: interactive selection, then button text,
    /// then plain text, then email subject/body.
    pub fn get_text_content(&self) -> String {
        if let Some(v) = non_empty(&self.interactive_value) {
            return v.to_string();
        }
        if let Some(v) = non_empty(&self.button_text) {
            return v.to_string();
        }
        if let Some(v) = non_empty(&self.text) {
            return v.to_string();
        }
        match (non_empty(&self.subject), non_empty(&self.body)) {
            (Some(s), Some(b)) => format!("{s}\n{b}"),
            (Some(s), None) => s.to_string(),
            (None, Some(b)) => b.to_string(),
            (None, None) => String::new(),
        }
    }

    /// `user_state_id` carried by synthetic `delay_complete` events.
    pub fn user_state_id(&self) -> Option<&str> {
        self.raw.get("user_state_id").and_then(Value::as_str)
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
