// src/engine/validator.rs

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::channel::NormalizedMessage;
use crate::engine::EngineError;
use crate::flow::{AnswerValidation, Flow, FlowNode};
use crate::store::FlowStore;

const DEFAULT_FALLBACK: &str = "This is not the valid response. Please try again below";

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());

/// Verdict on an inbound reply. The validator never mutates user state; the
/// user state service acts on the verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyVerdict {
    /// Reply matched an expected answer of the current node.
    Matched { answer_id: String },
    /// Reply matched an expected answer of another node in the same flow.
    MatchedOtherNode { node_id: String },
    /// Text question accepted the reply; follow the node's outgoing edge.
    UseDefaultEdge,
    /// No match, retry budget left. Re-render the node with the fallback.
    MismatchRetry { fallback: String },
    /// No match and the retry budget is spent.
    ValidationExit { fallback: String },
}

pub struct ReplyValidator {
    store: Arc<dyn FlowStore>,
}

impl ReplyValidator {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    /// Validate a reply against the user's current node.
    ///
    /// `is_text` marks a free-text question: expected-answer matching is
    /// skipped and the reply runs through the node's answer validation
    /// rules instead. `current_failure_count` is the user's consecutive
    /// failure count before this event.
    pub async fn validate_and_match(
        &self,
        normalized: &NormalizedMessage,
        current_node_id: &str,
        flow_id: &str,
        is_text: bool,
        current_failure_count: u32,
    ) -> Result<ReplyVerdict, EngineError> {
        let flow = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("flow {flow_id}")))?;
        let current = flow
            .node(current_node_id)
            .ok_or_else(|| EngineError::NotFound(format!("node {current_node_id}")))?;

        let reply = normalized.get_text_content();
        if reply.trim().is_empty() && normalized.button_payload.is_none() {
            return Err(EngineError::InvalidInput(
                "reply carries no text content".into(),
            ));
        }

        if is_text {
            return Ok(self.validate_text_reply(current, &reply, current_failure_count));
        }

        // Expected answers of the current node first. A reply matches on its
        // visible text or on the interactive payload carrying the answer id.
        for answer in current.expected_answers() {
            let text_match = !answer.expected_input.trim().is_empty()
                && answer.expected_input.trim().eq_ignore_ascii_case(reply.trim());
            let payload_match = normalized
                .button_payload
                .as_deref()
                .is_some_and(|p| p == answer.id);
            if text_match || payload_match {
                info!(node_id = current_node_id, answer_id = %answer.id, "reply matched current node");
                return Ok(ReplyVerdict::Matched {
                    answer_id: answer.id.clone(),
                });
            }
        }

        // Cross-node jump: the reply may name a choice of another
        // interactive node in the same flow.
        if let Some(node_id) = find_match_in_flow(&flow, current_node_id, &reply) {
            info!(node_id = %node_id, "reply matched another node in flow");
            return Ok(ReplyVerdict::MatchedOtherNode { node_id });
        }

        Ok(self.mismatch_verdict(current.answer_validation(), current_failure_count))
    }

    fn validate_text_reply(
        &self,
        node: &FlowNode,
        reply: &str,
        current_failure_count: u32,
    ) -> ReplyVerdict {
        let validation = node.answer_validation();
        match validation.map(|v| check_text_rules(v, reply)) {
            None | Some(Ok(())) => ReplyVerdict::UseDefaultEdge,
            Some(Err(reason)) => {
                info!(node_id = node.id(), reason, "text reply failed validation");
                self.mismatch_verdict(validation, current_failure_count)
            }
        }
    }

    fn mismatch_verdict(
        &self,
        validation: Option<&AnswerValidation>,
        current_failure_count: u32,
    ) -> ReplyVerdict {
        let fallback = validation
            .and_then(|v| v.fallback.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_FALLBACK)
            .to_string();
        match validation.and_then(AnswerValidation::max_failures) {
            Some(max) if current_failure_count + 1 >= max => {
                warn!(
                    failures = current_failure_count + 1,
                    max, "validation limit reached, exiting automation"
                );
                ReplyVerdict::ValidationExit { fallback }
            }
            _ => ReplyVerdict::MismatchRetry { fallback },
        }
    }
}

fn find_match_in_flow(flow: &Flow, current_node_id: &str, reply: &str) -> Option<String> {
    for node in &flow.flow_nodes {
        if node.id() == current_node_id {
            continue;
        }
        if !matches!(
            node,
            FlowNode::ButtonQuestion(_) | FlowNode::ListQuestion(_) | FlowNode::TriggerTemplate(_)
        ) {
            continue;
        }
        for answer in node.expected_answers() {
            if !answer.expected_input.trim().is_empty()
                && answer.expected_input.trim().eq_ignore_ascii_case(reply.trim())
            {
                return Some(node.id().to_string());
            }
        }
    }
    None
}

/// Answer validation rules for text questions. Returns the first violated
/// rule as a reason string.
fn check_text_rules(validation: &AnswerValidation, reply: &str) -> Result<(), &'static str> {
    let reply = reply.trim();
    match validation.validation_type.as_deref() {
        Some("Number") => {
            let Ok(value) = reply.parse::<f64>() else {
                return Err("not a number");
            };
            if let Some(min) = parse_bound(&validation.min_value) {
                if value < min {
                    return Err("below minimum");
                }
            }
            if let Some(max) = parse_bound(&validation.max_value) {
                if value > max {
                    return Err("above maximum");
                }
            }
        }
        Some("Text") => {
            if let Some(min) = parse_bound(&validation.min_value) {
                if (reply.chars().count() as f64) < min {
                    return Err("too short");
                }
            }
            if let Some(max) = parse_bound(&validation.max_value) {
                if (reply.chars().count() as f64) > max {
                    return Err("too long");
                }
            }
        }
        Some("Email") => {
            if !EMAIL_RE.is_match(reply) {
                return Err("invalid email");
            }
        }
        Some("Phone") => {
            let digits: String = reply
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '+'))
                .collect();
            if digits.len() < 7 || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err("invalid phone");
            }
        }
        _ => {}
    }
    if let Some(pattern) = validation.regex.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(reply) {
                    return Err("pattern mismatch");
                }
            }
            Err(e) => warn!(pattern, error = %e, "invalid validation regex, skipping"),
        }
    }
    Ok(())
}

fn parse_bound(value: &Option<String>) -> Option<f64> {
    value.as_deref()?.trim().parse::<f64>().ok()
}
