// src/engine/condition.rs

use std::collections::HashMap;

use tracing::warn;

use crate::engine::context::strip_at;
use crate::flow::{ConditionNode, ConditionOperator, ConditionType, FlowNodeCondition};

/// Outcome of evaluating a condition node against a variable snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub matched: bool,
    /// `nodeResultId` of the `__true` or `__false` entry.
    pub branch_node_id: Option<String>,
}

/// Evaluate a condition node. Missing variables compare as the empty string;
/// numeric comparisons fall through to false when either side does not
/// parse.
pub fn evaluate_node(node: &ConditionNode, vars: &HashMap<String, String>) -> ConditionOutcome {
    let matched = evaluate(&node.flow_node_conditions, node.condition_operator, vars);
    let suffix = if matched { "__true" } else { "__false" };
    let branch_node_id = node
        .condition_result
        .iter()
        .find(|entry| entry.id.ends_with(suffix))
        .and_then(|entry| entry.node_result_id.clone());
    ConditionOutcome {
        matched,
        branch_node_id,
    }
}

pub fn evaluate(
    conditions: &[FlowNodeCondition],
    operator: ConditionOperator,
    vars: &HashMap<String, String>,
) -> bool {
    let mut results = conditions.iter().map(|c| evaluate_one(c, vars));
    match operator {
        ConditionOperator::None => {
            if conditions.len() > 1 {
                warn!(
                    conditions = conditions.len(),
                    "operator None with multiple conditions, only the first applies"
                );
            }
            results.next().unwrap_or(false)
        }
        ConditionOperator::And => results.fold(true, |acc, r| acc && r),
        ConditionOperator::Or => results.fold(false, |acc, r| acc || r),
    }
}

fn evaluate_one(condition: &FlowNodeCondition, vars: &HashMap<String, String>) -> bool {
    let actual = vars
        .get(strip_at(&condition.variable))
        .map(String::as_str)
        .unwrap_or("");
    let expected = condition.value.as_str();

    match condition.flow_condition_type {
        ConditionType::Equal => eq_ignore_case(actual, expected),
        ConditionType::NotEqual => !eq_ignore_case(actual, expected),
        ConditionType::Contains => contains_ignore_case(actual, expected),
        ConditionType::NotContains => !contains_ignore_case(actual, expected),
        ConditionType::GreaterThan => match (parse_num(actual), parse_num(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionType::LessThan => match (parse_num(actual), parse_num(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn parse_num(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}
