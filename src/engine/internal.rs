// src/engine/internal.rs
//
// Internal nodes (condition, delay) are evaluated silently. The processor
// only computes; it never writes state. The identifier and the user state
// service act on what it returns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::condition;
use crate::engine::EngineError;
use crate::flow::{DelayNode, DelayUnit, FlowNode};

/// Computed plan for a delay node. `wait_time_seconds` of zero fires on the
/// next scheduler tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayPlan {
    pub delay_duration: i64,
    pub delay_unit: DelayUnit,
    pub wait_time_seconds: i64,
    pub wait_for_reply: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InternalOutcome {
    /// Condition evaluated; `branch_node_id` is the `nodeResultId` of the
    /// matching `__true`/`__false` entry.
    ConditionBranch {
        matched: bool,
        branch_node_id: String,
    },
    Delay(DelayPlan),
}

#[derive(Debug, Clone, Default)]
pub struct InternalNodeProcessor;

impl InternalNodeProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(
        &self,
        node: &FlowNode,
        vars: &HashMap<String, String>,
    ) -> Result<InternalOutcome, EngineError> {
        match node {
            FlowNode::Condition(cond) => {
                if cond.flow_node_conditions.is_empty() {
                    return Err(EngineError::ProcessingFailed(format!(
                        "condition node {} has no conditions",
                        cond.id
                    )));
                }
                let outcome = condition::evaluate_node(cond, vars);
                info!(
                    node_id = %cond.id,
                    matched = outcome.matched,
                    branch = outcome.branch_node_id.as_deref().unwrap_or("-"),
                    "condition evaluated"
                );
                let branch_node_id = outcome.branch_node_id.ok_or_else(|| {
                    EngineError::InvalidInput(format!(
                        "condition node {} has no result entry for {}",
                        cond.id,
                        if outcome.matched { "__true" } else { "__false" }
                    ))
                })?;
                Ok(InternalOutcome::ConditionBranch {
                    matched: outcome.matched,
                    branch_node_id,
                })
            }
            FlowNode::Delay(delay) => Ok(InternalOutcome::Delay(plan_delay(delay))),
            other => Err(EngineError::InvalidInput(format!(
                "node {} is not an internal node ({})",
                other.id(),
                other.type_name()
            ))),
        }
    }
}

fn plan_delay(node: &DelayNode) -> DelayPlan {
    let duration = if node.delay_duration < 0 {
        warn!(node_id = %node.id, duration = node.delay_duration, "invalid delay duration, using 0");
        0
    } else {
        node.delay_duration
    };
    DelayPlan {
        delay_duration: duration,
        delay_unit: node.delay_unit,
        wait_time_seconds: duration * node.delay_unit.seconds_multiplier(),
        wait_for_reply: node.wait_for_reply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{ConditionOperator, ConditionType, FlowNodeCondition, ResultEntry};

    fn condition_node() -> FlowNode {
        FlowNode::Condition(crate::flow::ConditionNode {
            id: "c1".into(),
            flow_node_type: "Condition".into(),
            flow_node_position: None,
            is_start_node: false,
            flow_node_conditions: vec![FlowNodeCondition {
                id: "cc1".into(),
                flow_condition_type: ConditionType::Equal,
                variable: "@name".into(),
                value: "John".into(),
            }],
            condition_result: vec![
                ResultEntry {
                    id: "c1__true".into(),
                    node_result_id: Some("Myes".into()),
                },
                ResultEntry {
                    id: "c1__false".into(),
                    node_result_id: Some("Mno".into()),
                },
            ],
            condition_operator: ConditionOperator::None,
        })
    }

    fn delay_node(duration: i64, unit: DelayUnit) -> FlowNode {
        FlowNode::Delay(crate::flow::DelayNode {
            id: "d1".into(),
            flow_node_type: "Delay".into(),
            flow_node_position: None,
            is_start_node: false,
            delay_duration: duration,
            delay_unit: unit,
            wait_for_reply: false,
            delay_interrupt: false,
            delay_result: vec![],
        })
    }

    #[test]
    fn condition_picks_true_branch() {
        let processor = InternalNodeProcessor::new();
        let vars = [("name".to_string(), "John".to_string())].into();
        let outcome = processor.process(&condition_node(), &vars).unwrap();
        assert_eq!(
            outcome,
            InternalOutcome::ConditionBranch {
                matched: true,
                branch_node_id: "Myes".into()
            }
        );
    }

    #[test]
    fn condition_picks_false_branch_on_missing_variable() {
        let processor = InternalNodeProcessor::new();
        let outcome = processor
            .process(&condition_node(), &HashMap::new())
            .unwrap();
        assert_eq!(
            outcome,
            InternalOutcome::ConditionBranch {
                matched: false,
                branch_node_id: "Mno".into()
            }
        );
    }

    #[test]
    fn delay_units_convert_to_seconds() {
        let processor = InternalNodeProcessor::new();
        for (unit, expected) in [
            (DelayUnit::Seconds, 5),
            (DelayUnit::Minutes, 300),
            (DelayUnit::Hours, 18_000),
            (DelayUnit::Days, 432_000),
        ] {
            let outcome = processor
                .process(&delay_node(5, unit), &HashMap::new())
                .unwrap();
            match outcome {
                InternalOutcome::Delay(plan) => assert_eq!(plan.wait_time_seconds, expected),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[test]
    fn negative_delay_duration_becomes_zero() {
        let processor = InternalNodeProcessor::new();
        let outcome = processor
            .process(&delay_node(-3, DelayUnit::Minutes), &HashMap::new())
            .unwrap();
        match outcome {
            InternalOutcome::Delay(plan) => {
                assert_eq!(plan.wait_time_seconds, 0);
                assert_eq!(plan.delay_duration, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn actionable_node_is_rejected() {
        let processor = InternalNodeProcessor::new();
        let node = FlowNode::Message(crate::flow::MessageNode {
            id: "m1".into(),
            flow_node_type: "Message".into(),
            flow_node_position: None,
            is_start_node: false,
            flow_replies: vec![],
        });
        assert!(processor.process(&node, &HashMap::new()).is_err());
    }
}
