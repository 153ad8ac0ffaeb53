// src/flow.rs

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::{graph::NodeIndex, prelude::StableDiGraph, Direction::Outgoing};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle of a flow. Only `Published` flows take part in trigger matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Draft,
    Published,
    Stop,
}

impl FlowStatus {
    /// Allowed transitions: draft→published, published→stop, stop→published.
    /// Nothing ever goes back to draft.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        matches!(
            (self, next),
            (FlowStatus::Draft, FlowStatus::Published)
                | (FlowStatus::Published, FlowStatus::Stop)
                | (FlowStatus::Stop, FlowStatus::Published)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub pos_x: String,
    pub pos_y: String,
}

/// One outbound payload of a message/question node, in render order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowReply {
    pub flow_reply_type: String,
    pub data: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnswerValidation {
    #[serde(rename = "type", default)]
    pub validation_type: Option<String>,
    #[serde(default)]
    pub min_value: Option<String>,
    #[serde(default)]
    pub max_value: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub fails_count: Option<String>,
}

impl AnswerValidation {
    /// Parsed retry budget. Absent or non-positive means retry indefinitely.
    pub fn max_failures(&self) -> Option<u32> {
        self.fails_count
            .as_deref()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|n| *n > 0)
            .map(|n| n as u32)
    }
}

/// An entry of a button/list/trigger-template answer set. `node_result_id`
/// names the target node for this choice directly, bypassing the edge set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedAnswer {
    pub id: String,
    pub expected_input: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub node_result_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveHeader {
    #[serde(rename = "type")]
    pub header_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Equal,
    NotEqual,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionOperator {
    #[default]
    None,
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowNodeCondition {
    pub id: String,
    pub flow_condition_type: ConditionType,
    /// `@variable` reference into the user's flow context.
    pub variable: String,
    pub value: String,
}

/// A branch outcome entry of a condition or delay node. The entry `id` ends
/// in `__true`/`__false` (condition) or `__interrupted`/`__not_interrupted`
/// (delay); `node_result_id` names the target node for that branch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub id: String,
    #[serde(default)]
    pub node_result_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DelayUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DelayUnit {
    pub fn seconds_multiplier(self) -> i64 {
        match self {
            DelayUnit::Seconds => 1,
            DelayUnit::Minutes => 60,
            DelayUnit::Hours => 3600,
            DelayUnit::Days => 86400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerKeywordNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    #[serde(default)]
    pub trigger_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTemplateNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    #[serde(default)]
    pub trigger_template_id: String,
    #[serde(default)]
    pub expected_answers: Vec<ExpectedAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    pub flow_replies: Vec<FlowReply>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuestionNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    pub flow_replies: Vec<FlowReply>,
    #[serde(default)]
    pub user_input_variable: String,
    #[serde(default)]
    pub answer_validation: AnswerValidation,
    #[serde(default)]
    pub is_media_accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ButtonQuestionNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    #[serde(default)]
    pub interactive_buttons_header: Option<InteractiveHeader>,
    pub interactive_buttons_body: String,
    #[serde(default)]
    pub interactive_buttons_footer: Option<String>,
    #[serde(default)]
    pub interactive_buttons_user_input_variable: String,
    #[serde(default)]
    pub interactive_buttons_default_node_result_id: Option<String>,
    #[serde(default)]
    pub answer_validation: AnswerValidation,
    #[serde(default)]
    pub expected_answers: Vec<ExpectedAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListQuestionNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    #[serde(default)]
    pub flow_replies: Vec<FlowReply>,
    #[serde(default)]
    pub user_input_variable: String,
    #[serde(default)]
    pub answer_validation: AnswerValidation,
    #[serde(default)]
    pub is_media_accepted: bool,
    #[serde(default)]
    pub expected_answers: Vec<ExpectedAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    pub flow_node_conditions: Vec<FlowNodeCondition>,
    #[serde(default)]
    pub condition_result: Vec<ResultEntry>,
    #[serde(default)]
    pub condition_operator: ConditionOperator,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelayNode {
    pub id: String,
    pub flow_node_type: String,
    #[serde(default)]
    pub flow_node_position: Option<NodePosition>,
    #[serde(default)]
    pub is_start_node: bool,
    #[serde(default)]
    pub delay_duration: i64,
    pub delay_unit: DelayUnit,
    #[serde(default)]
    pub wait_for_reply: bool,
    #[serde(default)]
    pub delay_interrupt: bool,
    #[serde(default)]
    pub delay_result: Vec<ResultEntry>,
}

/// Closed node variant set, tagged by the authoring tool's `type` field.
/// Dispatch on node type is an explicit branch in the internal-node
/// processor and the node identifier; a new node type requires coordinated
/// changes in the catalog, the processor and the identifier.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowNode {
    TriggerKeyword(TriggerKeywordNode),
    TriggerTemplate(TriggerTemplateNode),
    Message(MessageNode),
    Question(QuestionNode),
    ButtonQuestion(ButtonQuestionNode),
    ListQuestion(ListQuestionNode),
    Condition(ConditionNode),
    Delay(DelayNode),
}

impl FlowNode {
    pub fn id(&self) -> &str {
        match self {
            FlowNode::TriggerKeyword(n) => &n.id,
            FlowNode::TriggerTemplate(n) => &n.id,
            FlowNode::Message(n) => &n.id,
            FlowNode::Question(n) => &n.id,
            FlowNode::ButtonQuestion(n) => &n.id,
            FlowNode::ListQuestion(n) => &n.id,
            FlowNode::Condition(n) => &n.id,
            FlowNode::Delay(n) => &n.id,
        }
    }

    /// The wire value of the `type` tag. Doubles as the key into the
    /// node-type catalog.
    pub fn type_name(&self) -> &'static str {
        match self {
            FlowNode::TriggerKeyword(_) => "trigger_keyword",
            FlowNode::TriggerTemplate(_) => "trigger_template",
            FlowNode::Message(_) => "message",
            FlowNode::Question(_) => "question",
            FlowNode::ButtonQuestion(_) => "button_question",
            FlowNode::ListQuestion(_) => "list_question",
            FlowNode::Condition(_) => "condition",
            FlowNode::Delay(_) => "delay",
        }
    }

    pub fn is_start_node(&self) -> bool {
        match self {
            FlowNode::TriggerKeyword(n) => n.is_start_node,
            FlowNode::TriggerTemplate(n) => n.is_start_node,
            FlowNode::Message(n) => n.is_start_node,
            FlowNode::Question(n) => n.is_start_node,
            FlowNode::ButtonQuestion(n) => n.is_start_node,
            FlowNode::ListQuestion(n) => n.is_start_node,
            FlowNode::Condition(n) => n.is_start_node,
            FlowNode::Delay(n) => n.is_start_node,
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            FlowNode::TriggerKeyword(_) | FlowNode::TriggerTemplate(_)
        )
    }

    /// Condition and delay nodes are evaluated silently, never rendered.
    pub fn is_internal(&self) -> bool {
        matches!(self, FlowNode::Condition(_) | FlowNode::Delay(_))
    }

    pub fn expected_answers(&self) -> &[ExpectedAnswer] {
        match self {
            FlowNode::TriggerTemplate(n) => &n.expected_answers,
            FlowNode::ButtonQuestion(n) => &n.expected_answers,
            FlowNode::ListQuestion(n) => &n.expected_answers,
            _ => &[],
        }
    }

    /// Branch outcome entries of a condition or delay node.
    pub fn result_entries(&self) -> &[ResultEntry] {
        match self {
            FlowNode::Condition(n) => &n.condition_result,
            FlowNode::Delay(n) => &n.delay_result,
            _ => &[],
        }
    }

    pub fn answer_validation(&self) -> Option<&AnswerValidation> {
        match self {
            FlowNode::Question(n) => Some(&n.answer_validation),
            FlowNode::ButtonQuestion(n) => Some(&n.answer_validation),
            FlowNode::ListQuestion(n) => Some(&n.answer_validation),
            _ => None,
        }
    }

    /// `@variable` under which this node persists the user's reply.
    pub fn user_input_variable(&self) -> Option<&str> {
        let var = match self {
            FlowNode::Question(n) => n.user_input_variable.as_str(),
            FlowNode::ButtonQuestion(n) => n.interactive_buttons_user_input_variable.as_str(),
            FlowNode::ListQuestion(n) => n.user_input_variable.as_str(),
            _ => return None,
        };
        if var.trim().is_empty() {
            None
        } else {
            Some(var)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub pos_x: String,
    pub pos_y: String,
    pub zoom: String,
}

/// A flow document: the authored node/edge graph plus tenancy and lifecycle
/// metadata. The graph is directed and may contain cycles; traversal is one
/// actionable step per event and never assumes a DAG.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub status: FlowStatus,
    #[serde(default)]
    pub brand_id: i64,
    #[serde(default)]
    pub user_id: i64,
    #[serde(rename = "flowNodes")]
    pub flow_nodes: Vec<FlowNode>,
    #[serde(rename = "flowEdges")]
    pub flow_edges: Vec<FlowEdge>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.flow_nodes.iter().find(|n| n.id() == node_id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.flow_nodes.iter().find(|n| n.is_start_node())
    }

    /// The successor of a non-branching node. A well-formed flow has at most
    /// one outgoing edge here; extras are tolerated by taking the first in
    /// stable id order and logging the condition.
    pub fn successor_of(&self, node_id: &str) -> Option<&str> {
        let mut out: Vec<&FlowEdge> = self
            .flow_edges
            .iter()
            .filter(|e| e.source_node_id == node_id)
            .collect();
        if out.len() > 1 {
            out.sort_by(|a, b| a.id.cmp(&b.id));
            warn!(
                flow_id = %self.id,
                node_id,
                edges = out.len(),
                "non-branching node has multiple outgoing edges, taking first by id"
            );
        }
        out.first().map(|e| e.target_node_id.as_str())
    }

    /// Resolve an expected-answer or condition/delay result entry id to the
    /// node it branches to. Returns `None` when `entry_id` names no entry or
    /// the entry carries no target.
    pub fn branch_target(&self, entry_id: &str) -> Option<&str> {
        for node in &self.flow_nodes {
            for answer in node.expected_answers() {
                if answer.id == entry_id {
                    return answer.node_result_id.as_deref();
                }
            }
            for entry in node.result_entries() {
                if entry.id == entry_id {
                    return entry.node_result_id.as_deref();
                }
            }
        }
        None
    }

    /// Build the node graph. Branch references (`nodeResultId`) become edges
    /// alongside the explicit edge set so reachability reporting sees the
    /// full structure.
    pub fn build_graph(&self) -> (StableDiGraph<String, ()>, HashMap<String, NodeIndex>) {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();
        for node in &self.flow_nodes {
            let idx = graph.add_node(node.id().to_string());
            index_of.insert(node.id().to_string(), idx);
        }
        for edge in &self.flow_edges {
            if let (Some(&a), Some(&b)) = (
                index_of.get(&edge.source_node_id),
                index_of.get(&edge.target_node_id),
            ) {
                graph.add_edge(a, b, ());
            }
        }
        for node in &self.flow_nodes {
            let from = index_of[node.id()];
            let targets = node
                .expected_answers()
                .iter()
                .filter_map(|a| a.node_result_id.as_deref())
                .chain(
                    node.result_entries()
                        .iter()
                        .filter_map(|r| r.node_result_id.as_deref()),
                );
            for target in targets {
                if let Some(&to) = index_of.get(target) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        (graph, index_of)
    }

    /// Node ids not reachable from the start node. Publish-time diagnostics
    /// only; the runtime tolerates whatever the author saved.
    pub fn unreachable_nodes(&self) -> Vec<String> {
        let Some(start) = self.start_node() else {
            return self.flow_nodes.iter().map(|n| n.id().to_string()).collect();
        };
        let (graph, index_of) = self.build_graph();
        let mut reachable = HashSet::new();
        let mut stack = vec![index_of[start.id()]];
        while let Some(idx) = stack.pop() {
            if reachable.insert(idx) {
                for succ in graph.neighbors_directed(idx, Outgoing) {
                    stack.push(succ);
                }
            }
        }
        self.flow_nodes
            .iter()
            .filter(|n| !reachable.contains(&index_of[n.id()]))
            .map(|n| n.id().to_string())
            .collect()
    }
}
