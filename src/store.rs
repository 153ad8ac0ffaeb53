// src/store.rs
//
// Document collections backing the engine: flows, triggers, users, flow
// variables, transactions, delays, webhook records and the node-type
// catalog. The store is a trait so a document database can replace the
// in-memory reference implementation; every document is stamped with its
// brand and UTC timestamps.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::channel::NormalizedMessage;
use crate::engine::EngineError;
use crate::flow::{Flow, FlowNode, FlowStatus};

/// Identity of an end user within a channel context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct UserKey {
    pub user_identifier: String,
    pub brand_id: i64,
    pub channel: String,
    pub channel_account_id: Option<String>,
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.user_identifier, self.brand_id, self.channel
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ValidationState {
    pub failure_count: u32,
    pub validation_failed: bool,
    pub failure_message: Option<String>,
}

/// Per-user automation position. Created on the first inbound message and
/// never destroyed, only toggled in and out of automation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UserState {
    pub key: UserKey,
    pub user_id: i64,
    pub is_in_automation: bool,
    pub current_flow_id: Option<String>,
    pub current_node_id: Option<String>,
    /// Set while the user sits inside a delay; mirrors an unprocessed timer.
    pub delay_node_data: Option<FlowNode>,
    pub validation: ValidationState,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

impl UserState {
    pub fn new(key: UserKey, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            key,
            user_id,
            is_in_automation: false,
            current_flow_id: None,
            current_node_id: None,
            delay_node_data: None,
            validation: ValidationState::default(),
            created_at: now,
            last_event_at: now,
        }
    }
}

/// Persisted timer for a delay node. Exactly one unprocessed timer may exist
/// per user; it flips to `processed` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DelayTimer {
    pub id: String,
    pub key: UserKey,
    pub flow_id: String,
    pub delay_node_id: String,
    pub wait_time_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub completes_at: DateTime<Utc>,
    pub processed: bool,
}

/// Catalog row describing a node type. The catalog is the authoritative
/// signal for whether a node expects a reply.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDetail {
    pub node_id: String,
    pub node_name: String,
    pub category: String,
    pub user_input_required: bool,
    pub is_internal: bool,
}

/// Append-only record written every time a node is entered. Per-node counts
/// feed the flow detail report.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransactionRecord {
    pub id: String,
    pub flow_id: String,
    pub node_id: String,
    pub node_type: String,
    pub key: UserKey,
    pub at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(flow_id: &str, node_id: &str, node_type: &str, key: UserKey) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            flow_id: flow_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            key,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Dropped,
    Error,
}

/// Raw inbound webhook plus its normalized form, stored before processing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookRecord {
    pub id: String,
    pub sender: String,
    pub brand_id: i64,
    pub user_id: i64,
    pub channel: String,
    pub channel_account_id: Option<String>,
    pub message_type: String,
    pub message_body: Value,
    pub normalized: Option<NormalizedMessage>,
    pub status: WebhookStatus,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Keyword,
    Template,
}

/// Trigger index row, derived from a flow's start node on every save.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowTrigger {
    pub flow_id: String,
    pub node_id: String,
    pub trigger_type: TriggerType,
    pub trigger_values: Vec<String>,
    pub template_id: Option<String>,
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    // flows
    async fn create_flow(&self, flow: Flow) -> Result<Flow, EngineError>;
    async fn update_flow(&self, flow: Flow) -> Result<Flow, EngineError>;
    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, EngineError>;
    async fn flows_for_user(&self, user_id: i64) -> Result<Vec<Flow>, EngineError>;
    async fn set_flow_status(&self, flow_id: &str, status: FlowStatus) -> Result<Flow, EngineError>;

    // trigger index
    async fn triggers_for_brand(&self, brand_id: i64) -> Result<Vec<FlowTrigger>, EngineError>;

    // users
    async fn get_user(&self, key: &UserKey) -> Result<Option<UserState>, EngineError>;
    async fn save_user(&self, user: UserState) -> Result<UserState, EngineError>;
    async fn update_automation_state(
        &self,
        key: &UserKey,
        is_in_automation: bool,
        flow_id: Option<String>,
        node_id: Option<String>,
    ) -> Result<(), EngineError>;
    async fn update_validation_state(
        &self,
        key: &UserKey,
        failed: bool,
        message: Option<String>,
    ) -> Result<(), EngineError>;
    async fn set_delay_node(&self, key: &UserKey, node: Option<FlowNode>) -> Result<(), EngineError>;

    // flow variables
    async fn set_variable(
        &self,
        key: &UserKey,
        flow_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), EngineError>;
    async fn get_variable(
        &self,
        key: &UserKey,
        flow_id: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError>;
    async fn variables_snapshot(
        &self,
        key: &UserKey,
        flow_id: &str,
    ) -> Result<HashMap<String, String>, EngineError>;

    // transactions
    async fn record_transaction(&self, tx: TransactionRecord) -> Result<(), EngineError>;
    async fn transaction_counts(&self, flow_id: &str) -> Result<HashMap<String, u64>, EngineError>;

    // delay timers
    async fn save_delay(&self, timer: DelayTimer) -> Result<DelayTimer, EngineError>;
    async fn claim_due_delays(&self, now: DateTime<Utc>) -> Result<Vec<DelayTimer>, EngineError>;
    async fn release_delay(&self, delay_id: &str) -> Result<(), EngineError>;
    async fn unprocessed_delay_for(&self, key: &UserKey) -> Result<Option<DelayTimer>, EngineError>;

    // node-type catalog
    async fn node_detail(&self, node_type: &str) -> Result<Option<NodeDetail>, EngineError>;
    async fn all_node_details(&self) -> Result<Vec<NodeDetail>, EngineError>;
    async fn node_details_by_category(&self, category: &str)
        -> Result<Vec<NodeDetail>, EngineError>;

    // webhook records
    async fn save_webhook(&self, record: WebhookRecord) -> Result<String, EngineError>;
    async fn update_webhook_status(
        &self,
        webhook_id: &str,
        status: WebhookStatus,
    ) -> Result<(), EngineError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn FlowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStore").field("impl", &self.name()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VariableKey {
    user: UserKey,
    flow_id: String,
    name: String,
}

/// Reference store. Per-entry locking comes from the dashmap collections;
/// the transaction log is append-only behind an rwlock.
pub struct InMemoryFlowStore {
    flows: DashMap<String, Flow>,
    triggers: DashMap<String, Vec<FlowTrigger>>,
    users: DashMap<UserKey, UserState>,
    variables: DashMap<VariableKey, String>,
    transactions: RwLock<Vec<TransactionRecord>>,
    delays: DashMap<String, DelayTimer>,
    node_details: DashMap<String, NodeDetail>,
    webhooks: DashMap<String, WebhookRecord>,
}

impl Default for InMemoryFlowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        let store = Self {
            flows: DashMap::new(),
            triggers: DashMap::new(),
            users: DashMap::new(),
            variables: DashMap::new(),
            transactions: RwLock::new(Vec::new()),
            delays: DashMap::new(),
            node_details: DashMap::new(),
            webhooks: DashMap::new(),
        };
        store.seed_node_details();
        store
    }

    fn seed_node_details(&self) {
        let rows = [
            ("trigger_keyword", "Keyword Trigger", "Trigger", false, false),
            ("trigger_template", "Template Trigger", "Trigger", true, false),
            ("message", "Send A Message", "Action", false, false),
            ("question", "Ask A Question", "Action", true, false),
            ("button_question", "Ask With Buttons", "Action", true, false),
            ("list_question", "Ask With A List", "Action", true, false),
            ("condition", "Condition", "Condition", false, true),
            ("delay", "Delay", "Delay", false, true),
        ];
        for (node_id, node_name, category, user_input_required, is_internal) in rows {
            self.node_details.insert(
                node_id.to_string(),
                NodeDetail {
                    node_id: node_id.to_string(),
                    node_name: node_name.to_string(),
                    category: category.to_string(),
                    user_input_required,
                    is_internal,
                },
            );
        }
    }

    /// Rebuild the trigger index rows for a flow from its start node.
    fn reindex_triggers(&self, flow: &Flow) {
        let mut rows = Vec::new();
        if let Some(node) = flow.start_node() {
            match node {
                FlowNode::TriggerKeyword(n) => rows.push(FlowTrigger {
                    flow_id: flow.id.clone(),
                    node_id: n.id.clone(),
                    trigger_type: TriggerType::Keyword,
                    trigger_values: n.trigger_keywords.clone(),
                    template_id: None,
                }),
                FlowNode::TriggerTemplate(n) => rows.push(FlowTrigger {
                    flow_id: flow.id.clone(),
                    node_id: n.id.clone(),
                    trigger_type: TriggerType::Template,
                    trigger_values: n
                        .expected_answers
                        .iter()
                        .map(|a| a.expected_input.clone())
                        .filter(|v| !v.trim().is_empty())
                        .collect(),
                    template_id: Some(n.trigger_template_id.clone()),
                }),
                _ => {}
            }
        }
        self.triggers.insert(flow.id.clone(), rows);
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create_flow(&self, mut flow: Flow) -> Result<Flow, EngineError> {
        if flow.id.trim().is_empty() {
            flow.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        flow.created_at = now;
        flow.updated_at = now;
        self.reindex_triggers(&flow);
        self.flows.insert(flow.id.clone(), flow.clone());
        info!(flow_id = %flow.id, name = %flow.name, "flow created");
        Ok(flow)
    }

    async fn update_flow(&self, mut flow: Flow) -> Result<Flow, EngineError> {
        if !self.flows.contains_key(&flow.id) {
            return Err(EngineError::NotFound(format!("flow {}", flow.id)));
        }
        flow.updated_at = Utc::now();
        self.reindex_triggers(&flow);
        self.flows.insert(flow.id.clone(), flow.clone());
        Ok(flow)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, EngineError> {
        Ok(self.flows.get(flow_id).map(|f| f.clone()))
    }

    async fn flows_for_user(&self, user_id: i64) -> Result<Vec<Flow>, EngineError> {
        let mut flows: Vec<Flow> = self
            .flows
            .iter()
            .filter(|f| f.user_id == user_id)
            .map(|f| f.clone())
            .collect();
        flows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(flows)
    }

    async fn set_flow_status(&self, flow_id: &str, status: FlowStatus) -> Result<Flow, EngineError> {
        let mut entry = self
            .flows
            .get_mut(flow_id)
            .ok_or_else(|| EngineError::NotFound(format!("flow {flow_id}")))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn triggers_for_brand(&self, brand_id: i64) -> Result<Vec<FlowTrigger>, EngineError> {
        let mut rows = Vec::new();
        for flow in self.flows.iter() {
            if flow.brand_id != brand_id {
                continue;
            }
            if let Some(flow_rows) = self.triggers.get(&flow.id) {
                rows.extend(flow_rows.iter().cloned());
            }
        }
        Ok(rows)
    }

    async fn get_user(&self, key: &UserKey) -> Result<Option<UserState>, EngineError> {
        Ok(self.users.get(key).map(|u| u.clone()))
    }

    async fn save_user(&self, mut user: UserState) -> Result<UserState, EngineError> {
        user.last_event_at = Utc::now();
        self.users.insert(user.key.clone(), user.clone());
        Ok(user)
    }

    async fn update_automation_state(
        &self,
        key: &UserKey,
        is_in_automation: bool,
        flow_id: Option<String>,
        node_id: Option<String>,
    ) -> Result<(), EngineError> {
        let mut user = self
            .users
            .get_mut(key)
            .ok_or_else(|| EngineError::NotFound(format!("user {key}")))?;
        user.is_in_automation = is_in_automation;
        user.current_flow_id = flow_id;
        user.current_node_id = node_id;
        user.last_event_at = Utc::now();
        if !is_in_automation {
            // Failure counters do not survive an automation exit.
            user.validation = ValidationState::default();
        }
        Ok(())
    }

    async fn update_validation_state(
        &self,
        key: &UserKey,
        failed: bool,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        let mut user = self
            .users
            .get_mut(key)
            .ok_or_else(|| EngineError::NotFound(format!("user {key}")))?;
        if failed {
            user.validation.failure_count += 1;
            user.validation.validation_failed = true;
            user.validation.failure_message = message;
        } else {
            user.validation = ValidationState::default();
        }
        Ok(())
    }

    async fn set_delay_node(&self, key: &UserKey, node: Option<FlowNode>) -> Result<(), EngineError> {
        let mut user = self
            .users
            .get_mut(key)
            .ok_or_else(|| EngineError::NotFound(format!("user {key}")))?;
        user.delay_node_data = node;
        Ok(())
    }

    async fn set_variable(
        &self,
        key: &UserKey,
        flow_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        self.variables.insert(
            VariableKey {
                user: key.clone(),
                flow_id: flow_id.to_string(),
                name: name.to_string(),
            },
            value.to_string(),
        );
        Ok(())
    }

    async fn get_variable(
        &self,
        key: &UserKey,
        flow_id: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        Ok(self
            .variables
            .get(&VariableKey {
                user: key.clone(),
                flow_id: flow_id.to_string(),
                name: name.to_string(),
            })
            .map(|v| v.clone()))
    }

    async fn variables_snapshot(
        &self,
        key: &UserKey,
        flow_id: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        let mut map = HashMap::new();
        for entry in self.variables.iter() {
            if entry.key().user == *key && entry.key().flow_id == flow_id {
                map.insert(entry.key().name.clone(), entry.value().clone());
            }
        }
        Ok(map)
    }

    async fn record_transaction(&self, tx: TransactionRecord) -> Result<(), EngineError> {
        self.transactions.write().await.push(tx);
        Ok(())
    }

    async fn transaction_counts(&self, flow_id: &str) -> Result<HashMap<String, u64>, EngineError> {
        let mut counts = HashMap::new();
        for tx in self.transactions.read().await.iter() {
            if tx.flow_id == flow_id {
                *counts.entry(tx.node_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn save_delay(&self, mut timer: DelayTimer) -> Result<DelayTimer, EngineError> {
        if timer.id.trim().is_empty() {
            timer.id = Uuid::new_v4().to_string();
        }
        self.delays.insert(timer.id.clone(), timer.clone());
        Ok(timer)
    }

    /// Claim due timers by flipping `processed` under the entry lock. A
    /// claimed timer is retried only after an explicit release.
    async fn claim_due_delays(&self, now: DateTime<Utc>) -> Result<Vec<DelayTimer>, EngineError> {
        let mut claimed = Vec::new();
        for mut entry in self.delays.iter_mut() {
            if !entry.processed && entry.completes_at <= now {
                entry.processed = true;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_delay(&self, delay_id: &str) -> Result<(), EngineError> {
        if let Some(mut entry) = self.delays.get_mut(delay_id) {
            entry.processed = false;
        }
        Ok(())
    }

    async fn unprocessed_delay_for(&self, key: &UserKey) -> Result<Option<DelayTimer>, EngineError> {
        Ok(self
            .delays
            .iter()
            .find(|d| !d.processed && d.key == *key)
            .map(|d| d.clone()))
    }

    async fn node_detail(&self, node_type: &str) -> Result<Option<NodeDetail>, EngineError> {
        Ok(self.node_details.get(node_type).map(|d| d.clone()))
    }

    async fn all_node_details(&self) -> Result<Vec<NodeDetail>, EngineError> {
        let mut rows: Vec<NodeDetail> = self.node_details.iter().map(|d| d.clone()).collect();
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(rows)
    }

    async fn node_details_by_category(
        &self,
        category: &str,
    ) -> Result<Vec<NodeDetail>, EngineError> {
        let mut rows: Vec<NodeDetail> = self
            .node_details
            .iter()
            .filter(|d| d.category == category)
            .map(|d| d.clone())
            .collect();
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(rows)
    }

    async fn save_webhook(&self, mut record: WebhookRecord) -> Result<String, EngineError> {
        if record.id.trim().is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let id = record.id.clone();
        self.webhooks.insert(id.clone(), record);
        Ok(id)
    }

    async fn update_webhook_status(
        &self,
        webhook_id: &str,
        status: WebhookStatus,
    ) -> Result<(), EngineError> {
        if let Some(mut record) = self.webhooks.get_mut(webhook_id) {
            record.status = status;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "InMemoryFlowStore"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn key() -> UserKey {
        UserKey {
            user_identifier: "919634086404".into(),
            brand_id: 1,
            channel: "whatsapp".into(),
            channel_account_id: None,
        }
    }

    fn keyword_flow() -> Flow {
        serde_json::from_value(json!({
            "id": "f1",
            "name": "welcome",
            "status": "published",
            "brand_id": 1,
            "user_id": 7,
            "flowNodes": [
                {
                    "type": "trigger_keyword",
                    "id": "t1",
                    "flowNodeType": "Trigger",
                    "isStartNode": true,
                    "triggerKeywords": ["learn"]
                }
            ],
            "flowEdges": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn trigger_index_follows_flow_saves() {
        let store = InMemoryFlowStore::new();
        store.create_flow(keyword_flow()).await.unwrap();
        let triggers = store.triggers_for_brand(1).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].trigger_values, vec!["learn".to_string()]);
        assert!(store.triggers_for_brand(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn validation_state_resets_on_automation_exit() {
        let store = InMemoryFlowStore::new();
        store.save_user(UserState::new(key(), 7)).await.unwrap();
        store
            .update_validation_state(&key(), true, Some("try again".into()))
            .await
            .unwrap();
        store
            .update_validation_state(&key(), true, Some("try again".into()))
            .await
            .unwrap();
        let user = store.get_user(&key()).await.unwrap().unwrap();
        assert_eq!(user.validation.failure_count, 2);

        store
            .update_automation_state(&key(), false, None, None)
            .await
            .unwrap();
        let user = store.get_user(&key()).await.unwrap().unwrap();
        assert_eq!(user.validation.failure_count, 0);
        assert!(!user.validation.validation_failed);
    }

    #[tokio::test]
    async fn delays_claim_once_until_released() {
        let store = InMemoryFlowStore::new();
        let now = Utc::now();
        store
            .save_delay(DelayTimer {
                id: "d1".into(),
                key: key(),
                flow_id: "f1".into(),
                delay_node_id: "delay-1".into(),
                wait_time_seconds: 60,
                started_at: now - Duration::seconds(61),
                completes_at: now - Duration::seconds(1),
                processed: false,
            })
            .await
            .unwrap();

        let claimed = store.claim_due_delays(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_due_delays(now).await.unwrap().is_empty());

        store.release_delay("d1").await.unwrap();
        assert_eq!(store.claim_due_delays(now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn variables_snapshot_is_scoped_to_flow() {
        let store = InMemoryFlowStore::new();
        store.set_variable(&key(), "f1", "name", "John").await.unwrap();
        store.set_variable(&key(), "f2", "name", "Jane").await.unwrap();
        let snap = store.variables_snapshot(&key(), "f1").await.unwrap();
        assert_eq!(snap.get("name").map(String::as_str), Some("John"));
        assert_eq!(snap.len(), 1);
    }

    #[tokio::test]
    async fn transaction_counts_group_by_node() {
        let store = InMemoryFlowStore::new();
        for _ in 0..3 {
            store
                .record_transaction(TransactionRecord::new("f1", "m1", "message", key()))
                .await
                .unwrap();
        }
        store
            .record_transaction(TransactionRecord::new("f1", "b1", "button_question", key()))
            .await
            .unwrap();
        let counts = store.transaction_counts("f1").await.unwrap();
        assert_eq!(counts.get("m1"), Some(&3));
        assert_eq!(counts.get("b1"), Some(&1));
    }

    #[tokio::test]
    async fn catalog_is_seeded() {
        let store = InMemoryFlowStore::new();
        let detail = store.node_detail("button_question").await.unwrap().unwrap();
        assert!(detail.user_input_required);
        let detail = store.node_detail("message").await.unwrap().unwrap();
        assert!(!detail.user_input_required);
        let internal = store.node_details_by_category("Condition").await.unwrap();
        assert_eq!(internal.len(), 1);
    }
}
