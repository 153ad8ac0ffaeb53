// src/engine/context.rs

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::engine::EngineError;
use crate::store::{FlowStore, UserKey};

/// Per-(user, brand, flow) key→value store behind `@variable` references.
/// Names are stored without the leading `@`; lookups accept either form.
pub struct VariableContext {
    store: Arc<dyn FlowStore>,
}

impl VariableContext {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        key: &UserKey,
        flow_id: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        self.store.get_variable(key, flow_id, strip_at(name)).await
    }

    pub async fn set(
        &self,
        key: &UserKey,
        flow_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let name = strip_at(name);
        debug!(%key, flow_id, name, "flow variable saved");
        self.store.set_variable(key, flow_id, name, value).await
    }

    pub async fn snapshot(
        &self,
        key: &UserKey,
        flow_id: &str,
    ) -> Result<HashMap<String, String>, EngineError> {
        self.store.variables_snapshot(key, flow_id).await
    }
}

pub fn strip_at(name: &str) -> &str {
    name.trim().trim_start_matches('@')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryFlowStore;

    fn key() -> UserKey {
        UserKey {
            user_identifier: "u1".into(),
            brand_id: 1,
            channel: "whatsapp".into(),
            channel_account_id: None,
        }
    }

    #[tokio::test]
    async fn at_prefix_is_stripped_on_both_paths() {
        let ctx = VariableContext::new(Arc::new(InMemoryFlowStore::new()));
        ctx.set(&key(), "f1", "@name", "John").await.unwrap();
        assert_eq!(ctx.get(&key(), "f1", "name").await.unwrap().as_deref(), Some("John"));
        assert_eq!(ctx.get(&key(), "f1", "@name").await.unwrap().as_deref(), Some("John"));
    }

    #[tokio::test]
    async fn missing_variable_is_none() {
        let ctx = VariableContext::new(Arc::new(InMemoryFlowStore::new()));
        assert_eq!(ctx.get(&key(), "f1", "@missing").await.unwrap(), None);
    }
}
