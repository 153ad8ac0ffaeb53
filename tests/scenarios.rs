// End-to-end scenarios driven through the real user state service with the
// in-memory store and a recording renderer.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use pulseflow::channel::adapter::ChannelAdapter;
use pulseflow::engine::state::EventOutcome;
use pulseflow::engine::{Engine, EventMetadata};
use pulseflow::flow::Flow;
use pulseflow::outbound::{RecordingRenderer, RenderIntent};
use pulseflow::store::{FlowStore, InMemoryFlowStore, UserKey};

const SENDER: &str = "919634086404";

struct Harness {
    store: Arc<InMemoryFlowStore>,
    renderer: Arc<RecordingRenderer>,
    engine: Engine,
    adapter: ChannelAdapter,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryFlowStore::new());
        let renderer = Arc::new(RecordingRenderer::new());
        let engine = Engine::new(store.clone(), renderer.clone(), 20);
        Self {
            store,
            renderer,
            engine,
            adapter: ChannelAdapter::new(),
        }
    }

    async fn publish(&self, flow: serde_json::Value) {
        let flow: Flow = serde_json::from_value(flow).expect("flow json");
        self.store.create_flow(flow).await.expect("create flow");
    }

    fn metadata(&self, message_type: &str) -> EventMetadata {
        EventMetadata {
            sender: SENDER.to_string(),
            brand_id: 1,
            user_id: 7,
            channel: "whatsapp".to_string(),
            channel_account_id: Some("wa-1".to_string()),
            message_type: message_type.to_string(),
        }
    }

    fn user_key(&self) -> UserKey {
        UserKey {
            user_identifier: SENDER.to_string(),
            brand_id: 1,
            channel: "whatsapp".to_string(),
            channel_account_id: Some("wa-1".to_string()),
        }
    }

    async fn send_text(&self, body: &str) -> EventOutcome {
        let payload = json!({"type": "text", "text": {"body": body}});
        let normalized = self.adapter.normalize("whatsapp", "text", &payload);
        self.engine
            .state_service
            .process_event(self.metadata("text"), normalized)
            .await
            .expect("process event")
    }

    async fn user(&self) -> pulseflow::store::UserState {
        self.store
            .get_user(&self.user_key())
            .await
            .expect("store")
            .expect("user exists")
    }

    async fn rendered_texts(&self) -> Vec<String> {
        self.renderer
            .sent()
            .await
            .into_iter()
            .filter_map(|m| match m.intent {
                RenderIntent::Text { body } => Some(body),
                _ => None,
            })
            .collect()
    }
}

fn trigger_node(id: &str, keyword: &str) -> serde_json::Value {
    json!({
        "type": "trigger_keyword",
        "id": id,
        "flowNodeType": "Trigger",
        "isStartNode": true,
        "triggerKeywords": [keyword]
    })
}

fn message_node(id: &str, text: &str) -> serde_json::Value {
    json!({
        "type": "message",
        "id": id,
        "flowNodeType": "Message",
        "flowReplies": [{"flowReplyType": "text", "data": text}]
    })
}

fn edge(id: &str, source: &str, target: &str) -> serde_json::Value {
    json!({"id": id, "sourceNodeId": source, "targetNodeId": target})
}

// S1: a published keyword flow starts, renders its message chain and, with a
// terminal message, exits automation in the same event.
#[tokio::test]
async fn s1_new_trigger_starts_flow_and_exits_at_terminal_message() {
    let h = Harness::new();
    h.publish(json!({
        "id": "F",
        "name": "learn flow",
        "status": "published",
        "brand_id": 1,
        "user_id": 7,
        "flowNodes": [trigger_node("T", "learn"), message_node("M", "hi")],
        "flowEdges": [edge("e1", "T", "M")]
    }))
    .await;

    let outcome = h.send_text("learn").await;
    assert_eq!(outcome, EventOutcome::Triggered { flow_id: "F".into() });

    assert_eq!(h.rendered_texts().await, vec!["hi".to_string()]);

    let counts = h.store.transaction_counts("F").await.unwrap();
    assert_eq!(counts.get("T"), Some(&1));
    assert_eq!(counts.get("M"), Some(&1));

    let user = h.user().await;
    assert!(!user.is_in_automation);
    assert_eq!(user.current_flow_id, None);
    assert_eq!(user.current_node_id, None);
}

// An unpublished flow never triggers and the event is dropped.
#[tokio::test]
async fn draft_flow_does_not_trigger() {
    let h = Harness::new();
    h.publish(json!({
        "id": "F",
        "name": "draft flow",
        "status": "draft",
        "brand_id": 1,
        "user_id": 7,
        "flowNodes": [trigger_node("T", "learn"), message_node("M", "hi")],
        "flowEdges": [edge("e1", "T", "M")]
    }))
    .await;

    assert_eq!(h.send_text("learn").await, EventOutcome::NoTrigger);
    assert!(h.renderer.sent().await.is_empty());
    let user = h.user().await;
    assert!(!user.is_in_automation);
}

fn button_flow() -> serde_json::Value {
    json!({
        "id": "F",
        "name": "button flow",
        "status": "published",
        "brand_id": 1,
        "user_id": 7,
        "flowNodes": [
            trigger_node("T", "start"),
            {
                "type": "button_question",
                "id": "Bq",
                "flowNodeType": "Question",
                "interactiveButtonsBody": "where did you study?",
                "answerValidation": {"type": "", "fallback": "not a valid choice", "failsCount": "2"},
                "expectedAnswers": [
                    {"id": "b1", "expectedInput": "IIT", "isDefault": false, "nodeResultId": "msg2"}
                ]
            },
            message_node("msg2", "great choice"),
            {
                "type": "button_question",
                "id": "Bq2",
                "flowNodeType": "Question",
                "interactiveButtonsBody": "pick a city",
                "expectedAnswers": [
                    {"id": "c1", "expectedInput": "Delhi", "isDefault": false, "nodeResultId": "msg3"}
                ]
            },
            message_node("msg3", "cool city")
        ],
        "flowEdges": [edge("e1", "T", "Bq")]
    })
}

// S2: a reply matching the current button question follows the answer's
// node reference and renders its target.
#[tokio::test]
async fn s2_button_match_advances_through_answer_reference() {
    let h = Harness::new();
    h.publish(button_flow()).await;

    assert!(matches!(h.send_text("start").await, EventOutcome::Triggered { .. }));
    let user = h.user().await;
    assert!(user.is_in_automation);
    assert_eq!(user.current_node_id.as_deref(), Some("Bq"));

    h.renderer.take().await;
    assert_eq!(h.send_text("IIT").await, EventOutcome::Advanced);

    assert_eq!(h.rendered_texts().await, vec!["great choice".to_string()]);
    let counts = h.store.transaction_counts("F").await.unwrap();
    assert_eq!(counts.get("msg2"), Some(&1));

    // msg2 is terminal, so the flow ended in the same event.
    let user = h.user().await;
    assert!(!user.is_in_automation);
    assert_eq!(user.validation.failure_count, 0);
}

// S3: two mismatches with failsCount=2. The first retries with the fallback
// prepended, the second sends the fallback alone and exits automation.
#[tokio::test]
async fn s3_mismatch_retry_then_validation_exit() {
    let h = Harness::new();
    h.publish(button_flow()).await;
    h.send_text("start").await;
    h.renderer.take().await;

    assert_eq!(h.send_text("foo").await, EventOutcome::Advanced);
    let sent = h.renderer.take().await;
    assert_eq!(
        sent[0].intent,
        RenderIntent::Text { body: "not a valid choice".into() }
    );
    assert!(matches!(sent[1].intent, RenderIntent::Buttons { .. }));

    let user = h.user().await;
    assert!(user.is_in_automation);
    assert_eq!(user.current_node_id.as_deref(), Some("Bq"));
    assert_eq!(user.validation.failure_count, 1);
    assert!(user.validation.validation_failed);

    assert_eq!(h.send_text("foo").await, EventOutcome::ValidationExited);
    let sent = h.renderer.take().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].intent,
        RenderIntent::Text { body: "not a valid choice".into() }
    );

    let user = h.user().await;
    assert!(!user.is_in_automation);
    assert_eq!(user.current_flow_id, None);
    assert_eq!(user.validation.failure_count, 0);
}

// S4: a reply that matches another interactive node of the flow jumps to
// that node and makes it current.
#[tokio::test]
async fn s4_cross_node_match_jumps_to_other_question() {
    let h = Harness::new();
    h.publish(button_flow()).await;
    h.send_text("start").await;
    h.renderer.take().await;

    assert_eq!(h.send_text("Delhi").await, EventOutcome::Advanced);

    let sent = h.renderer.take().await;
    assert_eq!(sent.len(), 1);
    match &sent[0].intent {
        RenderIntent::Buttons { body, .. } => assert_eq!(body, "pick a city"),
        other => panic!("expected buttons, got {other:?}"),
    }

    let user = h.user().await;
    assert!(user.is_in_automation);
    assert_eq!(user.current_node_id.as_deref(), Some("Bq2"));
    assert_eq!(user.validation.failure_count, 0);
}

fn delay_flow(duration: i64) -> serde_json::Value {
    json!({
        "id": "F",
        "name": "delay flow",
        "status": "published",
        "brand_id": 1,
        "user_id": 7,
        "flowNodes": [
            trigger_node("T", "go"),
            message_node("M1", "hold on"),
            {
                "type": "delay",
                "id": "D",
                "flowNodeType": "Delay",
                "delayDuration": duration,
                "delayUnit": "seconds",
                "waitForReply": false,
                "delayInterrupt": false,
                "delayResult": [
                    {"id": "D__interrupted", "nodeResultId": null},
                    {"id": "D__not_interrupted", "nodeResultId": "M2"}
                ]
            },
            message_node("M2", "thanks for waiting")
        ],
        "flowEdges": [edge("e1", "T", "M1"), edge("e2", "M1", "D")]
    })
}

// S5 (arming half): entering a delay writes the timer and the delay node
// data and suspends processing.
#[tokio::test]
async fn s5_delay_entry_arms_timer() {
    let h = Harness::new();
    h.publish(delay_flow(60)).await;

    let before = Utc::now();
    assert!(matches!(h.send_text("go").await, EventOutcome::Triggered { .. }));
    assert_eq!(h.rendered_texts().await, vec!["hold on".to_string()]);

    let user = h.user().await;
    assert!(user.is_in_automation);
    assert_eq!(user.current_flow_id.as_deref(), Some("F"));
    assert!(user.delay_node_data.is_some());

    let timer = h
        .store
        .unprocessed_delay_for(&h.user_key())
        .await
        .unwrap()
        .expect("timer exists");
    assert_eq!(timer.delay_node_id, "D");
    assert_eq!(timer.wait_time_seconds, 60);
    let wait = (timer.completes_at - before).num_seconds();
    assert!((59..=61).contains(&wait), "unexpected wait {wait}");

    // Not due yet: a sweep is a no-op.
    h.engine.scheduler.tick().await;
    assert!(h.user().await.delay_node_data.is_some());
}

// S5 (completion half): a due timer resumes the flow at the
// __not_interrupted branch, clears the delay data and marks the timer
// processed.
#[tokio::test]
async fn s5_delay_completion_resumes_flow() {
    let h = Harness::new();
    h.publish(delay_flow(0)).await;
    h.send_text("go").await;
    h.renderer.take().await;
    assert!(h.user().await.delay_node_data.is_some());

    // A reply during the pending delay is consumed, the timer stays.
    assert_eq!(h.send_text("hello?").await, EventOutcome::Ignored);
    assert!(h.renderer.sent().await.is_empty());
    assert!(h.user().await.delay_node_data.is_some());

    h.engine.scheduler.tick().await;

    assert_eq!(h.rendered_texts().await, vec!["thanks for waiting".to_string()]);
    let user = h.user().await;
    assert!(user.delay_node_data.is_none());
    assert!(!user.is_in_automation, "terminal M2 ends the flow");
    assert!(h
        .store
        .unprocessed_delay_for(&h.user_key())
        .await
        .unwrap()
        .is_none());

    // Re-sweeping finds nothing; the completion fired exactly once.
    h.renderer.take().await;
    h.engine.scheduler.tick().await;
    assert!(h.renderer.sent().await.is_empty());
}

// S6: a condition node routes on a variable captured by an earlier text
// question.
#[tokio::test]
async fn s6_condition_branches_on_flow_variable() {
    let h = Harness::new();
    h.publish(json!({
        "id": "F",
        "name": "condition flow",
        "status": "published",
        "brand_id": 1,
        "user_id": 7,
        "flowNodes": [
            trigger_node("T", "hello"),
            {
                "type": "question",
                "id": "Q",
                "flowNodeType": "Question",
                "flowReplies": [{"flowReplyType": "text", "data": "what is your name?"}],
                "userInputVariable": "@name",
                "answerValidation": {"type": "Text"}
            },
            {
                "type": "condition",
                "id": "C",
                "flowNodeType": "Condition",
                "conditionOperator": "None",
                "flowNodeConditions": [
                    {"id": "c1", "flowConditionType": "Equal", "variable": "@name", "value": "John"}
                ],
                "conditionResult": [
                    {"id": "C__true", "nodeResultId": "Myes"},
                    {"id": "C__false", "nodeResultId": "Mno"}
                ]
            },
            message_node("Myes", "welcome back John"),
            message_node("Mno", "nice to meet you")
        ],
        "flowEdges": [edge("e1", "T", "Q"), edge("e2", "Q", "C")]
    }))
    .await;

    h.send_text("hello").await;
    assert_eq!(h.user().await.current_node_id.as_deref(), Some("Q"));
    h.renderer.take().await;

    assert_eq!(h.send_text("John").await, EventOutcome::Advanced);
    assert_eq!(h.rendered_texts().await, vec!["welcome back John".to_string()]);

    let vars = h
        .store
        .variables_snapshot(&h.user_key(), "F")
        .await
        .unwrap();
    assert_eq!(vars.get("name").map(String::as_str), Some("John"));

    // Both the condition and the branch target were entered.
    let counts = h.store.transaction_counts("F").await.unwrap();
    assert_eq!(counts.get("C"), Some(&1));
    assert_eq!(counts.get("Myes"), Some(&1));
    assert_eq!(counts.get("Mno"), None);

    let user = h.user().await;
    assert!(!user.is_in_automation);
}

// Message chains render in order within a single event and stop at the
// first node that awaits input.
#[tokio::test]
async fn message_chain_renders_in_order_and_stops_at_question() {
    let h = Harness::new();
    h.publish(json!({
        "id": "F",
        "name": "chain flow",
        "status": "published",
        "brand_id": 1,
        "user_id": 7,
        "flowNodes": [
            trigger_node("T", "chain"),
            message_node("M1", "one"),
            message_node("M2", "two"),
            {
                "type": "question",
                "id": "Q",
                "flowNodeType": "Question",
                "flowReplies": [{"flowReplyType": "text", "data": "three?"}],
                "userInputVariable": "@answer",
                "answerValidation": {"type": ""}
            }
        ],
        "flowEdges": [
            edge("e1", "T", "M1"),
            edge("e2", "M1", "M2"),
            edge("e3", "M2", "Q")
        ]
    }))
    .await;

    h.send_text("chain").await;
    assert_eq!(
        h.rendered_texts().await,
        vec!["one".to_string(), "two".to_string(), "three?".to_string()]
    );
    let user = h.user().await;
    assert!(user.is_in_automation);
    assert_eq!(user.current_node_id.as_deref(), Some("Q"));

    // Invariant: in automation implies a flow id.
    assert!(user.current_flow_id.is_some());
}
