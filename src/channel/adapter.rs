// src/channel/adapter.rs
//
// One normalizer per channel plus a generic fallback. Adding a channel means
// adding one normalizer here and the matching entries in the outbound
// renderer; nothing else in the engine changes.

use serde_json::Value;
use tracing::warn;

use super::{InteractiveType, NormalizedMessage};

#[derive(Debug, Clone, Default)]
pub struct ChannelAdapter;

impl ChannelAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, channel: &str, message_type: &str, payload: &Value) -> NormalizedMessage {
        // System events are channel-independent.
        if message_type == "delay_complete" {
            return normalize_delay_complete(payload);
        }

        match channel.to_ascii_lowercase().as_str() {
            "whatsapp" => normalize_whatsapp(message_type, payload),
            "gmail" | "email" => normalize_email(payload),
            "telegram" => normalize_telegram(message_type, payload),
            "sms" => normalize_sms(payload),
            "instagram" => normalize_instagram(message_type, payload),
            "facebook" => normalize_facebook(message_type, payload),
            other => {
                warn!(channel = other, "unknown channel, using generic normalizer");
                normalize_generic(payload)
            }
        }
    }
}

/// WhatsApp Cloud API shapes. Text precedence: interactive selection title,
/// then button text (payload as fallback), then text body; media messages
/// surface their caption.
fn normalize_whatsapp(message_type: &str, payload: &Value) -> NormalizedMessage {
    let mut msg = NormalizedMessage {
        raw: payload.clone(),
        ..Default::default()
    };

    match message_type {
        "text" => {
            msg.text = str_at(payload, &["text", "body"]);
        }
        "button" => {
            msg.button_text = str_at(payload, &["button", "text"]);
            msg.button_payload = str_at(payload, &["button", "payload"]);
            if msg.button_text.is_none() {
                msg.button_text = msg.button_payload.clone();
            }
        }
        "interactive" => {
            let interactive = &payload["interactive"];
            match interactive["type"].as_str() {
                Some("button_reply") => {
                    msg.interactive_type = InteractiveType::ButtonReply;
                    msg.interactive_value = str_at(interactive, &["button_reply", "title"])
                        .or_else(|| str_at(interactive, &["button_reply", "id"]));
                    msg.button_payload = str_at(interactive, &["button_reply", "id"]);
                }
                Some("list_reply") => {
                    msg.interactive_type = InteractiveType::ListReply;
                    msg.interactive_value = str_at(interactive, &["list_reply", "title"])
                        .or_else(|| str_at(interactive, &["list_reply", "id"]));
                    msg.button_payload = str_at(interactive, &["list_reply", "id"]);
                }
                _ => {}
            }
        }
        "image" | "video" | "audio" | "document" => {
            msg.media_type = Some(message_type.to_string());
            let media = &payload[message_type];
            msg.media_url = str_at(media, &["url"]).or_else(|| str_at(media, &["link"]));
            msg.text = str_at(media, &["caption"]);
        }
        _ => {}
    }
    msg
}

/// Email carries its content in subject + body; `get_text_content` joins
/// them with a newline.
fn normalize_email(payload: &Value) -> NormalizedMessage {
    NormalizedMessage {
        subject: str_at(payload, &["subject"]),
        body: str_at(payload, &["body"]).or_else(|| str_at(payload, &["text"])),
        raw: payload.clone(),
        ..Default::default()
    }
}

fn normalize_telegram(message_type: &str, payload: &Value) -> NormalizedMessage {
    let mut msg = NormalizedMessage {
        raw: payload.clone(),
        ..Default::default()
    };
    if message_type == "callback_query" {
        msg.interactive_type = InteractiveType::ButtonReply;
        msg.interactive_value = str_at(payload, &["callback_query", "data"]);
        msg.button_payload = msg.interactive_value.clone();
        return msg;
    }
    // Telegram wraps the text in a `message` object; tolerate a flat shape.
    msg.text = str_at(payload, &["message", "text"]).or_else(|| str_at(payload, &["text"]));
    msg
}

fn normalize_sms(payload: &Value) -> NormalizedMessage {
    NormalizedMessage {
        text: str_at(payload, &["text"])
            .or_else(|| str_at(payload, &["body"]))
            .or_else(|| str_at(payload, &["message"])),
        raw: payload.clone(),
        ..Default::default()
    }
}

fn normalize_instagram(_message_type: &str, payload: &Value) -> NormalizedMessage {
    NormalizedMessage {
        text: str_at(payload, &["text"]).or_else(|| str_at(payload, &["message", "text"])),
        raw: payload.clone(),
        ..Default::default()
    }
}

fn normalize_facebook(message_type: &str, payload: &Value) -> NormalizedMessage {
    let mut msg = NormalizedMessage {
        raw: payload.clone(),
        ..Default::default()
    };
    if message_type == "postback" {
        msg.button_text = str_at(payload, &["postback", "title"]);
        msg.button_payload = str_at(payload, &["postback", "payload"]);
        if msg.button_text.is_none() {
            msg.button_text = msg.button_payload.clone();
        }
        return msg;
    }
    msg.text = str_at(payload, &["message", "text"]);
    msg
}

/// Unknown channels: look for a text-ish field, otherwise return an empty
/// message. Never fails.
fn normalize_generic(payload: &Value) -> NormalizedMessage {
    let text = str_at(payload, &["text"])
        .or_else(|| str_at(payload, &["body"]))
        .or_else(|| str_at(payload, &["message"]))
        .or_else(|| str_at(payload, &["content"]))
        .or_else(|| str_at(payload, &["text", "body"]))
        .or_else(|| str_at(payload, &["message", "text"]));
    NormalizedMessage {
        text,
        raw: payload.clone(),
        ..Default::default()
    }
}

/// Synthetic scheduler event. Carries only the user-state id of the user to
/// resume.
fn normalize_delay_complete(payload: &Value) -> NormalizedMessage {
    let user_state_id = str_at(payload, &["user_identifier"])
        .or_else(|| str_at(payload, &["user_state_id"]));
    NormalizedMessage {
        raw: match user_state_id {
            Some(id) => serde_json::json!({ "user_state_id": id }),
            None => serde_json::json!({}),
        },
        ..Default::default()
    }
}

/// Walk `path` through nested objects and return the trimmed string there,
/// if any.
fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whatsapp_text() {
        let adapter = ChannelAdapter::new();
        let payload = json!({"type": "text", "text": {"body": "  learn  "}});
        let msg = adapter.normalize("whatsapp", "text", &payload);
        assert_eq!(msg.get_text_content(), "learn");
    }

    #[test]
    fn whatsapp_button_reply_carries_payload() {
        let adapter = ChannelAdapter::new();
        let payload = json!({
            "interactive": {
                "type": "button_reply",
                "button_reply": {"id": "b1", "title": "IIT"}
            }
        });
        let msg = adapter.normalize("whatsapp", "interactive", &payload);
        assert_eq!(msg.interactive_type, InteractiveType::ButtonReply);
        assert_eq!(msg.get_text_content(), "IIT");
        assert_eq!(msg.button_payload.as_deref(), Some("b1"));
    }

    #[test]
    fn whatsapp_media_caption_is_text() {
        let adapter = ChannelAdapter::new();
        let payload = json!({"image": {"link": "https://cdn/img.png", "caption": "receipt"}});
        let msg = adapter.normalize("whatsapp", "image", &payload);
        assert_eq!(msg.media_type.as_deref(), Some("image"));
        assert_eq!(msg.media_url.as_deref(), Some("https://cdn/img.png"));
        assert_eq!(msg.get_text_content(), "receipt");
    }

    #[test]
    fn email_subject_and_body() {
        let adapter = ChannelAdapter::new();
        let payload = json!({"subject": "order", "body": "where is it"});
        let msg = adapter.normalize("gmail", "email", &payload);
        assert_eq!(msg.get_text_content(), "order\nwhere is it");
    }

    #[test]
    fn telegram_callback_query() {
        let adapter = ChannelAdapter::new();
        let payload = json!({"callback_query": {"data": "opt_2"}});
        let msg = adapter.normalize("telegram", "callback_query", &payload);
        assert_eq!(msg.get_text_content(), "opt_2");
    }

    #[test]
    fn unknown_channel_never_fails() {
        let adapter = ChannelAdapter::new();
        let msg = adapter.normalize("pigeon", "text", &json!({"weird": true}));
        assert_eq!(msg.get_text_content(), "");
        let msg = adapter.normalize("pigeon", "text", &json!({"text": "coo"}));
        assert_eq!(msg.get_text_content(), "coo");
    }

    #[test]
    fn delay_complete_keeps_only_user_state_id() {
        let adapter = ChannelAdapter::new();
        let payload = json!({
            "user_identifier": "919634086404",
            "flow_id": "f1",
            "node_id": "d1"
        });
        let msg = adapter.normalize("system", "delay_complete", &payload);
        assert_eq!(msg.user_state_id(), Some("919634086404"));
        assert_eq!(msg.get_text_content(), "");
    }
}
