use crate::models::{NormalizedEvent, RawEvent};
use serde_json::Value;
use uuid::Uuid;

/// Quick-reply payloads that never reach the pipeline (reaction buttons and
/// the built-in help chips handled client-side).
pub const IGNORED_QUICK_REPLIES: &[&str] = &["LIKE", "YES", "NO", "HELP"];

/// Extract the canonical `{text, image_url, is_quick_reply}` shape from a raw
/// event. Priority when several fields are populated: quick-reply payload,
/// then postback payload, then free text. Never fails; absent fields yield
/// an empty string or `None`.
pub fn normalize(event: &RawEvent) -> NormalizedEvent {
    let mut text = String::new();
    let mut is_quick_reply = false;

    if let Some(quick_reply) = event
        .message
        .as_ref()
        .and_then(|message| message.quick_reply.as_ref())
    {
        text = quick_reply.payload.clone();
        is_quick_reply = true;
    } else if let Some(postback) = &event.postback {
        text = postback_text(&postback.payload);
    } else if let Some(raw) = event.message.as_ref().and_then(|m| m.text.as_ref()) {
        text = raw.clone();
    }

    NormalizedEvent {
        text,
        image_url: first_image_url(event),
        is_quick_reply,
    }
}

/// First `image` attachment only; later attachments in the same event are
/// ignored.
fn first_image_url(event: &RawEvent) -> Option<String> {
    event.message.as_ref().and_then(|message| {
        message
            .attachments
            .iter()
            .find(|attachment| attachment.kind == "image")
            .and_then(|attachment| attachment.payload.url.clone())
            .filter(|url| !url.is_empty())
    })
}

/// Postbacks normally carry a string payload; structured payloads fall back
/// to a `url` or `text` field, then to any short string value.
fn postback_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Object(map) => {
            for key in ["url", "text"] {
                if let Some(Value::String(value)) = map.get(key)
                    && !value.is_empty()
                {
                    return value.clone();
                }
            }
            map.values()
                .find_map(|value| match value {
                    Value::String(s) if s.starts_with("http") || s.len() < 100 => Some(s.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "[postback]".to_string())
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Stable identifier for deduplication. Events without a platform-assigned
/// `mid` get a synthetic id that is unique per delivery, so retries of such
/// events cannot be deduplicated (accepted gap).
pub fn message_id(event: &RawEvent) -> MessageId {
    match event
        .message
        .as_ref()
        .and_then(|message| message.mid.clone())
        .filter(|mid| !mid.is_empty())
    {
        Some(mid) => MessageId::Platform(mid),
        None => MessageId::Synthetic(format!("{}:{}", event.sender.id, Uuid::new_v4())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageId {
    Platform(String),
    Synthetic(String),
}

impl MessageId {
    /// The registry only tracks platform-assigned ids.
    pub fn dedup_key(&self) -> Option<&str> {
        match self {
            Self::Platform(mid) => Some(mid),
            Self::Synthetic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Attachment, AttachmentPayload, Participant, QuickReply, RawMessage, RawPostback,
    };
    use serde_json::json;

    fn base_event() -> RawEvent {
        RawEvent {
            sender: Participant { id: "u1".into() },
            message: None,
            postback: None,
        }
    }

    #[test]
    fn quick_reply_wins_over_text() {
        let mut event = base_event();
        event.message = Some(RawMessage {
            mid: Some("m1".into()),
            text: Some("typed text".into()),
            quick_reply: Some(QuickReply {
                payload: "SIZE_M".into(),
            }),
            attachments: vec![],
        });
        let normalized = normalize(&event);
        assert_eq!(normalized.text, "SIZE_M");
        assert!(normalized.is_quick_reply);
    }

    #[test]
    fn postback_wins_over_free_text() {
        let mut event = base_event();
        event.message = Some(RawMessage {
            text: Some("hello".into()),
            ..Default::default()
        });
        event.postback = Some(RawPostback {
            payload: json!("VIEW_CATALOG"),
        });
        let normalized = normalize(&event);
        assert_eq!(normalized.text, "VIEW_CATALOG");
        assert!(!normalized.is_quick_reply);
    }

    #[test]
    fn structured_postback_prefers_url_field() {
        let mut event = base_event();
        event.postback = Some(RawPostback {
            payload: json!({"title": "x".repeat(200), "url": "https://shop.example/p/1"}),
        });
        assert_eq!(normalize(&event).text, "https://shop.example/p/1");
    }

    #[test]
    fn takes_first_image_attachment_only() {
        let mut event = base_event();
        event.message = Some(RawMessage {
            attachments: vec![
                Attachment {
                    kind: "file".into(),
                    payload: AttachmentPayload {
                        url: Some("https://cdn.example/doc.pdf".into()),
                    },
                },
                Attachment {
                    kind: "image".into(),
                    payload: AttachmentPayload {
                        url: Some("https://cdn.example/a.jpg".into()),
                    },
                },
                Attachment {
                    kind: "image".into(),
                    payload: AttachmentPayload {
                        url: Some("https://cdn.example/b.jpg".into()),
                    },
                },
            ],
            ..Default::default()
        });
        let normalized = normalize(&event);
        assert_eq!(
            normalized.image_url.as_deref(),
            Some("https://cdn.example/a.jpg")
        );
        assert!(normalized.text.is_empty());
    }

    #[test]
    fn absent_fields_yield_empty_shape() {
        let normalized = normalize(&base_event());
        assert_eq!(normalized, NormalizedEvent::default());
    }

    #[test]
    fn synthetic_id_when_mid_missing() {
        let mut event = base_event();
        event.message = Some(RawMessage {
            text: Some("hi".into()),
            ..Default::default()
        });
        let id = message_id(&event);
        assert!(id.dedup_key().is_none());
        match id {
            MessageId::Synthetic(value) => assert!(value.starts_with("u1:")),
            MessageId::Platform(_) => panic!("expected synthetic id"),
        }
    }
}
