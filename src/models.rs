use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level webhook delivery. The platform batches events from several
/// conversations into one POST body.
#[derive(Debug, Clone, Deserialize)]
pub struct PageEnvelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<PageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageEntry {
    #[serde(default)]
    pub messaging: Vec<RawEvent>,
}

/// One inbound messaging event as delivered by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub sender: Participant,
    #[serde(default)]
    pub message: Option<RawMessage>,
    #[serde(default)]
    pub postback: Option<RawPostback>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    /// Platform-assigned message id. Absent on synthesized events
    /// (comment-to-message conversions deliver without one).
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quick_reply: Option<QuickReply>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuickReply {
    pub payload: String,
}

/// Postback payloads are usually strings but third-party composers send
/// structured objects; normalization digs a usable string out of either.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPostback {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: AttachmentPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub url: Option<String>,
}

/// Canonical shape extracted from one raw event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub text: String,
    pub image_url: Option<String>,
    pub is_quick_reply: bool,
}

/// One logical conversational turn, reduced from a burst of events:
/// last non-empty text, first non-empty image URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReducedTurn {
    pub text: String,
    pub image_url: Option<String>,
}

impl ReducedTurn {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image_url.is_none()
    }
}

/// Classified purpose of a turn, produced by the external classifier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifiedIntent {
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub entities: Entities,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Image,
    ProductDetails,
    Price,
    Size,
    SizeChart,
    Color,
    OrderInfo,
    #[default]
    #[serde(other)]
    General,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Entities {
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub height: String,
    #[serde(default)]
    pub bargain_price: String,
    #[serde(default)]
    pub order_info: Option<OrderFields>,
}

/// The seven tracked order fields. Doubles as the per-sender partial order:
/// empty string means "not yet supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFields {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub quantity: String,
}

/// Typed reply handed to the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundResponse {
    Text { content: String },
    Image { urls: Vec<String> },
    Order { content: String },
}

impl OutboundResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Text content for history persistence; image replies are recorded
    /// by their URLs.
    pub fn history_content(&self) -> String {
        match self {
            Self::Text { content } | Self::Order { content } => content.clone(),
            Self::Image { urls } => urls.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let trimmed = full.trim();
        if trimmed.is_empty() {
            "khách".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_parses_known_and_unknown() {
        let known: Intent = serde_json::from_str("\"size_chart\"").unwrap();
        assert_eq!(known, Intent::SizeChart);
        let unknown: Intent = serde_json::from_str("\"smalltalk\"").unwrap();
        assert_eq!(unknown, Intent::General);
    }

    #[test]
    fn classified_intent_tolerates_missing_entities() {
        let parsed: ClassifiedIntent = serde_json::from_str(r#"{"intent":"price"}"#).unwrap();
        assert_eq!(parsed.intent, Intent::Price);
        assert!(parsed.entities.product.is_empty());
        assert!(parsed.entities.order_info.is_none());
    }

    #[test]
    fn envelope_parses_message_event() {
        let body = r#"{
            "object": "page",
            "entry": [{"messaging": [{
                "sender": {"id": "u1"},
                "message": {"mid": "m-1", "text": "xin chào"}
            }]}]
        }"#;
        let envelope: PageEnvelope = serde_json::from_str(body).unwrap();
        let event = &envelope.entry[0].messaging[0];
        assert_eq!(event.sender.id, "u1");
        assert_eq!(
            event.message.as_ref().unwrap().text.as_deref(),
            Some("xin chào")
        );
    }

    #[test]
    fn profile_display_name_falls_back() {
        assert_eq!(UserProfile::default().display_name(), "khách");
        let profile = UserProfile {
            first_name: "Lan".into(),
            last_name: "Phạm".into(),
        };
        assert_eq!(profile.display_name(), "Lan Phạm");
    }
}
