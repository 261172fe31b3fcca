use crate::http::build_client;
use crate::models::OutboundResponse;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

/// Hard platform limit on a single text message.
const MAX_TEXT_CHARS: usize = 640;

const MAX_ATTEMPTS: u32 = 3;

/// Outbound channel back to the customer. Delivery is fire-and-forget from
/// the pipeline's point of view; failures are logged, never propagated.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, recipient: &str, response: &OutboundResponse);
}

/// Graph send-API client. Image responses fan out into one message per URL,
/// in order, so albums arrive as the catalog lists them.
pub struct GraphDelivery {
    access_token: String,
    graph_url: String,
    http: Client,
}

impl GraphDelivery {
    pub fn from_env() -> Option<Self> {
        let access_token = std::env::var("PAGE_ACCESS_TOKEN").ok()?;
        Some(Self {
            access_token,
            graph_url: std::env::var("GRAPH_API_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com/v21.0".into()),
            http: build_client(),
        })
    }

    async fn send_payload(&self, recipient: &str, payload: Value) {
        let url = format!(
            "{}/me/messages?access_token={}",
            self.graph_url, self.access_token
        );
        for attempt in 1..=MAX_ATTEMPTS {
            let result = self.http.post(&url).json(&payload).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(target = "boutique.delivery", recipient, "message delivered");
                    return;
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    if attempt == MAX_ATTEMPTS {
                        warn!(
                            target = "boutique.delivery",
                            recipient, "rate limited, giving up"
                        );
                        return;
                    }
                    let backoff = backoff_with_jitter(attempt);
                    warn!(
                        target = "boutique.delivery",
                        recipient,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    sleep(backoff).await;
                }
                Ok(response) => {
                    warn!(
                        target = "boutique.delivery",
                        recipient,
                        status = %response.status(),
                        "send rejected"
                    );
                    return;
                }
                Err(error) => {
                    warn!(
                        target = "boutique.delivery",
                        recipient,
                        error = %error,
                        "send failed"
                    );
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Delivery for GraphDelivery {
    async fn deliver(&self, recipient: &str, response: &OutboundResponse) {
        match response {
            OutboundResponse::Text { content } => {
                self.send_payload(recipient, text_payload(recipient, content))
                    .await;
            }
            OutboundResponse::Image { urls } => {
                for url in urls {
                    self.send_payload(recipient, image_payload(recipient, url))
                        .await;
                }
            }
            OutboundResponse::Order { content } => {
                self.send_payload(recipient, order_payload(recipient, content))
                    .await;
            }
        }
    }
}

/// Development fallback when no page token is configured: replies land in
/// the log instead of a chat thread.
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, recipient: &str, response: &OutboundResponse) {
        debug!(
            target = "boutique.delivery",
            recipient,
            response = ?response,
            "delivery skipped (no PAGE_ACCESS_TOKEN)"
        );
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = 500u64 * 2u64.pow(attempt - 1);
    let jitter = rand::rng().random_range(0..250);
    Duration::from_millis(base + jitter)
}

fn text_payload(recipient: &str, content: &str) -> Value {
    json!({
        "recipient": {"id": recipient},
        "messaging_type": "RESPONSE",
        "message": {"text": clip_text(content)},
    })
}

fn image_payload(recipient: &str, url: &str) -> Value {
    json!({
        "recipient": {"id": recipient},
        "messaging_type": "RESPONSE",
        "message": {
            "attachment": {
                "type": "image",
                "payload": {"url": url, "is_reusable": true},
            }
        },
    })
}

/// Order confirmations may land outside the 24h response window, so they go
/// out under the post-purchase message tag.
fn order_payload(recipient: &str, content: &str) -> Value {
    json!({
        "recipient": {"id": recipient},
        "messaging_type": "MESSAGE_TAG",
        "tag": "POST_PURCHASE_UPDATE",
        "message": {"text": clip_text(content)},
    })
}

fn clip_text(content: &str) -> String {
    if content.chars().count() <= MAX_TEXT_CHARS {
        return content.to_string();
    }
    content.chars().take(MAX_TEXT_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_shape() {
        let payload = text_payload("u1", "chào chị ạ");
        assert_eq!(payload["recipient"]["id"], "u1");
        assert_eq!(payload["messaging_type"], "RESPONSE");
        assert_eq!(payload["message"]["text"], "chào chị ạ");
    }

    #[test]
    fn image_payload_is_reusable() {
        let payload = image_payload("u1", "https://cdn.example/a.jpg");
        let attachment = &payload["message"]["attachment"];
        assert_eq!(attachment["type"], "image");
        assert_eq!(attachment["payload"]["url"], "https://cdn.example/a.jpg");
        assert_eq!(attachment["payload"]["is_reusable"], true);
    }

    #[test]
    fn order_payload_uses_post_purchase_tag() {
        let payload = order_payload("u1", "đã lưu đơn");
        assert_eq!(payload["messaging_type"], "MESSAGE_TAG");
        assert_eq!(payload["tag"], "POST_PURCHASE_UPDATE");
    }

    #[test]
    fn long_text_clipped_on_char_boundary() {
        let long = "đ".repeat(1000);
        let clipped = clip_text(&long);
        assert_eq!(clipped.chars().count(), MAX_TEXT_CHARS);
        assert!(clipped.chars().all(|c| c == 'đ'));
    }

    #[test]
    fn backoff_grows_per_attempt() {
        let first = backoff_with_jitter(1);
        let second = backoff_with_jitter(2);
        assert!(first >= Duration::from_millis(500));
        assert!(first < Duration::from_millis(750));
        assert!(second >= Duration::from_millis(1000));
        assert!(second < Duration::from_millis(1250));
    }
}
