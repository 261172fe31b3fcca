use crate::aggregate::{AggregationWindow, TurnSink};
use crate::catalog::{Catalog, ImageContextCache, Product};
use crate::dedup::DedupRegistry;
use crate::delivery::Delivery;
use crate::dispatch::Dispatcher;
use crate::llm::{ClassifyContext, Inference};
use crate::models::{OutboundResponse, RawEvent, ReducedTurn};
use crate::normalize::{self, IGNORED_QUICK_REPLIES};
use crate::store::HistoryStore;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// History depth handed to the classifier.
const CLASSIFY_HISTORY: usize = 6;
/// History depth handed to the conversational responder.
const RESPOND_HISTORY: usize = 10;

const CLASSIFY_APOLOGY: &str =
    "Dạ em chưa hiểu ý chị/anh lắm, mình nhắn lại giúp em với nhé!";
const VISION_APOLOGY: &str =
    "Xin lỗi, em đang gặp lỗi khi xử lý ảnh ạ. Chị/anh gửi lại hoặc mô tả sản phẩm giúp em nhé!";

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct AgentError {
    stage: &'static str,
    message: String,
}

impl AgentError {
    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }
}

/// Consumes reduced turns from the aggregation window: classify, dispatch,
/// persist, deliver. Image-bearing turns take the vision path instead.
pub struct TurnProcessor {
    catalog: Catalog,
    image_context: Arc<ImageContextCache>,
    dispatcher: Dispatcher,
    inference: Arc<dyn Inference>,
    history: Arc<dyn HistoryStore>,
    delivery: Arc<dyn Delivery>,
}

impl TurnProcessor {
    pub fn new(
        catalog: Catalog,
        image_context: Arc<ImageContextCache>,
        dispatcher: Dispatcher,
        inference: Arc<dyn Inference>,
        history: Arc<dyn HistoryStore>,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            catalog,
            image_context,
            dispatcher,
            inference,
            history,
            delivery,
        }
    }

    async fn text_turn(
        &self,
        sender: &str,
        text: &str,
    ) -> Result<OutboundResponse, AgentError> {
        let history = self.history.recent(sender, RESPOND_HISTORY).await;
        let classify_tail = if history.len() > CLASSIFY_HISTORY {
            &history[history.len() - CLASSIFY_HISTORY..]
        } else {
            &history[..]
        };
        let summary = self.catalog.summary();
        let recent_products: Vec<String> = self
            .image_context
            .recent(sender)
            .await
            .into_iter()
            .map(|entry| entry.product.product)
            .collect();

        let classified = self
            .inference
            .classify(&ClassifyContext {
                text,
                history: classify_tail,
                catalog_summary: &summary,
                recent_products: &recent_products,
            })
            .await
            .map_err(|err| AgentError::upstream("classify", err.to_string()))?;

        Ok(self
            .dispatcher
            .dispatch(sender, text, &classified, &history)
            .await)
    }

    async fn vision_turn(
        &self,
        sender: &str,
        turn: &ReducedTurn,
    ) -> Result<Vec<OutboundResponse>, AgentError> {
        let image_url = turn.image_url.as_deref().unwrap_or_default();
        let summary = self.catalog.summary();
        let matched = self
            .inference
            .match_image(image_url, &summary)
            .await
            .map_err(|err| AgentError::upstream("match_image", err.to_string()))?;

        let product = find_product(&self.catalog, &matched);
        let Some(product) = product else {
            info!(
                target = "boutique.agent",
                sender, matched, "customer photo matched nothing in the catalog"
            );
            return Ok(vec![OutboundResponse::text(
                "Xin lỗi, em không nhận ra sản phẩm trong ảnh ạ. \
                 Chị/anh mô tả thêm giúp em nhé!",
            )]);
        };

        self.image_context
            .record(sender, &product.image_url, &product)
            .await;

        let mut content = format!(
            "Dạ ảnh chị/anh gửi rất giống mẫu {} bên em ạ. Giá {}. {}",
            product.product, product.price, product.product_details
        );
        if !turn.text.trim().is_empty() {
            content = format!("{}\n{content}", turn.text.trim());
        }
        Ok(vec![
            OutboundResponse::text(content),
            OutboundResponse::Image {
                urls: vec![product.image_url.clone()],
            },
        ])
    }
}

#[async_trait]
impl TurnSink for TurnProcessor {
    async fn flush(&self, sender: &str, turn: ReducedTurn) {
        let flush_start = std::time::Instant::now();
        if !turn.text.trim().is_empty() {
            self.history.append(sender, "user", turn.text.trim()).await;
        }

        if turn.image_url.is_some() {
            match self.vision_turn(sender, &turn).await {
                Ok(responses) => {
                    for response in responses {
                        self.history
                            .append(sender, "assistant", &response.history_content())
                            .await;
                        self.delivery.deliver(sender, &response).await;
                    }
                }
                Err(error) => {
                    warn!(
                        target = "boutique.agent",
                        sender,
                        stage = error.stage(),
                        error = %error,
                        "vision turn failed"
                    );
                    // The apology lands in history too so the next turn's
                    // classifier sees it.
                    self.history.append(sender, "assistant", VISION_APOLOGY).await;
                    self.delivery
                        .deliver(sender, &OutboundResponse::text(VISION_APOLOGY))
                        .await;
                }
            }
            crate::metrics::turn_elapsed(flush_start.elapsed().as_millis());
            return;
        }

        match self.text_turn(sender, turn.text.trim()).await {
            Ok(response) => {
                self.history
                    .append(sender, "assistant", &response.history_content())
                    .await;
                self.delivery.deliver(sender, &response).await;
            }
            Err(error) => {
                warn!(
                    target = "boutique.agent",
                    sender,
                    stage = error.stage(),
                    error = %error,
                    "turn failed"
                );
                self.history
                    .append(sender, "assistant", CLASSIFY_APOLOGY)
                    .await;
                self.delivery
                    .deliver(sender, &OutboundResponse::text(CLASSIFY_APOLOGY))
                    .await;
            }
        }
        crate::metrics::turn_elapsed(flush_start.elapsed().as_millis());
    }
}

fn find_product(catalog: &Catalog, name: &str) -> Option<Product> {
    let folded = name.trim().to_lowercase();
    if folded.is_empty() {
        return None;
    }
    catalog
        .products()
        .iter()
        .find(|product| product.product.to_lowercase() == folded)
        .cloned()
}

/// Webhook-facing entry point: normalize, filter, dedup, admit.
pub struct Agent {
    dedup: Arc<DedupRegistry>,
    window: Arc<AggregationWindow>,
}

impl Agent {
    pub fn new(dedup: Arc<DedupRegistry>, window: Arc<AggregationWindow>) -> Self {
        Self { dedup, window }
    }

    /// True when the platform has redelivered an already-processed message.
    /// Checked at the webhook boundary so redeliveries never charge the
    /// sender's rate-limit bucket. Synthetic ids are never duplicates.
    pub async fn is_duplicate(&self, event: &RawEvent) -> bool {
        match normalize::message_id(event).dedup_key() {
            Some(mid) => self.dedup.is_processed(&event.sender.id, mid).await,
            None => false,
        }
    }

    pub async fn on_event(&self, event: &RawEvent) {
        let sender = event.sender.id.as_str();
        let normalized = normalize::normalize(event);

        if normalized.is_quick_reply
            && IGNORED_QUICK_REPLIES.contains(&normalized.text.as_str())
        {
            debug!(
                target = "boutique.agent",
                sender,
                payload = normalized.text,
                "ignored quick reply dropped"
            );
            return;
        }
        if normalized.text.trim().is_empty() && normalized.image_url.is_none() {
            // Delivery receipts, reactions and other contentless events.
            return;
        }

        if let Some(mid) = normalize::message_id(event).dedup_key() {
            if self.dedup.is_processed(sender, mid).await {
                debug!(target = "boutique.agent", sender, mid, "duplicate delivery dropped");
                return;
            }
            self.dedup.mark_processed(sender, mid).await;
        }

        self.window.admit(sender, normalized).await;
    }
}
