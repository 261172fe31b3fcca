use crate::catalog::{ImageContextCache, Product, ProductResolver};
use crate::llm::Inference;
use crate::models::{ClassifiedIntent, Intent, OutboundResponse};
use crate::orders::OrderAccumulator;
use crate::store::{HistoryEntry, ProfileStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Phrasings that signal an unfocused wish to buy; answered with a catalog
/// overview instead of a bare conversational reply.
const VAGUE_PURCHASE_MARKERS: &[&str] = &["muốn mua", "có bán", "bán gì", "shop có gì", "có những gì"];

const NOT_FOUND: &str =
    "Xin lỗi, em chưa tìm thấy sản phẩm phù hợp ạ. Chị/anh mô tả rõ hơn giúp em nhé!";

/// Stateless intent switch. Turns a classified turn into one outbound
/// response, consulting the catalog, the order accumulator and the responder.
pub struct Dispatcher {
    resolver: Arc<ProductResolver>,
    image_context: Arc<ImageContextCache>,
    orders: Arc<OrderAccumulator>,
    inference: Arc<dyn Inference>,
    profiles: Arc<dyn ProfileStore>,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<ProductResolver>,
        image_context: Arc<ImageContextCache>,
        orders: Arc<OrderAccumulator>,
        inference: Arc<dyn Inference>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            resolver,
            image_context,
            orders,
            inference,
            profiles,
        }
    }

    pub async fn dispatch(
        &self,
        sender: &str,
        turn_text: &str,
        classified: &ClassifiedIntent,
        history: &[HistoryEntry],
    ) -> OutboundResponse {
        let entities = &classified.entities;
        debug!(
            target = "boutique.agent",
            sender,
            intent = ?classified.intent,
            product = entities.product,
            "dispatching turn"
        );

        let response = match classified.intent {
            Intent::Image => self.handle_image(sender, entities).await,
            Intent::ProductDetails | Intent::Price => {
                self.handle_product_info(sender, turn_text, classified, history)
                    .await
            }
            Intent::Size => self.handle_size(sender, turn_text, entities, history).await,
            Intent::SizeChart => self.handle_size_chart(sender, entities).await,
            Intent::Color => self.handle_color(sender, entities).await,
            Intent::OrderInfo => self.orders.handle(sender, entities).await,
            Intent::General => self.handle_general(turn_text, history).await,
        };

        // Order prompts stay focused on the missing fields; a "want to see
        // more styles?" tail would bury the request.
        if classified.intent == Intent::OrderInfo {
            return response;
        }
        self.with_follow_up(response, history).await
    }

    async fn handle_image(
        &self,
        sender: &str,
        entities: &crate::models::Entities,
    ) -> OutboundResponse {
        let hits = self
            .resolver
            .search(
                &entities.product,
                &entities.category,
                &entities.color,
                Some(sender),
            )
            .await;
        let mut urls = Vec::new();
        for product in &hits {
            if product.image_url.is_empty() || urls.contains(&product.image_url) {
                continue;
            }
            urls.push(product.image_url.clone());
            self.image_context
                .record(sender, &product.image_url, product)
                .await;
        }
        if urls.is_empty() {
            return OutboundResponse::text(
                "Xin lỗi, em chưa tìm thấy ảnh sản phẩm phù hợp ạ. \
                 Chị/anh mô tả rõ hơn giúp em nhé!",
            );
        }
        OutboundResponse::Image { urls }
    }

    async fn handle_product_info(
        &self,
        sender: &str,
        turn_text: &str,
        classified: &ClassifiedIntent,
        history: &[HistoryEntry],
    ) -> OutboundResponse {
        let entities = &classified.entities;
        let hits = self
            .resolver
            .search(
                &entities.product,
                &entities.category,
                &entities.color,
                Some(sender),
            )
            .await;
        let Some(best) = hits.first() else {
            return OutboundResponse::text(NOT_FOUND);
        };

        let mut prompt = product_prompt(turn_text, best);
        if classified.intent == Intent::Price && !entities.bargain_price.is_empty() {
            prompt.push_str(
                "\nKhách đang trả giá; từ chối khéo léo, giá niêm yết không đổi.",
            );
        }
        match self.inference.respond(&prompt, history).await {
            Ok(reply) => OutboundResponse::text(reply),
            Err(error) => {
                warn!(
                    target = "boutique.agent",
                    sender,
                    error = %error,
                    "responder failed, using catalog fields directly"
                );
                OutboundResponse::text(format!(
                    "Dạ {} giá {} ạ. {}",
                    best.product, best.price, best.product_details
                ))
            }
        }
    }

    async fn handle_size(
        &self,
        sender: &str,
        turn_text: &str,
        entities: &crate::models::Entities,
        history: &[HistoryEntry],
    ) -> OutboundResponse {
        if entities.weight.is_empty() && entities.height.is_empty() {
            return OutboundResponse::text(
                "Chị/anh cho em xin cân nặng và chiều cao để em tư vấn size chuẩn nhé ạ!",
            );
        }
        let hits = self
            .resolver
            .search(
                &entities.product,
                &entities.category,
                &entities.color,
                Some(sender),
            )
            .await;
        let Some(best) = hits.first() else {
            return OutboundResponse::text(NOT_FOUND);
        };
        let prompt = format!(
            "{}\nKhách nặng {} và cao {}. Dựa vào bảng size trên, tư vấn size phù hợp.\n\
             Câu hỏi của khách: {turn_text}",
            product_prompt("", best),
            or_unknown(&entities.weight),
            or_unknown(&entities.height),
        );
        match self.inference.respond(&prompt, history).await {
            Ok(reply) => OutboundResponse::text(reply),
            Err(_) => OutboundResponse::text(format!(
                "Dạ bảng size của {}:\n{}",
                best.product, best.size
            )),
        }
    }

    async fn handle_size_chart(
        &self,
        sender: &str,
        entities: &crate::models::Entities,
    ) -> OutboundResponse {
        let hits = self
            .resolver
            .search(
                &entities.product,
                &entities.category,
                &entities.color,
                Some(sender),
            )
            .await;
        let Some(best) = hits.first() else {
            return OutboundResponse::text(NOT_FOUND);
        };
        let name = self
            .profiles
            .fetch(sender)
            .await
            .unwrap_or_default()
            .display_name();
        if best.size.trim().is_empty() {
            return OutboundResponse::text(format!(
                "Dạ {name} ơi, {} hiện là free size ạ.",
                best.product
            ));
        }
        // The chart goes out verbatim; reformatting loses the weight ranges.
        OutboundResponse::text(format!(
            "Dạ {name} ơi, bảng size của {} đây ạ:\n{}",
            best.product, best.size
        ))
    }

    async fn handle_color(
        &self,
        sender: &str,
        entities: &crate::models::Entities,
    ) -> OutboundResponse {
        // A named product with no colour constraint asks "what colours does
        // it come in"; a colour query asks "what comes in this colour".
        if !entities.product.is_empty() && entities.color.is_empty() {
            let hits = self
                .resolver
                .search(&entities.product, &entities.category, "", Some(sender))
                .await;
            return match hits.first() {
                Some(best) if !best.color.trim().is_empty() => OutboundResponse::text(format!(
                    "Dạ {} hiện có các màu: {} ạ.",
                    best.product, best.color
                )),
                Some(best) => OutboundResponse::text(format!(
                    "Dạ {} hiện chỉ có một màu như ảnh ạ.",
                    best.product
                )),
                None => OutboundResponse::text(NOT_FOUND),
            };
        }

        let hits = self
            .resolver
            .search("", &entities.category, &entities.color, Some(sender))
            .await;
        if hits.is_empty() {
            return OutboundResponse::text(NOT_FOUND);
        }
        let names: Vec<&str> = hits.iter().map(|product| product.product.as_str()).collect();
        OutboundResponse::text(format!(
            "Dạ màu {} bên em có: {} ạ.",
            entities.color,
            names.join(", ")
        ))
    }

    async fn handle_general(
        &self,
        turn_text: &str,
        history: &[HistoryEntry],
    ) -> OutboundResponse {
        let folded = turn_text.to_lowercase();
        if VAGUE_PURCHASE_MARKERS
            .iter()
            .any(|marker| folded.contains(marker))
        {
            return OutboundResponse::text(self.catalog_overview());
        }
        match self.inference.respond(turn_text, history).await {
            Ok(reply) => OutboundResponse::text(reply),
            Err(_) => OutboundResponse::text(
                "Dạ em chưa hiểu ý chị/anh lắm, mình nói rõ hơn giúp em nhé!",
            ),
        }
    }

    fn catalog_overview(&self) -> String {
        let catalog = self.resolver.catalog();
        let mut lines = vec!["Dạ bên em hiện có ạ:".to_string()];
        for category in catalog.categories() {
            lines.push(format!("• {category}:"));
            for product in catalog
                .products()
                .iter()
                .filter(|product| product.category == category)
            {
                lines.push(format!("   - {} ({})", product.product, product.price));
            }
        }
        lines.push("Chị/anh muốn xem mẫu nào để em gửi ảnh ạ?".to_string());
        lines.join("\n")
    }

    /// Non-order text replies get one proactive follow-up question appended.
    /// Responder failure degrades to the bare reply.
    async fn with_follow_up(
        &self,
        response: OutboundResponse,
        history: &[HistoryEntry],
    ) -> OutboundResponse {
        let OutboundResponse::Text { content } = &response else {
            return response;
        };
        match self.inference.proactive(content, history).await {
            Ok(follow_up) if !follow_up.trim().is_empty() => {
                OutboundResponse::text(format!("{content}\n\n{}", follow_up.trim()))
            }
            Ok(_) => response,
            Err(error) => {
                debug!(
                    target = "boutique.agent",
                    error = %error,
                    "follow-up generation failed, sending bare reply"
                );
                response
            }
        }
    }
}

fn product_prompt(question: &str, product: &Product) -> String {
    let mut prompt = format!(
        "Thông tin sản phẩm:\n- Tên: {}\n- Giá: {}\n- Chi tiết: {}\n- Màu: {}\n- Bảng size: {}",
        product.product, product.price, product.product_details, product.color, product.size
    );
    if !question.is_empty() {
        prompt.push_str(&format!("\nCâu hỏi của khách: {question}"));
    }
    prompt
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "(chưa rõ)"
    } else {
        value
    }
}
