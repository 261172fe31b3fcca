use crate::models::ClassifiedIntent;
use crate::store::HistoryEntry;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::http::build_client;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub vision_model: String,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("LLM_GATEWAY_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: std::env::var("LLM_API_KEY").ok(),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            vision_model: std::env::var("LLM_VISION_MODEL").unwrap_or_else(|_| "gpt-4o".into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Everything the classifier sees about the current turn.
pub struct ClassifyContext<'a> {
    pub text: &'a str,
    pub history: &'a [HistoryEntry],
    pub catalog_summary: &'a Value,
    /// Names of products whose images were recently sent to this customer;
    /// lets "cái này giá bao nhiêu" resolve against what they just saw.
    pub recent_products: &'a [String],
}

/// External inference seam. One production client, swapped for stubs in
/// pipeline tests.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Classify a turn into intent + entities. Output errors when the
    /// gateway fails or returns something unparseable.
    async fn classify(&self, ctx: &ClassifyContext<'_>) -> Result<ClassifiedIntent, LlmError>;

    /// Free-form Vietnamese reply to the customer from a composed prompt.
    async fn respond(&self, prompt: &str, history: &[HistoryEntry]) -> Result<String, LlmError>;

    /// One short follow-up question to keep the conversation moving. Gets
    /// the reply just sent so it never restates it.
    async fn proactive(&self, latest_reply: &str, history: &[HistoryEntry])
    -> Result<String, LlmError>;

    /// Match a customer-sent photo against the catalog; returns the matched
    /// product name, or an empty string when nothing in the catalog fits.
    async fn match_image(&self, image_url: &str, catalog_summary: &Value)
    -> Result<String, LlmError>;
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(LlmConfig::from_env())
    }

    async fn chat(&self, model: &str, messages: Vec<Value>, temperature: f32) -> Result<String, LlmError> {
        let gateway = self.config.gateway_url.trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });

        let mut request = self
            .http
            .post(format!("{gateway}/chat/completions"))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".into()))
    }
}

#[async_trait]
impl Inference for LlmClient {
    async fn classify(&self, ctx: &ClassifyContext<'_>) -> Result<ClassifiedIntent, LlmError> {
        let messages = vec![
            json!({"role": "system", "content": classifier_prompt(ctx)}),
            json!({"role": "user", "content": ctx.text}),
        ];
        let raw = self.chat(&self.config.model, messages, 0.0).await?;
        let cleaned = strip_code_fences(&raw);
        debug!(target = "boutique.llm", classified = cleaned, "turn classified");
        serde_json::from_str(cleaned).map_err(|err| LlmError::InvalidResponse(err.to_string()))
    }

    async fn respond(&self, prompt: &str, history: &[HistoryEntry]) -> Result<String, LlmError> {
        let mut messages = vec![json!({"role": "system", "content": RESPONDER_SYSTEM})];
        messages.extend(history_messages(history));
        messages.push(json!({"role": "user", "content": prompt}));
        self.chat(&self.config.model, messages, 0.7).await
    }

    async fn proactive(
        &self,
        latest_reply: &str,
        history: &[HistoryEntry],
    ) -> Result<String, LlmError> {
        let mut messages = vec![json!({"role": "system", "content": PROACTIVE_SYSTEM})];
        messages.extend(history_messages(history));
        messages.push(json!({
            "role": "user",
            "content": format!(
                "Câu trả lời shop vừa gửi cho khách: \"{latest_reply}\"\n\
                 Hãy viết MỘT câu hỏi gợi mở tiếp theo, không lặp lại nội dung trên."
            ),
        }));
        self.chat(&self.config.model, messages, 0.8).await
    }

    async fn match_image(
        &self,
        image_url: &str,
        catalog_summary: &Value,
    ) -> Result<String, LlmError> {
        let messages = vec![
            json!({"role": "system", "content": format!(
                "Bạn nhận diện sản phẩm thời trang trong ảnh khách gửi. \
                 Danh mục cửa hàng: {catalog_summary}. \
                 Trả về CHÍNH XÁC tên sản phẩm trong danh mục giống ảnh nhất, \
                 hoặc chuỗi rỗng nếu không có sản phẩm nào giống."
            )}),
            json!({"role": "user", "content": [
                {"type": "text", "text": "Sản phẩm trong ảnh này là gì?"},
                {"type": "image_url", "image_url": {"url": image_url}},
            ]}),
        ];
        let raw = self.chat(&self.config.vision_model, messages, 0.0).await?;
        Ok(strip_code_fences(&raw).trim_matches('"').trim().to_string())
    }
}

const RESPONDER_SYSTEM: &str = "Bạn là nhân viên tư vấn của một cửa hàng thời trang online, \
xưng \"em\", gọi khách là \"chị/anh\". Trả lời ngắn gọn, thân thiện, bằng tiếng Việt. \
Chỉ tư vấn dựa trên thông tin sản phẩm được cung cấp, không bịa thêm.";

const PROACTIVE_SYSTEM: &str = "Bạn là nhân viên tư vấn của một cửa hàng thời trang online. \
Viết đúng một câu hỏi ngắn bằng tiếng Việt để gợi mở nhu cầu tiếp theo của khách \
(ví dụ hỏi về kích cỡ, màu sắc, hoặc nhu cầu đặt hàng).";

fn classifier_prompt(ctx: &ClassifyContext<'_>) -> String {
    let mut prompt = String::from(
        "Bạn phân loại tin nhắn của khách hàng một cửa hàng thời trang. \
         Trả về JSON duy nhất, không giải thích, theo mẫu:\n\
         {\"intent\": \"...\", \"entities\": {\"product\": \"\", \"category\": \"\", \
         \"color\": \"\", \"weight\": \"\", \"height\": \"\", \"bargain_price\": \"\", \
         \"order_info\": null}}\n\
         intent là một trong: image, product_details, price, size, size_chart, \
         color, order_info, general.\n\
         Khi khách cung cấp thông tin đặt hàng, điền order_info với các trường: \
         name, address, phone, product_name, color, size, quantity \
         (trường chưa biết để chuỗi rỗng).\n",
    );
    prompt.push_str(&format!("Danh mục sản phẩm: {}\n", ctx.catalog_summary));
    if !ctx.recent_products.is_empty() {
        prompt.push_str(&format!(
            "Sản phẩm shop vừa gửi ảnh cho khách (khách nói \"cái này\" thường chỉ chúng): {}\n",
            ctx.recent_products.join(", ")
        ));
    }
    if !ctx.history.is_empty() {
        prompt.push_str("Hội thoại gần đây:\n");
        for entry in ctx.history {
            prompt.push_str(&format!("- {}: {}\n", entry.role, entry.content));
        }
    }
    prompt
}

fn history_messages(history: &[HistoryEntry]) -> Vec<Value> {
    history
        .iter()
        .map(|entry| {
            let role = if entry.role == "assistant" {
                "assistant"
            } else {
                "user"
            };
            json!({"role": role, "content": entry.content})
        })
        .collect()
}

/// Models wrap JSON in markdown fences more often than not.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Intent;

    #[test]
    fn strips_fenced_json() {
        let raw = "```json\n{\"intent\": \"price\"}\n```";
        assert_eq!(strip_code_fences(raw), "{\"intent\": \"price\"}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn fenced_classifier_output_parses() {
        let raw = "```json\n{\"intent\": \"size_chart\", \"entities\": {\"product\": \"Đầm Maxi\"}}\n```";
        let parsed: ClassifiedIntent = serde_json::from_str(strip_code_fences(raw)).unwrap();
        assert_eq!(parsed.intent, Intent::SizeChart);
        assert_eq!(parsed.entities.product, "Đầm Maxi");
    }

    #[test]
    fn classifier_prompt_carries_context() {
        let summary = json!({"Áo Quần": ["Đầm Maxi"]});
        let history = vec![HistoryEntry {
            role: "user".into(),
            content: "có đầm nào đẹp không".into(),
        }];
        let recent = vec!["Đầm Maxi".to_string()];
        let prompt = classifier_prompt(&ClassifyContext {
            text: "cái này bao nhiêu",
            history: &history,
            catalog_summary: &summary,
            recent_products: &recent,
        });
        assert!(prompt.contains("Đầm Maxi"));
        assert!(prompt.contains("có đầm nào đẹp không"));
        assert!(prompt.contains("order_info"));
    }

    #[test]
    fn history_roles_map_to_chat_roles() {
        let history = vec![
            HistoryEntry {
                role: "user".into(),
                content: "chào shop".into(),
            },
            HistoryEntry {
                role: "assistant".into(),
                content: "chào chị ạ".into(),
            },
        ];
        let messages = history_messages(&history);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }
}
