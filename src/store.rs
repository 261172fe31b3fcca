use crate::http::build_client;
use crate::models::{OrderFields, UserProfile};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Commits completed orders. Owned table layout is the collaborator's
/// concern; this core only hands over the seven fields.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save_order(&self, sender: &str, order: &OrderFields) -> Result<String, StoreError>;
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// Conversation history, append-only, read back most-recent-first capped.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, sender: &str, role: &str, content: &str);
    async fn recent(&self, sender: &str, n: usize) -> Vec<HistoryEntry>;
}

/// Resolves the customer's display profile; `None` when the platform lookup
/// fails, in which case replies fall back to a generic form of address.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch(&self, sender: &str) -> Option<UserProfile>;
}

// ---------------------------------------------------------------------------
// In-memory implementations (development default, test doubles)

#[derive(Default)]
pub struct MemoryOrderStore {
    saved: Mutex<Vec<(String, OrderFields)>>,
}

impl MemoryOrderStore {
    pub async fn saved(&self) -> Vec<(String, OrderFields)> {
        self.saved.lock().await.clone()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn save_order(&self, sender: &str, order: &OrderFields) -> Result<String, StoreError> {
        self.saved
            .lock()
            .await
            .push((sender.to_string(), order.clone()));
        Ok(format!("ORD-{}", Uuid::new_v4().simple()))
    }
}

pub struct MemoryHistoryStore {
    cap: usize,
    entries: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self {
            cap: 50,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, sender: &str, role: &str, content: &str) {
        let mut entries = self.entries.lock().await;
        let list = entries.entry(sender.to_string()).or_default();
        list.push(HistoryEntry {
            role: role.to_string(),
            content: content.to_string(),
        });
        if list.len() > self.cap {
            let excess = list.len() - self.cap;
            list.drain(..excess);
        }
    }

    async fn recent(&self, sender: &str, n: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().await;
        match entries.get(sender) {
            Some(list) => list.iter().rev().take(n).rev().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Profile store that never resolves anyone; used when no platform token is
/// configured.
pub struct NoProfileStore;

#[async_trait]
impl ProfileStore for NoProfileStore {
    async fn fetch(&self, _sender: &str) -> Option<UserProfile> {
        None
    }
}

// ---------------------------------------------------------------------------
// REST-backed implementations

/// Supabase REST client covering order persistence and conversation history.
#[derive(Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }
}

#[async_trait]
impl OrderStore for SupabaseStore {
    async fn save_order(&self, sender: &str, order: &OrderFields) -> Result<String, StoreError> {
        let order_id = format!("ORD-{}", Uuid::new_v4().simple());
        let payload = json!({
            "order_id": order_id,
            "sender_id": sender,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "name": order.name,
            "address": order.address,
            "phone": order.phone,
            "product_name": order.product_name,
            "color": order.color,
            "size": order.size,
            "quantity": order.quantity,
        });
        let response = self
            .request(reqwest::Method::POST, "/rest/v1/order_info")
            .json(&payload)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!("HTTP {}", response.status())));
        }
        Ok(order_id)
    }
}

#[derive(Debug, Deserialize)]
struct HistoryRow {
    role: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl HistoryStore for SupabaseStore {
    async fn append(&self, sender: &str, role: &str, content: &str) {
        let payload = json!({
            "sender_id": sender,
            "role": role,
            "content": content,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        let result = self
            .request(reqwest::Method::POST, "/rest/v1/history")
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                target = "boutique.store",
                sender,
                status = %response.status(),
                "history append rejected"
            ),
            Err(error) => warn!(
                target = "boutique.store",
                sender,
                error = %error,
                "history append failed"
            ),
        }
    }

    async fn recent(&self, sender: &str, n: usize) -> Vec<HistoryEntry> {
        let path = format!(
            "/rest/v1/history?sender_id=eq.{sender}&select=role,content&order=created_at.desc&limit={n}"
        );
        let result = self.request(reqwest::Method::GET, &path).send().await;
        let rows: Vec<HistoryRow> = match result {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(rows) => rows,
                    Err(err) => {
                        let error = StoreError::Deserialize(err.to_string());
                        warn!(
                            target = "boutique.store",
                            sender,
                            error = %error,
                            "history rows unreadable"
                        );
                        return Vec::new();
                    }
                }
            }
            Ok(response) => {
                warn!(
                    target = "boutique.store",
                    sender,
                    status = %response.status(),
                    "history fetch rejected"
                );
                return Vec::new();
            }
            Err(error) => {
                warn!(
                    target = "boutique.store",
                    sender,
                    error = %error,
                    "history fetch failed"
                );
                return Vec::new();
            }
        };
        rows.into_iter()
            .rev()
            .map(|row| HistoryEntry {
                role: row.role,
                content: row.content,
            })
            .collect()
    }
}

/// Graph-API profile lookup with a refresh-window cache, so we greet repeat
/// customers without hammering the platform.
pub struct GraphProfileStore {
    access_token: String,
    graph_url: String,
    refresh: Duration,
    http: Client,
    cache: Mutex<HashMap<String, (UserProfile, Instant)>>,
}

impl GraphProfileStore {
    pub fn from_env() -> Option<Arc<dyn ProfileStore>> {
        let access_token = std::env::var("PAGE_ACCESS_TOKEN").ok()?;
        Some(Arc::new(Self {
            access_token,
            graph_url: std::env::var("GRAPH_API_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com/v21.0".into()),
            refresh: Duration::from_secs(7 * 24 * 3600),
            http: build_client(),
            cache: Mutex::new(HashMap::new()),
        }))
    }
}

#[async_trait]
impl ProfileStore for GraphProfileStore {
    async fn fetch(&self, sender: &str) -> Option<UserProfile> {
        {
            let cache = self.cache.lock().await;
            if let Some((profile, fetched_at)) = cache.get(sender)
                && fetched_at.elapsed() < self.refresh
            {
                return Some(profile.clone());
            }
        }
        let url = format!(
            "{}/{sender}?fields=first_name,last_name&access_token={}",
            self.graph_url, self.access_token
        );
        let response = match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    target = "boutique.store",
                    sender,
                    status = %response.status(),
                    "profile lookup rejected"
                );
                return None;
            }
            Err(error) => {
                warn!(
                    target = "boutique.store",
                    sender,
                    error = %error,
                    "profile lookup failed"
                );
                return None;
            }
        };
        let profile: UserProfile = response.json().await.ok()?;
        self.cache
            .lock()
            .await
            .insert(sender.to_string(), (profile.clone(), Instant::now()));
        Some(profile)
    }
}
