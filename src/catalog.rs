use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::warn;

/// Immutable catalog reference data, owned by an external collaborator and
/// read-only here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub product_details: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub image_url: String,
}

#[derive(Clone)]
pub struct Catalog {
    products: Arc<Vec<Product>>,
}

impl Catalog {
    /// Load from `CATALOG_PATH` (JSON array of products); the embedded demo
    /// catalog backs development and tests.
    pub fn from_env() -> Self {
        match std::env::var("CATALOG_PATH") {
            Ok(path) => match std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<Vec<Product>>(&raw).map_err(|err| err.to_string())
                }) {
                Ok(products) => Self {
                    products: Arc::new(products),
                },
                Err(error) => {
                    warn!(
                        target = "boutique.catalog",
                        path, error, "catalog load failed, using demo catalog"
                    );
                    Self::demo()
                }
            },
            Err(_) => Self::demo(),
        }
    }

    pub fn demo() -> Self {
        Self {
            products: DEMO_PRODUCTS.clone(),
        }
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Distinct categories in catalog order.
    pub fn categories(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for product in self.products.iter() {
            if !product.category.is_empty() && !seen.contains(&product.category) {
                seen.push(product.category.clone());
            }
        }
        seen
    }

    /// Compact summary handed to the classifier as candidate context.
    pub fn summary(&self) -> Value {
        let grouped: Vec<Value> = self
            .categories()
            .into_iter()
            .map(|category| {
                let products: Vec<Value> = self
                    .products
                    .iter()
                    .filter(|product| product.category == category)
                    .map(|product| {
                        json!({
                            "product": product.product,
                            "synonyms": product.synonyms,
                            "color": product.color,
                        })
                    })
                    .collect();
                json!({ "category": category, "products": products })
            })
            .collect();
        Value::Array(grouped)
    }
}

/// Short-lived per-sender cache of product images already sent, used to
/// resolve anaphoric references ("the black one") right after a photo.
pub struct ImageContextCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, Vec<ImageContextEntry>>>,
}

#[derive(Debug, Clone)]
pub struct ImageContextEntry {
    pub image_url: String,
    pub product: Product,
    pub sent_at: Instant,
}

impl ImageContextCache {
    pub fn from_env() -> Self {
        let ttl_secs = std::env::var("IMAGE_CONTEXT_TTL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(300);
        Self::new(Duration::from_secs(ttl_secs), 8)
    }

    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, sender: &str, image_url: &str, product: &Product) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let list = entries.entry(sender.to_string()).or_default();
        list.push(ImageContextEntry {
            image_url: image_url.to_string(),
            product: product.clone(),
            sent_at: now,
        });
        list.retain(|entry| now.duration_since(entry.sent_at) < self.ttl);
        if list.len() > self.max_entries {
            let excess = list.len() - self.max_entries;
            list.drain(..excess);
        }
    }

    /// In-TTL entries, oldest first. Expired entries are evicted on read.
    pub async fn recent(&self, sender: &str) -> Vec<ImageContextEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(sender) {
            Some(list) => {
                list.retain(|entry| now.duration_since(entry.sent_at) < self.ttl);
                list.clone()
            }
            None => Vec::new(),
        }
    }
}

/// Resolves `(product, category, color)` queries against the catalog, with
/// fallback to the sender's recently shown images.
pub struct ProductResolver {
    catalog: Catalog,
    image_context: Arc<ImageContextCache>,
}

impl ProductResolver {
    pub fn new(catalog: Catalog, image_context: Arc<ImageContextCache>) -> Self {
        Self {
            catalog,
            image_context,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn search(
        &self,
        product: &str,
        category: &str,
        color: &str,
        sender: Option<&str>,
    ) -> Vec<Product> {
        let query_product = fold(product);
        let query_category = fold(category);
        let query_color = fold(color);

        let hits: Vec<Product> = self
            .catalog
            .products()
            .iter()
            .filter(|entry| {
                matches_category(entry, &query_category)
                    && matches_product(entry, &query_product)
                    && matches_color(entry, &query_color)
            })
            .cloned()
            .collect();

        if !hits.is_empty() {
            return hits;
        }
        let Some(sender) = sender else {
            return hits;
        };

        self.image_context
            .recent(sender)
            .await
            .into_iter()
            .filter(|entry| context_matches(entry, &query_product, &query_color))
            .map(|entry| entry.product)
            .collect()
    }
}

fn fold(value: &str) -> String {
    value.trim().to_lowercase()
}

fn matches_category(entry: &Product, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    let entry_category = fold(&entry.category);
    entry_category.contains(query) || query.contains(&entry_category)
}

fn matches_product(entry: &Product, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    let entry_product = fold(&entry.product);
    if entry_product == query {
        return true;
    }
    if entry.synonyms.iter().any(|synonym| fold(synonym) == *query) {
        return true;
    }
    // "đầm đen" style queries name a colour instead of a product.
    let entry_color = fold(&entry.color);
    !entry_color.is_empty() && query.contains(&entry_color)
}

fn matches_color(entry: &Product, query: &str) -> bool {
    query.is_empty() || fold(&entry.color).contains(query)
}

fn context_matches(entry: &ImageContextEntry, query_product: &str, query_color: &str) -> bool {
    let name = fold(&entry.product.product);
    let color = fold(&entry.product.color);
    let product_hit = !query_product.is_empty()
        && (name.contains(query_product)
            || query_product.contains(&name)
            || color.contains(query_product));
    let color_hit = !query_color.is_empty() && color.contains(query_color);
    product_hit || color_hit || (query_product.is_empty() && query_color.is_empty())
}

static DEMO_PRODUCTS: Lazy<Arc<Vec<Product>>> = Lazy::new(|| Arc::new(demo_products()));

fn demo_products() -> Vec<Product> {
    vec![
        Product {
            category: "Áo Quần".into(),
            product: "Đầm Maxi".into(),
            product_details: "Đầm dài chạm sàn, thướt tha, hợp cả dịp thường ngày và trang trọng."
                .into(),
            price: "450.000đ".into(),
            size: "S (40-48kg)\nM (49-55kg)\nL (56-62kg)".into(),
            color: "đen, trắng, đỏ đô".into(),
            synonyms: vec![
                "Đầm Dài".into(),
                "Đầm Dài Toàn Thân".into(),
                "Đầm Boho".into(),
            ],
            image_url: "https://cdn.boutique.example/dam-maxi.jpg".into(),
        },
        Product {
            category: "Áo Quần".into(),
            product: "Đầm Bodycon".into(),
            product_details: "Đầm ôm sát tôn dáng, chất thun co giãn bốn chiều.".into(),
            price: "390.000đ".into(),
            size: "S (40-47kg)\nM (48-54kg)".into(),
            color: "đen, đỏ".into(),
            synonyms: vec!["Đầm Ôm".into()],
            image_url: "https://cdn.boutique.example/dam-bodycon.jpg".into(),
        },
        Product {
            category: "Áo Quần".into(),
            product: "Đầm Chữ A".into(),
            product_details: "Dáng xòe nhẹ che khuyết điểm, vải tuyết mưa dày dặn.".into(),
            price: "420.000đ".into(),
            size: "S\nM\nL".into(),
            color: "trắng, hồng pastel".into(),
            synonyms: vec!["Đầm Xòe".into()],
            image_url: "https://cdn.boutique.example/dam-chu-a.jpg".into(),
        },
        Product {
            category: "Phụ Kiện".into(),
            product: "Túi Tote Canvas".into(),
            product_details: "Túi vải canvas in họa tiết, đựng vừa laptop 13 inch.".into(),
            price: "180.000đ".into(),
            size: String::new(),
            color: "be, xanh rêu".into(),
            synonyms: vec!["Túi Vải".into()],
            image_url: "https://cdn.boutique.example/tui-tote.jpg".into(),
        },
    ]
}
