use crate::models::{Entities, OrderFields, OutboundResponse};
use crate::store::OrderStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tracked fields in the order they are asked for. The enumeration order is
/// stable so "missing fields" prompts read the same across turns.
const FIELDS: [(OrderField, &str); 7] = [
    (OrderField::Name, "tên người nhận"),
    (OrderField::Address, "địa chỉ"),
    (OrderField::Phone, "số điện thoại"),
    (OrderField::ProductName, "tên sản phẩm"),
    (OrderField::Color, "màu sắc"),
    (OrderField::Size, "kích cỡ"),
    (OrderField::Quantity, "số lượng"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderField {
    Name,
    Address,
    Phone,
    ProductName,
    Color,
    Size,
    Quantity,
}

fn field<'a>(order: &'a OrderFields, which: OrderField) -> &'a str {
    match which {
        OrderField::Name => &order.name,
        OrderField::Address => &order.address,
        OrderField::Phone => &order.phone,
        OrderField::ProductName => &order.product_name,
        OrderField::Color => &order.color,
        OrderField::Size => &order.size,
        OrderField::Quantity => &order.quantity,
    }
}

fn field_mut<'a>(order: &'a mut OrderFields, which: OrderField) -> &'a mut String {
    match which {
        OrderField::Name => &mut order.name,
        OrderField::Address => &mut order.address,
        OrderField::Phone => &mut order.phone,
        OrderField::ProductName => &mut order.product_name,
        OrderField::Color => &mut order.color,
        OrderField::Size => &mut order.size,
        OrderField::Quantity => &mut order.quantity,
    }
}

/// Merge incrementally supplied fields into an accumulated order. Non-empty
/// new values overwrite; empty values never erase what is already known.
/// Idempotent: merging the same field set twice equals merging it once.
pub fn merge(existing: &OrderFields, new_fields: &OrderFields) -> OrderFields {
    let mut merged = existing.clone();
    for (which, _) in FIELDS {
        let incoming = field(new_fields, which).trim();
        if !incoming.is_empty() {
            *field_mut(&mut merged, which) = incoming.to_string();
        }
    }
    merged
}

#[derive(Debug, PartialEq, Eq)]
pub struct Completion {
    pub complete: bool,
    pub missing_labels: Vec<&'static str>,
}

pub fn check_completion(order: &OrderFields) -> Completion {
    let missing_labels: Vec<&'static str> = FIELDS
        .iter()
        .filter(|(which, _)| field(order, *which).trim().is_empty())
        .map(|(_, label)| *label)
        .collect();
    Completion {
        complete: missing_labels.is_empty(),
        missing_labels,
    }
}

/// Per-sender partial-order state machine. Holds the in-progress form across
/// turns, commits it to the order store when every field is present.
pub struct OrderAccumulator {
    partials: Mutex<HashMap<String, OrderFields>>,
    store: Arc<dyn OrderStore>,
}

impl OrderAccumulator {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self {
            partials: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub async fn partial(&self, sender: &str) -> OrderFields {
        self.partials
            .lock()
            .await
            .get(sender)
            .cloned()
            .unwrap_or_default()
    }

    /// Fold an `order_info` turn into the sender's accumulated order and
    /// produce the user-facing reply.
    ///
    /// Persistence failure keeps the partial order, so nothing the customer
    /// already supplied is lost; the next turn retries the commit.
    pub async fn handle(&self, sender: &str, entities: &Entities) -> OutboundResponse {
        let new_fields = entities.order_info.clone().unwrap_or_default();
        let previous = self.partial(sender).await;
        let merged = merge(&previous, &new_fields);
        let completion = check_completion(&merged);

        if !completion.complete {
            self.partials
                .lock()
                .await
                .insert(sender.to_string(), merged);
            let missing = completion.missing_labels.join(", ");
            return OutboundResponse::text(format!(
                "Vui lòng cung cấp thêm thông tin ạ: {missing}."
            ));
        }

        match self.store.save_order(sender, &merged).await {
            Ok(order_id) => {
                info!(
                    target = "boutique.orders",
                    sender, order_id, "order committed"
                );
                self.partials.lock().await.remove(sender);
                OutboundResponse::Order {
                    content: "Thông tin đặt hàng đã được lưu. Cảm ơn ạ!".to_string(),
                }
            }
            Err(error) => {
                warn!(
                    target = "boutique.orders",
                    sender,
                    error = %error,
                    "order persistence failed, keeping partial order"
                );
                self.partials
                    .lock()
                    .await
                    .insert(sender.to_string(), merged);
                OutboundResponse::text(
                    "Xin lỗi, em chưa lưu được đơn hàng. Mình thử lại giúp em sau ít phút nhé!",
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryOrderStore, StoreError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn order(fields: &[(&str, &str)]) -> OrderFields {
        let mut result = OrderFields::default();
        for (key, value) in fields {
            match *key {
                "name" => result.name = value.to_string(),
                "address" => result.address = value.to_string(),
                "phone" => result.phone = value.to_string(),
                "product_name" => result.product_name = value.to_string(),
                "color" => result.color = value.to_string(),
                "size" => result.size = value.to_string(),
                "quantity" => result.quantity = value.to_string(),
                other => panic!("unknown field {other}"),
            }
        }
        result
    }

    #[test]
    fn merge_overwrites_non_empty_only() {
        let previous = order(&[("name", "Lan"), ("color", "đen")]);
        let incoming = order(&[("color", "trắng"), ("phone", "0901234567")]);
        let merged = merge(&previous, &incoming);
        assert_eq!(merged.name, "Lan");
        assert_eq!(merged.color, "trắng");
        assert_eq!(merged.phone, "0901234567");
    }

    #[test]
    fn merge_is_idempotent() {
        let previous = order(&[("name", "Lan"), ("size", "M")]);
        let incoming = order(&[("address", "12 Lý Thường Kiệt"), ("quantity", "2")]);
        let once = merge(&previous, &incoming);
        let twice = merge(&once, &incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn completion_lists_missing_in_stable_order() {
        let partial = order(&[("name", "Lan"), ("size", "M")]);
        let completion = check_completion(&partial);
        assert!(!completion.complete);
        assert_eq!(
            completion.missing_labels,
            vec![
                "địa chỉ",
                "số điện thoại",
                "tên sản phẩm",
                "màu sắc",
                "số lượng"
            ]
        );
    }

    fn almost_complete() -> OrderFields {
        order(&[
            ("name", "Lan"),
            ("address", "12 Lý Thường Kiệt"),
            ("product_name", "Đầm Maxi"),
            ("color", "đen"),
            ("size", "M"),
            ("quantity", "1"),
        ])
    }

    fn entities_with(fields: OrderFields) -> Entities {
        Entities {
            order_info: Some(fields),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn supplying_last_field_commits_once_and_clears() {
        let store = Arc::new(MemoryOrderStore::default());
        let accumulator = OrderAccumulator::new(store.clone());
        let response = accumulator
            .handle("u1", &entities_with(almost_complete()))
            .await;
        match response {
            OutboundResponse::Text { content } => {
                assert!(content.contains("số điện thoại"));
                assert!(!content.contains("màu sắc"));
            }
            other => panic!("expected missing-field prompt, got {other:?}"),
        }

        let response = accumulator
            .handle("u1", &entities_with(order(&[("phone", "0901234567")])))
            .await;
        assert!(matches!(response, OutboundResponse::Order { .. }));
        assert_eq!(store.saved().await.len(), 1);
        assert_eq!(accumulator.partial("u1").await, OrderFields::default());
    }

    #[derive(Default)]
    struct FailingStore {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl OrderStore for FailingStore {
        async fn save_order(&self, _: &str, _: &OrderFields) -> Result<String, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Request("boom".into()))
        }
    }

    #[tokio::test]
    async fn persistence_failure_keeps_partial_order() {
        let store = Arc::new(FailingStore::default());
        let accumulator = OrderAccumulator::new(store.clone());
        let mut complete = almost_complete();
        complete.phone = "0901234567".into();
        let response = accumulator.handle("u1", &entities_with(complete.clone())).await;
        assert!(matches!(response, OutboundResponse::Text { .. }));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        // Fields survive for the next turn's retry.
        assert_eq!(accumulator.partial("u1").await, complete);
    }

    #[tokio::test]
    async fn empty_order_info_turn_asks_for_everything() {
        let accumulator = OrderAccumulator::new(Arc::new(MemoryOrderStore::default()));
        let response = accumulator.handle("u1", &Entities::default()).await;
        match response {
            OutboundResponse::Text { content } => {
                assert!(content.contains("tên người nhận"));
                assert!(content.contains("số lượng"));
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }
}
