use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Tracks `(sender, message id)` pairs already admitted into an aggregate.
///
/// The chat platform delivers at-least-once; this registry makes admission
/// at-most-once while an entry is live. Entries expire after a retention
/// window, so a very late retry may be reprocessed (false negatives are
/// acceptable, false positives are not). An optional Redis backing makes the
/// registry survive restarts and span replicas.
pub struct DedupRegistry {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), Instant>>,
    redis: Option<redis::Client>,
}

impl DedupRegistry {
    pub fn from_env() -> Self {
        let ttl_secs = std::env::var("DEDUP_TTL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(3600);
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        Self::new(Duration::from_secs(ttl_secs), redis)
    }

    pub fn new(ttl: Duration, redis: Option<redis::Client>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            redis,
        }
    }

    pub async fn is_processed(&self, sender: &str, message_id: &str) -> bool {
        {
            let entries = self.entries.lock().await;
            if let Some(expiry) = entries.get(&(sender.to_string(), message_id.to_string()))
                && *expiry > Instant::now()
            {
                return true;
            }
        }
        if let Some(client) = &self.redis {
            return redis_seen(client, sender, message_id).await;
        }
        false
    }

    pub async fn mark_processed(&self, sender: &str, message_id: &str) {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|_, expiry| *expiry > now);
            entries.insert((sender.to_string(), message_id.to_string()), now + self.ttl);
        }
        if let Some(client) = &self.redis {
            redis_mark(client, sender, message_id, self.ttl.as_secs()).await;
        }
        debug!(
            target = "boutique.dedup",
            sender,
            message_id,
            "message marked processed"
        );
    }
}

fn redis_key(sender: &str, message_id: &str) -> String {
    format!("boutique:dedup:{sender}:{message_id}")
}

async fn redis_seen(client: &redis::Client, sender: &str, message_id: &str) -> bool {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(_) => return false,
    };
    conn.exists(redis_key(sender, message_id))
        .await
        .unwrap_or(false)
}

async fn redis_mark(client: &redis::Client, sender: &str, message_id: &str, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
        let _: Result<(), _> = conn
            .set_ex(redis_key(sender, message_id), 1u8, ttl_secs.max(1))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test]
    async fn unseen_message_is_not_processed() {
        let registry = DedupRegistry::new(Duration::from_secs(3600), None);
        assert!(!registry.is_processed("u1", "m1").await);
    }

    #[tokio::test]
    async fn marked_message_is_rejected_on_replay() {
        let registry = DedupRegistry::new(Duration::from_secs(3600), None);
        registry.mark_processed("u1", "m1").await;
        assert!(registry.is_processed("u1", "m1").await);
        // Same mid from a different sender is a different pair.
        assert!(!registry.is_processed("u2", "m1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_retention_window() {
        let registry = DedupRegistry::new(Duration::from_secs(3600), None);
        registry.mark_processed("u1", "m1").await;
        advance(Duration::from_secs(3599)).await;
        assert!(registry.is_processed("u1", "m1").await);
        advance(Duration::from_secs(2)).await;
        assert!(!registry.is_processed("u1", "m1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_on_insert() {
        let registry = DedupRegistry::new(Duration::from_secs(60), None);
        registry.mark_processed("u1", "m1").await;
        advance(Duration::from_secs(120)).await;
        registry.mark_processed("u1", "m2").await;
        let entries = registry.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&("u1".to_string(), "m2".to_string())));
    }
}
