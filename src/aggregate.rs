use crate::models::{NormalizedEvent, ReducedTurn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Duration, sleep};
use tracing::debug;

/// Downstream consumer of one reduced turn per sender.
#[async_trait]
pub trait TurnSink: Send + Sync {
    async fn flush(&self, sender: &str, turn: ReducedTurn);
}

/// Per-sender debounce window. Customers type in bursts; each admitted
/// event re-arms the sender's timer, and only a quiet gap ends the turn.
///
/// State per sender: absent (idle), `Collecting` (timer armed), `Flushing`
/// (sink running). Events arriving mid-flush are queued as stragglers and
/// promoted into a fresh window afterwards, so same-sender turns never
/// interleave.
pub struct AggregationWindow {
    debounce: Duration,
    senders: Mutex<HashMap<String, SenderState>>,
    sink: Arc<dyn TurnSink>,
}

enum SenderState {
    Collecting {
        events: Vec<NormalizedEvent>,
        timer: AbortHandle,
    },
    Flushing {
        stragglers: Vec<NormalizedEvent>,
    },
}

impl AggregationWindow {
    pub fn from_env(sink: Arc<dyn TurnSink>) -> Arc<Self> {
        let debounce_ms = std::env::var("AGGREGATE_DEBOUNCE_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(5000);
        Self::new(Duration::from_millis(debounce_ms), sink)
    }

    pub fn new(debounce: Duration, sink: Arc<dyn TurnSink>) -> Arc<Self> {
        Arc::new(Self {
            debounce,
            senders: Mutex::new(HashMap::new()),
            sink,
        })
    }

    pub async fn admit(self: &Arc<Self>, sender: &str, event: NormalizedEvent) {
        let mut senders = self.senders.lock().await;
        match senders.get_mut(sender) {
            None => {
                let timer = self.arm_timer(sender);
                senders.insert(
                    sender.to_string(),
                    SenderState::Collecting {
                        events: vec![event],
                        timer,
                    },
                );
            }
            Some(SenderState::Collecting { events, timer }) => {
                timer.abort();
                events.push(event);
                *timer = self.arm_timer(sender);
            }
            Some(SenderState::Flushing { stragglers }) => {
                debug!(
                    target = "boutique.window",
                    sender, "event queued behind in-flight flush"
                );
                stragglers.push(event);
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, sender: &str) -> AbortHandle {
        let window = self.clone();
        let sender = sender.to_string();
        let handle = tokio::spawn(async move {
            sleep(window.debounce).await;
            window.flush(&sender).await;
        });
        handle.abort_handle()
    }

    async fn flush(self: &Arc<Self>, sender: &str) {
        let events = {
            let mut senders = self.senders.lock().await;
            match senders.remove(sender) {
                Some(SenderState::Collecting { events, .. }) => {
                    senders.insert(
                        sender.to_string(),
                        SenderState::Flushing {
                            stragglers: Vec::new(),
                        },
                    );
                    events
                }
                // A racing admit already re-armed or another flush owns it.
                Some(other) => {
                    senders.insert(sender.to_string(), other);
                    return;
                }
                None => return,
            }
        };

        let turn = reduce(events);
        if turn.is_empty() {
            debug!(target = "boutique.window", sender, "empty turn dropped");
        } else {
            self.sink.flush(sender, turn).await;
        }

        // Cleanup runs whether or not the turn was delivered.
        let mut senders = self.senders.lock().await;
        match senders.remove(sender) {
            Some(SenderState::Flushing { stragglers }) if !stragglers.is_empty() => {
                debug!(
                    target = "boutique.window",
                    sender,
                    count = stragglers.len(),
                    "promoting stragglers into a new window"
                );
                let timer = self.arm_timer(sender);
                senders.insert(
                    sender.to_string(),
                    SenderState::Collecting {
                        events: stragglers,
                        timer,
                    },
                );
            }
            _ => {}
        }
    }
}

/// Burst reduction: the last non-empty text wins, the first image wins.
fn reduce(events: Vec<NormalizedEvent>) -> ReducedTurn {
    let mut turn = ReducedTurn::default();
    for event in events {
        if !event.text.trim().is_empty() {
            turn.text = event.text;
        }
        if turn.image_url.is_none() && event.image_url.is_some() {
            turn.image_url = event.image_url;
        }
    }
    turn
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{Notify, Semaphore};
    use tokio::task::yield_now;
    use tokio::time::advance;

    const DEBOUNCE: Duration = Duration::from_millis(5000);

    #[derive(Default)]
    struct RecordingSink {
        turns: Mutex<Vec<(String, ReducedTurn)>>,
    }

    impl RecordingSink {
        async fn turns(&self) -> Vec<(String, ReducedTurn)> {
            self.turns.lock().await.clone()
        }
    }

    #[async_trait]
    impl TurnSink for RecordingSink {
        async fn flush(&self, sender: &str, turn: ReducedTurn) {
            self.turns.lock().await.push((sender.to_string(), turn));
        }
    }

    fn text_event(text: &str) -> NormalizedEvent {
        NormalizedEvent {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn image_event(url: &str) -> NormalizedEvent {
        NormalizedEvent {
            image_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..8 {
            yield_now().await;
        }
    }

    #[test]
    fn reduction_keeps_last_text_and_first_image() {
        let turn = reduce(vec![
            text_event("xin chào"),
            image_event("https://cdn.example/a.jpg"),
            text_event("giá bao nhiêu"),
            image_event("https://cdn.example/b.jpg"),
        ]);
        assert_eq!(turn.text, "giá bao nhiêu");
        assert_eq!(turn.image_url.as_deref(), Some("https://cdn.example/a.jpg"));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_turn() {
        let sink = Arc::new(RecordingSink::default());
        let window = AggregationWindow::new(DEBOUNCE, sink.clone());
        window.admit("u1", text_event("cho mình hỏi")).await;
        window.admit("u1", text_event("đầm maxi")).await;
        window.admit("u1", text_event("còn hàng không")).await;
        settle().await;

        advance(DEBOUNCE + Duration::from_millis(1)).await;
        settle().await;

        let turns = sink.turns().await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].0, "u1");
        assert_eq!(turns[0].1.text, "còn hàng không");
    }

    #[tokio::test(start_paused = true)]
    async fn text_and_image_a_second_apart_share_one_turn() {
        let sink = Arc::new(RecordingSink::default());
        let window = AggregationWindow::new(DEBOUNCE, sink.clone());
        window.admit("u1", text_event("cái này còn không")).await;
        settle().await;
        advance(Duration::from_millis(1000)).await;
        window.admit("u1", image_event("https://cdn.example/dress.jpg")).await;
        settle().await;

        advance(DEBOUNCE + Duration::from_millis(1)).await;
        settle().await;

        let turns = sink.turns().await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].1.text, "cái này còn không");
        assert_eq!(
            turns[0].1.image_url.as_deref(),
            Some("https://cdn.example/dress.jpg")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_event_rearms_the_timer() {
        let sink = Arc::new(RecordingSink::default());
        let window = AggregationWindow::new(DEBOUNCE, sink.clone());
        window.admit("u1", text_event("một")).await;
        settle().await;
        advance(Duration::from_millis(3000)).await;
        window.admit("u1", text_event("hai")).await;
        settle().await;
        // 6s since the first event but only 3s since the last: no flush yet.
        advance(Duration::from_millis(3000)).await;
        settle().await;
        assert!(sink.turns().await.is_empty());

        advance(Duration::from_millis(2001)).await;
        settle().await;
        let turns = sink.turns().await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].1.text, "hai");
    }

    #[tokio::test(start_paused = true)]
    async fn senders_are_windowed_independently() {
        let sink = Arc::new(RecordingSink::default());
        let window = AggregationWindow::new(DEBOUNCE, sink.clone());
        window.admit("u1", text_event("của u1")).await;
        window.admit("u2", text_event("của u2")).await;
        settle().await;

        advance(DEBOUNCE + Duration::from_millis(1)).await;
        settle().await;

        let mut turns = sink.turns().await;
        turns.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0], ("u1".to_string(), reduce(vec![text_event("của u1")])));
        assert_eq!(turns[1].1.text, "của u2");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_turn_is_dropped_and_state_cleared() {
        let sink = Arc::new(RecordingSink::default());
        let window = AggregationWindow::new(DEBOUNCE, sink.clone());
        window.admit("u1", text_event("   ")).await;
        settle().await;

        advance(DEBOUNCE + Duration::from_millis(1)).await;
        settle().await;

        assert!(sink.turns().await.is_empty());
        assert!(window.senders.lock().await.is_empty());
    }

    struct GatedSink {
        entered: Notify,
        release: Semaphore,
        turns: Mutex<Vec<ReducedTurn>>,
    }

    #[async_trait]
    impl TurnSink for GatedSink {
        async fn flush(&self, _sender: &str, turn: ReducedTurn) {
            self.entered.notify_one();
            let permit = self.release.acquire().await.unwrap();
            permit.forget();
            self.turns.lock().await.push(turn);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn straggler_during_flush_starts_a_new_window() {
        let sink = Arc::new(GatedSink {
            entered: Notify::new(),
            release: Semaphore::new(0),
            turns: Mutex::new(Vec::new()),
        });
        let window = AggregationWindow::new(DEBOUNCE, sink.clone());

        window.admit("u1", text_event("đơn đầu")).await;
        advance(DEBOUNCE + Duration::from_millis(1)).await;
        sink.entered.notified().await;

        // The flush is in progress; this event must not join it.
        window.admit("u1", text_event("đơn sau")).await;
        sink.release.add_permits(1);
        settle().await;
        assert_eq!(sink.turns.lock().await.len(), 1);

        // The straggler was promoted into a fresh window with its own timer.
        advance(DEBOUNCE + Duration::from_millis(1)).await;
        sink.entered.notified().await;
        sink.release.add_permits(1);
        settle().await;

        let turns = sink.turns.lock().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "đơn đầu");
        assert_eq!(turns[1].text, "đơn sau");
    }
}

