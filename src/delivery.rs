use crate::{
    chat::{ChatChannel, ChatError, ChatId},
    retry::{RetryPolicy, Verdict},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};

/// Client-side call timeout that grows with each attempt, up to a ceiling.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLadder {
    pub base: Duration,
    pub step: Duration,
    pub ceiling: Duration,
}

impl TimeoutLadder {
    /// `attempt` is 1-based; the first call gets `base`.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        (self.base + self.step.saturating_mul(steps)).min(self.ceiling)
    }
}

pub struct DeliveryManager {
    chat: Arc<dyn ChatChannel>,
    batch_size: usize,
    batch_policy: RetryPolicy,
    item_policy: RetryPolicy,
    timeouts: TimeoutLadder,
}

impl DeliveryManager {
    pub fn new(
        chat: Arc<dyn ChatChannel>,
        batch_size: usize,
        batch_policy: RetryPolicy,
        item_policy: RetryPolicy,
        timeouts: TimeoutLadder,
    ) -> Self {
        Self {
            chat,
            batch_size: batch_size.max(1),
            batch_policy,
            item_policy,
            timeouts,
        }
    }

    /// Sends every asset in discovery order and returns how many arrived.
    /// Never fails: a lost asset only lowers the count.
    pub async fn deliver(&self, chat: ChatId, assets: &[PathBuf]) -> usize {
        let mut delivered = 0;
        for (index, group) in assets.chunks(self.batch_size).enumerate() {
            if group.len() > 1 && self.send_batch(chat, group).await {
                delivered += group.len();
                continue;
            }
            if group.len() > 1 {
                warn!(
                    target = "listing_bot.delivery",
                    chat,
                    batch = index,
                    size = group.len(),
                    "batch failed; falling back to single photos"
                );
            }
            delivered += self.send_each(chat, group).await;
        }
        info!(target = "listing_bot.delivery", chat, delivered, total = assets.len(), "delivery_finished");
        delivered
    }

    async fn send_batch(&self, chat: ChatId, group: &[PathBuf]) -> bool {
        self.batch_policy
            .run(
                "send_photo_batch",
                |attempt| {
                    self.chat
                        .send_photo_batch(chat, group, self.timeouts.for_attempt(attempt))
                },
                classify,
            )
            .await
            .is_ok()
    }

    async fn send_each(&self, chat: ChatId, group: &[PathBuf]) -> usize {
        let mut sent = 0;
        for photo in group {
            let result = self
                .item_policy
                .run(
                    "send_photo",
                    |attempt| {
                        self.chat
                            .send_photo(chat, photo, self.timeouts.for_attempt(attempt))
                    },
                    classify,
                )
                .await;
            match result {
                Ok(()) => sent += 1,
                Err(err) => error!(
                    target = "listing_bot.delivery",
                    chat,
                    photo = %photo.display(),
                    error = %err,
                    "photo dropped after retries"
                ),
            }
        }
        sent
    }
}

fn classify(err: &ChatError) -> Verdict {
    match err {
        ChatError::RetryAfter(delay) => Verdict::RetryAfter(*delay + Duration::from_secs(1)),
        _ => Verdict::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::fake::{FakeChat, Sent};
    use tokio::time::Instant;

    fn manager(chat: Arc<FakeChat>, batch_size: usize) -> DeliveryManager {
        DeliveryManager::new(
            chat,
            batch_size,
            RetryPolicy::fixed(5, Duration::from_secs(3)),
            RetryPolicy::fixed(3, Duration::from_secs(3)),
            TimeoutLadder {
                base: Duration::from_secs(60),
                step: Duration::from_secs(30),
                ceiling: Duration::from_secs(120),
            },
        )
    }

    fn assets(count: usize) -> Vec<PathBuf> {
        (0..count).map(|i| PathBuf::from(format!("/tmp/cropped_image_{i}.png"))).collect()
    }

    fn transport() -> ChatError {
        ChatError::Transport("connection reset".into())
    }

    #[test]
    fn timeout_escalates_to_ceiling() {
        let ladder = TimeoutLadder {
            base: Duration::from_secs(60),
            step: Duration::from_secs(30),
            ceiling: Duration::from_secs(120),
        };
        assert_eq!(ladder.for_attempt(1), Duration::from_secs(60));
        assert_eq!(ladder.for_attempt(2), Duration::from_secs(90));
        assert_eq!(ladder.for_attempt(3), Duration::from_secs(120));
        assert_eq!(ladder.for_attempt(9), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_delay_is_honored_then_batch_resent() {
        let chat = Arc::new(FakeChat::with_batch_results(vec![
            Err(ChatError::RetryAfter(Duration::from_secs(3))),
            Ok(()),
        ]));
        let photos = assets(10);
        let started = Instant::now();
        let delivered = manager(chat.clone(), 10).deliver(7, &photos).await;
        assert_eq!(delivered, 10);
        assert!(started.elapsed() >= Duration::from_secs(4));

        let batches: Vec<_> = chat
            .sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Batch { photos, timeout, .. } => Some((photos, timeout)),
                _ => None,
            })
            .collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, batches[1].0);
        assert_eq!(batches[0].1, Duration::from_secs(60));
        assert!(batches[1].1 > batches[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_preserve_order() {
        let chat = Arc::new(FakeChat::default());
        let photos = assets(23);
        let delivered = manager(chat.clone(), 10).deliver(1, &photos).await;
        assert_eq!(delivered, 23);
        let sent = chat.sent();
        // 10 + 10 as albums, the last 3 as an album too
        assert_eq!(sent.len(), 3);
        let flattened: Vec<PathBuf> = sent
            .into_iter()
            .flat_map(|s| match s {
                Sent::Batch { photos, .. } => photos,
                _ => Vec::new(),
            })
            .collect();
        assert_eq!(flattened, photos);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_batch_falls_back_to_single_photos() {
        let chat = Arc::new(FakeChat::with_batch_results(
            (0..5).map(|_| Err(transport())).collect(),
        ));
        chat.script_photos(vec![
            Ok(()),
            Err(transport()),
            Err(transport()),
            Err(transport()),
            Ok(()),
        ]);
        let delivered = manager(chat.clone(), 10).deliver(1, &assets(3)).await;
        // second photo exhausts its three attempts and is dropped
        assert_eq!(delivered, 2);
        let photo_calls = chat
            .sent()
            .iter()
            .filter(|s| matches!(s, Sent::Photo { .. }))
            .count();
        assert_eq!(photo_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn single_asset_skips_album() {
        let chat = Arc::new(FakeChat::default());
        let delivered = manager(chat.clone(), 10).deliver(1, &assets(11)).await;
        assert_eq!(delivered, 11);
        assert!(matches!(chat.sent().last(), Some(Sent::Photo { .. })));
    }

    #[tokio::test]
    async fn nothing_to_deliver() {
        let chat = Arc::new(FakeChat::default());
        assert_eq!(manager(chat.clone(), 10).deliver(1, &[]).await, 0);
        assert!(chat.sent().is_empty());
    }
}
