//! Typed pub/sub event bus: per-stream FIFO delivery, priority-ordered
//! handler fan-out, bounded queues with configurable backpressure, and
//! handler-failure isolation.
//!
//! A bare `tokio::sync::broadcast` channel per topic gives "every
//! subscriber sees every message" but no notion of subscriber priority,
//! no backpressure policy, and no per-subscription failure accounting.
//! Those requirements need a bespoke structure built from `dashmap`,
//! `parking_lot`, and `tokio::sync::Notify` instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::config::{BackpressurePolicy, EventBusConfig};
use crate::notifications::schema::{AccountPositionMessage, DepthUpdateMessage, OrderTradeUpdate, TradeMessage};

#[derive(Debug, Clone)]
pub enum BusMessage {
    Order(OrderTradeUpdate),
    Trade(TradeMessage),
    Depth(DepthUpdateMessage),
    Account(AccountPositionMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Default)]
pub struct SubscriptionStats {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Clone)]
pub struct Subscription {
    pub id: u64,
    pub stream_key: String,
    pub priority: Priority,
    pub created_at: i64,
}

type Handler = dyn Fn(&BusMessage) -> anyhow::Result<()> + Send + Sync;

struct SubscriberEntry {
    id: u64,
    priority: Priority,
    seq: u64,
    handler: Arc<Handler>,
    stats: Arc<SubscriptionStats>,
}

struct QueuedEvent {
    stream_key: String,
    message: BusMessage,
}

struct Shard {
    queue: Mutex<VecDeque<QueuedEvent>>,
    notify: Notify,
}

#[derive(Debug, Default)]
pub struct EventBusStats {
    pub published: AtomicU64,
    pub dropped: AtomicU64,
    pub handlers_executed: AtomicU64,
    pub handler_failures: AtomicU64,
    pub subscriptions_created: AtomicU64,
}

pub struct EventBus {
    shards: Vec<Arc<Shard>>,
    subscribers: DashMap<String, RwLock<Vec<SubscriberEntry>>>,
    sub_index: DashMap<u64, String>,
    next_sub_id: AtomicU64,
    next_seq: AtomicU64,
    shard_capacity: usize,
    policy: BackpressurePolicy,
    pub stats: EventBusStats,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Arc<Self> {
        let worker_count = config.dispatch_workers.max(1);
        let shard_capacity = (config.queue_capacity / worker_count).max(1);
        let shards = (0..worker_count)
            .map(|_| {
                Arc::new(Shard {
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .collect();
        Arc::new(EventBus {
            shards,
            subscribers: DashMap::new(),
            sub_index: DashMap::new(),
            next_sub_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            shard_capacity,
            policy: config.backpressure_policy,
            stats: EventBusStats::default(),
        })
    }

    /// Spawns one dispatch worker per shard. Must be called from within
    /// a running Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        for (index, shard) in self.shards.iter().enumerate() {
            let bus = Arc::clone(self);
            let shard = Arc::clone(shard);
            tokio::spawn(async move {
                bus.run_shard(index, shard).await;
            });
        }
    }

    async fn run_shard(self: Arc<Self>, index: usize, shard: Arc<Shard>) {
        tracing::info!(shard = index, "event bus dispatch worker started");
        loop {
            let next = shard.queue.lock().pop_front();
            let event = match next {
                Some(event) => event,
                None => {
                    shard.notify.notified().await;
                    continue;
                }
            };
            self.dispatch(event);
        }
    }

    fn dispatch(&self, event: QueuedEvent) {
        let Some(subs) = self.subscribers.get(&event.stream_key) else {
            return;
        };
        for sub in subs.read().iter() {
            self.stats.handlers_executed.fetch_add(1, Ordering::Relaxed);
            let handler = sub.handler.as_ref();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event.message)));
            match outcome {
                Ok(Ok(())) => {
                    sub.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    tracing::warn!(stream = %event.stream_key, subscription = sub.id, error = %err, "event handler returned an error");
                    sub.stats.failed.fetch_add(1, Ordering::Relaxed);
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    tracing::warn!(stream = %event.stream_key, subscription = sub.id, "event handler panicked");
                    sub.stats.failed.fetch_add(1, Ordering::Relaxed);
                    self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn subscribe<F>(&self, stream_key: impl Into<String>, priority: Priority, handler: F) -> Subscription
    where
        F: Fn(&BusMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let stream_key = stream_key.into();
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let created_at = crate::models::now_millis();
        let entry = SubscriberEntry {
            id,
            priority,
            seq,
            handler: Arc::new(handler),
            stats: Arc::new(SubscriptionStats::default()),
        };
        {
            let mut list = self.subscribers.entry(stream_key.clone()).or_default();
            list.write().push(entry);
            list.write().sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        }
        self.sub_index.insert(id, stream_key.clone());
        self.stats.subscriptions_created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(stream = %stream_key, subscription = id, "subscription created");
        Subscription { id, stream_key, priority, created_at }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let Some((_, stream_key)) = self.sub_index.remove(&id) else {
            return false;
        };
        if let Some(list) = self.subscribers.get(&stream_key) {
            list.write().retain(|entry| entry.id != id);
        }
        true
    }

    /// Non-blocking publish: enqueues onto the shard owning `stream_key`
    /// (all events for a stream share a shard, so per-stream FIFO order
    /// is preserved), applying the configured backpressure policy if the
    /// shard is at capacity.
    pub fn publish(&self, stream_key: impl Into<String>, message: BusMessage) {
        let stream_key = stream_key.into();
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        let shard_index = self.shard_for(&stream_key);
        let shard = &self.shards[shard_index];
        let mut queue = shard.queue.lock();
        if queue.len() >= self.shard_capacity {
            match self.policy {
                BackpressurePolicy::DropNewest => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(stream = %stream_key, "event bus shard full, dropping newest event");
                    return;
                }
                BackpressurePolicy::DropOldestLowPriority => {
                    let victim = queue
                        .iter()
                        .position(|queued| self.max_priority(&queued.stream_key) == Priority::Low)
                        .unwrap_or(0);
                    queue.remove(victim);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(stream = %stream_key, "event bus shard full, evicted oldest low-priority event");
                }
            }
        }
        queue.push_back(QueuedEvent { stream_key, message });
        drop(queue);
        shard.notify.notify_one();
    }

    fn max_priority(&self, stream_key: &str) -> Priority {
        self.subscribers
            .get(stream_key)
            .and_then(|list| list.read().iter().map(|e| e.priority).max())
            .unwrap_or(Priority::Normal)
    }

    fn shard_for(&self, stream_key: &str) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        stream_key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.shards.iter().map(|s| s.queue.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EventBusConfig {
        EventBusConfig {
            queue_capacity: 8,
            dispatch_workers: 1,
            backpressure_policy: BackpressurePolicy::DropNewest,
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber_in_priority_order() {
        let bus = EventBus::new(config());
        bus.start();
        let order: Vec<u32> = Vec::new();
        let order = Arc::new(Mutex::new(order));
        let order_low = Arc::clone(&order);
        bus.subscribe("BTCUSDT@trade", Priority::Low, move |_| {
            order_low.lock().push(2);
            Ok(())
        });
        let order_high = Arc::clone(&order);
        bus.subscribe("BTCUSDT@trade", Priority::High, move |_| {
            order_high.lock().push(1);
            Ok(())
        });
        bus.publish(
            "BTCUSDT@trade",
            BusMessage::Trade(TradeMessage {
                symbol: "BTCUSDT".into(),
                trade_id: 1,
                price: rust_decimal::Decimal::ONE,
                quantity: rust_decimal::Decimal::ONE,
                buyer_order_id: uuid::Uuid::new_v4(),
                seller_order_id: uuid::Uuid::new_v4(),
                is_buyer_maker: false,
                trade_time: 0,
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = EventBus::new(config());
        bus.start();
        let hit = Arc::new(std::sync::atomic::AtomicBool::new(false));
        bus.subscribe("BTCUSDT@trade", Priority::Normal, |_| anyhow::bail!("boom"));
        let hit2 = Arc::clone(&hit);
        bus.subscribe("BTCUSDT@trade", Priority::Normal, move |_| {
            hit2.store(true, Ordering::Relaxed);
            Ok(())
        });
        bus.publish(
            "BTCUSDT@trade",
            BusMessage::Trade(TradeMessage {
                symbol: "BTCUSDT".into(),
                trade_id: 1,
                price: rust_decimal::Decimal::ONE,
                quantity: rust_decimal::Decimal::ONE,
                buyer_order_id: uuid::Uuid::new_v4(),
                seller_order_id: uuid::Uuid::new_v4(),
                is_buyer_maker: false,
                trade_time: 0,
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(hit.load(Ordering::Relaxed));
        assert_eq!(bus.stats.handler_failures.load(Ordering::Relaxed), 1);
    }
}
