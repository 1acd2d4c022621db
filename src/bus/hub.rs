//! 进程内发布/订阅总线
//!
//! - publish 同步投递给该主题当前的全部订阅者，按订阅注册顺序
//! - 订阅表锁只在复制处理器列表时持有，执行处理器期间不持锁
//! - 处理器 panic 会被捕获并记录，不会传播给发布者或其他订阅者
//! - 每个主题保留一个有界历史环形缓冲，仅用于审计/调试，不保证持久

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::message::BusMessage;

/// 默认每主题历史容量
pub const DEFAULT_HISTORY_CAPACITY: usize = 128;

/// 订阅句柄，用于取消订阅
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

/// 订阅处理器
pub type Handler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

/// 消息总线
pub struct MessageBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    history: Mutex<HashMap<String, VecDeque<Arc<BusMessage>>>>,
    history_capacity: usize,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// capacity 为 0 时不保留历史
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            history_capacity: capacity,
            next_id: AtomicU64::new(0),
        }
    }

    /// 订阅主题
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.entry(topic.into()).or_default().push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// 取消订阅；返回是否找到
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let mut found = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != id);
            found |= list.len() != before;
        }
        found
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// 发布消息，返回成功处理的订阅者数量（panic 的处理器不计入）
    pub fn publish(&self, message: BusMessage) -> usize {
        let message = Arc::new(message);
        self.record(&message);

        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subscribers
                .get(&message.topic)
                .map(|list| list.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&message)));
            match result {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(
                        topic = %message.topic,
                        producer = %message.producer,
                        %reason,
                        "Bus subscriber panicked"
                    );
                }
            }
        }
        delivered
    }

    /// 主题的历史消息（最旧在前）
    pub fn history(&self, topic: &str) -> Vec<Arc<BusMessage>> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, message: &Arc<BusMessage>) {
        if self.history_capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let ring = history.entry(message.topic.clone()).or_default();
        if ring.len() == self.history_capacity {
            ring.pop_front();
        }
        ring.push_back(Arc::clone(message));
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusPayload, ProgressEvent, TOPIC_FINDINGS_RAW, TOPIC_RUN_PROGRESS};
    use crate::core::RunPhase;
    use uuid::Uuid;

    fn progress() -> BusMessage {
        BusMessage::progress(
            "test",
            ProgressEvent::PhaseChanged {
                run_id: Uuid::new_v4(),
                phase: RunPhase::Selecting,
            },
        )
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(TOPIC_RUN_PROGRESS, move |_| seen.lock().unwrap().push(n));
        }
        assert_eq!(bus.publish(progress()), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = MessageBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(TOPIC_FINDINGS_RAW, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(progress());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = MessageBus::new();
        let after = Arc::new(AtomicU64::new(0));
        bus.subscribe(TOPIC_RUN_PROGRESS, |_| panic!("handler exploded"));
        let a = Arc::clone(&after);
        bus.subscribe(TOPIC_RUN_PROGRESS, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let delivered = bus.publish(progress());
        assert_eq!(delivered, 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = MessageBus::with_history_capacity(2);
        let first = progress();
        let first_id = first.id;
        bus.publish(first);
        bus.publish(progress());
        bus.publish(progress());
        let history = bus.history(TOPIC_RUN_PROGRESS);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.id != first_id));
        assert!(bus.history("unknown").is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = MessageBus::new();
        let id = bus.subscribe(TOPIC_RUN_PROGRESS, |_| {});
        assert_eq!(bus.subscriber_count(TOPIC_RUN_PROGRESS), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(progress()), 0);
    }

    #[test]
    fn test_handler_can_publish_without_deadlock() {
        let bus = Arc::new(MessageBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(TOPIC_RUN_PROGRESS, move |_| {
            inner.publish(BusMessage::findings(TOPIC_FINDINGS_RAW, "nested", vec![]));
        });
        bus.publish(progress());
        let raw = bus.history(TOPIC_FINDINGS_RAW);
        assert_eq!(raw.len(), 1);
        assert!(matches!(raw[0].payload, BusPayload::Findings(_)));
    }
}
