//! 消息总线：进度事件与发现批次的进程内扇出

pub mod hub;
pub mod message;

pub use hub::{Handler, MessageBus, SubscriptionId, DEFAULT_HISTORY_CAPACITY};
pub use message::{
    BusMessage, BusPayload, ProgressEvent, TOPIC_FINDINGS_CORRELATED, TOPIC_FINDINGS_RAW,
    TOPIC_FINDINGS_TRIAGED, TOPIC_RUN_PROGRESS,
};
