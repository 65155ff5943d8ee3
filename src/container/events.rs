//! 生命周期事件
//!
//! 容器在每次状态变化后发布 [`ContainerEvent`]：
//!
//! - **同步监听器**: 按注册顺序在发布线程上调用，单个监听器 panic 不影响其他监听器
//! - **广播通道**: `tokio::sync::broadcast`，供异步订阅者使用，慢订阅者会丢失最旧的事件
//!
//! # 使用示例
//!
//! ```
//! use chips_container::container::events::{EventDispatcher, EventKind};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let dispatcher = EventDispatcher::new(16);
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! dispatcher.add_listener(move |_event: &chips_container::container::events::ContainerEvent| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//! dispatcher.publish_raw(EventKind::Installed, 1, "mem:a", None);
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::module::ModuleId;
use crate::utils::{generate_id, generate_uuid};

/// 默认广播通道容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Installed,
    LazyActivation,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Unresolved,
    Uninstalled,
    Updated,
    StartLevelChanged,
    Refreshed,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Installed => "INSTALLED",
            EventKind::LazyActivation => "LAZY_ACTIVATION",
            EventKind::Resolved => "RESOLVED",
            EventKind::Starting => "STARTING",
            EventKind::Started => "STARTED",
            EventKind::Stopping => "STOPPING",
            EventKind::Stopped => "STOPPED",
            EventKind::Unresolved => "UNRESOLVED",
            EventKind::Uninstalled => "UNINSTALLED",
            EventKind::Updated => "UPDATED",
            EventKind::StartLevelChanged => "START_LEVEL_CHANGED",
            EventKind::Refreshed => "REFRESHED",
            EventKind::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 容器事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub module_id: ModuleId,
    pub location: String,
    /// 仅 `Error` 事件携带
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 同步监听器
pub trait ContainerListener: Send + Sync {
    fn on_event(&self, event: &ContainerEvent);
}

impl<F> ContainerListener for F
where
    F: Fn(&ContainerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ContainerEvent) {
        self(event)
    }
}

struct ListenerEntry {
    id: String,
    listener: Arc<dyn ContainerListener>,
}

/// 分发统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub published: u64,
    /// 监听器 panic 次数
    pub listener_failures: u64,
}

/// 事件分发器
pub struct EventDispatcher {
    listeners: RwLock<Vec<ListenerEntry>>,
    sender: broadcast::Sender<ContainerEvent>,
    published: AtomicU64,
    listener_failures: AtomicU64,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
            published: AtomicU64::new(0),
            listener_failures: AtomicU64::new(0),
        }
    }

    /// 注册同步监听器，返回监听器 ID
    pub fn add_listener(&self, listener: impl ContainerListener + 'static) -> String {
        self.add_listener_arc(Arc::new(listener))
    }

    pub fn add_listener_arc(&self, listener: Arc<dyn ContainerListener>) -> String {
        let id = generate_id();
        self.listeners.write().push(ListenerEntry {
            id: id.clone(),
            listener,
        });
        id
    }

    pub fn remove_listener(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// 订阅广播通道
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.sender.subscribe()
    }

    /// 发布事件
    pub fn publish(&self, event: ContainerEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(kind = %event.kind, module_id = event.module_id, "发布容器事件");

        let listeners: Vec<Arc<dyn ContainerListener>> = self
            .listeners
            .read()
            .iter()
            .map(|entry| entry.listener.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                self.listener_failures.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %event.kind, module_id = event.module_id, "监听器处理事件时 panic");
            }
        }
        // 没有订阅者时发送失败，忽略
        let _ = self.sender.send(event);
    }

    /// 构造并发布事件
    pub fn publish_raw(
        &self,
        kind: EventKind,
        module_id: ModuleId,
        location: &str,
        message: Option<String>,
    ) {
        self.publish(ContainerEvent {
            event_id: generate_uuid(),
            kind,
            module_id,
            location: location.to_string(),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.published.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_in_order_and_isolated() {
        let dispatcher = EventDispatcher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = seen.clone();
        dispatcher.add_listener(move |e: &ContainerEvent| first.lock().push(format!("1:{}", e.kind)));
        dispatcher.add_listener(|_: &ContainerEvent| panic!("broken listener"));
        let third = seen.clone();
        let id = dispatcher.add_listener(move |e: &ContainerEvent| third.lock().push(format!("3:{}", e.kind)));

        dispatcher.publish_raw(EventKind::Installed, 1, "mem:a", None);
        assert_eq!(*seen.lock(), vec!["1:INSTALLED", "3:INSTALLED"]);
        assert_eq!(dispatcher.stats().listener_failures, 1);

        assert!(dispatcher.remove_listener(&id));
        dispatcher.publish_raw(EventKind::Resolved, 1, "mem:a", None);
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_subscriber() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx = dispatcher.subscribe();
        dispatcher.publish_raw(EventKind::Started, 7, "mem:x", None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Started);
        assert_eq!(event.module_id, 7);
        assert_eq!(event.location, "mem:x");
    }

    #[test]
    fn test_event_kind_serialization() {
        let json = serde_json::to_string(&EventKind::LazyActivation).unwrap();
        assert_eq!(json, "\"LAZY_ACTIVATION\"");
    }
}
