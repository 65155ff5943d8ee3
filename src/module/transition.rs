//! 模块状态变更锁
//!
//! 每个模块拥有一把可重入的状态变更锁。锁按操作上下文（[`OperationContext`]）重入，
//! 并记录正在进行中的状态变更事件，用于在嵌套获取时校验顺序：
//!
//! - `Started`、`Updated`、`Uninstalled`、`Unresolved` 只能在未持有任何事件时获取；
//! - `Resolved` 只能嵌套在 `Started` 之内；
//! - `Stopped` 只能嵌套在 `Updated`、`Unresolved` 或 `Uninstalled` 之内。
//!
//! 违反顺序立即返回 [`ContainerError::StateLockOrder`]，等待超时返回
//! [`ContainerError::StateChangeTimeout`] 并附带持有者诊断信息。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::utils::{next_operation_id, ContainerError, Result};

/// 状态变更事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionEvent {
    Started,
    Stopped,
    Updated,
    Uninstalled,
    Resolved,
    Unresolved,
}

impl TransitionEvent {
    /// 在已持有 `held` 的情况下能否获取本事件
    fn may_nest_in(self, held: &[TransitionEvent]) -> bool {
        if held.is_empty() {
            return true;
        }
        match self {
            TransitionEvent::Started
            | TransitionEvent::Updated
            | TransitionEvent::Uninstalled
            | TransitionEvent::Unresolved => false,
            TransitionEvent::Resolved => held.contains(&TransitionEvent::Started),
            TransitionEvent::Stopped => held.iter().any(|e| {
                matches!(
                    e,
                    TransitionEvent::Updated
                        | TransitionEvent::Unresolved
                        | TransitionEvent::Uninstalled
                )
            }),
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionEvent::Started => "STARTED",
            TransitionEvent::Stopped => "STOPPED",
            TransitionEvent::Updated => "UPDATED",
            TransitionEvent::Uninstalled => "UNINSTALLED",
            TransitionEvent::Resolved => "RESOLVED",
            TransitionEvent::Unresolved => "UNRESOLVED",
        };
        f.write_str(name)
    }
}

/// 操作上下文
///
/// 每个公开入口创建一个上下文并沿调用链传递，标识状态变更锁与解析许可的持有者。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    id: u64,
    label: &'static str,
}

impl OperationContext {
    pub fn new(label: &'static str) -> Self {
        Self {
            id: next_operation_id(),
            label,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<OperationContext>,
    in_flight: Vec<TransitionEvent>,
    acquired_at: Option<Instant>,
}

/// 可重入状态变更锁
#[derive(Debug, Default)]
pub struct StateChangeLock {
    state: Mutex<LockState>,
    released: Notify,
}

impl StateChangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取锁
    ///
    /// `subject` 仅用于错误信息。
    pub async fn acquire(
        self: &Arc<Self>,
        ctx: &OperationContext,
        event: TransitionEvent,
        timeout: Duration,
        subject: &str,
    ) -> Result<TransitionGuard> {
        let deadline = Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.state.lock();
                let holder_id = state.holder.as_ref().map(|h| h.id);
                match holder_id {
                    None => {
                        state.holder = Some(ctx.clone());
                        state.in_flight.push(event);
                        state.acquired_at = Some(Instant::now());
                        trace!(subject = %subject, transition = %event, op = %ctx, "获取状态变更锁");
                        return Ok(self.guard(event));
                    }
                    Some(id) if id == ctx.id => {
                        if !event.may_nest_in(&state.in_flight) {
                            return Err(ContainerError::StateLockOrder {
                                module: subject.to_string(),
                                requested: event,
                                held: state.in_flight.clone(),
                            });
                        }
                        state.in_flight.push(event);
                        trace!(subject = %subject, transition = %event, op = %ctx, "重入状态变更锁");
                        return Ok(self.guard(event));
                    }
                    Some(_) => {}
                }
            }

            let now = Instant::now();
            if now >= deadline
                || tokio::time::timeout(deadline - now, released).await.is_err()
            {
                let holder = self.describe_holder();
                debug!(subject = %subject, transition = %event, holder = %holder, "状态变更锁等待超时");
                return Err(ContainerError::StateChangeTimeout {
                    module: subject.to_string(),
                    transition: event,
                    holder,
                });
            }
        }
    }

    fn guard(self: &Arc<Self>, event: TransitionEvent) -> TransitionGuard {
        TransitionGuard {
            lock: self.clone(),
            event,
        }
    }

    /// 当前持有者的诊断描述
    pub fn describe_holder(&self) -> String {
        let state = self.state.lock();
        match &state.holder {
            Some(holder) => format!(
                "持有者 {} 正在处理 {:?}，已持有 {}ms",
                holder,
                state.in_flight,
                state
                    .acquired_at
                    .map(|t| t.elapsed().as_millis())
                    .unwrap_or_default()
            ),
            None => "无持有者".to_string(),
        }
    }

    /// 指定上下文当前持有的事件
    pub fn held_by(&self, ctx: &OperationContext) -> Vec<TransitionEvent> {
        let state = self.state.lock();
        match &state.holder {
            Some(holder) if holder.id == ctx.id => state.in_flight.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    fn release(&self, event: TransitionEvent) {
        let mut state = self.state.lock();
        if let Some(pos) = state.in_flight.iter().rposition(|e| *e == event) {
            state.in_flight.remove(pos);
        }
        if state.in_flight.is_empty() {
            state.holder = None;
            state.acquired_at = None;
            drop(state);
            self.released.notify_waiters();
        }
    }
}

/// 状态变更锁守卫，释放时弹出对应事件
#[derive(Debug)]
pub struct TransitionGuard {
    lock: Arc<StateChangeLock>,
    event: TransitionEvent,
}

impl TransitionGuard {
    pub fn event(&self) -> TransitionEvent {
        self.event
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        self.lock.release(self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_reentrant_nesting_rules() {
        let lock = Arc::new(StateChangeLock::new());
        let ctx = OperationContext::new("test");

        let started = lock.acquire(&ctx, TransitionEvent::Started, WAIT, "m").await.unwrap();
        let resolved = lock.acquire(&ctx, TransitionEvent::Resolved, WAIT, "m").await.unwrap();
        assert_eq!(
            lock.held_by(&ctx),
            vec![TransitionEvent::Started, TransitionEvent::Resolved]
        );

        let err = lock
            .acquire(&ctx, TransitionEvent::Stopped, WAIT, "m")
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::StateLockOrder { .. }));

        drop(resolved);
        drop(started);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_stopped_nests_inside_updated() {
        let lock = Arc::new(StateChangeLock::new());
        let ctx = OperationContext::new("test");
        let _updated = lock.acquire(&ctx, TransitionEvent::Updated, WAIT, "m").await.unwrap();
        let _stopped = lock.acquire(&ctx, TransitionEvent::Stopped, WAIT, "m").await.unwrap();

        let err = lock
            .acquire(&ctx, TransitionEvent::Unresolved, WAIT, "m")
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::StateLockOrder { .. }));
    }

    #[tokio::test]
    async fn test_resolved_outside_started_is_rejected_when_nested() {
        let lock = Arc::new(StateChangeLock::new());
        let ctx = OperationContext::new("test");
        let _unresolved = lock
            .acquire(&ctx, TransitionEvent::Unresolved, WAIT, "m")
            .await
            .unwrap();
        assert!(lock
            .acquire(&ctx, TransitionEvent::Resolved, WAIT, "m")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_timeout_reports_holder() {
        let lock = Arc::new(StateChangeLock::new());
        let owner = OperationContext::new("owner");
        let other = OperationContext::new("other");
        let _guard = lock.acquire(&owner, TransitionEvent::Started, WAIT, "m").await.unwrap();

        let err = lock
            .acquire(&other, TransitionEvent::Started, Duration::from_millis(20), "m")
            .await
            .unwrap_err();
        match err {
            ContainerError::StateChangeTimeout { holder, .. } => {
                assert!(holder.contains("owner"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let lock = Arc::new(StateChangeLock::new());
        let owner = OperationContext::new("owner");
        let guard = lock.acquire(&owner, TransitionEvent::Started, WAIT, "m").await.unwrap();

        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let ctx = OperationContext::new("waiter");
            waiter_lock
                .acquire(&ctx, TransitionEvent::Stopped, WAIT, "m")
                .await
                .map(|g| g.event())
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert_eq!(waiter.await.unwrap().unwrap(), TransitionEvent::Stopped);
    }
}
