//! 容器级锁
//!
//! - [`ResolutionPermits`]: 基于信号量的解析许可，限制同时进行的解析轮次数量。
//!   许可按操作上下文可重入，已持有许可的操作再次进入解析不会与自己死锁。
//! - [`InstallLocks`]: 按位置与符号名加锁的安装锁，避免同一位置或同名模块被并发安装。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::module::OperationContext;
use crate::utils::{ContainerError, Result};

/// 默认解析许可数量
pub const DEFAULT_RESOLUTION_PERMITS: usize = 10;

/// 解析许可
///
/// # Example
///
/// ```rust
/// use chips_container::container::locks::ResolutionPermits;
/// use chips_container::module::OperationContext;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let permits = ResolutionPermits::new(2);
///     let ctx = OperationContext::new("doc");
///     let outer = permits.acquire(&ctx, Duration::from_secs(1)).await.unwrap();
///     // 同一上下文重入不占用新的许可
///     let inner = permits.acquire(&ctx, Duration::from_secs(1)).await.unwrap();
///     assert_eq!(permits.available_permits(), 1);
///     drop(inner);
///     drop(outer);
///     assert_eq!(permits.available_permits(), 2);
/// }
/// ```
#[derive(Debug)]
pub struct ResolutionPermits {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    holders: Holders,
}

/// 持有许可的上下文；信号量许可在重入深度归零时随记录一起释放
#[derive(Debug)]
struct Holder {
    depth: usize,
    _permit: OwnedSemaphorePermit,
}

type Holders = Arc<Mutex<HashMap<u64, Holder>>>;

impl ResolutionPermits {
    pub fn new(max_permits: usize) -> Self {
        let max_permits = max_permits.max(1);
        debug!(max_permits, "创建解析许可");
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            holders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 获取许可，最多等待 `timeout`
    pub async fn acquire(&self, ctx: &OperationContext, timeout: Duration) -> Result<PermitGuard> {
        {
            let mut holders = self.holders.lock();
            if let Some(holder) = holders.get_mut(&ctx.id()) {
                holder.depth += 1;
                trace!(ctx = %ctx, depth = holder.depth, "解析许可重入");
                return Ok(PermitGuard {
                    ctx_id: ctx.id(),
                    reentrant: true,
                    holders: self.holders.clone(),
                });
            }
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ContainerError::Internal("解析许可信号量已关闭".to_string()));
            }
            Err(_) => {
                let available = self.semaphore.available_permits();
                warn!(ctx = %ctx, available, "解析许可获取超时");
                return Err(ContainerError::ResolutionPermitTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                    available,
                });
            }
        };
        self.holders.lock().insert(
            ctx.id(),
            Holder {
                depth: 1,
                _permit: permit,
            },
        );
        Ok(PermitGuard {
            ctx_id: ctx.id(),
            reentrant: false,
            holders: self.holders.clone(),
        })
    }

    /// 上下文是否已持有许可
    pub fn is_held_by(&self, ctx: &OperationContext) -> bool {
        self.holders.lock().contains_key(&ctx.id())
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }
}

impl Default for ResolutionPermits {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLUTION_PERMITS)
    }
}

/// 解析许可守卫
///
/// 同一上下文的全部守卫释放后才归还信号量许可，与释放顺序无关。
#[derive(Debug)]
pub struct PermitGuard {
    ctx_id: u64,
    reentrant: bool,
    holders: Holders,
}

impl PermitGuard {
    /// 是否为重入获取
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let released = {
            let mut holders = self.holders.lock();
            match holders.get_mut(&self.ctx_id) {
                Some(holder) if holder.depth > 1 => {
                    holder.depth -= 1;
                    None
                }
                Some(_) => holders.remove(&self.ctx_id),
                None => None,
            }
        };
        drop(released);
    }
}

type KeyedMutexes = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// 按键加锁的互斥表
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: KeyedMutexes,
}

impl KeyedLocks {
    async fn lock(&self, key: &str, timeout: Duration) -> Result<KeyedGuard> {
        let mutex = self
            .locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(KeyedGuard {
                key: key.to_string(),
                guard: Some(guard),
                locks: self.locks.clone(),
            }),
            Err(_) => {
                warn!(key, timeout_ms = timeout.as_millis() as u64, "安装锁获取超时");
                Err(ContainerError::InstallLockTimeout(key.to_string()))
            }
        }
    }
}

#[derive(Debug)]
struct KeyedGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyedMutexes,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        // 表本身持有一个引用，没有其他等待者时移除
        if locks
            .get(&self.key)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// 安装锁
#[derive(Debug, Default)]
pub struct InstallLocks {
    locations: KeyedLocks,
    names: KeyedLocks,
}

/// 安装锁守卫：先位置后符号名
#[derive(Debug)]
pub struct InstallGuard {
    _name: Option<KeyedGuard>,
    _location: KeyedGuard,
}

impl InstallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次锁定位置与符号名
    pub async fn lock(
        &self,
        location: &str,
        symbolic_name: Option<&str>,
        timeout: Duration,
    ) -> Result<InstallGuard> {
        let location_guard = self.locations.lock(location, timeout).await?;
        let name_guard = match symbolic_name {
            Some(name) => Some(self.names.lock(name, timeout).await?),
            None => None,
        };
        Ok(InstallGuard {
            _name: name_guard,
            _location: location_guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_timeout_reports_available() {
        let permits = ResolutionPermits::new(1);
        let a = OperationContext::new("a");
        let b = OperationContext::new("b");
        let _held = permits.acquire(&a, Duration::from_secs(1)).await.unwrap();

        let err = permits
            .acquire(&b, Duration::from_millis(20))
            .await
            .unwrap_err();
        match err {
            ContainerError::ResolutionPermitTimeout { available, .. } => assert_eq!(available, 0),
            other => panic!("unexpected error: {other}"),
        }
        let err = permits
            .acquire(&b, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_reentrant_permit() {
        let permits = ResolutionPermits::new(1);
        let ctx = OperationContext::new("nested");
        let outer = permits.acquire(&ctx, Duration::from_secs(1)).await.unwrap();
        let inner = permits.acquire(&ctx, Duration::from_millis(10)).await.unwrap();
        assert!(!outer.is_reentrant());
        assert!(inner.is_reentrant());
        drop(outer);
        // 内层守卫仍在，上下文仍持有许可
        assert!(permits.is_held_by(&ctx));
        assert_eq!(permits.available_permits(), 0);
        let other = OperationContext::new("other");
        assert!(permits.acquire(&other, Duration::from_millis(10)).await.is_err());
        drop(inner);
        assert!(!permits.is_held_by(&ctx));
        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_install_lock_serializes_location() {
        let locks = InstallLocks::new();
        let guard = locks
            .lock("mem:a", Some("a"), Duration::from_secs(1))
            .await
            .unwrap();
        let err = locks
            .lock("mem:a", Some("other"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::InstallLockTimeout(ref k) if k == "mem:a"));

        let err = locks
            .lock("mem:b", Some("a"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::InstallLockTimeout(ref k) if k == "a"));

        drop(guard);
        assert!(locks
            .lock("mem:a", Some("a"), Duration::from_millis(20))
            .await
            .is_ok());
    }
}
