//! 数据库读写锁
//!
//! 在 `parking_lot::RwLock` 外记录每个线程持有的读锁数量。持有读锁的线程再请求写锁
//! 属于编程错误，立即返回 [`ContainerError::LockUpgrade`] 而不是死锁。
//! 锁只在同步代码中短暂持有，从不跨越 `.await`。

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use crate::utils::{ContainerError, Result};

#[derive(Debug, Default)]
pub(crate) struct DbLock<T> {
    inner: RwLock<T>,
    readers: Mutex<HashMap<ThreadId, usize>>,
}

impl<T> DbLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// 获取读锁，同一线程可重复获取
    pub(crate) fn read(&self) -> DbReadGuard<'_, T> {
        let guard = self.inner.read_recursive();
        *self.readers.lock().entry(thread::current().id()).or_insert(0) += 1;
        DbReadGuard { lock: self, guard }
    }

    /// 获取写锁
    pub(crate) fn write(&self) -> Result<DbWriteGuard<'_, T>> {
        if self.readers.lock().contains_key(&thread::current().id()) {
            return Err(ContainerError::LockUpgrade);
        }
        Ok(DbWriteGuard {
            guard: self.inner.write(),
        })
    }

    fn release_read(&self) {
        let mut readers = self.readers.lock();
        let id = thread::current().id();
        if let Some(count) = readers.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&id);
            }
        }
    }
}

pub(crate) struct DbReadGuard<'a, T> {
    lock: &'a DbLock<T>,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for DbReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for DbReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub(crate) struct DbWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Deref for DbWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for DbWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_rejected() {
        let lock = DbLock::new(1u32);
        let read = lock.read();
        assert_eq!(*read, 1);
        assert!(matches!(lock.write(), Err(ContainerError::LockUpgrade)));
        drop(read);

        let mut write = lock.write().unwrap();
        *write = 2;
        drop(write);
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn test_nested_reads() {
        let lock = DbLock::new(());
        let a = lock.read();
        let b = lock.read();
        drop(a);
        assert!(lock.write().is_err());
        drop(b);
        assert!(lock.write().is_ok());
    }
}
