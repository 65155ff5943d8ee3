//! ID 生成工具
//!
//! - 监听器订阅 ID：10 位 62 进制字符串（0-9, a-z, A-Z）
//! - 事件 ID：UUID v4
//! - 操作 ID / 修订 ID：进程内单调递增序列

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// ID 长度
const ID_LENGTH: usize = 10;

/// 生成 10 位 62 进制 ID
///
/// 使用时间戳与随机数组合。
///
/// # Example
///
/// ```
/// use chips_container::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let random: u64 = rng.gen();
    let mut value = timestamp ^ random;

    let mut result = String::with_capacity(ID_LENGTH);
    let mut digits = [0u8; ID_LENGTH];
    for slot in digits.iter_mut().rev() {
        *slot = BASE62_CHARS[(value % 62) as usize];
        value /= 62;
    }
    for digit in digits {
        result.push(digit as char);
    }
    result
}

/// 生成 UUID v4 格式的 ID
///
/// 用于事件 ID 等需要全局唯一性的场景
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 单调递增 ID 序列
///
/// 序列从给定起点开始，每次调用 [`IdSequence::next`] 返回下一个值。
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    /// 创建从 `start` 开始的序列
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// 取得下一个 ID
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// 查看下一个将要分配的 ID（不消耗）
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    /// 确保后续分配的 ID 不小于 `value`
    pub fn advance_to(&self, value: u64) {
        self.next.fetch_max(value, Ordering::Relaxed);
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// 进程内的操作 ID 序列
static OPERATION_IDS: IdSequence = IdSequence::starting_at(1);

/// 分配新的操作 ID
pub fn next_operation_id() -> u64 {
    OPERATION_IDS.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(generate_id()), "ID collision detected");
        }
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
    }

    #[test]
    fn test_id_sequence() {
        let seq = IdSequence::starting_at(5);
        assert_eq!(seq.next(), 5);
        assert_eq!(seq.next(), 6);
        seq.advance_to(10);
        assert_eq!(seq.peek(), 10);
        seq.advance_to(3);
        assert_eq!(seq.next(), 10);
    }

    #[test]
    fn test_operation_ids_increase() {
        let a = next_operation_id();
        let b = next_operation_id();
        assert!(b > a);
    }
}
