//! 解析性能指标
//!
//! 收集解析循环的次数、成功/失败、快照过期重试、批次超时、动态解析命中率与延迟分布。
//!
//! # 示例
//!
//! ```rust
//! use chips_container::utils::metrics::ResolutionMetrics;
//!
//! let metrics = ResolutionMetrics::new();
//! metrics.record_cycle(true, 1500);
//! metrics.record_stale_retry();
//!
//! let report = metrics.export();
//! assert_eq!(report.cycles.total, 1);
//! assert_eq!(report.cycles.stale_retries, 1);
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// 延迟样本的最大数量
const MAX_LATENCY_SAMPLES: usize = 10_000;

/// 解析指标收集器
///
/// 计数器使用 `AtomicU64`，延迟样本使用互斥锁保护的环形缓冲。
#[derive(Debug)]
pub struct ResolutionMetrics {
    /// 完成的解析循环总数
    cycles_total: AtomicU64,
    /// 成功应用的解析循环
    cycles_applied: AtomicU64,
    /// 失败的解析循环（必需触发器未解析）
    cycles_failed: AtomicU64,
    /// 因数据库时间戳变化导致的重试
    stale_retries: AtomicU64,
    /// 因模块状态锁竞争导致的重试
    contention_retries: AtomicU64,
    /// 批次超时后回退为单个解析的次数
    batch_timeouts: AtomicU64,
    /// 动态解析命中次数
    dynamic_hits: AtomicU64,
    /// 动态解析未命中次数
    dynamic_misses: AtomicU64,
    /// 动态解析命中缓存的未命中次数
    dynamic_cached_misses: AtomicU64,
    /// 延迟样本（微秒）
    latency_samples: Mutex<Vec<u64>>,
    /// 下一个覆盖位置
    sample_cursor: AtomicU64,
    /// 创建时间
    started_at: DateTime<Utc>,
}

impl ResolutionMetrics {
    /// 创建新的指标收集器
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            cycles_applied: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            stale_retries: AtomicU64::new(0),
            contention_retries: AtomicU64::new(0),
            batch_timeouts: AtomicU64::new(0),
            dynamic_hits: AtomicU64::new(0),
            dynamic_misses: AtomicU64::new(0),
            dynamic_cached_misses: AtomicU64::new(0),
            latency_samples: Mutex::new(Vec::with_capacity(1024)),
            sample_cursor: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    /// 记录一次完整的解析循环
    pub fn record_cycle(&self, success: bool, latency_us: u64) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.cycles_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut samples = self.latency_samples.lock();
        if samples.len() < MAX_LATENCY_SAMPLES {
            samples.push(latency_us);
        } else {
            let cursor = self.sample_cursor.fetch_add(1, Ordering::Relaxed) as usize;
            samples[cursor % MAX_LATENCY_SAMPLES] = latency_us;
        }
    }

    /// 记录快照过期重试
    pub fn record_stale_retry(&self) {
        self.stale_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录锁竞争重试
    pub fn record_contention_retry(&self) {
        self.contention_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录批次超时
    pub fn record_batch_timeout(&self) {
        self.batch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录动态解析结果
    pub fn record_dynamic(&self, hit: bool) {
        if hit {
            self.dynamic_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dynamic_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 记录命中未命中缓存的动态解析
    pub fn record_dynamic_cached_miss(&self) {
        self.dynamic_cached_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// 快照过期重试次数
    pub fn stale_retries(&self) -> u64 {
        self.stale_retries.load(Ordering::Relaxed)
    }

    /// 锁竞争重试次数
    pub fn contention_retries(&self) -> u64 {
        self.contention_retries.load(Ordering::Relaxed)
    }

    /// 批次超时次数
    pub fn batch_timeouts(&self) -> u64 {
        self.batch_timeouts.load(Ordering::Relaxed)
    }

    /// 解析循环总数
    pub fn cycles(&self) -> u64 {
        self.cycles_total.load(Ordering::Relaxed)
    }

    /// 计算延迟百分位数（p 取 0.0 - 1.0）
    pub fn percentile(&self, p: f64) -> u64 {
        let mut samples = self.latency_samples.lock().clone();
        if samples.is_empty() {
            return 0;
        }
        samples.sort_unstable();
        let rank = ((samples.len() as f64) * p.clamp(0.0, 1.0)).ceil() as usize;
        samples[rank.saturating_sub(1).min(samples.len() - 1)]
    }

    /// 平均延迟（微秒）
    pub fn average_latency(&self) -> u64 {
        let samples = self.latency_samples.lock();
        if samples.is_empty() {
            return 0;
        }
        samples.iter().sum::<u64>() / samples.len() as u64
    }

    /// 导出指标报告
    pub fn export(&self) -> MetricsReport {
        let total = self.cycles_total.load(Ordering::Relaxed);
        let applied = self.cycles_applied.load(Ordering::Relaxed);
        MetricsReport {
            timestamp: Utc::now(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            cycles: CycleMetrics {
                total,
                applied,
                failed: self.cycles_failed.load(Ordering::Relaxed),
                stale_retries: self.stale_retries(),
                contention_retries: self.contention_retries(),
                batch_timeouts: self.batch_timeouts(),
                success_rate: if total == 0 {
                    0.0
                } else {
                    applied as f64 / total as f64
                },
            },
            dynamic: DynamicMetrics {
                hits: self.dynamic_hits.load(Ordering::Relaxed),
                misses: self.dynamic_misses.load(Ordering::Relaxed),
                cached_misses: self.dynamic_cached_misses.load(Ordering::Relaxed),
            },
            latency: LatencyMetrics {
                avg_us: self.average_latency(),
                p50_us: self.percentile(0.50),
                p95_us: self.percentile(0.95),
                p99_us: self.percentile(0.99),
            },
        }
    }

    /// 重置全部指标
    pub fn reset(&self) {
        for counter in [
            &self.cycles_total,
            &self.cycles_applied,
            &self.cycles_failed,
            &self.stale_retries,
            &self.contention_retries,
            &self.batch_timeouts,
            &self.dynamic_hits,
            &self.dynamic_misses,
            &self.dynamic_cached_misses,
            &self.sample_cursor,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latency_samples.lock().clear();
    }
}

impl Default for ResolutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 解析循环指标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub total: u64,
    pub applied: u64,
    pub failed: u64,
    pub stale_retries: u64,
    pub contention_retries: u64,
    pub batch_timeouts: u64,
    pub success_rate: f64,
}

/// 动态解析指标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicMetrics {
    pub hits: u64,
    pub misses: u64,
    pub cached_misses: u64,
}

/// 延迟分布（微秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// 指标报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub cycles: CycleMetrics,
    pub dynamic: DynamicMetrics,
    pub latency: LatencyMetrics,
}

impl MetricsReport {
    /// 导出为格式化 JSON
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_counters() {
        let metrics = ResolutionMetrics::new();
        metrics.record_cycle(true, 100);
        metrics.record_cycle(true, 200);
        metrics.record_cycle(false, 300);

        let report = metrics.export();
        assert_eq!(report.cycles.total, 3);
        assert_eq!(report.cycles.applied, 2);
        assert_eq!(report.cycles.failed, 1);
        assert!((report.cycles.success_rate - 2.0 / 3.0).abs() < 0.001);
        assert_eq!(report.latency.avg_us, 200);
    }

    #[test]
    fn test_percentiles() {
        let metrics = ResolutionMetrics::new();
        for i in 1..=100 {
            metrics.record_cycle(true, i);
        }
        assert_eq!(metrics.percentile(0.5), 50);
        assert_eq!(metrics.percentile(0.99), 99);
        assert_eq!(metrics.percentile(1.0), 100);
    }

    #[test]
    fn test_retry_and_dynamic_counters() {
        let metrics = ResolutionMetrics::new();
        metrics.record_stale_retry();
        metrics.record_contention_retry();
        metrics.record_batch_timeout();
        metrics.record_dynamic(true);
        metrics.record_dynamic(false);
        metrics.record_dynamic_cached_miss();

        let report = metrics.export();
        assert_eq!(report.cycles.stale_retries, 1);
        assert_eq!(report.cycles.contention_retries, 1);
        assert_eq!(report.cycles.batch_timeouts, 1);
        assert_eq!(report.dynamic.hits, 1);
        assert_eq!(report.dynamic.misses, 1);
        assert_eq!(report.dynamic.cached_misses, 1);

        metrics.reset();
        assert_eq!(metrics.stale_retries(), 0);
        assert_eq!(metrics.percentile(0.5), 0);
    }

    #[test]
    fn test_report_json() {
        let metrics = ResolutionMetrics::new();
        metrics.record_cycle(true, 42);
        let json = metrics.export().to_json_pretty().unwrap();
        assert!(json.contains("stale_retries"));
    }
}
