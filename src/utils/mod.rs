//! 工具模块
//!
//! 包含错误类型、ID 生成、日志系统、解析指标等通用工具。

pub mod error;
pub mod id;
pub mod logger;
pub mod metrics;

pub use error::{error_code, ContainerError, Result};
pub use id::{generate_id, generate_uuid, next_operation_id, IdSequence};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use metrics::{MetricsReport, ResolutionMetrics};
