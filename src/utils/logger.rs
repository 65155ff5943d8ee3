//! 日志系统模块
//!
//! 基于 tracing 生态的日志初始化：
//!
//! - 多级别日志（TRACE, DEBUG, INFO, WARN, ERROR）
//! - 结构化日志（JSON 格式输出）
//! - 文件日志输出（异步非阻塞，按时间轮转）
//! - 按模块过滤（EnvFilter 指令）
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_container::utils::logger::{Logger, LoggerConfig};
//!
//! let _guard = Logger::init(LoggerConfig::builder().level("debug").build()).unwrap();
//! tracing::info!(module_id = 3, location = "file:/a", "模块已安装");
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::core::config::{ContainerConfig, LogConfig};
use crate::utils::{ContainerError, Result};

/// 本 crate 的日志目标前缀
const CRATE_TARGET: &str = "chips_container";

// ============================================================================
// 日志轮转策略
// ============================================================================

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转（单个日志文件）
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转（默认）
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 从字符串解析轮转策略，无法识别时使用每天轮转
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationStrategy::Never => write!(f, "never"),
            RotationStrategy::Hourly => write!(f, "hourly"),
            RotationStrategy::Daily => write!(f, "daily"),
        }
    }
}

// ============================================================================
// 日志配置
// ============================================================================

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认日志级别
    pub level: String,
    /// 是否使用 JSON 格式输出
    pub json_format: bool,
    /// 是否输出到控制台
    pub console_output: bool,
    /// 文件输出目录（None 表示不输出到文件）
    pub file_output: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 日志轮转策略
    pub rotation: RotationStrategy,
    /// 是否显示目标模块
    pub show_target: bool,
    /// 是否显示线程 ID
    pub show_thread_ids: bool,
    /// 解析器（`chips_container::resolver`）单独的日志级别
    pub resolver_level: Option<String>,
    /// 数据库（`chips_container::database`）单独的日志级别
    pub database_level: Option<String>,
    /// 自定义过滤指令（EnvFilter 格式，逗号分隔）
    pub filter_directives: Option<String>,
    /// 是否启用 ANSI 颜色
    pub ansi_colors: bool,
    /// 是否记录 span 关闭事件（含耗时）
    pub span_close_events: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: "chips-container".to_string(),
            rotation: RotationStrategy::Daily,
            show_target: true,
            show_thread_ids: false,
            resolver_level: None,
            database_level: None,
            filter_directives: None,
            ansi_colors: true,
            span_close_events: false,
        }
    }
}

impl LoggerConfig {
    /// 创建配置构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从容器配置的日志段创建
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            filter_directives: log_config.filter.clone(),
            ..Default::default()
        }
    }

    fn parse_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 设置日志级别
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    /// 启用 JSON 格式输出
    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    /// 设置文件输出目录
    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    /// 设置轮转策略
    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    /// 单独调整解析器日志级别，排查解析回溯时常用 `trace`
    pub fn resolver_level(mut self, level: impl Into<String>) -> Self {
        self.config.resolver_level = Some(level.into());
        self
    }

    pub fn database_level(mut self, level: impl Into<String>) -> Self {
        self.config.database_level = Some(level.into());
        self
    }

    /// 设置过滤指令
    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn show_thread_ids(mut self, enable: bool) -> Self {
        self.config.show_thread_ids = enable;
        self
    }

    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    /// 记录 span 关闭事件
    pub fn span_close_events(mut self, enable: bool) -> Self {
        self.config.span_close_events = enable;
        self
    }

    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

// ============================================================================
// 日志守卫
// ============================================================================

/// 日志系统守卫
///
/// 持有非阻塞写入器的 WorkerGuard，丢弃时刷新所有挂起的日志。
#[derive(Default)]
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

impl LogGuard {
    fn push(&mut self, guard: WorkerGuard) {
        self._guards.push(guard);
    }

    /// 守卫持有的写入器数量
    pub fn writer_count(&self) -> usize {
        self._guards.len()
    }
}

// ============================================================================
// 日志系统
// ============================================================================

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// 日志系统
pub struct Logger;

impl Logger {
    /// 初始化日志系统
    ///
    /// 返回的 `LogGuard` 必须保持存活直到程序退出。
    ///
    /// # Errors
    ///
    /// 日志系统已初始化或订阅者注册失败时返回错误
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(ContainerError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let mut guard = LogGuard::default();
        let mut layers: Vec<BoxedLayer> = Vec::with_capacity(3);
        layers.push(Box::new(Self::env_filter(&config)));

        if config.console_output {
            let (writer, console_guard) = tracing_appender::non_blocking(io::stdout());
            guard.push(console_guard);
            layers.push(Self::output_layer(&config, writer, config.ansi_colors));
        }
        if let Some(log_dir) = &config.file_output {
            let appender = RollingFileAppender::new(
                config.rotation.to_rotation(),
                log_dir,
                format!("{}.log", config.file_prefix),
            );
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard.push(file_guard);
            layers.push(Self::output_layer(&config, writer, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| ContainerError::InitFailed(format!("日志系统初始化失败: {}", e)))?;
        let _ = LOGGER_INITIALIZED.set(());
        Ok(guard)
    }

    /// 按容器配置的日志段初始化
    pub fn init_for(config: &ContainerConfig) -> Result<LogGuard> {
        Self::init(LoggerConfig::from_log_config(&config.logging))
    }

    /// 尝试初始化日志系统（不会失败）
    ///
    /// 已初始化时返回空守卫，适用于测试。
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_default()
    }

    fn output_layer(config: &LoggerConfig, writer: NonBlocking, ansi: bool) -> BoxedLayer {
        let span_events = if config.span_close_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events);
        if config.json_format {
            layer.json().boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }

    /// `RUST_LOG` 优先；否则使用配置级别，再叠加解析器与数据库的单独级别和自定义指令
    fn env_filter(config: &LoggerConfig) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.parse_level().as_str()));
        let mut directives: Vec<String> = Vec::new();
        if let Some(level) = &config.resolver_level {
            directives.push(format!("{}::resolver={}", CRATE_TARGET, level));
        }
        if let Some(level) = &config.database_level {
            directives.push(format!("{}::database={}", CRATE_TARGET, level));
        }
        if let Some(custom) = &config.filter_directives {
            directives.extend(custom.split(',').map(|d| d.trim().to_string()));
        }
        // 无法解析的指令被忽略
        directives
            .iter()
            .filter(|d| !d.is_empty())
            .filter_map(|d| d.parse().ok())
            .fold(filter, |f, directive| f.add_directive(directive))
    }
}

// ============================================================================
// 结构化日志字段定义
// ============================================================================

/// 标准日志字段名称
pub mod fields {
    /// 模块 ID
    pub const MODULE_ID: &str = "module_id";
    /// 安装位置
    pub const LOCATION: &str = "location";
    /// 修订 ID
    pub const REVISION: &str = "revision";
    /// 状态转换
    pub const TRANSITION: &str = "transition";
    /// 数据库时间戳
    pub const TIMESTAMP: &str = "timestamp";
    /// 解析重试次数
    pub const ATTEMPT: &str = "attempt";
    /// 操作 ID
    pub const OPERATION: &str = "operation";
    /// 耗时（微秒）
    pub const DURATION_US: &str = "duration_us";
}

/// 创建模块操作 span
///
/// ```rust,ignore
/// let span = chips_container::module_span!("start", module.id(), module.location());
/// let _enter = span.enter();
/// ```
#[macro_export]
macro_rules! module_span {
    ($operation:expr, $module_id:expr, $location:expr) => {
        tracing::info_span!(
            "module",
            operation = %$operation,
            module_id = $module_id,
            location = %$location
        )
    };
}
