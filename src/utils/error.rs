//! 模块容器错误类型定义
//!
//! 本模块定义了容器中使用的所有错误类型。

use thiserror::Error;

use crate::module::TransitionEvent;
use crate::resolver::ResolutionReport;

/// 模块容器核心错误类型
#[derive(Error, Debug)]
pub enum ContainerError {
    // ==================== 锁获取错误 ====================

    /// 模块状态变更锁获取超时
    #[error("模块 '{module}' 的状态变更锁 ({transition}) 获取超时: {holder}")]
    StateChangeTimeout {
        module: String,
        transition: TransitionEvent,
        /// 当前持有者诊断信息
        holder: String,
    },

    /// 安装锁（位置 / 符号名）获取超时
    #[error("安装锁获取超时: '{0}'")]
    InstallLockTimeout(String),

    /// 解析许可获取超时
    #[error("解析许可获取超时: 等待 {waited_ms}ms, 可用许可 {available}")]
    ResolutionPermitTimeout { waited_ms: u64, available: usize },

    /// 状态锁嵌套顺序错误
    #[error("状态锁顺序错误: 模块 '{module}' 持有 {held:?} 时不能获取 {requested}")]
    StateLockOrder {
        module: String,
        requested: TransitionEvent,
        held: Vec<TransitionEvent>,
    },

    /// 数据库读锁升级为写锁
    #[error("不允许将数据库读锁升级为写锁")]
    LockUpgrade,

    // ==================== 状态错误 ====================

    /// 无效状态
    #[error("无效状态: {0}")]
    InvalidState(String),

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 启动级别未满足
    #[error("模块 '{module}' 的启动级别 {module_level} 高于当前活动级别 {active_level}")]
    StartLevelNotMet {
        module: String,
        module_level: u32,
        active_level: u32,
    },

    // ==================== 解析错误 ====================

    /// 解析失败
    #[error("解析失败: {message}")]
    ResolutionFailed {
        message: String,
        report: ResolutionReport,
    },

    /// 无效的过滤器表达式
    #[error("无效的过滤器 '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// 无效的模块元数据
    #[error("无效的模块元数据: {0}")]
    InvalidMetadata(String),

    // ==================== 冲突错误 ====================

    /// 符号名 / 版本冲突
    #[error("模块冲突: '{symbolic_name}' {version} 已被模块 {existing:?} 使用")]
    Collision {
        symbolic_name: String,
        version: String,
        existing: Vec<u64>,
    },

    /// 被钩子拒绝
    #[error("操作被钩子拒绝: {0}")]
    RejectedByHook(String),

    // ==================== 工作钩子错误 ====================

    /// 激活 / 停用回调失败
    #[error("模块 '{module}' 在 {transition} 过程中回调失败: {source}")]
    WorkerFailed {
        module: String,
        transition: TransitionEvent,
        #[source]
        source: anyhow::Error,
    },

    // ==================== 存储与配置错误 ====================

    /// 持久化错误
    #[error("持久化错误: {0}")]
    Storage(String),

    /// 二进制编码错误
    #[error("二进制编码错误: {0}")]
    Encoding(#[from] bincode::Error),

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue { key: String, reason: String },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 容器操作结果类型别名
pub type Result<T> = std::result::Result<T, ContainerError>;

/// 错误码常量
pub mod error_code {
    // 锁错误 (LOCK-xxx)
    pub const LOCK_STATE_CHANGE_TIMEOUT: &str = "LOCK-001";
    pub const LOCK_INSTALL_TIMEOUT: &str = "LOCK-002";
    pub const LOCK_RESOLUTION_TIMEOUT: &str = "LOCK-003";
    pub const LOCK_ORDER: &str = "LOCK-004";
    pub const LOCK_UPGRADE: &str = "LOCK-005";

    // 状态错误 (STATE-xxx)
    pub const STATE_INVALID: &str = "STATE-001";
    pub const STATE_MODULE_NOT_FOUND: &str = "STATE-002";
    pub const STATE_START_LEVEL: &str = "STATE-003";

    // 解析错误 (RESOLVE-xxx)
    pub const RESOLVE_FAILED: &str = "RESOLVE-001";
    pub const RESOLVE_INVALID_FILTER: &str = "RESOLVE-002";
    pub const RESOLVE_INVALID_METADATA: &str = "RESOLVE-003";

    // 冲突错误 (COLLISION-xxx)
    pub const COLLISION_DUPLICATE: &str = "COLLISION-001";
    pub const COLLISION_REJECTED: &str = "COLLISION-002";

    // 回调错误 (WORKER-xxx)
    pub const WORKER_FAILED: &str = "WORKER-001";

    // 存储错误 (STORAGE-xxx)
    pub const STORAGE_FAILED: &str = "STORAGE-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl ContainerError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            ContainerError::StateChangeTimeout { .. } => error_code::LOCK_STATE_CHANGE_TIMEOUT,
            ContainerError::InstallLockTimeout(_) => error_code::LOCK_INSTALL_TIMEOUT,
            ContainerError::ResolutionPermitTimeout { .. } => error_code::LOCK_RESOLUTION_TIMEOUT,
            ContainerError::StateLockOrder { .. } => error_code::LOCK_ORDER,
            ContainerError::LockUpgrade => error_code::LOCK_UPGRADE,
            ContainerError::InvalidState(_) => error_code::STATE_INVALID,
            ContainerError::ModuleNotFound(_) => error_code::STATE_MODULE_NOT_FOUND,
            ContainerError::StartLevelNotMet { .. } => error_code::STATE_START_LEVEL,
            ContainerError::ResolutionFailed { .. } => error_code::RESOLVE_FAILED,
            ContainerError::InvalidFilter { .. } => error_code::RESOLVE_INVALID_FILTER,
            ContainerError::InvalidMetadata(_) => error_code::RESOLVE_INVALID_METADATA,
            ContainerError::Collision { .. } => error_code::COLLISION_DUPLICATE,
            ContainerError::RejectedByHook(_) => error_code::COLLISION_REJECTED,
            ContainerError::WorkerFailed { .. } => error_code::WORKER_FAILED,
            ContainerError::Storage(_) | ContainerError::Encoding(_) => {
                error_code::STORAGE_FAILED
            }
            ContainerError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            ContainerError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 是否为可重试错误
    ///
    /// 锁获取超时属于可重试错误，编程错误（无效状态、锁顺序错误）不可重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ContainerError::StateChangeTimeout { .. }
                | ContainerError::InstallLockTimeout(_)
                | ContainerError::ResolutionPermitTimeout { .. }
        )
    }

    /// 获取解析报告（仅解析失败时存在）
    pub fn resolution_report(&self) -> Option<&ResolutionReport> {
        match self {
            ContainerError::ResolutionFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}
