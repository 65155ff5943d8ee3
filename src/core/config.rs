//! 容器配置
//!
//! 定义容器的配置结构和加载逻辑。所有分节都带有 `#[serde(default)]`，
//! 配置文件只需写出需要覆盖的字段。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::{ContainerError, Result};

/// 锁配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// 模块状态变更锁等待时间（毫秒）
    #[serde(default = "default_state_change_timeout_ms")]
    pub state_change_timeout_ms: u64,

    /// 安装锁（位置 / 符号名）等待时间（毫秒）
    #[serde(default = "default_install_lock_timeout_ms")]
    pub install_lock_timeout_ms: u64,

    /// 并发解析许可数量
    #[serde(default = "default_resolution_permits")]
    pub resolution_permits: usize,

    /// 解析许可等待时间（毫秒）
    #[serde(default = "default_resolution_permit_timeout_ms")]
    pub resolution_permit_timeout_ms: u64,
}

fn default_state_change_timeout_ms() -> u64 {
    30_000
}

fn default_install_lock_timeout_ms() -> u64 {
    5_000
}

fn default_resolution_permits() -> usize {
    10
}

fn default_resolution_permit_timeout_ms() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            state_change_timeout_ms: default_state_change_timeout_ms(),
            install_lock_timeout_ms: default_install_lock_timeout_ms(),
            resolution_permits: default_resolution_permits(),
            resolution_permit_timeout_ms: default_resolution_permit_timeout_ms(),
        }
    }
}

impl LockConfig {
    pub fn state_change_timeout(&self) -> Duration {
        Duration::from_millis(self.state_change_timeout_ms)
    }

    pub fn install_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.install_lock_timeout_ms)
    }

    pub fn resolution_permit_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_permit_timeout_ms)
    }
}

/// 解析器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// 每批可选修订的数量
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// 批次超时（毫秒），0 表示不超时
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// uses 约束检查时最多尝试的候选排列数
    #[serde(default = "default_max_uses_permutations")]
    pub max_uses_permutations: usize,

    /// 任意解析成功后自动启动已持久化启动的模块
    #[serde(default = "default_true")]
    pub auto_start_on_resolve: bool,

    /// 缓存动态导入未命中
    #[serde(default = "default_true")]
    pub dynamic_miss_cache: bool,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    60_000
}

fn default_max_uses_permutations() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_uses_permutations: default_max_uses_permutations(),
            auto_start_on_resolve: true,
            dynamic_miss_cache: true,
        }
    }
}

impl ResolverConfig {
    /// 批次超时，`None` 表示不超时
    pub fn batch_timeout(&self) -> Option<Duration> {
        (self.batch_timeout_ms > 0).then(|| Duration::from_millis(self.batch_timeout_ms))
    }
}

/// 启动级别配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartLevelConfig {
    /// 新安装模块的启动级别
    #[serde(default = "default_start_level")]
    pub initial_module_start_level: u32,

    /// 系统启动后的目标活动级别
    #[serde(default = "default_start_level")]
    pub beginning_start_level: u32,
}

fn default_start_level() -> u32 {
    1
}

impl Default for StartLevelConfig {
    fn default() -> Self {
        Self {
            initial_module_start_level: default_start_level(),
            beginning_start_level: default_start_level(),
        }
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据库文件路径
    #[serde(default)]
    pub data_file: Option<PathBuf>,

    /// 保存时是否写入连线图
    #[serde(default = "default_true")]
    pub persist_wirings: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: None,
            persist_wirings: true,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 额外的过滤指令，例如 `chips_container::resolver=trace`
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            filter: None,
        }
    }
}

/// 容器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub start_level: StartLevelConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

impl ContainerConfig {
    /// 创建配置构建器
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::new()
    }

    /// 从文件加载配置（`.json` 按 JSON 解析，其余按 YAML）
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ContainerError::ConfigLoadFailed(format!("{}: {}", path.display(), e))
        })?;

        let mut config: ContainerConfig =
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置值
    pub fn validate(&self) -> Result<()> {
        if self.locks.resolution_permits == 0 {
            return Err(ContainerError::InvalidConfigValue {
                key: "locks.resolution_permits".to_string(),
                reason: "至少需要一个解析许可".to_string(),
            });
        }
        if self.resolver.batch_size == 0 {
            return Err(ContainerError::InvalidConfigValue {
                key: "resolver.batch_size".to_string(),
                reason: "批次大小必须大于 0".to_string(),
            });
        }
        if self.start_level.initial_module_start_level == 0 {
            return Err(ContainerError::InvalidConfigValue {
                key: "start_level.initial_module_start_level".to_string(),
                reason: "启动级别 0 保留给系统模块".to_string(),
            });
        }
        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    ///
    /// 只覆盖与默认值不同的字段。
    pub fn merge(&mut self, other: ContainerConfig) {
        let lock_defaults = LockConfig::default();
        if other.locks.state_change_timeout_ms != lock_defaults.state_change_timeout_ms {
            self.locks.state_change_timeout_ms = other.locks.state_change_timeout_ms;
        }
        if other.locks.install_lock_timeout_ms != lock_defaults.install_lock_timeout_ms {
            self.locks.install_lock_timeout_ms = other.locks.install_lock_timeout_ms;
        }
        if other.locks.resolution_permits != lock_defaults.resolution_permits {
            self.locks.resolution_permits = other.locks.resolution_permits;
        }
        if other.locks.resolution_permit_timeout_ms != lock_defaults.resolution_permit_timeout_ms
        {
            self.locks.resolution_permit_timeout_ms = other.locks.resolution_permit_timeout_ms;
        }

        let resolver_defaults = ResolverConfig::default();
        if other.resolver.batch_size != resolver_defaults.batch_size {
            self.resolver.batch_size = other.resolver.batch_size;
        }
        if other.resolver.batch_timeout_ms != resolver_defaults.batch_timeout_ms {
            self.resolver.batch_timeout_ms = other.resolver.batch_timeout_ms;
        }
        if other.resolver.max_uses_permutations != resolver_defaults.max_uses_permutations {
            self.resolver.max_uses_permutations = other.resolver.max_uses_permutations;
        }
        if !other.resolver.auto_start_on_resolve {
            self.resolver.auto_start_on_resolve = false;
        }
        if !other.resolver.dynamic_miss_cache {
            self.resolver.dynamic_miss_cache = false;
        }

        if other.start_level != StartLevelConfig::default() {
            self.start_level = other.start_level;
        }
        if other.storage.data_file.is_some() {
            self.storage.data_file = other.storage.data_file;
        }
        if !other.storage.persist_wirings {
            self.storage.persist_wirings = false;
        }

        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.logging.filter.is_some() {
            self.logging.filter = other.logging.filter;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置状态变更锁等待时间
    pub fn state_change_timeout(mut self, timeout: Duration) -> Self {
        self.config.locks.state_change_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置安装锁等待时间
    pub fn install_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.locks.install_lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置解析许可数量
    pub fn resolution_permits(mut self, permits: usize) -> Self {
        self.config.locks.resolution_permits = permits;
        self
    }

    /// 设置解析许可等待时间
    pub fn resolution_permit_timeout(mut self, timeout: Duration) -> Self {
        self.config.locks.resolution_permit_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置批次大小
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.resolver.batch_size = size;
        self
    }

    /// 设置批次超时，`Duration::ZERO` 表示不超时
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.resolver.batch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置 uses 检查的排列上限
    pub fn max_uses_permutations(mut self, max: usize) -> Self {
        self.config.resolver.max_uses_permutations = max;
        self
    }

    /// 设置解析后自动启动策略
    pub fn auto_start_on_resolve(mut self, enabled: bool) -> Self {
        self.config.resolver.auto_start_on_resolve = enabled;
        self
    }

    /// 设置动态未命中缓存
    pub fn dynamic_miss_cache(mut self, enabled: bool) -> Self {
        self.config.resolver.dynamic_miss_cache = enabled;
        self
    }

    /// 设置新模块的初始启动级别
    pub fn initial_module_start_level(mut self, level: u32) -> Self {
        self.config.start_level.initial_module_start_level = level;
        self
    }

    /// 设置系统启动的目标级别
    pub fn beginning_start_level(mut self, level: u32) -> Self {
        self.config.start_level.beginning_start_level = level;
        self
    }

    /// 设置数据库文件
    pub fn data_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.data_file = Some(path.into());
        self
    }

    /// 设置是否持久化连线
    pub fn persist_wirings(mut self, enabled: bool) -> Self {
        self.config.storage.persist_wirings = enabled;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> ContainerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContainerConfig::default();
        assert_eq!(config.locks.state_change_timeout_ms, 30_000);
        assert_eq!(config.locks.install_lock_timeout_ms, 5_000);
        assert_eq!(config.locks.resolution_permits, 10);
        assert_eq!(config.resolver.batch_size, 100);
        assert!(config.resolver.auto_start_on_resolve);
        assert_eq!(config.start_level.initial_module_start_level, 1);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ContainerConfig::builder()
            .resolution_permits(2)
            .batch_timeout(Duration::ZERO)
            .auto_start_on_resolve(false)
            .log_level("debug")
            .build();

        assert_eq!(config.locks.resolution_permits, 2);
        assert!(config.resolver.batch_timeout().is_none());
        assert!(!config.resolver.auto_start_on_resolve);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_config_merge() {
        let mut base = ContainerConfig::default();
        let overrides = ContainerConfig::builder()
            .state_change_timeout(Duration::from_millis(500))
            .log_level("trace")
            .data_file("/tmp/chips.db")
            .build();

        base.merge(overrides);

        assert_eq!(base.locks.state_change_timeout_ms, 500);
        assert_eq!(base.locks.resolution_permits, 10);
        assert_eq!(base.logging.level, "trace");
        assert_eq!(base.storage.data_file, Some(PathBuf::from("/tmp/chips.db")));
    }

    #[test]
    fn test_validate_rejects_zero_permits() {
        let config = ContainerConfig::builder().resolution_permits(0).build();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ContainerError::InvalidConfigValue { .. }));
    }

    #[test]
    fn test_config_serialization() {
        let config = ContainerConfig::builder()
            .batch_size(7)
            .log_level("warn")
            .build();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ContainerConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(parsed.resolver.batch_size, 7);
        assert_eq!(parsed.logging.level, "warn");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "resolver:\n  batch_size: 3\n";
        let parsed: ContainerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.resolver.batch_size, 3);
        assert_eq!(parsed.resolver.batch_timeout_ms, 60_000);
        assert_eq!(parsed.locks.resolution_permits, 10);
    }
}
