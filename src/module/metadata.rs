//! 模块元数据定义
//!
//! 定义模块状态、属性值、命名空间与指令常量，以及模块的持久化设置。

use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::utils::{ContainerError, Result};

/// 模块数字 ID，0 保留给系统模块
pub type ModuleId = u64;

/// 修订 ID，在一个数据库内全局唯一
pub type RevisionId = u64;

/// 系统模块 ID
pub const SYSTEM_MODULE_ID: ModuleId = 0;

/// 系统模块安装位置
pub const SYSTEM_MODULE_LOCATION: &str = "System Module";

/// 能力命名空间
pub mod namespace {
    /// 包导出 / 导入
    pub const PACKAGE: &str = "package";
    /// 整模块依赖
    pub const BUNDLE: &str = "bundle";
    /// 片段宿主
    pub const HOST: &str = "host";
    /// 模块身份
    pub const IDENTITY: &str = "identity";

    /// 需要强制检查 `mandatory` 指令的命名空间
    pub fn enforces_mandatory(namespace: &str) -> bool {
        matches!(namespace, PACKAGE | BUNDLE | HOST)
    }
}

/// 指令名称
pub mod directive {
    pub const FILTER: &str = "filter";
    pub const RESOLUTION: &str = "resolution";
    pub const CARDINALITY: &str = "cardinality";
    pub const EFFECTIVE: &str = "effective";
    pub const MANDATORY: &str = "mandatory";
    pub const SINGLETON: &str = "singleton";
    pub const FRAGMENT_ATTACHMENT: &str = "fragment-attachment";
    pub const USES: &str = "uses";

    pub const RESOLUTION_MANDATORY: &str = "mandatory";
    pub const RESOLUTION_OPTIONAL: &str = "optional";
    pub const RESOLUTION_DYNAMIC: &str = "dynamic";
    pub const CARDINALITY_SINGLE: &str = "single";
    pub const CARDINALITY_MULTIPLE: &str = "multiple";
    pub const EFFECTIVE_RESOLVE: &str = "resolve";
}

/// 常用属性名称
pub mod attribute {
    pub const VERSION: &str = "version";
    pub const TYPE: &str = "type";

    pub const TYPE_MODULE: &str = "module";
    pub const TYPE_FRAGMENT: &str = "fragment";
}

/// 模块生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// 已安装，尚未解析
    Installed,
    /// 已解析
    Resolved,
    /// 等待延迟激活触发
    LazyStarting,
    /// 正在启动
    Starting,
    /// 运行中
    Active,
    /// 正在停止
    Stopping,
    /// 已卸载（终态）
    Uninstalled,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState::Installed
    }
}

impl ModuleState {
    /// 是否属于活动集合（STARTING、LAZY_STARTING、ACTIVE、STOPPING）
    pub fn is_active_set(&self) -> bool {
        matches!(
            self,
            ModuleState::Starting
                | ModuleState::LazyStarting
                | ModuleState::Active
                | ModuleState::Stopping
        )
    }

    /// 是否属于已解析集合（RESOLVED 及之后的活动状态）
    pub fn is_resolved_set(&self) -> bool {
        matches!(self, ModuleState::Resolved) || self.is_active_set()
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::LazyStarting => "LAZY_STARTING",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        };
        f.write_str(name)
    }
}

/// 激活策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    #[default]
    Eager,
    Lazy,
}

/// 宿主允许片段附加的时机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FragmentAttachment {
    /// 解析时与解析后均可附加
    #[default]
    Always,
    /// 仅在宿主解析时附加
    ResolveTime,
    /// 不允许附加
    Never,
}

impl FragmentAttachment {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentAttachment::Always => "always",
            FragmentAttachment::ResolveTime => "resolve-time",
            FragmentAttachment::Never => "never",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "never" => FragmentAttachment::Never,
            "resolve-time" => FragmentAttachment::ResolveTime,
            _ => FragmentAttachment::Always,
        }
    }
}

/// 需求的解析方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Mandatory,
    Optional,
    Dynamic,
}

/// 模块的持久化设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleSettings {
    /// 持久化启动标记
    pub auto_start: bool,
    /// 启动时遵循激活策略
    pub use_activation_policy: bool,
    /// 启动级别变化时允许与同级模块并行启动
    pub parallel_activation: bool,
}

/// 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Long(i64),
    Double(f64),
    Version(Version),
    List(Vec<AttrValue>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_version(&self) -> Option<&Version> {
        match self {
            AttrValue::Version(v) => Some(v),
            _ => None,
        }
    }

    /// 与过滤器中的字面值比较
    ///
    /// 字面值按本属性的类型解析，解析失败时返回 `None`。
    pub fn compare_literal(&self, literal: &str) -> Option<Ordering> {
        match self {
            AttrValue::String(s) => Some(s.as_str().cmp(literal)),
            AttrValue::Long(n) => literal.trim().parse::<i64>().ok().map(|l| n.cmp(&l)),
            AttrValue::Double(d) => literal
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|l| d.partial_cmp(&l)),
            AttrValue::Version(v) => parse_version(literal).ok().map(|l| v.cmp(&l)),
            AttrValue::List(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Long(n) => write!(f, "{}", n),
            AttrValue::Double(d) => write!(f, "{}", d),
            AttrValue::Version(v) => write!(f, "{}", v),
            AttrValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Long(value)
    }
}

impl From<Version> for AttrValue {
    fn from(value: Version) -> Self {
        AttrValue::Version(value)
    }
}

/// 属性表（有序，保证序列化结果稳定）
pub type Attributes = BTreeMap<String, AttrValue>;

/// 指令表
pub type Directives = BTreeMap<String, String>;

/// 宽松解析版本号
///
/// 允许省略次版本号和修订号（`1` / `1.2`），缺失部分补 0。
pub fn parse_version(text: &str) -> Result<Version> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Version::new(0, 0, 0));
    }
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    let (core, rest) = match trimmed.find(|c| c == '-' || c == '+') {
        Some(pos) => trimmed.split_at(pos),
        None => (trimmed, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ContainerError::InvalidMetadata(format!(
            "无效的版本号: '{}'",
            text
        )));
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Ok(Version::parse(&format!("{}{}", parts.join("."), rest))?)
}

/// 解析逗号分隔的名称列表（用于 `uses`、`mandatory` 指令）
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
