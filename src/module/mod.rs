//! 模块
//!
//! 包含模块系统的基础组件：
//! - 模块元数据与属性值
//! - 属性过滤器
//! - 修订、能力与需求
//! - 模块清单解析
//! - 状态变更锁与模块状态机

pub mod filter;
pub mod lifecycle;
pub mod metadata;
pub mod parser;
pub mod revision;
pub mod transition;

// 重导出常用类型
pub use filter::Filter;
pub use lifecycle::{LifecycleHost, Module, ModuleWorker, NoopWorker, StartOptions, StopOptions};
pub use metadata::{
    ActivationPolicy, AttrValue, Attributes, Directives, FragmentAttachment, ModuleId,
    ModuleSettings, ModuleState, Resolution, RevisionId, SYSTEM_MODULE_ID,
    SYSTEM_MODULE_LOCATION,
};
pub use parser::{ManifestParser, ModuleManifest};
pub use revision::{
    Capability, CapabilityRef, ModuleRevision, Requirement, RequirementRef, RevisionBuilder,
};
pub use transition::{OperationContext, StateChangeLock, TransitionEvent, TransitionGuard};
