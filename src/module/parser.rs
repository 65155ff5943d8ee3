//! 模块清单解析器
//!
//! 负责从 module.yaml 文件解析模块清单，并转换为 [`RevisionBuilder`]。
//!
//! ```yaml
//! symbolic_name: com.acme.app
//! version: 1.2.0
//! singleton: true
//! activation: lazy
//! exports:
//!   - package: com.acme.api
//!     version: 1.2.0
//!     uses: [com.acme.model]
//! imports:
//!   - package: org.util
//!     version: "[1.0,2.0)"
//!     resolution: optional
//! requires:
//!   - module: com.acme.core
//! dynamic_imports: ["com.acme.ext.*"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::filter::Filter;
use super::metadata::{
    attribute, directive, parse_version, ActivationPolicy, AttrValue, Attributes, Directives,
    FragmentAttachment,
};
use super::revision::{version_range_clauses, RevisionBuilder};
use crate::utils::{ContainerError, Result};

/// 包导出声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportDecl {
    pub package: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub uses: Vec<String>,
    #[serde(default)]
    pub mandatory: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

/// 包导入声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportDecl {
    pub package: String,
    /// 版本区间或最低版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    /// 附加过滤条件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// 模块依赖声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequireDecl {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// 通用能力声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub namespace: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub directives: BTreeMap<String, String>,
}

/// 通用需求声明
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequirementDecl {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_cardinality")]
    pub cardinality: String,
    #[serde(default)]
    pub directives: BTreeMap<String, String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_resolution() -> String {
    directive::RESOLUTION_MANDATORY.to_string()
}

fn default_cardinality() -> String {
    directive::CARDINALITY_SINGLE.to_string()
}

/// 模块清单（module.yaml）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub symbolic_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub singleton: bool,
    #[serde(default)]
    pub activation: ActivationPolicy,
    /// 片段的宿主符号名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_host: Option<String>,
    #[serde(default)]
    pub fragment_attachment: FragmentAttachment,
    #[serde(default)]
    pub exports: Vec<ExportDecl>,
    #[serde(default)]
    pub imports: Vec<ImportDecl>,
    #[serde(default)]
    pub requires: Vec<RequireDecl>,
    #[serde(default)]
    pub dynamic_imports: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDecl>,
    #[serde(default)]
    pub requirements: Vec<RequirementDecl>,
}

/// 模块清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析模块清单
    ///
    /// # Errors
    ///
    /// - 文件不存在或无法读取时返回 IO 错误
    /// - 内容不是合法 YAML 时返回 YAML 错误
    /// - 校验失败时返回 `InvalidMetadata`，消息中包含全部问题
    pub async fn parse_file(path: &Path) -> Result<ModuleManifest> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse_string(&content)
    }

    /// 从文件同步解析模块清单
    pub fn parse_file_sync(path: &Path) -> Result<ModuleManifest> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_string(&content)
    }

    /// 从字符串解析模块清单
    pub fn parse_string(content: &str) -> Result<ModuleManifest> {
        let manifest: ModuleManifest = serde_yaml::from_str(content)?;
        Self::validate(&manifest)?;
        Ok(manifest)
    }

    /// 校验模块清单，累积全部错误后一并返回
    pub fn validate(manifest: &ModuleManifest) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if manifest.symbolic_name.trim().is_empty() {
            errors.push("符号名不能为空".to_string());
        } else if !Self::is_valid_symbolic_name(&manifest.symbolic_name) {
            errors.push(format!(
                "符号名 '{}' 格式无效，只允许字母、数字、点、下划线和连字符",
                manifest.symbolic_name
            ));
        }

        if parse_version(&manifest.version).is_err() {
            errors.push(format!("无效的版本号格式 '{}'", manifest.version));
        }

        if let Some(host) = &manifest.fragment_host {
            if host.trim().is_empty() {
                errors.push("片段宿主的符号名不能为空".to_string());
            }
        }

        for (index, export) in manifest.exports.iter().enumerate() {
            if export.package.is_empty() {
                errors.push(format!("第 {} 个导出的包名不能为空", index + 1));
            }
            if parse_version(&export.version).is_err() {
                errors.push(format!(
                    "导出包 '{}' 的版本号格式无效: '{}'",
                    export.package, export.version
                ));
            }
            for name in &export.mandatory {
                if name != &export.package
                    && name != attribute::VERSION
                    && !export.attributes.contains_key(name)
                {
                    errors.push(format!(
                        "导出包 '{}' 的 mandatory 属性 '{}' 未声明",
                        export.package, name
                    ));
                }
            }
        }

        for (index, import) in manifest.imports.iter().enumerate() {
            if import.package.is_empty() {
                errors.push(format!("第 {} 个导入的包名不能为空", index + 1));
            }
            if let Some(range) = &import.version {
                if version_range_clauses(attribute::VERSION, range).is_err() {
                    errors.push(format!(
                        "导入包 '{}' 的版本区间格式无效: '{}'",
                        import.package, range
                    ));
                }
            }
            if !Self::is_valid_resolution(&import.resolution, false) {
                errors.push(format!(
                    "导入包 '{}' 的 resolution 无效: '{}'",
                    import.package, import.resolution
                ));
            }
            if let Some(filter) = &import.filter {
                if let Err(e) = Filter::parse(filter) {
                    errors.push(e.to_string());
                }
            }
        }

        for require in &manifest.requires {
            if require.module.is_empty() {
                errors.push("依赖模块的符号名不能为空".to_string());
            }
            if let Some(range) = &require.version {
                if version_range_clauses(attribute::VERSION, range).is_err() {
                    errors.push(format!(
                        "依赖模块 '{}' 的版本区间格式无效: '{}'",
                        require.module, range
                    ));
                }
            }
        }

        for capability in &manifest.capabilities {
            if capability.namespace.is_empty() {
                errors.push("能力的命名空间不能为空".to_string());
            }
        }

        for requirement in &manifest.requirements {
            if requirement.namespace.is_empty() {
                errors.push("需求的命名空间不能为空".to_string());
            }
            if let Some(filter) = &requirement.filter {
                if let Err(e) = Filter::parse(filter) {
                    errors.push(e.to_string());
                }
            }
            if !Self::is_valid_resolution(&requirement.resolution, true) {
                errors.push(format!(
                    "命名空间 '{}' 的需求 resolution 无效: '{}'",
                    requirement.namespace, requirement.resolution
                ));
            }
            if requirement.cardinality != directive::CARDINALITY_SINGLE
                && requirement.cardinality != directive::CARDINALITY_MULTIPLE
            {
                errors.push(format!(
                    "命名空间 '{}' 的需求 cardinality 无效: '{}'",
                    requirement.namespace, requirement.cardinality
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ContainerError::InvalidMetadata(errors.join("; ")))
        }
    }

    /// 将清单转换为修订构建器
    pub fn to_builder(manifest: &ModuleManifest) -> Result<RevisionBuilder> {
        let mut builder = RevisionBuilder::new(manifest.symbolic_name.clone(), &manifest.version)?
            .singleton(manifest.singleton)
            .activation_policy(manifest.activation)
            .fragment_attachment(manifest.fragment_attachment);
        if let Some(host) = &manifest.fragment_host {
            builder = builder.fragment_of(host.clone());
        }

        for export in &manifest.exports {
            let uses: Vec<&str> = export.uses.iter().map(|s| s.as_str()).collect();
            let mandatory: Vec<&str> = export.mandatory.iter().map(|s| s.as_str()).collect();
            builder = builder.export_package_with(
                &export.package,
                &export.version,
                &uses,
                &mandatory,
                convert_attributes(&export.attributes),
            )?;
        }

        for import in &manifest.imports {
            builder = builder.import_package_with(
                &import.package,
                import.version.as_deref(),
                &import.resolution,
                import.filter.as_deref(),
            )?;
        }

        for require in &manifest.requires {
            builder = builder.require_module(&require.module, require.version.as_deref())?;
        }

        for pattern in &manifest.dynamic_imports {
            builder = builder.dynamic_import(pattern);
        }

        for capability in &manifest.capabilities {
            builder = builder.capability(
                capability.namespace.clone(),
                capability.directives.clone(),
                convert_attributes(&capability.attributes),
            );
        }

        for requirement in &manifest.requirements {
            let mut directives: Directives = requirement.directives.clone();
            if let Some(filter) = &requirement.filter {
                directives.insert(directive::FILTER.to_string(), filter.clone());
            }
            if requirement.resolution != directive::RESOLUTION_MANDATORY {
                directives.insert(
                    directive::RESOLUTION.to_string(),
                    requirement.resolution.clone(),
                );
            }
            if requirement.cardinality != directive::CARDINALITY_SINGLE {
                directives.insert(
                    directive::CARDINALITY.to_string(),
                    requirement.cardinality.clone(),
                );
            }
            builder = builder.requirement(requirement.namespace.clone(), directives, Attributes::new());
        }

        Ok(builder)
    }

    /// 解析文件并直接得到构建器
    pub async fn load_builder(path: &Path) -> Result<RevisionBuilder> {
        let manifest = Self::parse_file(path).await?;
        Self::to_builder(&manifest)
    }

    fn is_valid_symbolic_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    fn is_valid_resolution(value: &str, allow_dynamic: bool) -> bool {
        match value {
            directive::RESOLUTION_MANDATORY | directive::RESOLUTION_OPTIONAL => true,
            directive::RESOLUTION_DYNAMIC => allow_dynamic,
            _ => false,
        }
    }
}

/// YAML 属性值转换为类型化属性
///
/// `version` 属性按版本号解析；整数为 Long，浮点为 Double，序列为 List。
fn convert_attributes(raw: &BTreeMap<String, serde_yaml::Value>) -> Attributes {
    raw.iter()
        .filter_map(|(key, value)| {
            let converted = if key == attribute::VERSION {
                yaml_scalar(value)
                    .and_then(|s| parse_version(&s).ok())
                    .map(AttrValue::Version)
            } else {
                convert_value(value)
            };
            converted.map(|v| (key.clone(), v))
        })
        .collect()
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn convert_value(value: &serde_yaml::Value) -> Option<AttrValue> {
    match value {
        serde_yaml::Value::String(s) => Some(AttrValue::String(s.clone())),
        serde_yaml::Value::Bool(b) => Some(AttrValue::String(b.to_string())),
        serde_yaml::Value::Number(n) => n
            .as_i64()
            .map(AttrValue::Long)
            .or_else(|| n.as_f64().map(AttrValue::Double)),
        serde_yaml::Value::Sequence(items) => Some(AttrValue::List(
            items.iter().filter_map(convert_value).collect(),
        )),
        _ => None,
    }
}
