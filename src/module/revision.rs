//! 模块修订
//!
//! 一个修订是模块某一版本内容的不可变描述：符号名、版本、类型标志，
//! 以及声明的能力与需求。修订由 [`RevisionBuilder`] 构建，构建时解析全部过滤器，
//! 并合成 `identity`、`bundle`、`host` 能力。

use semver::Version;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::filter::Filter;
use super::metadata::{
    attribute, directive, namespace, parse_version, split_list, ActivationPolicy, AttrValue,
    Attributes, Directives, FragmentAttachment, ModuleId, Resolution, RevisionId,
};
use crate::utils::{ContainerError, Result};

/// 能力：修订对外提供的事实
#[derive(Debug, Clone)]
pub struct Capability {
    namespace: String,
    directives: Directives,
    attributes: Attributes,
}

impl Capability {
    pub fn new(namespace: impl Into<String>, directives: Directives, attributes: Attributes) -> Self {
        Self {
            namespace: namespace.into(),
            directives,
            attributes,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn directives(&self) -> &Directives {
        &self.directives
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// 仅 `effective:=resolve`（或未声明）的能力参与解析
    pub fn is_effective(&self) -> bool {
        self.directives
            .get(directive::EFFECTIVE)
            .map(|e| e == directive::EFFECTIVE_RESOLVE)
            .unwrap_or(true)
    }

    pub fn is_singleton(&self) -> bool {
        self.directives
            .get(directive::SINGLETON)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// 命名空间同名属性的值（索引主键）
    pub fn primary_value(&self) -> Option<&AttrValue> {
        self.attributes.get(&self.namespace)
    }

    /// 主键为字符串时返回其值
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_value().and_then(|v| v.as_str())
    }

    /// `version` 属性
    pub fn version(&self) -> Option<&Version> {
        self.attributes
            .get(attribute::VERSION)
            .and_then(|v| v.as_version())
    }

    /// `mandatory` 指令列出的属性名
    pub fn mandatory_attributes(&self) -> Vec<String> {
        self.directives
            .get(directive::MANDATORY)
            .map(|v| split_list(v))
            .unwrap_or_default()
    }

    /// `uses` 指令列出的包名
    pub fn uses(&self) -> Vec<String> {
        self.directives
            .get(directive::USES)
            .map(|v| split_list(v))
            .unwrap_or_default()
    }

    /// 宿主能力上的片段附加策略
    pub fn fragment_attachment(&self) -> FragmentAttachment {
        self.directives
            .get(directive::FRAGMENT_ATTACHMENT)
            .map(|v| FragmentAttachment::parse(v))
            .unwrap_or_default()
    }
}

/// 需求：修订需要由其他修订能力满足的事实
#[derive(Debug, Clone)]
pub struct Requirement {
    namespace: String,
    directives: Directives,
    attributes: Attributes,
    filter: Option<Filter>,
}

impl Requirement {
    /// 创建需求，`filter` 指令在此解析
    pub fn new(
        namespace: impl Into<String>,
        directives: Directives,
        attributes: Attributes,
    ) -> Result<Self> {
        let filter = directives
            .get(directive::FILTER)
            .map(|f| Filter::parse(f))
            .transpose()?;
        Ok(Self {
            namespace: namespace.into(),
            directives,
            attributes,
            filter,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn directives(&self) -> &Directives {
        &self.directives
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn resolution(&self) -> Resolution {
        match self.directives.get(directive::RESOLUTION).map(|s| s.as_str()) {
            Some(directive::RESOLUTION_OPTIONAL) => Resolution::Optional,
            Some(directive::RESOLUTION_DYNAMIC) => Resolution::Dynamic,
            _ => Resolution::Mandatory,
        }
    }

    pub fn is_optional(&self) -> bool {
        self.resolution() == Resolution::Optional
    }

    pub fn is_dynamic(&self) -> bool {
        self.resolution() == Resolution::Dynamic
    }

    pub fn is_multiple(&self) -> bool {
        self.directives
            .get(directive::CARDINALITY)
            .map(|c| c == directive::CARDINALITY_MULTIPLE)
            .unwrap_or(false)
    }

    pub fn is_effective(&self) -> bool {
        self.directives
            .get(directive::EFFECTIVE)
            .map(|e| e == directive::EFFECTIVE_RESOLVE)
            .unwrap_or(true)
    }

    /// 索引查找用的主键
    pub fn primary_key(&self) -> Option<&str> {
        self.filter
            .as_ref()
            .and_then(|f| f.primary_key(&self.namespace))
    }

    /// 能力是否满足此需求
    ///
    /// 检查命名空间、有效性与过滤器；`package`/`bundle`/`host` 命名空间下，
    /// 能力 `mandatory` 指令中的每个属性都必须在过滤器里显式出现。
    pub fn matches(&self, capability: &Capability) -> bool {
        if capability.namespace() != self.namespace || !capability.is_effective() {
            return false;
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(capability.attributes()) {
                return false;
            }
        }
        if namespace::enforces_mandatory(&self.namespace) {
            let mandatory = capability.mandatory_attributes();
            if !mandatory.is_empty() {
                let referenced: BTreeSet<String> = self
                    .filter
                    .as_ref()
                    .map(|f| f.referenced_attributes())
                    .unwrap_or_default();
                if !mandatory.iter().all(|m| referenced.contains(m)) {
                    return false;
                }
            }
        }
        true
    }

    /// 简短描述，用于报告与日志
    pub fn describe(&self) -> String {
        match &self.filter {
            Some(filter) => format!("{}; filter:=\"{}\"", self.namespace, filter),
            None => self.namespace.clone(),
        }
    }
}

/// 模块修订
#[derive(Debug)]
pub struct ModuleRevision {
    id: RevisionId,
    module_id: ModuleId,
    symbolic_name: String,
    version: Version,
    fragment: bool,
    activation: ActivationPolicy,
    capabilities: Vec<Capability>,
    requirements: Vec<Requirement>,
}

impl ModuleRevision {
    pub fn id(&self) -> RevisionId {
        self.id
    }

    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment
    }

    pub fn activation_policy(&self) -> ActivationPolicy {
        self.activation
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// 指定命名空间的能力引用
    pub fn capabilities_in(self: &Arc<Self>, ns: &str) -> Vec<CapabilityRef> {
        self.capabilities
            .iter()
            .enumerate()
            .filter(|(_, c)| c.namespace() == ns)
            .map(|(i, _)| CapabilityRef::new(self.clone(), i))
            .collect()
    }

    /// 全部需求引用
    pub fn requirement_refs(self: &Arc<Self>) -> Vec<RequirementRef> {
        (0..self.requirements.len())
            .map(|i| RequirementRef::new(self.clone(), i))
            .collect()
    }

    /// 身份能力
    pub fn identity(self: &Arc<Self>) -> Option<CapabilityRef> {
        self.capabilities_in(namespace::IDENTITY).into_iter().next()
    }

    /// 片段对宿主的需求
    pub fn host_requirement(self: &Arc<Self>) -> Option<RequirementRef> {
        if !self.fragment {
            return None;
        }
        self.requirements
            .iter()
            .position(|r| r.namespace() == namespace::HOST)
            .map(|i| RequirementRef::new(self.clone(), i))
    }

    /// 片段是否仅含身份能力与宿主需求（无负载）
    pub fn is_payload_free(&self) -> bool {
        self.capabilities
            .iter()
            .all(|c| c.namespace() == namespace::IDENTITY)
            && self
                .requirements
                .iter()
                .all(|r| r.namespace() == namespace::HOST)
    }

    /// 是否为单例
    pub fn is_singleton(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.namespace() == namespace::IDENTITY && c.is_singleton())
    }

    /// 能力与需求的声明形式（用于持久化）
    pub(crate) fn declarations(&self) -> (Vec<Declaration>, Vec<Declaration>) {
        let caps = self
            .capabilities
            .iter()
            .map(|c| Declaration {
                namespace: c.namespace.clone(),
                directives: c.directives.clone(),
                attributes: c.attributes.clone(),
            })
            .collect();
        let reqs = self
            .requirements
            .iter()
            .map(|r| Declaration {
                namespace: r.namespace.clone(),
                directives: r.directives.clone(),
                attributes: r.attributes.clone(),
            })
            .collect();
        (caps, reqs)
    }

    /// 由持久化记录还原修订，不再合成能力
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: RevisionId,
        module_id: ModuleId,
        symbolic_name: String,
        version: Version,
        fragment: bool,
        activation: ActivationPolicy,
        capabilities: Vec<Declaration>,
        requirements: Vec<Declaration>,
    ) -> Result<Self> {
        let requirements = requirements
            .into_iter()
            .map(|d| Requirement::new(d.namespace, d.directives, d.attributes))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id,
            module_id,
            symbolic_name,
            version,
            fragment,
            activation,
            capabilities: capabilities
                .into_iter()
                .map(|d| Capability::new(d.namespace, d.directives, d.attributes))
                .collect(),
            requirements,
        })
    }
}

impl fmt::Display for ModuleRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{} [{}]", self.symbolic_name, self.version, self.module_id)
    }
}

/// 指向修订中某个能力的引用，按 (修订 ID, 下标) 判等
#[derive(Debug, Clone)]
pub struct CapabilityRef {
    revision: Arc<ModuleRevision>,
    index: usize,
}

impl CapabilityRef {
    pub fn new(revision: Arc<ModuleRevision>, index: usize) -> Self {
        Self { revision, index }
    }

    /// 声明该能力的修订
    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capability(&self) -> &Capability {
        &self.revision.capabilities[self.index]
    }

    pub fn key(&self) -> (RevisionId, usize) {
        (self.revision.id, self.index)
    }
}

impl PartialEq for CapabilityRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CapabilityRef {}

impl Hash for CapabilityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// 指向修订中某个需求的引用
#[derive(Debug, Clone)]
pub struct RequirementRef {
    revision: Arc<ModuleRevision>,
    index: usize,
}

impl RequirementRef {
    pub fn new(revision: Arc<ModuleRevision>, index: usize) -> Self {
        Self { revision, index }
    }

    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn requirement(&self) -> &Requirement {
        &self.revision.requirements[self.index]
    }

    pub fn key(&self) -> (RevisionId, usize) {
        (self.revision.id, self.index)
    }
}

impl PartialEq for RequirementRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RequirementRef {}

impl Hash for RequirementRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// 声明阶段的能力 / 需求描述
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub namespace: String,
    pub directives: Directives,
    pub attributes: Attributes,
}

/// 修订构建器
///
/// # Example
///
/// ```
/// use chips_container::module::revision::RevisionBuilder;
///
/// let builder = RevisionBuilder::new("com.acme.app", "1.0.0")
///     .unwrap()
///     .export_package("com.acme.api", "1.0.0")
///     .unwrap()
///     .import_package("org.util", Some("[1.0,2.0)"))
///     .unwrap();
/// assert_eq!(builder.symbolic_name(), "com.acme.app");
/// ```
#[derive(Debug, Clone)]
pub struct RevisionBuilder {
    symbolic_name: String,
    version: Version,
    fragment_host: Option<String>,
    singleton: bool,
    activation: ActivationPolicy,
    attachment: FragmentAttachment,
    capabilities: Vec<Declaration>,
    requirements: Vec<Declaration>,
}

impl RevisionBuilder {
    /// 创建构建器，版本号宽松解析
    pub fn new(symbolic_name: impl Into<String>, version: &str) -> Result<Self> {
        let symbolic_name = symbolic_name.into();
        if symbolic_name.trim().is_empty() {
            return Err(ContainerError::InvalidMetadata("符号名不能为空".to_string()));
        }
        Ok(Self {
            symbolic_name,
            version: parse_version(version)?,
            fragment_host: None,
            singleton: false,
            activation: ActivationPolicy::Eager,
            attachment: FragmentAttachment::Always,
            capabilities: Vec::new(),
            requirements: Vec::new(),
        })
    }

    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_host.is_some()
    }

    /// 声明为指定宿主的片段
    pub fn fragment_of(mut self, host: impl Into<String>) -> Self {
        self.fragment_host = Some(host.into());
        self
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn lazy_activation(mut self) -> Self {
        self.activation = ActivationPolicy::Lazy;
        self
    }

    pub fn activation_policy(mut self, policy: ActivationPolicy) -> Self {
        self.activation = policy;
        self
    }

    pub fn fragment_attachment(mut self, attachment: FragmentAttachment) -> Self {
        self.attachment = attachment;
        self
    }

    /// 添加通用能力
    pub fn capability(
        mut self,
        namespace: impl Into<String>,
        directives: Directives,
        attributes: Attributes,
    ) -> Self {
        self.capabilities.push(Declaration {
            namespace: namespace.into(),
            directives,
            attributes,
        });
        self
    }

    /// 添加通用需求，过滤器在 [`RevisionBuilder::build`] 时校验
    pub fn requirement(
        mut self,
        namespace: impl Into<String>,
        directives: Directives,
        attributes: Attributes,
    ) -> Self {
        self.requirements.push(Declaration {
            namespace: namespace.into(),
            directives,
            attributes,
        });
        self
    }

    /// 导出包
    pub fn export_package(self, package: &str, version: &str) -> Result<Self> {
        self.export_package_with(package, version, &[], &[], Attributes::new())
    }

    /// 导出包，附带 `uses` 约束、`mandatory` 属性和额外属性
    pub fn export_package_with(
        self,
        package: &str,
        version: &str,
        uses: &[&str],
        mandatory: &[&str],
        extra: Attributes,
    ) -> Result<Self> {
        let mut attributes = extra;
        attributes.insert(namespace::PACKAGE.to_string(), AttrValue::from(package));
        attributes.insert(
            attribute::VERSION.to_string(),
            AttrValue::Version(parse_version(version)?),
        );
        let mut directives = Directives::new();
        if !uses.is_empty() {
            directives.insert(directive::USES.to_string(), uses.join(","));
        }
        if !mandatory.is_empty() {
            directives.insert(directive::MANDATORY.to_string(), mandatory.join(","));
        }
        Ok(self.capability(namespace::PACKAGE, directives, attributes))
    }

    /// 导入包，`range` 为区间语法（`[1.0,2.0)`）或最低版本
    pub fn import_package(self, package: &str, range: Option<&str>) -> Result<Self> {
        self.import_package_with(package, range, directive::RESOLUTION_MANDATORY, None)
    }

    /// 可选导入包
    pub fn import_package_optional(self, package: &str, range: Option<&str>) -> Result<Self> {
        self.import_package_with(package, range, directive::RESOLUTION_OPTIONAL, None)
    }

    /// 导入包，附加过滤片段（例如 `(vendor=acme)`）
    pub fn import_package_with(
        self,
        package: &str,
        range: Option<&str>,
        resolution: &str,
        extra_filter: Option<&str>,
    ) -> Result<Self> {
        let mut clauses = vec![format!("({}={})", namespace::PACKAGE, package)];
        if let Some(range) = range {
            clauses.extend(version_range_clauses(attribute::VERSION, range)?);
        }
        if let Some(extra) = extra_filter {
            clauses.push(extra.to_string());
        }
        let mut directives = Directives::new();
        directives.insert(directive::FILTER.to_string(), and_filter(&clauses));
        if resolution != directive::RESOLUTION_MANDATORY {
            directives.insert(directive::RESOLUTION.to_string(), resolution.to_string());
        }
        Ok(self.requirement(namespace::PACKAGE, directives, Attributes::new()))
    }

    /// 动态导入，`pattern` 可含通配符（`com.acme.*` 或 `*`）
    pub fn dynamic_import(self, pattern: &str) -> Self {
        let mut directives = Directives::new();
        directives.insert(
            directive::FILTER.to_string(),
            format!("({}={})", namespace::PACKAGE, pattern),
        );
        directives.insert(
            directive::RESOLUTION.to_string(),
            directive::RESOLUTION_DYNAMIC.to_string(),
        );
        directives.insert(
            directive::CARDINALITY.to_string(),
            directive::CARDINALITY_MULTIPLE.to_string(),
        );
        self.requirement(namespace::PACKAGE, directives, Attributes::new())
    }

    /// 依赖整个模块
    pub fn require_module(self, symbolic_name: &str, range: Option<&str>) -> Result<Self> {
        let mut clauses = vec![format!("({}={})", namespace::BUNDLE, symbolic_name)];
        if let Some(range) = range {
            clauses.extend(version_range_clauses(attribute::VERSION, range)?);
        }
        let mut directives = Directives::new();
        directives.insert(directive::FILTER.to_string(), and_filter(&clauses));
        Ok(self.requirement(namespace::BUNDLE, directives, Attributes::new()))
    }

    /// 构建修订
    ///
    /// 合成的身份能力始终位于能力列表首位。
    pub fn build(&self, module_id: ModuleId, revision_id: RevisionId) -> Result<ModuleRevision> {
        let mut capabilities = Vec::with_capacity(self.capabilities.len() + 3);
        let mut requirements = Vec::with_capacity(self.requirements.len() + 1);
        let version_attr = AttrValue::Version(self.version.clone());

        let mut identity_attrs = Attributes::new();
        identity_attrs.insert(
            namespace::IDENTITY.to_string(),
            AttrValue::from(self.symbolic_name.as_str()),
        );
        identity_attrs.insert(attribute::VERSION.to_string(), version_attr.clone());
        identity_attrs.insert(
            attribute::TYPE.to_string(),
            AttrValue::from(if self.is_fragment() {
                attribute::TYPE_FRAGMENT
            } else {
                attribute::TYPE_MODULE
            }),
        );
        let mut identity_dirs = Directives::new();
        if self.singleton {
            identity_dirs.insert(directive::SINGLETON.to_string(), "true".to_string());
        }
        capabilities.push(Capability::new(namespace::IDENTITY, identity_dirs, identity_attrs));

        match &self.fragment_host {
            None => {
                let mut bundle_attrs = Attributes::new();
                bundle_attrs.insert(
                    namespace::BUNDLE.to_string(),
                    AttrValue::from(self.symbolic_name.as_str()),
                );
                bundle_attrs.insert(attribute::VERSION.to_string(), version_attr.clone());
                let mut host_attrs = Attributes::new();
                host_attrs.insert(
                    namespace::HOST.to_string(),
                    AttrValue::from(self.symbolic_name.as_str()),
                );
                host_attrs.insert(attribute::VERSION.to_string(), version_attr);
                let mut host_dirs = Directives::new();
                host_dirs.insert(
                    directive::FRAGMENT_ATTACHMENT.to_string(),
                    self.attachment.as_str().to_string(),
                );
                if self.singleton {
                    host_dirs.insert(directive::SINGLETON.to_string(), "true".to_string());
                }
                capabilities.push(Capability::new(namespace::BUNDLE, Directives::new(), bundle_attrs));
                capabilities.push(Capability::new(namespace::HOST, host_dirs, host_attrs));
            }
            Some(host) => {
                let mut dirs = Directives::new();
                dirs.insert(
                    directive::FILTER.to_string(),
                    format!("({}={})", namespace::HOST, host),
                );
                requirements.push(Requirement::new(namespace::HOST, dirs, Attributes::new())?);
            }
        }

        for decl in &self.capabilities {
            if decl.namespace == namespace::IDENTITY {
                return Err(ContainerError::InvalidMetadata(
                    "identity 能力由容器生成，不能手工声明".to_string(),
                ));
            }
            capabilities.push(Capability::new(
                decl.namespace.clone(),
                decl.directives.clone(),
                decl.attributes.clone(),
            ));
        }
        for decl in &self.requirements {
            requirements.push(Requirement::new(
                decl.namespace.clone(),
                decl.directives.clone(),
                decl.attributes.clone(),
            )?);
        }

        Ok(ModuleRevision {
            id: revision_id,
            module_id,
            symbolic_name: self.symbolic_name.clone(),
            version: self.version.clone(),
            fragment: self.is_fragment(),
            activation: self.activation,
            capabilities,
            requirements,
        })
    }
}

fn and_filter(clauses: &[String]) -> String {
    if clauses.len() == 1 {
        clauses[0].clone()
    } else {
        format!("(&{})", clauses.concat())
    }
}

/// 将版本区间转换为过滤器子句
///
/// `[a,b)`、`(a,b]` 等区间语法，或单个版本号表示最低版本。
pub fn version_range_clauses(attr: &str, range: &str) -> Result<Vec<String>> {
    let range = range.trim();
    let invalid = || ContainerError::InvalidMetadata(format!("无效的版本区间: '{}'", range));

    let first = range.chars().next().ok_or_else(invalid)?;
    if first != '[' && first != '(' {
        let floor = parse_version(range)?;
        return Ok(vec![format!("({}>={})", attr, floor)]);
    }

    let last = range.chars().last().ok_or_else(invalid)?;
    if (last != ']' && last != ')') || range.len() < 2 {
        return Err(invalid());
    }
    let body = &range[1..range.len() - 1];
    let (low, high) = body.split_once(',').ok_or_else(invalid)?;
    let low = parse_version(low)?;
    let high = parse_version(high)?;

    let mut clauses = Vec::with_capacity(2);
    if first == '[' {
        clauses.push(format!("({}>={})", attr, low));
    } else {
        clauses.push(format!("(!({}<={}))", attr, low));
    }
    if last == ']' {
        clauses.push(format!("({}<={})", attr, high));
    } else {
        clauses.push(format!("(!({}>={}))", attr, high));
    }
    Ok(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(builder: RevisionBuilder) -> Arc<ModuleRevision> {
        Arc::new(builder.build(1, 1).unwrap())
    }

    #[test]
    fn test_synthesized_capabilities() {
        let rev = build(RevisionBuilder::new("a", "1.0").unwrap().singleton(true));
        let namespaces: Vec<&str> = rev.capabilities().iter().map(|c| c.namespace()).collect();
        assert_eq!(namespaces, vec!["identity", "bundle", "host"]);
        assert!(rev.is_singleton());
        assert!(!rev.is_fragment());
        assert_eq!(rev.capabilities()[0].primary_key(), Some("a"));
    }

    #[test]
    fn test_fragment_revision() {
        let rev = build(RevisionBuilder::new("frag", "1.0").unwrap().fragment_of("host.a"));
        assert!(rev.is_fragment());
        assert!(rev.is_payload_free());
        let host_req = rev.host_requirement().unwrap();
        assert_eq!(host_req.requirement().primary_key(), Some("host.a"));
    }

    #[test]
    fn test_package_matching_with_range() {
        let exporter = build(
            RevisionBuilder::new("a", "1.0")
                .unwrap()
                .export_package("p", "1.5")
                .unwrap(),
        );
        let importer = build(
            RevisionBuilder::new("b", "1.0")
                .unwrap()
                .import_package("p", Some("[1.0,2.0)"))
                .unwrap(),
        );
        let cap = &exporter.capabilities_in("package")[0];
        let req = &importer.requirement_refs()[0];
        assert!(req.requirement().matches(cap.capability()));
        assert_eq!(req.requirement().primary_key(), Some("p"));

        let too_new = build(
            RevisionBuilder::new("c", "1.0")
                .unwrap()
                .export_package("p", "2.0")
                .unwrap(),
        );
        let cap = &too_new.capabilities_in("package")[0];
        assert!(!req.requirement().matches(cap.capability()));
    }

    #[test]
    fn test_mandatory_directive() {
        let mut extra = Attributes::new();
        extra.insert("vendor".to_string(), AttrValue::from("acme"));
        let exporter = build(
            RevisionBuilder::new("a", "1.0")
                .unwrap()
                .export_package_with("p", "1.0", &[], &["vendor"], extra)
                .unwrap(),
        );
        let cap = exporter.capabilities_in("package")[0].clone();

        let plain = build(
            RevisionBuilder::new("b", "1.0")
                .unwrap()
                .import_package("p", None)
                .unwrap(),
        );
        assert!(!plain.requirements()[0].matches(cap.capability()));

        let explicit = build(
            RevisionBuilder::new("c", "1.0")
                .unwrap()
                .import_package_with("p", None, "mandatory", Some("(vendor=acme)"))
                .unwrap(),
        );
        assert!(explicit.requirements()[0].matches(cap.capability()));
    }

    #[test]
    fn test_non_effective_capability_ignored() {
        let mut dirs = Directives::new();
        dirs.insert("effective".to_string(), "active".to_string());
        let mut attrs = Attributes::new();
        attrs.insert("service".to_string(), AttrValue::from("log"));
        let provider = build(RevisionBuilder::new("a", "1.0").unwrap().capability("service", dirs, attrs));
        let mut req_dirs = Directives::new();
        req_dirs.insert("filter".to_string(), "(service=log)".to_string());
        let consumer = build(
            RevisionBuilder::new("b", "1.0")
                .unwrap()
                .requirement("service", req_dirs, Attributes::new()),
        );
        let cap = provider.capabilities_in("service")[0].clone();
        assert!(!consumer.requirements()[0].matches(cap.capability()));
    }

    #[test]
    fn test_invalid_filter_rejected_at_build() {
        let mut dirs = Directives::new();
        dirs.insert("filter".to_string(), "(broken".to_string());
        let builder = RevisionBuilder::new("a", "1.0")
            .unwrap()
            .requirement("service", dirs, Attributes::new());
        assert!(matches!(
            builder.build(1, 1),
            Err(ContainerError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_version_range_clauses() {
        assert_eq!(
            version_range_clauses("version", "1.0").unwrap(),
            vec!["(version>=1.0.0)"]
        );
        assert_eq!(
            version_range_clauses("version", "(1.0,2.0]").unwrap(),
            vec!["(!(version<=1.0.0))", "(version<=2.0.0)"]
        );
        assert!(version_range_clauses("version", "[1.0)").is_err());
    }

    #[test]
    fn test_dynamic_import() {
        let rev = build(RevisionBuilder::new("a", "1.0").unwrap().dynamic_import("com.acme.*"));
        let req = &rev.requirements()[0];
        assert!(req.is_dynamic());
        assert!(req.is_multiple());
    }
}
