//! 数据库持久化
//!
//! 使用 serde + bincode 编码的带版本二进制格式，依次包含：
//!
//! 1. 格式版本与全局计数器（下一个模块 ID、下一个修订 ID、两个时间戳、初始模块启动级别）
//! 2. 去重的字符串表与属性表（指令表同样存放在属性表中）
//! 3. 每个模块的记录：位置、ID、符号名、版本、能力、需求、设置、启动级别、最后修改时间
//! 4. 可选的完整连线图，连线以 (修订 ID, 下标) 引用模块表中的能力与需求
//!
//! 任何修订处于等待移除状态时连线图无法重建，此时不写入连线图。
//! 加载要求数据库为新建的空数据库。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Database, ModuleWiring, Wire, WiringMap};
use crate::module::revision::Declaration;
use crate::module::{
    ActivationPolicy, AttrValue, Attributes, CapabilityRef, Directives, Module, ModuleRevision,
    ModuleSettings, ModuleState, RequirementRef, RevisionId,
};
use crate::utils::{ContainerError, Result};

/// 当前格式版本
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum StoredValue {
    String(u32),
    Long(i64),
    Double(f64),
    Version(u32),
    List(Vec<StoredValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredMap {
    entries: Vec<(u32, StoredValue)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDeclaration {
    namespace: u32,
    directives: u32,
    attributes: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredModule {
    location: u32,
    id: u64,
    revision_id: u64,
    symbolic_name: u32,
    version: u32,
    fragment: bool,
    lazy: bool,
    capabilities: Vec<StoredDeclaration>,
    requirements: Vec<StoredDeclaration>,
    settings: ModuleSettings,
    start_level: u32,
    last_modified: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredWire {
    requirement: (u64, u32),
    capability: (u64, u32),
    requirer: u64,
    provider: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredWiring {
    revision: u64,
    capabilities: Vec<(u64, u32)>,
    requirements: Vec<(u64, u32)>,
    required: Vec<StoredWire>,
    substituted: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDatabase {
    format_version: u32,
    next_module_id: u64,
    next_revision_id: u64,
    revisions_timestamp: u64,
    all_timestamp: u64,
    initial_module_start_level: u32,
    strings: Vec<String>,
    maps: Vec<StoredMap>,
    modules: Vec<StoredModule>,
    wirings: Option<Vec<StoredWiring>>,
}

/// 编码时的去重表
#[derive(Default)]
struct Tables {
    strings: Vec<String>,
    string_ids: HashMap<String, u32>,
    maps: Vec<StoredMap>,
    map_ids: HashMap<Vec<u8>, u32>,
}

impl Tables {
    fn string(&mut self, value: &str) -> u32 {
        if let Some(id) = self.string_ids.get(value) {
            return *id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_ids.insert(value.to_string(), id);
        id
    }

    fn value(&mut self, value: &AttrValue) -> StoredValue {
        match value {
            AttrValue::String(s) => StoredValue::String(self.string(s)),
            AttrValue::Long(n) => StoredValue::Long(*n),
            AttrValue::Double(d) => StoredValue::Double(*d),
            AttrValue::Version(v) => StoredValue::Version(self.string(&v.to_string())),
            AttrValue::List(items) => StoredValue::List(items.iter().map(|i| self.value(i)).collect()),
        }
    }

    fn map(&mut self, entries: Vec<(u32, StoredValue)>) -> Result<u32> {
        let map = StoredMap { entries };
        let key = bincode::serialize(&map)?;
        if let Some(id) = self.map_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.maps.len() as u32;
        self.maps.push(map);
        self.map_ids.insert(key, id);
        Ok(id)
    }

    fn declaration(&mut self, decl: &Declaration) -> Result<StoredDeclaration> {
        let namespace = self.string(&decl.namespace);
        let directives: Vec<(u32, StoredValue)> = decl
            .directives
            .iter()
            .map(|(k, v)| (self.string(k), StoredValue::String(self.string(v))))
            .collect();
        let attributes: Vec<(u32, StoredValue)> = decl
            .attributes
            .iter()
            .map(|(k, v)| (self.string(k), self.value(v)))
            .collect();
        Ok(StoredDeclaration {
            namespace,
            directives: self.map(directives)?,
            attributes: self.map(attributes)?,
        })
    }
}

/// 解码时的表访问
struct Lookup<'a> {
    strings: &'a [String],
    maps: &'a [StoredMap],
}

impl Lookup<'_> {
    fn string(&self, id: u32) -> Result<&str> {
        self.strings
            .get(id as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| ContainerError::Storage(format!("字符串表下标越界: {}", id)))
    }

    fn value(&self, value: &StoredValue) -> Result<AttrValue> {
        Ok(match value {
            StoredValue::String(id) => AttrValue::String(self.string(*id)?.to_string()),
            StoredValue::Long(n) => AttrValue::Long(*n),
            StoredValue::Double(d) => AttrValue::Double(*d),
            StoredValue::Version(id) => AttrValue::Version(semver::Version::parse(self.string(*id)?)?),
            StoredValue::List(items) => AttrValue::List(
                items
                    .iter()
                    .map(|i| self.value(i))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    fn map(&self, id: u32) -> Result<&StoredMap> {
        self.maps
            .get(id as usize)
            .ok_or_else(|| ContainerError::Storage(format!("属性表下标越界: {}", id)))
    }

    fn declaration(&self, stored: &StoredDeclaration) -> Result<Declaration> {
        let mut directives = Directives::new();
        for (key, value) in &self.map(stored.directives)?.entries {
            let value = match self.value(value)? {
                AttrValue::String(s) => s,
                other => other.to_string(),
            };
            directives.insert(self.string(*key)?.to_string(), value);
        }
        let mut attributes = Attributes::new();
        for (key, value) in &self.map(stored.attributes)?.entries {
            attributes.insert(self.string(*key)?.to_string(), self.value(value)?);
        }
        Ok(Declaration {
            namespace: self.string(stored.namespace)?.to_string(),
            directives,
            attributes,
        })
    }
}

fn revision_ref(revisions: &HashMap<RevisionId, Arc<ModuleRevision>>, id: u64) -> Result<&Arc<ModuleRevision>> {
    revisions
        .get(&id)
        .ok_or_else(|| ContainerError::Storage(format!("连线引用了未知修订 {}", id)))
}

fn capability_ref(
    revisions: &HashMap<RevisionId, Arc<ModuleRevision>>,
    (revision, index): (u64, u32),
) -> Result<CapabilityRef> {
    let revision = revision_ref(revisions, revision)?;
    if index as usize >= revision.capabilities().len() {
        return Err(ContainerError::Storage(format!(
            "修订 {} 没有下标为 {} 的能力",
            revision, index
        )));
    }
    Ok(CapabilityRef::new(revision.clone(), index as usize))
}

fn requirement_ref(
    revisions: &HashMap<RevisionId, Arc<ModuleRevision>>,
    (revision, index): (u64, u32),
) -> Result<RequirementRef> {
    let revision = revision_ref(revisions, revision)?;
    if index as usize >= revision.requirements().len() {
        return Err(ContainerError::Storage(format!(
            "修订 {} 没有下标为 {} 的需求",
            revision, index
        )));
    }
    Ok(RequirementRef::new(revision.clone(), index as usize))
}

impl Database {
    /// 编码数据库
    ///
    /// `persist_wirings` 为 `true` 且没有等待移除的修订时写入连线图。
    pub fn encode(&self, persist_wirings: bool) -> Result<Vec<u8>> {
        let state = self.read_state();
        let mut tables = Tables::default();

        let mut modules = Vec::with_capacity(state.modules_by_id.len());
        for module in state.modules_by_id.values() {
            let revision = module.current_revision().ok_or_else(|| {
                ContainerError::Storage(format!("模块 {} 没有当前修订", module))
            })?;
            let (caps, reqs) = revision.declarations();
            modules.push(StoredModule {
                location: tables.string(module.location()),
                id: module.id(),
                revision_id: revision.id(),
                symbolic_name: tables.string(revision.symbolic_name()),
                version: tables.string(&revision.version().to_string()),
                fragment: revision.is_fragment(),
                lazy: revision.activation_policy() == ActivationPolicy::Lazy,
                capabilities: caps
                    .iter()
                    .map(|d| tables.declaration(d))
                    .collect::<Result<Vec<_>>>()?,
                requirements: reqs
                    .iter()
                    .map(|d| tables.declaration(d))
                    .collect::<Result<Vec<_>>>()?,
                settings: module.settings(),
                start_level: module.start_level(),
                last_modified: module.last_modified(),
            });
        }

        let current = state.current_revision_ids();
        let pending = state.wirings.keys().any(|id| !current.contains(id));
        let wirings = if !persist_wirings {
            None
        } else if pending {
            warn!("存在等待移除的修订，连线图不写入持久化数据");
            None
        } else {
            let mut stored: Vec<StoredWiring> = state
                .wirings
                .values()
                .map(|wiring| StoredWiring {
                    revision: wiring.revision().id(),
                    capabilities: wiring
                        .capabilities()
                        .iter()
                        .map(|c| (c.revision().id(), c.index() as u32))
                        .collect(),
                    requirements: wiring
                        .requirements()
                        .iter()
                        .map(|r| (r.revision().id(), r.index() as u32))
                        .collect(),
                    required: wiring
                        .required_wires()
                        .iter()
                        .map(|w| StoredWire {
                            requirement: (
                                w.raw_requirement().revision().id(),
                                w.raw_requirement().index() as u32,
                            ),
                            capability: (
                                w.raw_capability().revision().id(),
                                w.raw_capability().index() as u32,
                            ),
                            requirer: w.requirer_id(),
                            provider: w.provider_id(),
                        })
                        .collect(),
                    substituted: wiring
                        .substituted()
                        .iter()
                        .map(|p| tables.string(p))
                        .collect(),
                })
                .collect();
            stored.sort_by_key(|w| w.revision);
            Some(stored)
        };

        let stored = StoredDatabase {
            format_version: FORMAT_VERSION,
            next_module_id: state.next_module_id,
            next_revision_id: state.next_revision_id,
            revisions_timestamp: state.revisions_timestamp,
            all_timestamp: state.all_timestamp,
            initial_module_start_level: state.initial_module_start_level,
            strings: tables.strings,
            maps: tables.maps,
            modules,
            wirings,
        };
        Ok(bincode::serialize(&stored)?)
    }

    /// 从编码数据恢复，数据库必须为空
    pub fn decode(&self, bytes: &[u8]) -> Result<()> {
        let stored: StoredDatabase = bincode::deserialize(bytes)?;
        if stored.format_version != FORMAT_VERSION {
            return Err(ContainerError::Storage(format!(
                "不支持的持久化格式版本 {}（期望 {}）",
                stored.format_version, FORMAT_VERSION
            )));
        }

        let mut state = self.write_state()?;
        if !state.modules_by_id.is_empty() || state.revisions_timestamp != 0 {
            return Err(ContainerError::InvalidState(
                "只能向新建的空数据库加载持久化数据".to_string(),
            ));
        }

        let lookup = Lookup {
            strings: &stored.strings,
            maps: &stored.maps,
        };

        let mut revisions: HashMap<RevisionId, Arc<ModuleRevision>> = HashMap::new();
        let mut modules = Vec::with_capacity(stored.modules.len());
        for record in &stored.modules {
            let caps = record
                .capabilities
                .iter()
                .map(|d| lookup.declaration(d))
                .collect::<Result<Vec<_>>>()?;
            let reqs = record
                .requirements
                .iter()
                .map(|d| lookup.declaration(d))
                .collect::<Result<Vec<_>>>()?;
            let revision = Arc::new(ModuleRevision::restore(
                record.revision_id,
                record.id,
                lookup.string(record.symbolic_name)?.to_string(),
                semver::Version::parse(lookup.string(record.version)?)?,
                record.fragment,
                if record.lazy {
                    ActivationPolicy::Lazy
                } else {
                    ActivationPolicy::Eager
                },
                caps,
                reqs,
            )?);
            let module = Arc::new(Module::new(
                record.id,
                lookup.string(record.location)?,
                record.start_level,
                record.settings,
                record.last_modified,
            ));
            module.push_revision(revision.clone());
            revisions.insert(revision.id(), revision);
            modules.push(module);
        }

        let mut wirings = WiringMap::new();
        if let Some(stored_wirings) = &stored.wirings {
            let mut provided: HashMap<RevisionId, Vec<Arc<Wire>>> = HashMap::new();
            let mut required: HashMap<RevisionId, Vec<Arc<Wire>>> = HashMap::new();
            for wiring in stored_wirings {
                for w in &wiring.required {
                    let wire = Arc::new(Wire::new(
                        requirement_ref(&revisions, w.requirement)?,
                        capability_ref(&revisions, w.capability)?,
                        revision_ref(&revisions, w.requirer)?.clone(),
                        revision_ref(&revisions, w.provider)?.clone(),
                    ));
                    provided.entry(w.provider).or_default().push(wire.clone());
                    required.entry(w.requirer).or_default().push(wire);
                }
            }
            for wiring in stored_wirings {
                let revision = revision_ref(&revisions, wiring.revision)?.clone();
                let capabilities = wiring
                    .capabilities
                    .iter()
                    .map(|c| capability_ref(&revisions, *c))
                    .collect::<Result<Vec<_>>>()?;
                let requirements = wiring
                    .requirements
                    .iter()
                    .map(|r| requirement_ref(&revisions, *r))
                    .collect::<Result<Vec<_>>>()?;
                let substituted = wiring
                    .substituted
                    .iter()
                    .map(|p| lookup.string(*p).map(|s| s.to_string()))
                    .collect::<Result<BTreeSet<_>>>()?;
                wirings.insert(
                    revision.id(),
                    Arc::new(ModuleWiring::new(
                        revision.clone(),
                        capabilities,
                        requirements,
                        provided.remove(&revision.id()).unwrap_or_default(),
                        required.remove(&revision.id()).unwrap_or_default(),
                        substituted,
                    )),
                );
            }
        }

        {
            let index = Arc::make_mut(&mut state.index);
            for revision in revisions.values() {
                index.add_revision(revision);
            }
        }
        for module in &modules {
            let resolved = module
                .current_revision()
                .map(|r| wirings.contains_key(&r.id()))
                .unwrap_or(false);
            if resolved {
                module.set_state(ModuleState::Resolved);
            }
            state
                .modules_by_location
                .insert(module.location().to_string(), module.clone());
            state.modules_by_id.insert(module.id(), module.clone());
        }
        state.wirings = Arc::new(wirings);
        state.next_module_id = stored.next_module_id;
        state.next_revision_id = stored.next_revision_id;
        state.revisions_timestamp = stored.revisions_timestamp;
        state.all_timestamp = stored.all_timestamp;
        state.initial_module_start_level = stored.initial_module_start_level;

        info!(
            modules = modules.len(),
            wirings = state.wirings.len(),
            "持久化数据已加载"
        );
        Ok(())
    }

    /// 保存到文件
    pub async fn save(&self, path: &Path, persist_wirings: bool) -> Result<()> {
        let bytes = self.encode(persist_wirings)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// 从文件加载
    pub async fn load(&self, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        self.decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::RevisionBuilder;

    fn populated() -> Database {
        let db = Database::new(3);
        db.install_system(&RevisionBuilder::new("system", "1.0").unwrap())
            .unwrap();
        let mut extra = Attributes::new();
        extra.insert("weight".to_string(), AttrValue::Double(0.5));
        extra.insert(
            "tags".to_string(),
            AttrValue::List(vec![AttrValue::from("x"), AttrValue::Long(2)]),
        );
        db.install(
            "loc:a",
            &RevisionBuilder::new("a", "1.2.3")
                .unwrap()
                .lazy_activation()
                .export_package_with("p", "1.0", &["q"], &[], extra)
                .unwrap(),
        )
        .unwrap();
        db.install(
            "loc:b",
            &RevisionBuilder::new("b", "2.0")
                .unwrap()
                .import_package("p", Some("[1.0,2.0)"))
                .unwrap(),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_restore_modules() {
        let db = populated();
        let b = db.module_by_location("loc:b").unwrap();
        db.set_start_level(&b, 7).unwrap();
        let bytes = db.encode(true).unwrap();

        let restored = Database::new(1);
        restored.decode(&bytes).unwrap();
        assert_eq!(restored.modules().len(), 3);
        assert_eq!(restored.initial_module_start_level(), 3);
        assert_eq!(restored.revisions_timestamp(), db.revisions_timestamp());
        assert_eq!(restored.all_timestamp(), db.all_timestamp());

        let a = restored.module_by_location("loc:a").unwrap();
        let rev = a.current_revision().unwrap();
        assert_eq!(rev.version().to_string(), "1.2.3");
        assert_eq!(rev.activation_policy(), ActivationPolicy::Lazy);
        let original = db.module_by_location("loc:a").unwrap().current_revision().unwrap();
        assert_eq!(rev.declarations(), original.declarations());
        assert_eq!(restored.module_by_location("loc:b").unwrap().start_level(), 7);

        let next = restored
            .install("loc:c", &RevisionBuilder::new("c", "1.0").unwrap())
            .unwrap();
        assert_eq!(next.id(), 3);
    }

    #[test]
    fn test_load_requires_empty_database() {
        let db = populated();
        let bytes = db.encode(false).unwrap();
        assert!(matches!(db.decode(&bytes), Err(ContainerError::InvalidState(_))));
    }

    #[test]
    fn test_corrupt_data_rejected() {
        let db = Database::new(1);
        assert!(db.decode(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("modules.db");
        let db = populated();
        db.save(&path, true).await.unwrap();

        let restored = Database::new(1);
        restored.load(&path).await.unwrap();
        assert!(restored.module_by_location("loc:b").is_some());
    }
}
