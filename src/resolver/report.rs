//! 解析报告
//!
//! 记录每个未解析修订的原因：缺失能力、提供方未解析、uses 约束冲突、
//! 单例选择落败、被解析钩子过滤。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::module::{ModuleId, ModuleRevision, RevisionId};

/// 报告条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportEntry {
    /// 过滤后没有任何能力满足需求
    MissingCapability { requirement: String },
    /// 满足需求的能力全部来自未能解析的修订
    UnresolvedProvider {
        requirement: String,
        providers: Vec<String>,
    },
    /// uses 约束冲突
    UsesConstraintViolation {
        requirement: String,
        package: String,
        detail: String,
    },
    /// 单例选择落败
    SingletonSelection { winner: String },
    /// 被解析钩子排除
    FilteredByResolverHook,
}

impl ReportEntry {
    /// 条目类别名称
    pub fn kind(&self) -> &'static str {
        match self {
            ReportEntry::MissingCapability { .. } => "missing_capability",
            ReportEntry::UnresolvedProvider { .. } => "unresolved_provider",
            ReportEntry::UsesConstraintViolation { .. } => "uses_constraint_violation",
            ReportEntry::SingletonSelection { .. } => "singleton_selection",
            ReportEntry::FilteredByResolverHook => "filtered_by_resolver_hook",
        }
    }
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportEntry::MissingCapability { requirement } => {
                write!(f, "缺少满足需求的能力: {}", requirement)
            }
            ReportEntry::UnresolvedProvider {
                requirement,
                providers,
            } => write!(
                f,
                "需求 {} 的提供方未能解析: {}",
                requirement,
                providers.join(", ")
            ),
            ReportEntry::UsesConstraintViolation {
                requirement,
                package,
                detail,
            } => write!(f, "需求 {} 违反包 '{}' 的 uses 约束: {}", requirement, package, detail),
            ReportEntry::SingletonSelection { winner } => {
                write!(f, "单例选择落败，已选择 {}", winner)
            }
            ReportEntry::FilteredByResolverHook => f.write_str("被解析钩子排除"),
        }
    }
}

/// 单个修订的报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionReport {
    pub revision: String,
    pub module_id: ModuleId,
    pub entries: Vec<ReportEntry>,
}

/// 解析报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    revisions: BTreeMap<RevisionId, RevisionReport>,
}

impl ResolutionReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加条目，相同条目只记录一次
    pub fn add(&mut self, revision: &ModuleRevision, entry: ReportEntry) {
        let report = self
            .revisions
            .entry(revision.id())
            .or_insert_with(|| RevisionReport {
                revision: revision.to_string(),
                module_id: revision.module_id(),
                entries: Vec::new(),
            });
        if !report.entries.contains(&entry) {
            report.entries.push(entry);
        }
    }

    /// 修订的条目
    pub fn entries(&self, revision: RevisionId) -> &[ReportEntry] {
        self.revisions
            .get(&revision)
            .map(|r| r.entries.as_slice())
            .unwrap_or(&[])
    }

    /// 模块任一修订的条目
    pub fn entries_for_module(&self, module: ModuleId) -> Vec<&ReportEntry> {
        self.revisions
            .values()
            .filter(|r| r.module_id == module)
            .flat_map(|r| r.entries.iter())
            .collect()
    }

    pub fn revisions(&self) -> impl Iterator<Item = &RevisionReport> {
        self.revisions.values()
    }

    /// 丢弃给定修订的条目（修订最终解析成功时）
    pub fn clear(&mut self, revision: RevisionId) {
        self.revisions.remove(&revision);
    }

    pub fn merge(&mut self, other: ResolutionReport) {
        for (id, report) in other.revisions {
            match self.revisions.get_mut(&id) {
                Some(existing) => {
                    for entry in report.entries {
                        if !existing.entries.contains(&entry) {
                            existing.entries.push(entry);
                        }
                    }
                }
                None => {
                    self.revisions.insert(id, report);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }
}

impl fmt::Display for ResolutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in self.revisions.values() {
            writeln!(f, "{}:", report.revision)?;
            for entry in &report.entries {
                writeln!(f, "  - {}", entry)?;
            }
        }
        Ok(())
    }
}
