//! 记忆存储
//!
//! SessionMemory 持有当前会话的 Working（按键覆盖，最新值生效）与 Episodic（仅追加的有序事件流，
//! 所有错误无论是否恢复都会落入其中供事后审计）；SharedMemory 持有跨会话的 Semantic / Procedural
//! 记忆，落盘为 JSON 文件。没有任何全局单例，所有访问都经由显式传入的会话上下文。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::memory::persistence;

/// 记忆记录种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    /// 当前任务暂存，按键覆盖
    Working,
    /// 有序事件日志，仅追加
    Episodic,
    /// 跨会话事实
    Semantic,
    /// 跨会话可复用工作流
    Procedural,
}

/// 单条记忆记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub kind: MemoryKind,
    pub session_id: String,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(kind: MemoryKind, session_id: &str, key: &str, value: Value) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            key: key.to_string(),
            value,
            created_at: Utc::now(),
        }
    }
}

/// 会话内记忆：Working + Episodic
#[derive(Debug, Clone)]
pub struct SessionMemory {
    session_id: String,
    working: HashMap<String, MemoryRecord>,
    episodic: Vec<MemoryRecord>,
}

impl SessionMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            working: HashMap::new(),
            episodic: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 写入 Working：同键覆盖，最新值生效
    pub fn set_working(&mut self, key: &str, value: Value) {
        let record = MemoryRecord::new(MemoryKind::Working, &self.session_id, key, value);
        self.working.insert(key.to_string(), record);
    }

    pub fn working(&self, key: &str) -> Option<&Value> {
        self.working.get(key).map(|r| &r.value)
    }

    /// 追加一条 Episodic 事件（key 为事件类型，如 "subtask_failed"）
    pub fn record_event(&mut self, key: &str, value: Value) {
        self.episodic
            .push(MemoryRecord::new(MemoryKind::Episodic, &self.session_id, key, value));
    }

    pub fn events(&self) -> &[MemoryRecord] {
        &self.episodic
    }

    /// 按事件类型统计，供汇总报告使用
    pub fn event_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for e in &self.episodic {
            *counts.entry(e.key.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// 跨会话记忆：Semantic + Procedural，JSON 文件持久化
#[derive(Debug)]
pub struct SharedMemory {
    path: PathBuf,
    semantic: HashMap<String, MemoryRecord>,
    procedural: HashMap<String, MemoryRecord>,
}

impl SharedMemory {
    /// 打开（或新建）跨会话记忆文件；文件不存在时为空存储
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref().to_path_buf();
        let (semantic, procedural) = persistence::load_shared(&path)?;
        Ok(Self {
            path,
            semantic,
            procedural,
        })
    }

    /// 写入一条跨会话记录并立即落盘
    pub fn put(
        &mut self,
        kind: MemoryKind,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), OrchestratorError> {
        let record = MemoryRecord::new(kind, session_id, key, value);
        match kind {
            MemoryKind::Semantic => {
                self.semantic.insert(key.to_string(), record);
            }
            MemoryKind::Procedural => {
                self.procedural.insert(key.to_string(), record);
            }
            _ => {
                return Err(OrchestratorError::Memory(format!(
                    "kind {:?} is session-scoped, not shared",
                    kind
                )));
            }
        }
        persistence::save_shared(&self.path, &self.semantic, &self.procedural)
    }

    pub fn get(&self, kind: MemoryKind, key: &str) -> Option<&MemoryRecord> {
        match kind {
            MemoryKind::Semantic => self.semantic.get(key),
            MemoryKind::Procedural => self.procedural.get(key),
            _ => None,
        }
    }

    pub fn remove(&mut self, kind: MemoryKind, key: &str) -> Result<bool, OrchestratorError> {
        let removed = match kind {
            MemoryKind::Semantic => self.semantic.remove(key).is_some(),
            MemoryKind::Procedural => self.procedural.remove(key).is_some(),
            _ => false,
        };
        if removed {
            persistence::save_shared(&self.path, &self.semantic, &self.procedural)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_working_memory_overwrites_per_key() {
        let mut mem = SessionMemory::new("s1");
        mem.set_working("draft", json!("v1"));
        mem.set_working("draft", json!("v2"));
        assert_eq!(mem.working("draft"), Some(&json!("v2")));
    }

    #[test]
    fn test_episodic_is_append_only_and_ordered() {
        let mut mem = SessionMemory::new("s1");
        mem.record_event("a", json!(1));
        mem.record_event("b", json!(2));
        mem.record_event("a", json!(3));
        let keys: Vec<_> = mem.events().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
        assert_eq!(mem.event_counts().get("a"), Some(&2));
    }

    #[test]
    fn test_shared_memory_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");

        let mut shared = SharedMemory::open(&path).unwrap();
        shared
            .put(MemoryKind::Procedural, "s1", "plan:core", json!({"steps": 2}))
            .unwrap();
        drop(shared);

        let reopened = SharedMemory::open(&path).unwrap();
        let rec = reopened.get(MemoryKind::Procedural, "plan:core").unwrap();
        assert_eq!(rec.value, json!({"steps": 2}));
        assert!(reopened.get(MemoryKind::Semantic, "plan:core").is_none());
    }

    #[test]
    fn test_shared_memory_rejects_session_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut shared = SharedMemory::open(dir.path().join("shared.json")).unwrap();
        assert!(shared
            .put(MemoryKind::Working, "s1", "k", json!(null))
            .is_err());
    }
}
