//! 跨会话记忆持久化
//!
//! Semantic / Procedural 记录写入/从单个 JSON 文件加载；父目录不存在时自动创建。

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::memory::store::MemoryRecord;

#[derive(Serialize, Deserialize, Default)]
struct SharedMemoryFile {
    semantic: Vec<MemoryRecord>,
    procedural: Vec<MemoryRecord>,
}

/// 从 JSON 文件加载跨会话记忆；文件不存在时返回空映射
pub fn load_shared(
    path: &Path,
) -> Result<(HashMap<String, MemoryRecord>, HashMap<String, MemoryRecord>), OrchestratorError> {
    if !path.exists() {
        return Ok((HashMap::new(), HashMap::new()));
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| OrchestratorError::Memory(format!("read {}: {}", path.display(), e)))?;
    let file: SharedMemoryFile = serde_json::from_str(&data)
        .map_err(|e| OrchestratorError::Memory(format!("parse {}: {}", path.display(), e)))?;

    let semantic = file
        .semantic
        .into_iter()
        .map(|r| (r.key.clone(), r))
        .collect();
    let procedural = file
        .procedural
        .into_iter()
        .map(|r| (r.key.clone(), r))
        .collect();
    Ok((semantic, procedural))
}

/// 将跨会话记忆写入 JSON 文件
pub fn save_shared(
    path: &Path,
    semantic: &HashMap<String, MemoryRecord>,
    procedural: &HashMap<String, MemoryRecord>,
) -> Result<(), OrchestratorError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| OrchestratorError::Memory(format!("mkdir {}: {}", parent.display(), e)))?;
    }
    let mut file = SharedMemoryFile::default();
    file.semantic = semantic.values().cloned().collect();
    file.procedural = procedural.values().cloned().collect();
    // 键序稳定，便于人工查看 diff
    file.semantic.sort_by(|a, b| a.key.cmp(&b.key));
    file.procedural.sort_by(|a, b| a.key.cmp(&b.key));

    let data = serde_json::to_string_pretty(&file)
        .map_err(|e| OrchestratorError::Memory(format!("serialize shared memory: {}", e)))?;
    std::fs::write(path, data)
        .map_err(|e| OrchestratorError::Memory(format!("write {}: {}", path.display(), e)))?;
    Ok(())
}
