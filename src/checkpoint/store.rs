//! 检查点存储
//!
//! 每个会话一个 JSONL 文件，一行一个计划快照。写入即落盘（sync_all），
//! 调度器在快照确认后才推进状态传播。文件保留最近 retain 条，超出截断；
//! 加载时跳过无法解析的行（可能来自写入中断），只警告不失败。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::OrchestratorError;
use crate::plan::Plan;

/// 计划快照：序号在会话内单调递增
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub plan: Plan,
}

/// 检查点存储：目录 + 保留条数
pub struct CheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session_id))
    }

    /// 追加一个快照并落盘；超出保留条数时重写文件只留最近 retain 条
    pub fn append(&self, session_id: &str, plan: &Plan) -> Result<Checkpoint, OrchestratorError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| OrchestratorError::Checkpoint(format!("mkdir {}: {}", self.dir.display(), e)))?;

        let mut existing = self.load_all(session_id)?;
        let sequence = existing.last().map(|c| c.sequence + 1).unwrap_or(1);
        let checkpoint = Checkpoint {
            session_id: session_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            plan: plan.clone(),
        };

        let path = self.path_for(session_id);
        if existing.len() + 1 > self.retain {
            existing.push(checkpoint.clone());
            let keep = existing.split_off(existing.len() - self.retain);
            self.rewrite(&path, &keep)?;
        } else {
            let line = serde_json::to_string(&checkpoint)
                .map_err(|e| OrchestratorError::Checkpoint(format!("serialize checkpoint: {}", e)))?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| OrchestratorError::Checkpoint(format!("open {}: {}", path.display(), e)))?;
            writeln!(file, "{}", line)
                .map_err(|e| OrchestratorError::Checkpoint(format!("write {}: {}", path.display(), e)))?;
            file.sync_all()
                .map_err(|e| OrchestratorError::Checkpoint(format!("sync {}: {}", path.display(), e)))?;
        }

        debug!(session_id = %session_id, sequence, "checkpoint written");
        Ok(checkpoint)
    }

    /// 加载会话的全部快照（按序号升序）；文件不存在返回空
    pub fn load_all(&self, session_id: &str) -> Result<Vec<Checkpoint>, OrchestratorError> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)
            .map_err(|e| OrchestratorError::Checkpoint(format!("open {}: {}", path.display(), e)))?;

        let mut checkpoints = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| OrchestratorError::Checkpoint(format!("read {}: {}", path.display(), e)))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(&line) {
                Ok(c) => checkpoints.push(c),
                Err(e) => {
                    warn!(
                        session_id = %session_id,
                        line = index + 1,
                        error = %e,
                        "skipping malformed checkpoint line"
                    );
                }
            }
        }
        checkpoints.sort_by_key(|c| c.sequence);
        Ok(checkpoints)
    }

    /// 最近一个快照
    pub fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, OrchestratorError> {
        Ok(self.load_all(session_id)?.into_iter().last())
    }

    fn rewrite(&self, path: &Path, checkpoints: &[Checkpoint]) -> Result<(), OrchestratorError> {
        let mut data = String::new();
        for checkpoint in checkpoints {
            let line = serde_json::to_string(checkpoint)
                .map_err(|e| OrchestratorError::Checkpoint(format!("serialize checkpoint: {}", e)))?;
            data.push_str(&line);
            data.push('\n');
        }
        let mut file = File::create(path)
            .map_err(|e| OrchestratorError::Checkpoint(format!("create {}: {}", path.display(), e)))?;
        file.write_all(data.as_bytes())
            .map_err(|e| OrchestratorError::Checkpoint(format!("write {}: {}", path.display(), e)))?;
        file.sync_all()
            .map_err(|e| OrchestratorError::Checkpoint(format!("sync {}: {}", path.display(), e)))?;
        Ok(())
    }
}
