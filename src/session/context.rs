//! 会话上下文
//!
//! 一次会话运行期间共享的句柄集合：配置、注册表、记忆、检查点存储、
//! 提案客户端、取消令牌与可选事件流。Episodic 记录与事件发送都经由
//! 这里，调用方不直接持有记忆锁。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::llm::ProposalClient;
use crate::memory::{SessionMemory, SharedMemory};
use crate::session::events::SessionEvent;

/// 会话上下文
pub struct SessionContext {
    pub session_id: String,
    pub config: AppConfig,
    pub registry: Arc<CapabilityRegistry>,
    pub memory: Arc<Mutex<SessionMemory>>,
    pub shared_memory: Arc<Mutex<SharedMemory>>,
    pub checkpoints: Arc<CheckpointStore>,
    pub proposals: Arc<dyn ProposalClient>,
    pub cancel: CancellationToken,
    events: Option<UnboundedSender<SessionEvent>>,
    /// 会话墙钟截止时刻；None 表示不限时
    pub deadline: Option<Instant>,
}

impl SessionContext {
    pub fn new(
        config: AppConfig,
        registry: Arc<CapabilityRegistry>,
        shared_memory: Arc<Mutex<SharedMemory>>,
        checkpoints: Arc<CheckpointStore>,
        proposals: Arc<dyn ProposalClient>,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        let deadline = match config.session.session_timeout_secs {
            0 => None,
            secs => Some(Instant::now() + Duration::from_secs(secs)),
        };
        Self {
            memory: Arc::new(Mutex::new(SessionMemory::new(session_id.clone()))),
            session_id,
            config,
            registry,
            shared_memory,
            checkpoints,
            proposals,
            cancel: CancellationToken::new(),
            events: None,
            deadline,
        }
    }

    /// 恢复会话时沿用原 session_id，使检查点文件续写同一条流
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        self.memory = Arc::new(Mutex::new(SessionMemory::new(session_id.clone())));
        self.session_id = session_id;
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 发送事件；无人接收时静默丢弃
    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 追加一条 Episodic 记录
    pub async fn record_event(&self, key: &str, value: Value) {
        self.memory.lock().await.record_event(key, value);
    }

    /// 剩余墙钟预算；None 表示不限时
    pub fn remaining_budget(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_passed(&self) -> bool {
        matches!(self.remaining_budget(), Some(d) if d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::MockProposalClient;
    use serde_json::json;

    fn context(dir: &std::path::Path) -> SessionContext {
        let config = AppConfig::default();
        SessionContext::new(
            config,
            Arc::new(CapabilityRegistry::new(15)),
            Arc::new(Mutex::new(SharedMemory::open(dir.join("shared.json")).unwrap())),
            Arc::new(CheckpointStore::new(dir.join("checkpoints"), 20)),
            Arc::new(MockProposalClient::new()),
        )
    }

    #[tokio::test]
    async fn test_record_event_lands_in_episodic_memory() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.record_event("subtask_finished", json!({"id": "t1"})).await;
        ctx.record_event("subtask_finished", json!({"id": "t2"})).await;

        let memory = ctx.memory.lock().await;
        assert_eq!(memory.events().len(), 2);
        assert_eq!(memory.event_counts()["subtask_finished"], 2);
    }

    #[tokio::test]
    async fn test_emit_without_receiver_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.emit(SessionEvent::ReportReady { outcome: "complete".to_string() });
    }

    #[tokio::test]
    async fn test_session_id_override_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).with_session_id("resumed-session");
        assert_eq!(ctx.session_id, "resumed-session");
        assert_eq!(ctx.memory.lock().await.session_id(), "resumed-session");
    }
}
