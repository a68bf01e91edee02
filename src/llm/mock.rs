//! Mock 提案客户端（用于测试与本地演示，无需 API）
//!
//! MockProposalClient 将目标回显为单个 echo 子任务，便于本地跑通完整会话；
//! ScriptedProposalClient 按脚本顺序返回预置提案，供测试精确控制非确定性边界。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CapabilitySummary, Proposal, ProposalClient, SubtaskProposal};

/// Mock 客户端：任何目标都分解为一个 echo 子任务
#[derive(Debug, Default)]
pub struct MockProposalClient;

impl MockProposalClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProposalClient for MockProposalClient {
    async fn propose(
        &self,
        context: &str,
        _capabilities: &[CapabilitySummary],
    ) -> Result<Proposal, String> {
        let goal = context.lines().next().unwrap_or("(no goal)").to_string();
        Ok(Proposal::Subtasks(vec![SubtaskProposal {
            id: "t1".to_string(),
            description: format!("Echo the goal: {}", goal),
            depends_on: vec![],
            requires: vec!["echo".to_string()],
            criteria: None,
            best_effort: false,
            delegate: false,
        }]))
    }
}

/// 脚本化客户端：按顺序弹出预置提案，脚本耗尽时报错
pub struct ScriptedProposalClient {
    script: Mutex<VecDeque<Proposal>>,
    /// 每次调用收到的 context，便于测试断言 prompt 内容
    pub seen_contexts: Mutex<Vec<String>>,
}

impl ScriptedProposalClient {
    pub fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            script: Mutex::new(proposals.into()),
            seen_contexts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProposalClient for ScriptedProposalClient {
    async fn propose(
        &self,
        context: &str,
        _capabilities: &[CapabilitySummary],
    ) -> Result<Proposal, String> {
        self.seen_contexts
            .lock()
            .expect("contexts lock poisoned")
            .push(context.to_string());
        self.script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .ok_or_else(|| "proposal script exhausted".to_string())
    }
}
