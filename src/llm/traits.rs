//! 提案接口抽象
//!
//! 所有后端实现 ProposalClient：propose(context, capabilities) 返回子任务提案、
//! 能力调用或最终回答。这是调度器中唯一的非确定性来源。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 能力摘要：提供给提案接口，约束其只能引用已注册的能力名
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySummary {
    pub name: String,
    pub domain: String,
    pub description: String,
}

/// 单个子任务提案（分解结果的线格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskProposal {
    pub id: String,
    pub description: String,
    /// 依赖的子任务 id 集合
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 所需能力名集合
    #[serde(default)]
    pub requires: Vec<String>,
    /// 可选成功判据（如 "value >= 0.85"）
    #[serde(default)]
    pub criteria: Option<String>,
    /// 尽力而为：上游失败时不被跳过，带降级输入标记继续
    #[serde(default)]
    pub best_effort: bool,
    /// 委派给隔离子智能体执行
    #[serde(default)]
    pub delegate: bool,
}

/// 提案接口的三种返回（子任务集 / 能力调用 / 最终回答）
#[derive(Debug, Clone)]
pub enum Proposal {
    Subtasks(Vec<SubtaskProposal>),
    CapabilityCall {
        name: String,
        args: serde_json::Value,
    },
    FinalAnswer(String),
}

/// 提案接口 trait：核心在分解、反思与校验评估时重复调用
#[async_trait]
pub trait ProposalClient: Send + Sync {
    async fn propose(
        &self,
        context: &str,
        capabilities: &[CapabilitySummary],
    ) -> Result<Proposal, String>;
}
