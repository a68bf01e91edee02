//! 编排错误类型
//!
//! 规划期错误（分解 / 成环 / 无法解析的能力 / 预算超限）触发有界重规划；
//! 执行期错误区分瞬时（本地重试）与致命（立即失败，仅影响所在子树）。

use thiserror::Error;

/// 编排过程中可能出现的错误（规划、执行、持久化、会话预算）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Cyclic dependency among subtasks: {0:?}")]
    CyclicDependency(Vec<String>),

    #[error("Subtask '{subtask}' requires unresolved capability '{capability}'")]
    UnresolvedCapability { subtask: String, capability: String },

    #[error("Capability budget exceeded: {requested} requested, budget {budget}")]
    CapabilityBudgetExceeded { requested: usize, budget: usize },

    /// 不可重试的处理器故障（未知能力、参数非法等契约错误）
    #[error("Fatal fault in subtask '{subtask}': {reason}")]
    FatalSubtask { subtask: String, reason: String },

    /// 可重试的瞬时故障（超时、I/O）；重试耗尽后转为 Failed 状态而非向上抛出
    #[error("Transient fault in subtask '{subtask}': {reason}")]
    TransientSubtask { subtask: String, reason: String },

    #[error("Verification failed for subtask '{subtask}': {reason}")]
    VerificationFailed { subtask: String, reason: String },

    #[error("Sub-agent '{0}' exceeded its budget and was cancelled")]
    SubAgentTimeout(String),

    #[error("Planning failed after {attempts} attempts: {reason}")]
    PlanningFailed { attempts: u32, reason: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Session wall-clock budget exceeded")]
    SessionTimeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Memory store error: {0}")]
    Memory(String),

    #[error("Proposal interface error: {0}")]
    Proposal(String),
}

/// 能力处理器的调用故障，按可否重试分类（见外部接口契约）
#[derive(Error, Debug, Clone)]
pub enum CapabilityFault {
    /// 瞬时故障：超时、网络、I/O；按退避策略重试
    #[error("transient: {0}")]
    Transient(String),

    /// 契约故障：未知能力、参数非法；不重试，立即失败
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CapabilityFault {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityFault::Transient(_))
    }
}
