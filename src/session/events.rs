//! 会话事件流
//!
//! 会话生命周期的结构化事件，供 CLI 实时展示与测试断言。
//! 发送端可选：未接流时事件被静默丢弃。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 会话事件（tag 序列化，便于 JSONL 输出）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 目标完成领域分类
    Classified { tags: Vec<String> },
    /// 领域包装载完毕
    CapabilitiesLoaded { tags: Vec<String>, active: usize },
    /// 计划通过校验
    PlanReady { version: u32, subtasks: usize },
    /// 计划被校验器拒绝，进入重规划
    ValidationFailed { attempt: u32, reason: String },
    /// 子任务开始执行
    SubtaskStarted { id: String },
    /// 子任务到达终态
    SubtaskFinished { id: String, status: String },
    /// 瞬时故障后安排重试
    RetryScheduled { id: String, retry: u32, delay_ms: u64 },
    /// 判据校验未通过
    VerificationRejected { id: String, reason: String },
    /// 检查点落盘
    CheckpointWritten { sequence: u64 },
    /// 反思后重规划
    Replan { version: u32, regenerated: usize },
    /// 委派子智能体
    SubAgentSpawned { subtask: String },
    /// 最终报告就绪
    ReportReady { outcome: String },
    /// 会话级错误
    Error { message: String },
    /// 能力调用结果摘要（降噪：只带载荷预览）
    CapabilityResult { subtask: String, output: Value },
}
