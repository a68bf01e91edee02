//! 计划类型定义
//!
//! Goal 在会话开始时创建且只读；Subtask 归属其 Plan 独占，仅由调度器变更；
//! Plan 的依赖边子图必须无环（由校验器保证）。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type SubtaskId = String;

/// 会话目标：输入文本 + 可选结构化成功判据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub text: String,
    pub success_criteria: Option<String>,
}

impl Goal {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success_criteria: None,
        }
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }
}

/// 子任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskStatus {
    /// 等待依赖满足（或退避期）
    Pending,
    /// 依赖已满足，可派发
    Ready,
    /// 正在执行
    Running,
    /// 成功（若声明判据则已通过校验）
    Succeeded,
    /// 失败（致命故障或重试耗尽）
    Failed,
    /// 被跳过（上游失败、取消或会话超时）
    Skipped,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Succeeded | SubtaskStatus::Failed | SubtaskStatus::Skipped
        )
    }
}

/// 子任务执行结果（不透明载荷或错误）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubtaskResult {
    Output(Value),
    Error(String),
}

/// 计划中的子任务节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub description: String,
    /// 所需能力名集合
    pub requires: BTreeSet<String>,
    /// 依赖的子任务 id 集合
    pub depends_on: BTreeSet<SubtaskId>,
    pub status: SubtaskStatus,
    pub result: Option<SubtaskResult>,
    /// 可选成功判据；声明判据的子任务必须 verified 后才能 Succeeded
    pub criteria: Option<String>,
    pub verified: bool,
    pub retry_count: u32,
    /// 尽力而为：上游失败时不被跳过，带降级输入继续
    pub best_effort: bool,
    /// 委派给隔离子智能体执行
    pub delegate: bool,
    /// 上游失败后的降级输入标记
    pub degraded_input: bool,
    /// 跳过原因（依赖失败 / 取消 / 会话超时）
    pub skip_reason: Option<String>,
    /// 退避截止时刻，仅运行期有效，不随检查点持久化
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
}

impl Subtask {
    pub fn new(id: impl Into<SubtaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            requires: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            status: SubtaskStatus::Pending,
            result: None,
            criteria: None,
            verified: false,
            retry_count: 0,
            best_effort: false,
            delegate: false,
            degraded_input: false,
            skip_reason: None,
            next_attempt_at: None,
        }
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = Some(criteria.into());
        self
    }
}

/// 计划：以 id 为键的子任务有向图；每会话同时只有一个现行计划，
/// 被替换的版本作为 Episodic 事件留档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: Goal,
    pub subtasks: HashMap<SubtaskId, Subtask>,
    /// 重规划时递增
    pub version: u32,
}

impl Plan {
    pub fn new(goal: Goal, subtasks: Vec<Subtask>) -> Self {
        Self {
            goal,
            subtasks: subtasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            version: 1,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.get_mut(id)
    }

    /// 直接依赖 id 的子任务集合
    pub fn dependents_of(&self, id: &str) -> Vec<SubtaskId> {
        let mut out: Vec<SubtaskId> = self
            .subtasks
            .values()
            .filter(|t| t.depends_on.contains(id))
            .map(|t| t.id.clone())
            .collect();
        out.sort();
        out
    }

    /// 状态映射（键序稳定，便于比较与审计）
    pub fn status_map(&self) -> BTreeMap<SubtaskId, SubtaskStatus> {
        self.subtasks
            .iter()
            .map(|(k, v)| (k.clone(), v.status))
            .collect()
    }

    /// 计划中出现的不同能力需求总数
    pub fn distinct_requirements(&self) -> BTreeSet<String> {
        self.subtasks
            .values()
            .flat_map(|t| t.requires.iter().cloned())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.subtasks.values().all(|t| t.status.is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        self.subtasks
            .values()
            .all(|t| t.status == SubtaskStatus::Succeeded)
    }

    /// 处于指定状态的子任务 id（升序）
    pub fn ids_with_status(&self, status: SubtaskStatus) -> Vec<SubtaskId> {
        let mut out: Vec<SubtaskId> = self
            .subtasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect();
        out.sort();
        out
    }
}
