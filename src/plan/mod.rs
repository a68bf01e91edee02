//! 计划层：目标 / 子任务数据模型、依赖图、目标分解与计划校验

pub mod decomposer;
pub mod graph;
pub mod types;
pub mod validator;

pub use decomposer::Decomposer;
pub use graph::PlanGraph;
pub use types::{Goal, Plan, Subtask, SubtaskId, SubtaskResult, SubtaskStatus};
pub use validator::validate;
