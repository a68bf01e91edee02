//! 子智能体层：受限能力集下的隔离委派执行

pub mod manager;

pub use manager::{SubAgentHandle, SubAgentManager, SubAgentOutcome};
