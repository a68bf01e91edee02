//! 提案接口层：LLM 边界的抽象与 Mock 实现
//!
//! 核心只依赖一个同步语义的「给定上下文与可用能力，提出下一步动作」操作；
//! 具体的 prompt 构造、流式输出与供应商选择均在外部实现。

pub mod mock;
pub mod traits;

pub use mock::{MockProposalClient, ScriptedProposalClient};
pub use traits::{CapabilitySummary, Proposal, ProposalClient, SubtaskProposal};
