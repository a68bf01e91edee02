//! 核心层：编排错误分类与能力调用故障

pub mod error;

pub use error::{CapabilityFault, OrchestratorError};
