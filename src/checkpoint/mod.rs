//! 检查点层：计划快照的 JSONL 持久化与恢复

pub mod store;

pub use store::{Checkpoint, CheckpointStore};
