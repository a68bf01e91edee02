//! 调度层：依赖驱动的并发执行、重试退避、判据校验与终态传播

pub mod executor;
pub mod verify;

pub use executor::{backoff_delay, Scheduler, TerminalState};
pub use verify::{Verdict, Verifier};
