//! 会话层：上下文、事件流与主循环（分类 - 装载 - 规划 - 执行 - 反思 - 汇总）

pub mod context;
pub mod events;
pub mod loop_;

pub use context::SessionContext;
pub use events::SessionEvent;
pub use loop_::{AgentLoop, SessionOutcome, SessionReport};
