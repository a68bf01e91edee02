//! 记忆层：Working（按键覆盖）、Episodic（仅追加事件）、Semantic / Procedural（跨会话持久）

pub mod persistence;
pub mod store;

pub use persistence::{load_shared, save_shared};
pub use store::{MemoryKind, MemoryRecord, SessionMemory, SharedMemory};
