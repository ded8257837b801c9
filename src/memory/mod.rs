//! 记忆层：轮次上下文（含检查点）与会话草稿本 / 偏好

pub mod context;
pub mod store;

pub use context::{Checkpoint, ContextCoordinator, Message, Role, Speaker, Turn, TurnForm};
pub use store::MemoryStore;
