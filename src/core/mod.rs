//! 核心层：错误与恢复、会话状态、会话监管、投票工作池

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod voter_pool;

pub use error::{AgentError, RecoveryAction};
pub use recovery::{RecoveryEngine, FALLBACK_MESSAGE};
pub use session_supervisor::SessionSupervisor;
pub use state::SessionState;
pub use voter_pool::VoterPool;
