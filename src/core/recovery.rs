//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 Agent 在本轮中止时组装兜底回复。

use crate::core::{AgentError, RecoveryAction};

/// 自检失败时的固定回复
pub const FALLBACK_MESSAGE: &str =
    "Sorry, I couldn't work out what you meant. Could you rephrase that?";

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::SelfCheckRejected(_) | AgentError::UnknownFlow(_) => {
                RecoveryAction::Fallback(FALLBACK_MESSAGE.to_string())
            }
            AgentError::StackOverflow { depth } => RecoveryAction::Fallback(format!(
                "I'm already juggling {depth} open tasks. Let's finish one of them before starting another."
            )),
            AgentError::LlmError(_) | AgentError::JsonParseError(_) => RecoveryAction::Fallback(
                "Sorry, I ran into a problem while thinking about that. Please try again.".to_string(),
            ),
            AgentError::ToolExecutionFailed(_) | AgentError::ToolTimeout(_) => {
                RecoveryAction::Fallback(
                    "Sorry, one of the tools I needed failed. Please try again shortly.".to_string(),
                )
            }
            AgentError::IllegalTransition(_)
            | AgentError::ConfigError(_)
            | AgentError::CatalogError(_) => RecoveryAction::Fallback(
                "Sorry, something went wrong on my side while handling that request.".to_string(),
            ),
            AgentError::Cancelled => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_self_check() {
        let engine = RecoveryEngine::new();
        let action = engine.handle(&AgentError::SelfCheckRejected("low confidence".into()));
        assert_eq!(action, RecoveryAction::Fallback(FALLBACK_MESSAGE.to_string()));
    }

    #[test]
    fn test_recovery_stack_overflow() {
        let engine = RecoveryEngine::new();
        match engine.handle(&AgentError::StackOverflow { depth: 8 }) {
            RecoveryAction::Fallback(msg) => assert!(msg.contains('8')),
            other => panic!("Expected Fallback, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&AgentError::Cancelled), RecoveryAction::Abort);
    }
}
