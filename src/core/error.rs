//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 Fallback / Abort。
//! 单个投票、单次工具调用、单次润色的失败在本地降级，不会走到这里。

use thiserror::Error;

/// 一轮对话处理中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// Flow 栈已满（仅对本轮致命，会话仍可用）
    #[error("Flow stack overflow: depth limit {depth} reached")]
    StackOverflow { depth: usize },

    /// 非法的生命周期转换（如对非栈顶 flow 标记完成）
    #[error("Illegal flow transition: {0}")]
    IllegalTransition(String),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    /// 自检闸门拒绝了 NLU 结果
    #[error("Self-check rejected resolution: {0}")]
    SelfCheckRejected(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// 传输层断开，本轮被放弃
    #[error("Turn cancelled")]
    Cancelled,
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 以固定文案回复用户，本轮结束，会话保留
    Fallback(String),
    /// 放弃本轮（会话应被清理）
    Abort,
}
