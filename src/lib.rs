//! Dialogue Engine - 多轮对话编排核心
//!
//! 模块划分：
//! - **agent**: 单会话轮次控制器（NLU -> PEX 回合循环 -> RES）
//! - **config**: 应用配置加载与校验（TOML + 环境变量）
//! - **core**: 错误与恢复、会话状态、会话监管、投票工作池
//! - **dialogue**: dax 编码、flow 目录、flow 栈、对话状态、歧义追踪、展示帧
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **manager**: 会话注册表
//! - **memory**: 轮次上下文与检查点、草稿本与偏好
//! - **nlu**: 快捷规则、gold label、多投票者共识、目录校验
//! - **pex**: 按意图类别调度的策略执行器
//! - **res**: 澄清 / 回复模板、润色与回复信封
//! - **tools**: 工具注册表、执行器与调度信封

pub mod agent;
pub mod config;
pub mod core;
pub mod dialogue;
pub mod llm;
pub mod manager;
pub mod memory;
pub mod nlu;
pub mod observability;
pub mod pex;
pub mod res;
pub mod tools;

pub use agent::{Agent, AgentComponents, TurnRequest};
pub use manager::{CleanupSource, SessionManager};
pub use res::TurnResponse;
