//! 工具调度信封
//!
//! PEX 通过 ToolDispatch 调用外部工具服务；所有结果（包括失败）都是 ToolEnvelope。
//! 错误信封上除 status 外的字段都可能缺失，调用方不得假定其存在。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// 错误类别（写入 error_category）
pub mod category {
    pub const UNKNOWN_TOOL: &str = "unknown_tool";
    pub const TIMEOUT: &str = "timeout";
    pub const EXECUTION: &str = "execution";
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const NOT_FOUND: &str = "not_found";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolEnvelope {
    pub fn success(result: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            result: Some(result),
            error_category: None,
            message: None,
            retryable: None,
            metadata: Map::new(),
        }
    }

    pub fn error(category: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: ToolStatus::Error,
            result: None,
            error_category: Some(category.to_string()),
            message: Some(message.into()),
            retryable: Some(retryable),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// 可重试标记缺失时按不可重试处理
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or(false)
    }
}

/// 外部工具调度回调
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn dispatch(&self, action: &str, params: Map<String, Value>) -> ToolEnvelope;
}

/// 不接任何工具服务的调度器：所有调用返回 unknown_tool
#[derive(Debug, Default)]
pub struct NoopDispatch;

#[async_trait]
impl ToolDispatch for NoopDispatch {
    async fn dispatch(&self, action: &str, _params: Map<String, Value>) -> ToolEnvelope {
        ToolEnvelope::error(category::UNKNOWN_TOOL, format!("Unknown tool: {action}"), false)
    }
}
