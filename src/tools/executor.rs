//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时，实现 ToolDispatch：
//! 未注册 -> unknown_tool，超时 -> timeout（可重试），工具返回 Err -> execution；
//! 每次调用输出一行结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::tools::dispatch::category;
use crate::tools::{ToolDispatch, ToolEnvelope, ToolRegistry};

pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    async fn run(&self, action: &str, params: Map<String, Value>) -> (ToolEnvelope, &'static str) {
        let Some(tool) = self.registry.get(action) else {
            return (
                ToolEnvelope::error(category::UNKNOWN_TOOL, format!("Unknown tool: {action}"), false),
                "unknown",
            );
        };
        match timeout(self.timeout, tool.execute(params)).await {
            Ok(Ok(result)) => (ToolEnvelope::success(result), "ok"),
            Ok(Err(e)) => (ToolEnvelope::error(category::EXECUTION, e, false), "error"),
            Err(_) => (
                ToolEnvelope::error(
                    category::TIMEOUT,
                    format!("{action} timed out after {}ms", self.timeout.as_millis()),
                    true,
                ),
                "timeout",
            ),
        }
    }
}

#[async_trait]
impl ToolDispatch for ToolExecutor {
    async fn dispatch(&self, action: &str, params: Map<String, Value>) -> ToolEnvelope {
        let start = Instant::now();
        let preview = args_preview(&params);
        let (envelope, outcome) = self.run(action, params).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": action,
            "ok": envelope.is_success(),
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");
        envelope.with_metadata("duration_ms", Value::from(duration_ms))
    }
}

fn args_preview(params: &Map<String, Value>) -> String {
    let s = Value::Object(params.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
