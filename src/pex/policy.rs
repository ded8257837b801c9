//! 策略接口与按意图类别的调度表
//!
//! 每个意图类别对应一个 Policy 实例；调度表在启动时构建（`register` 可覆盖默认策略），之后只读共享。
//! 策略通过 PolicyContext 访问当前 flow、槽位、会话状态与工具调度；
//! memory.* / preference.* 在本地针对会话的 MemoryStore 处理，其余动作交给外部 ToolDispatch。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::FrozenConfig;
use crate::core::{AgentError, SessionState};
use crate::dialogue::{FlowCatalog, FlowSpec, Intent};
use crate::llm::LlmClient;
use crate::nlu::NluResult;
use crate::pex::policies::{ConversePolicy, PlanPolicy, ToolPolicy};
use crate::pex::{PexResult, ToolCallRecord};
use crate::tools::dispatch::category;
use crate::tools::{ToolDispatch, ToolEnvelope};

/// 策略：返回 (结果, keep_going)
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut PolicyContext<'_>) -> Result<(PexResult, bool), AgentError>;
}

/// 所有会话共享的只读依赖
#[derive(Clone)]
pub struct PolicyServices {
    pub catalog: Arc<FlowCatalog>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolDispatch>,
    pub config: FrozenConfig,
}

/// 一次策略执行的上下文
pub struct PolicyContext<'a> {
    pub flow: &'a FlowSpec,
    pub nlu: &'a NluResult,
    /// 生效槽位：栈上条目的槽位（已合并本轮解析结果）
    pub slots: HashMap<String, Value>,
    pub session: &'a mut SessionState,
    services: &'a PolicyServices,
    tool_log: Vec<ToolCallRecord>,
}

impl<'a> PolicyContext<'a> {
    pub fn new(
        flow: &'a FlowSpec,
        nlu: &'a NluResult,
        slots: HashMap<String, Value>,
        session: &'a mut SessionState,
        services: &'a PolicyServices,
    ) -> Self {
        Self {
            flow,
            nlu,
            slots,
            session,
            services,
            tool_log: Vec::new(),
        }
    }

    pub fn llm(&self) -> &'a dyn LlmClient {
        self.services.llm.as_ref()
    }

    pub fn catalog(&self) -> &'a FlowCatalog {
        &self.services.catalog
    }

    pub fn config(&self) -> &'a FrozenConfig {
        &self.services.config
    }

    /// 调用一个动作并记入工具日志；失败以错误信封返回，不会中断策略
    pub async fn dispatch(&mut self, action: &str, params: Map<String, Value>) -> ToolEnvelope {
        self.dispatch_attempt(action, params, 1).await
    }

    /// 可重试的错误最多重试到 max_attempts 次
    pub async fn dispatch_with_retry(
        &mut self,
        action: &str,
        params: Map<String, Value>,
        max_attempts: u32,
    ) -> ToolEnvelope {
        let mut attempt = 1;
        loop {
            let envelope = self.dispatch_attempt(action, params.clone(), attempt).await;
            if envelope.is_success() || !envelope.is_retryable() || attempt >= max_attempts {
                return envelope;
            }
            tracing::debug!(action, attempt, "retrying tool call");
            attempt += 1;
        }
    }

    async fn dispatch_attempt(&mut self, action: &str, params: Map<String, Value>, attempt: u32) -> ToolEnvelope {
        let envelope = match self.dispatch_local(action, &params) {
            Some(envelope) => envelope,
            None => {
                let services = self.services;
                services.tools.dispatch(action, params.clone()).await
            }
        };
        if !envelope.is_success() {
            tracing::warn!(
                action,
                category = envelope.error_category.as_deref().unwrap_or("unknown"),
                "tool call failed"
            );
        }
        self.tool_log.push(ToolCallRecord {
            action: action.to_string(),
            params,
            envelope: envelope.clone(),
            attempt,
        });
        envelope
    }

    /// 会话记忆相关动作；不是本地动作时返回 None
    fn dispatch_local(&mut self, action: &str, params: &Map<String, Value>) -> Option<ToolEnvelope> {
        let memory = &mut self.session.memory;
        let key = params.get("key").and_then(Value::as_str);
        let envelope = match action {
            "memory.write" => match (key, params.get("value")) {
                (Some(key), Some(value)) => {
                    let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                    let evicted = memory.write_snippet(key, text);
                    ToolEnvelope::success(serde_json::json!({ "key": key, "evicted": evicted }))
                }
                _ => missing_params(action, "key, value"),
            },
            "memory.read" => match key {
                Some(key) => match memory.read_snippet(key) {
                    Some(value) => ToolEnvelope::success(Value::from(value)),
                    None => ToolEnvelope::error(category::NOT_FOUND, format!("no snippet '{key}'"), false),
                },
                None => missing_params(action, "key"),
            },
            "preference.set" => match (key, params.get("value")) {
                (Some(key), Some(value)) => {
                    memory.set_preference(key, value.clone());
                    ToolEnvelope::success(serde_json::json!({ "key": key }))
                }
                _ => missing_params(action, "key, value"),
            },
            "preference.get" => match key {
                Some(key) => match memory.get_preference(key) {
                    Some(value) => ToolEnvelope::success(value.clone()),
                    None => ToolEnvelope::error(category::NOT_FOUND, format!("no preference '{key}'"), false),
                },
                None => missing_params(action, "key"),
            },
            _ => return None,
        };
        Some(envelope)
    }

    pub fn tool_log(&self) -> &[ToolCallRecord] {
        &self.tool_log
    }

    pub fn take_tool_log(&mut self) -> Vec<ToolCallRecord> {
        std::mem::take(&mut self.tool_log)
    }

    /// 标记当前 flow 完成；返回同一计划中是否还有待执行的步骤
    pub fn complete_flow(&mut self, result: Option<Value>) -> Result<bool, AgentError> {
        let plan_id = self.ensure_on_top()?;
        self.session.stack.mark_complete(result)?;
        Ok(match plan_id {
            Some(plan_id) => self
                .session
                .stack
                .entries()
                .iter()
                .any(|e| !e.status.is_terminal() && e.plan_id.as_deref() == Some(plan_id.as_str())),
            None => false,
        })
    }

    /// 标记当前 flow 无效（如用户拒绝确认）
    pub fn invalidate_flow(&mut self) -> Result<(), AgentError> {
        self.ensure_on_top()?;
        self.session.stack.mark_invalid()
    }

    fn ensure_on_top(&self) -> Result<Option<String>, AgentError> {
        match self.session.stack.peek() {
            Some(top) if top.flow_name == self.flow.name && !top.status.is_terminal() => {
                Ok(top.plan_id.clone())
            }
            Some(top) => Err(AgentError::IllegalTransition(format!(
                "flow '{}' is not the live stack top ('{}' is)",
                self.flow.name, top.flow_name
            ))),
            None => Err(AgentError::IllegalTransition(format!(
                "flow '{}' is not on the stack",
                self.flow.name
            ))),
        }
    }

    /// 生效槽位的单行摘要
    pub fn slot_summary(&self) -> String {
        let mut pairs: Vec<String> = self
            .slots
            .iter()
            .map(|(k, v)| match v.as_str() {
                Some(s) => format!("{k}={s}"),
                None => format!("{k}={v}"),
            })
            .collect();
        pairs.sort();
        pairs.join(", ")
    }
}

fn missing_params(action: &str, expected: &str) -> ToolEnvelope {
    ToolEnvelope::error(
        category::INVALID_PARAMS,
        format!("{action} requires params: {expected}"),
        false,
    )
}

/// 意图类别 -> 策略
#[derive(Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<Intent, Arc<dyn Policy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置策略表
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Intent::Converse, ConversePolicy);
        for intent in [
            Intent::Search,
            Intent::Analyze,
            Intent::Clean,
            Intent::Transform,
            Intent::Visualize,
        ] {
            registry.register(intent, ToolPolicy::foreground());
        }
        registry.register(Intent::Plan, PlanPolicy);
        registry.register(Intent::Internal, ToolPolicy::background());
        registry
    }

    /// 注册或覆盖某意图类别的策略
    pub fn register(&mut self, intent: Intent, policy: impl Policy + 'static) {
        self.policies.insert(intent, Arc::new(policy));
    }

    pub fn get(&self, intent: Intent) -> Option<Arc<dyn Policy>> {
        self.policies.get(&intent).cloned()
    }
}
