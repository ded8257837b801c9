//! Agent：单会话的轮次控制器
//!
//! handle_turn 顺序：记录用户轮 -> 清除旧歧义 -> NLU -> 自检闸门 -> 放入 flow 栈 ->
//! 有界回合循环（PEX 与基于栈顶的再解析交替）-> RES -> 摘要检查点 -> 清空展示帧。
//! 任何错误都经 RecoveryEngine 转为回复信封，handle_turn 本身不返回错误。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use crate::config::FrozenConfig;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, SessionState, SessionSupervisor};
use crate::dialogue::FlowCatalog;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{Speaker, TurnForm};
use crate::nlu::{Nlu, NluResult};
use crate::pex::{PolicyExecutor, PolicyRegistry};
use crate::res::{ResponseAssembler, TurnResponse};
use crate::tools::{EchoTool, ToolDispatch, ToolExecutor, ToolRegistry};

/// 歧义次数达到升级阈值时附加的动作
pub const HANDOFF_ACTION: &str = "handoff";

/// 纯动作轮延续栈顶 flow 时的置信度
const ACTION_CONFIDENCE: f64 = 1.0;

/// 传输层的单条请求
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub last_action: Vec<String>,
    #[serde(default)]
    pub gold_label: Option<String>,
}

/// 所有会话共享的组件（只读）
pub struct AgentComponents {
    pub config: FrozenConfig,
    pub catalog: Arc<FlowCatalog>,
    pub nlu: Nlu,
    pub pex: PolicyExecutor,
    pub res: ResponseAssembler,
    pub recovery: RecoveryEngine,
}

impl AgentComponents {
    pub fn new(
        config: FrozenConfig,
        catalog: Arc<FlowCatalog>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolDispatch>,
    ) -> Self {
        Self {
            nlu: Nlu::new(Arc::clone(&llm), Arc::clone(&catalog), config.clone()),
            pex: PolicyExecutor::new(Arc::clone(&catalog), Arc::clone(&llm), tools, config.clone()),
            res: ResponseAssembler::new(llm, Arc::clone(&catalog), config.clone()),
            recovery: RecoveryEngine::new(),
            catalog,
            config,
        }
    }

    /// 按配置构建：读取 flow 目录，选择 LLM 后端，注册内置工具
    pub fn from_config(config: FrozenConfig) -> Result<Self, AgentError> {
        let catalog = Arc::new(FlowCatalog::load(&config.catalog.path)?);
        let llm = create_llm_from_config(&config);
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let tools = Arc::new(ToolExecutor::new(registry, config.tools.tool_timeout_secs));
        tracing::info!(flows = catalog.flows().len(), "agent components ready");
        Ok(Self::new(config, catalog, llm, tools))
    }

    /// 覆盖默认策略表
    pub fn with_policies(mut self, registry: PolicyRegistry) -> Self {
        self.pex = self.pex.with_registry(registry);
        self
    }
}

pub struct Agent {
    session_id: String,
    components: Arc<AgentComponents>,
    state: SessionState,
    supervisor: SessionSupervisor,
    last_active: Instant,
}

impl Agent {
    pub fn new(session_id: impl Into<String>, components: Arc<AgentComponents>) -> Self {
        let state = SessionState::new(&components.config);
        Self {
            session_id: session_id.into(),
            components,
            state,
            supervisor: SessionSupervisor::new(),
            last_active: Instant::now(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// 原地重置会话状态（偏好保留）
    pub fn reset(&mut self) {
        tracing::info!(session = %self.session_id, "session reset");
        self.state.reset();
        self.last_active = Instant::now();
    }

    pub async fn handle_request(&mut self, request: TurnRequest) -> TurnResponse {
        self.handle_turn(&request.text, request.last_action, request.gold_label.as_deref())
            .await
    }

    /// 处理一轮用户输入；总是返回一个完整的回复信封
    pub async fn handle_turn(
        &mut self,
        text: &str,
        actions: Vec<String>,
        gold_label: Option<&str>,
    ) -> TurnResponse {
        self.last_active = Instant::now();
        let cancel = self.supervisor.child_token();
        // 本轮失败时恢复，出错的轮次不留下半途入栈的 flow
        let stack_before = self.state.stack.clone();
        let outcome = if cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                outcome = self.run_turn(text, actions, gold_label) => outcome,
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                self.state.stack = stack_before;
                match self.components.recovery.handle(&err) {
                    RecoveryAction::Fallback(message) => {
                        tracing::warn!(session = %self.session_id, error = %err, "turn aborted");
                        TurnResponse::text(message)
                    }
                    RecoveryAction::Abort => {
                        tracing::info!(session = %self.session_id, "turn cancelled");
                        self.state.frame.clear();
                        return TurnResponse::cancelled();
                    }
                }
            }
        };

        self.state.frame.clear();
        if !response.message.is_empty() {
            self.state
                .context
                .add_turn(Speaker::Agent, response.message.clone(), TurnForm::Text, None);
        }
        response
    }

    async fn run_turn(
        &mut self,
        text: &str,
        actions: Vec<String>,
        gold_label: Option<&str>,
    ) -> Result<TurnResponse, AgentError> {
        let components = Arc::clone(&self.components);
        let config = &components.config;
        let state = &mut self.state;

        let action_only = text.trim().is_empty() && !actions.is_empty();
        let form = if action_only {
            TurnForm::Action
        } else {
            TurnForm::Text
        };
        let turn_id = state.context.add_turn(Speaker::User, text, form, None);
        state.last_actions = actions;
        state.ambiguity.resolve();
        state.dialogue.update_flags(Some(false), Some(false), Some(false));

        // 纯动作轮（如确认按钮）延续栈上的 Active flow，不重新分类
        let pending = state.stack.get_active_flow().cloned();
        let mut nlu = match pending {
            Some(active) if action_only => {
                components.nlu.resolve_from_stack(&active, ACTION_CONFIDENCE, state)
            }
            _ => components.nlu.understand(text, gold_label, state).await,
        };
        self_check(&nlu, config.thresholds.self_check_floor)?;
        place_on_stack(state, &nlu, &turn_id)?;

        let max_rounds = config.session.max_rounds;
        let mut rounds = 0;
        let mut finished = Vec::new();
        let last = loop {
            let (result, keep_going) = components.pex.execute(&nlu, state).await?;
            rounds += 1;
            if !keep_going {
                break result;
            }
            if rounds >= max_rounds {
                tracing::warn!(rounds, flow = %nlu.flow_name, "round cap reached, using last result");
                break result;
            }
            finished.extend(state.stack.pop_completed_and_invalid());
            let Some(active) = state.stack.get_active_flow().cloned() else {
                break result;
            };
            nlu = components.nlu.resolve_from_stack(&active, nlu.confidence, state);
        };
        tracing::info!(
            session = %self.session_id,
            rounds,
            flow = %nlu.flow_name,
            depth = state.stack.depth(),
            "turn executed"
        );

        let mut response = components.res.respond(&last, finished, state).await;

        if state.ambiguity.present() && state.ambiguity.should_escalate() {
            tracing::warn!(session = %self.session_id, "repeated ambiguity, offering handoff");
            if !response.actions.iter().any(|a| a == HANDOFF_ACTION) {
                response.actions.push(HANDOFF_ACTION.to_string());
            }
        }

        let summarization = &config.memory.summarization;
        let turn_count = state.dialogue.turn_count;
        if turn_count > 0 && turn_count % summarization.trigger_turn_count == 0 {
            let mut metadata = HashMap::new();
            metadata.insert("turn_count".to_string(), Value::from(turn_count));
            metadata.insert(
                "history".to_string(),
                Value::from(state.context.compile_history(summarization.lookback)),
            );
            state.context.store_checkpoint("summary", metadata);
        }
        Ok(response)
    }
}

/// 自检闸门：置信度低于硬下限或没有 flow 名时拒绝
fn self_check(nlu: &NluResult, floor: f64) -> Result<(), AgentError> {
    if nlu.flow_name.trim().is_empty() {
        return Err(AgentError::SelfCheckRejected("no flow resolved".to_string()));
    }
    if nlu.confidence < floor {
        return Err(AgentError::SelfCheckRejected(format!(
            "confidence {:.2} below floor {:.2}",
            nlu.confidence, floor
        )));
    }
    Ok(())
}

/// 栈上已有同名且未结束的 flow 时把它提到栈顶并合并槽位；
/// 否则先作废仍在等待用户的旧栈顶，再压入新 flow
fn place_on_stack(state: &mut SessionState, nlu: &NluResult, turn_id: &str) -> Result<(), AgentError> {
    let existing = state
        .stack
        .find_by_name(&nlu.flow_name)
        .map(|e| e.flow_id.clone());
    match existing {
        Some(flow_id) => {
            state.stack.raise(&flow_id);
            if let Some(top) = state.stack.peek_mut() {
                top.slots
                    .extend(nlu.slots.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        None => {
            abandon_stale_top(state)?;
            state.stack.push(
                &nlu.flow_name,
                nlu.dax_code.clone(),
                nlu.intent,
                Some(nlu.slots.clone()),
                None,
            )?;
            state.stack.pop_completed_and_invalid();
        }
    }
    if let Some(top) = state.stack.peek_mut() {
        top.turn_ids.push(turn_id.to_string());
    }
    Ok(())
}

/// 轮次开始时仍在栈顶的 flow 都在等用户（缺槽位、待确认或计划的下一步）；用户转向别的 flow 即放弃它
fn abandon_stale_top(state: &mut SessionState) -> Result<(), AgentError> {
    let Some(top) = state.stack.peek() else {
        return Ok(());
    };
    if top.status.is_terminal() {
        return Ok(());
    }
    tracing::info!(flow = %top.flow_name, "held flow abandoned");
    state.stack.mark_invalid()?;
    state.stack.pop_completed_and_invalid();
    Ok(())
}
