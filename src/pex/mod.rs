//! PEX：策略执行器
//!
//! 按 flow 的意图类别选出策略并执行，返回 (PexResult, keep_going)。
//! 执行前的两道检查：必填槽位缺失 -> specific 歧义；需要确认而本轮没有 confirm 动作 -> confirmation 歧义。
//! 两种情况都不运行策略，flow 留在栈上等下一轮用户补充。

pub mod policies;
pub mod policy;
pub mod result;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::FrozenConfig;
use crate::core::{AgentError, SessionState};
use crate::dialogue::{AmbiguityLevel, FlowCatalog, FlowSpec};
use crate::llm::LlmClient;
use crate::nlu::NluResult;
use crate::tools::ToolDispatch;

pub use policies::{bind_params, fill_slots, ConversePolicy, PlanPolicy, ToolPolicy};
pub use policy::{Policy, PolicyContext, PolicyRegistry, PolicyServices};
pub use result::{Interaction, PexResult, ToolCallRecord};

/// 用户确认 / 拒绝的界面动作名
pub const CONFIRM_ACTION: &str = "confirm";
pub const DENY_ACTION: &str = "deny";

pub struct PolicyExecutor {
    registry: PolicyRegistry,
    services: PolicyServices,
}

impl PolicyExecutor {
    pub fn new(
        catalog: Arc<FlowCatalog>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolDispatch>,
        config: FrozenConfig,
    ) -> Self {
        Self {
            registry: PolicyRegistry::with_defaults(),
            services: PolicyServices {
                catalog,
                llm,
                tools,
                config,
            },
        }
    }

    pub fn with_registry(mut self, registry: PolicyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn execute(
        &self,
        nlu: &NluResult,
        session: &mut SessionState,
    ) -> Result<(PexResult, bool), AgentError> {
        let spec = self
            .services
            .catalog
            .get(&nlu.flow_name)
            .ok_or_else(|| AgentError::UnknownFlow(nlu.flow_name.clone()))?;

        let slots = match session.stack.peek() {
            Some(top) if top.flow_name == spec.name && !top.status.is_terminal() => top.slots.clone(),
            _ => nlu.slots.clone(),
        };

        if let Some(held) = self.precheck(spec, &slots, session)? {
            session.dialogue.update_flags(Some(false), None, None);
            return Ok((held, false));
        }

        let policy = self
            .registry
            .get(spec.intent)
            .ok_or_else(|| AgentError::UnknownFlow(format!("no policy for intent '{}'", spec.intent)))?;
        tracing::debug!(flow = %spec.name, policy = policy.name(), "executing policy");

        let (mut result, keep_going) = {
            let mut ctx = PolicyContext::new(spec, nlu, slots, session, &self.services);
            let (mut result, keep_going) = policy.execute(&mut ctx).await?;
            result.tool_log = ctx.take_tool_log();
            (result, keep_going)
        };
        result.tool_log.iter().for_each(|r| {
            tracing::debug!(action = %r.action, ok = r.succeeded(), attempt = r.attempt, "tool log");
        });

        let has_issues = result.has_failures();
        session
            .dialogue
            .update_flags(Some(keep_going), Some(has_issues), None);
        tracing::info!(
            flow = %spec.name,
            keep_going,
            tool_calls = result.tool_log.len(),
            has_issues,
            "policy finished"
        );
        Ok((result, keep_going))
    }

    /// 槽位与确认检查；需要暂停时返回占位结果
    fn precheck(
        &self,
        spec: &FlowSpec,
        slots: &HashMap<String, Value>,
        session: &mut SessionState,
    ) -> Result<Option<PexResult>, AgentError> {
        let missing: Vec<&str> = spec
            .required_slots()
            .filter(|s| !slot_filled(slots.get(&s.name)))
            .map(|s| s.name.as_str())
            .collect();
        if !missing.is_empty() {
            tracing::info!(flow = %spec.name, ?missing, "required slots missing");
            let mut metadata = HashMap::new();
            metadata.insert("flow".to_string(), Value::from(spec.name.clone()));
            metadata.insert("missing".to_string(), json!(missing));
            session
                .ambiguity
                .declare(AmbiguityLevel::Specific, Some(metadata), None);
            let held = PexResult::default().with_interaction(Interaction::new(
                "slot_request",
                json!({ "flow": spec.name, "missing": missing }),
            ));
            return Ok(Some(held));
        }

        if !spec.requires_confirmation {
            return Ok(None);
        }
        if session.has_action(DENY_ACTION) {
            if matches!(session.stack.peek(), Some(top) if top.flow_name == spec.name && !top.status.is_terminal())
            {
                session.stack.mark_invalid()?;
            }
            let label = if spec.description.is_empty() { &spec.name } else { &spec.description };
            return Ok(Some(PexResult::new(format!("Okay, I won't go ahead with: {label}."))));
        }
        if !session.has_action(CONFIRM_ACTION) {
            let mut metadata = HashMap::new();
            metadata.insert("flow".to_string(), Value::from(spec.name.clone()));
            metadata.insert("description".to_string(), Value::from(spec.description.clone()));
            session
                .ambiguity
                .declare(AmbiguityLevel::Confirmation, Some(metadata), None);
            let held = PexResult::default()
                .with_actions([CONFIRM_ACTION, DENY_ACTION])
                .with_interaction(Interaction::new(
                    "confirm",
                    json!({ "flow": spec.name, "slots": slots }),
                ));
            return Ok(Some(held));
        }
        Ok(None)
    }
}

fn slot_filled(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::dialogue::catalog::test_catalog;
    use crate::dialogue::FlowStatus;
    use crate::llm::ScriptedLlmClient;
    use crate::tools::{EchoTool, Tool, ToolExecutor, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::Map;

    struct StaticTool(&'static str);

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "returns its params under a fixed key"
        }

        async fn execute(&self, params: Map<String, Value>) -> Result<Value, String> {
            Ok(json!({ "tool": self.0, "params": params }))
        }
    }

    struct Fixture {
        pex: PolicyExecutor,
        session: SessionState,
        llm: Arc<ScriptedLlmClient>,
        catalog: Arc<FlowCatalog>,
    }

    fn fixture(replies: &[&str]) -> Fixture {
        let config = test_config();
        let catalog = Arc::new(test_catalog());
        let llm = Arc::new(ScriptedLlmClient::new(replies.iter().copied()));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(StaticTool("search"));
        registry.register(StaticTool("chart"));
        let tools = Arc::new(ToolExecutor::new(registry, 5));
        let pex = PolicyExecutor::new(Arc::clone(&catalog), llm.clone(), tools, config.clone());
        Fixture {
            pex,
            session: SessionState::new(&config),
            llm,
            catalog,
        }
    }

    fn resolve(f: &mut Fixture, flow: &str, slots: &[(&str, Value)]) -> NluResult {
        let spec = f.catalog.get(flow).unwrap();
        let slots: HashMap<String, Value> = slots.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        f.session
            .stack
            .push(&spec.name, spec.dax.clone(), spec.intent, Some(slots.clone()), None)
            .unwrap();
        NluResult::from_spec(spec, 0.9, slots)
    }

    #[tokio::test]
    async fn test_converse_answers_with_model() {
        let mut f = fixture(&["  Hello there!  "]);
        f.session.context.add_turn(
            crate::memory::Speaker::User,
            "hi bot",
            crate::memory::TurnForm::Text,
            None,
        );
        let nlu = resolve(&mut f, "chat", &[]);
        let (result, keep_going) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert_eq!(result.message, "Hello there!");
        assert!(!keep_going);
        assert_eq!(f.session.stack.peek().unwrap().status, FlowStatus::Completed);
        let seen = f.llm.seen();
        assert!(seen[0][0].content.contains("Bee"));
        assert!(seen[0].iter().any(|m| m.content == "hi bot"));
    }

    #[tokio::test]
    async fn test_missing_required_slot_holds_flow() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "search", &[]);
        let (result, keep_going) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert!(!keep_going);
        assert!(result.tool_log.is_empty());
        assert_eq!(result.interaction.kind, "slot_request");
        assert_eq!(f.session.ambiguity.level(), Some(AmbiguityLevel::Specific));
        assert_eq!(f.session.stack.peek().unwrap().status, FlowStatus::Active);
    }

    #[tokio::test]
    async fn test_tool_sequence_binds_slots() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "search", &[("query", Value::from("rust"))]);
        let (result, keep_going) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert!(!keep_going);
        assert_eq!(result.tool_log.len(), 1);
        assert_eq!(result.tool_log[0].params["q"], "rust");
        assert!(result.message.contains("1 step(s) succeeded"));
        assert!(!f.session.dialogue.has_issues);
    }

    #[tokio::test]
    async fn test_visualize_sets_display_frame() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "plot", &[("column", Value::from("revenue"))]);
        f.pex.execute(&nlu, &mut f.session).await.unwrap();
        let frame = f.session.frame.get().unwrap();
        assert_eq!(frame.kind, "chart");
        assert_eq!(frame.source, "plot");
        assert_eq!(frame.data["params"]["column"], "revenue");
    }

    #[tokio::test]
    async fn test_failed_tool_is_logged_not_raised() {
        let mut f = fixture(&[]);
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        f.pex = PolicyExecutor::new(
            Arc::clone(&f.catalog),
            f.llm.clone(),
            Arc::new(ToolExecutor::new(registry, 5)),
            test_config(),
        );
        let nlu = resolve(&mut f, "search", &[("query", Value::from("rust"))]);
        let (result, _) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert!(result.has_failures());
        assert_eq!(result.tool_log[0].envelope.error_category.as_deref(), Some("unknown_tool"));
        assert!(f.session.dialogue.has_issues);
        assert_eq!(f.session.stack.peek().unwrap().status, FlowStatus::Invalid);
    }

    #[tokio::test]
    async fn test_plan_pushes_steps_in_order() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "outline", &[]);
        let (result, keep_going) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert!(keep_going);
        assert!(f.session.dialogue.has_plan);
        assert_eq!(result.interaction.kind, "plan");
        f.session.stack.pop_completed_and_invalid();
        let active = f.session.stack.get_active_flow().unwrap();
        assert_eq!(active.flow_name, "search");
        assert!(active.plan_id.is_some());
        assert_eq!(f.session.stack.depth(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_required_then_confirmed() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "drop_rows", &[]);
        let (result, _) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert_eq!(result.actions, vec!["confirm", "deny"]);
        assert_eq!(f.session.ambiguity.level(), Some(AmbiguityLevel::Confirmation));

        f.session.ambiguity.resolve();
        f.session.last_actions = vec!["confirm".to_string()];
        let (result, _) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert!(result.message.starts_with("Done"));
        assert!(!f.session.ambiguity.present());
        assert_eq!(f.session.stack.peek().unwrap().status, FlowStatus::Completed);
    }

    #[tokio::test]
    async fn test_deny_invalidates_flow() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "drop_rows", &[]);
        f.session.last_actions = vec!["Deny".to_string()];
        let (result, keep_going) = f.pex.execute(&nlu, &mut f.session).await.unwrap();
        assert!(!keep_going);
        assert!(result.message.contains("won't"));
        assert_eq!(f.session.stack.peek().unwrap().status, FlowStatus::Invalid);
    }

    #[tokio::test]
    async fn test_memory_actions_use_session_store() {
        let mut f = fixture(&[]);
        let nlu = resolve(&mut f, "chat", &[]);
        let spec = f.catalog.get("chat").unwrap();
        let services = f.pex.services.clone();
        let mut ctx = PolicyContext::new(spec, &nlu, HashMap::new(), &mut f.session, &services);
        let mut params = Map::new();
        params.insert("key".into(), Value::from("city"));
        params.insert("value".into(), Value::from("Paris"));
        assert!(ctx.dispatch("memory.write", params).await.is_success());

        let mut params = Map::new();
        params.insert("key".into(), Value::from("city"));
        let env = ctx.dispatch("memory.read", params).await;
        assert_eq!(env.result, Some(Value::from("Paris")));

        let env = ctx.dispatch("preference.get", Map::new()).await;
        assert_eq!(env.error_category.as_deref(), Some("invalid_params"));
        assert_eq!(ctx.tool_log().len(), 3);
    }
}
