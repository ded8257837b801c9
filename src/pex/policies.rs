//! 内置策略
//!
//! - ConversePolicy：技能模板 + 槽位 + 草稿本拼 prompt，直接由模型作答
//! - ToolPolicy：按目录声明的固定工具序列依次调用，组装结构化结果（不做自由生成）
//! - PlanPolicy：把 edge flow 按逆序压栈，使第一步位于栈顶，并请求下一回合

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::AgentError;
use crate::dialogue::{Frame, Intent};
use crate::memory::Message;
use crate::pex::{Interaction, PexResult, Policy, PolicyContext};

/// 未配置 skill_template 时的默认技能说明
const DEFAULT_SKILL: &str = "Answer the user's latest message helpfully, using the conversation so far.";
/// Converse prompt 附带的历史轮数
const CONVERSE_LOOKBACK: usize = 10;
/// 可重试工具错误的最大尝试次数
const MAX_TOOL_ATTEMPTS: u32 = 2;

/// 用槽位值替换模板中的 `{slot}` 占位符；未填的槽位保持原样
pub fn fill_slots(template: &str, slots: &HashMap<String, Value>) -> String {
    let mut out = template.to_string();
    for (name, value) in slots {
        let text = match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        };
        out = out.replace(&format!("{{{name}}}"), &text);
    }
    out
}

/// 绑定工具参数：整值为 `{slot}` 时直接代入槽位的 JSON 值（未填则省略该参数），
/// 其余字符串做文本替换
pub fn bind_params(template: &Map<String, Value>, slots: &HashMap<String, Value>) -> Map<String, Value> {
    let mut params = Map::new();
    for (key, value) in template {
        match value {
            Value::String(s) => {
                let whole = s
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                    .filter(|name| !name.contains(['{', '}']));
                match whole {
                    Some(name) => {
                        if let Some(v) = slots.get(name) {
                            params.insert(key.clone(), v.clone());
                        }
                    }
                    None => {
                        params.insert(key.clone(), Value::String(fill_slots(s, slots)));
                    }
                }
            }
            other => {
                params.insert(key.clone(), other.clone());
            }
        }
    }
    params
}

/// 对话策略
pub struct ConversePolicy;

#[async_trait]
impl Policy for ConversePolicy {
    fn name(&self) -> &'static str {
        "converse"
    }

    async fn execute(&self, ctx: &mut PolicyContext<'_>) -> Result<(PexResult, bool), AgentError> {
        let persona = &ctx.config().persona;
        let skill = fill_slots(
            ctx.flow.skill_template.as_deref().unwrap_or(DEFAULT_SKILL),
            &ctx.slots,
        );
        let mut system = format!(
            "You are {}, a {} assistant. Keep your replies {}.\n\n{}",
            persona.name, persona.tone, persona.response_style, skill
        );
        let scratchpad = ctx.session.memory.scratchpad_section();
        if !scratchpad.is_empty() {
            system.push_str("\n\n");
            system.push_str(&scratchpad);
        }
        let mut messages = vec![Message::system(system)];
        messages.extend(ctx.session.context.to_llm_messages(CONVERSE_LOOKBACK));

        let text = ctx
            .llm()
            .complete(&messages)
            .await
            .map_err(AgentError::LlmError)?;
        let text = text.trim().to_string();
        let continues = ctx.complete_flow(Some(Value::from(text.clone())))?;
        Ok((PexResult::new(text), continues))
    }
}

/// 工具序列策略；background 为 true 时结果标记为内部回合
pub struct ToolPolicy {
    background: bool,
}

impl ToolPolicy {
    pub fn foreground() -> Self {
        Self { background: false }
    }

    pub fn background() -> Self {
        Self { background: true }
    }
}

#[async_trait]
impl Policy for ToolPolicy {
    fn name(&self) -> &'static str {
        if self.background {
            "background_tools"
        } else {
            "tools"
        }
    }

    async fn execute(&self, ctx: &mut PolicyContext<'_>) -> Result<(PexResult, bool), AgentError> {
        let flow = ctx.flow;
        let label = if flow.description.is_empty() {
            flow.name.as_str()
        } else {
            flow.description.as_str()
        };

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for step in &flow.tools {
            let params = bind_params(&step.params, &ctx.slots);
            let envelope = ctx
                .dispatch_with_retry(&step.action, params, MAX_TOOL_ATTEMPTS)
                .await;
            if envelope.is_success() {
                succeeded.push(json!({
                    "action": step.action,
                    "result": envelope.result.unwrap_or(Value::Null),
                }));
            } else {
                failures.push(format!(
                    "{}: {}",
                    step.action,
                    envelope.message.as_deref().unwrap_or("failed")
                ));
            }
        }

        let total = flow.tools.len();
        let data = json!({
            "flow": flow.name,
            "slots": ctx.slots,
            "results": succeeded,
            "failures": failures,
        });

        if total > 0 && succeeded.is_empty() {
            ctx.invalidate_flow()?;
            let message = format!("I couldn't complete {}: {}.", label, failures.join("; "));
            let result = PexResult::new(message)
                .with_data(data.clone())
                .with_interaction(Interaction::new("tool_error", data));
            return Ok((self.finish(result), false));
        }

        if flow.intent == Intent::Visualize {
            if let Some(last) = succeeded.last() {
                let frame = Frame::new("chart", last["result"].clone(), flow.name.clone())
                    .with_display_name(label);
                ctx.session.frame.set(frame);
            }
        }

        let message = if total == 0 {
            format!("Done: {label}.")
        } else if failures.is_empty() {
            format!("Finished {label}: {total} step(s) succeeded.")
        } else {
            format!(
                "Finished {label} with problems: {} of {total} step(s) succeeded ({}).",
                succeeded.len(),
                failures.join("; ")
            )
        };
        let continues = ctx.complete_flow(Some(data.clone()))?;
        let mut interaction = Interaction::new("tool_result", data.clone());
        interaction.show = !self.background;
        let result = PexResult::new(message)
            .with_data(data)
            .with_interaction(interaction);
        Ok((self.finish(result), continues))
    }
}

impl ToolPolicy {
    fn finish(&self, result: PexResult) -> PexResult {
        if self.background {
            result.internal()
        } else {
            result
        }
    }
}

/// 计划策略
pub struct PlanPolicy;

#[async_trait]
impl Policy for PlanPolicy {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn execute(&self, ctx: &mut PolicyContext<'_>) -> Result<(PexResult, bool), AgentError> {
        let flow = ctx.flow;
        if flow.edge_flows.is_empty() {
            let continues = ctx.complete_flow(None)?;
            return Ok((PexResult::new("There is nothing to plan for that yet."), continues));
        }

        let catalog = ctx.catalog();
        let steps = flow
            .edge_flows
            .iter()
            .map(|name| catalog.get(name).ok_or_else(|| AgentError::UnknownFlow(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        // 计划自身仍占一格，先整体检查容量，避免只压入一半
        let stack = &ctx.session.stack;
        if stack.depth() + steps.len() > stack.max_depth() {
            tracing::warn!(flow = %flow.name, steps = steps.len(), "plan does not fit on the flow stack");
            return Err(AgentError::StackOverflow {
                depth: stack.max_depth(),
            });
        }

        let plan_id = uuid::Uuid::new_v4().to_string();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        let data = json!({ "plan_id": plan_id, "steps": names });
        ctx.complete_flow(Some(data.clone()))?;

        for spec in steps.iter().rev() {
            let slots: HashMap<String, Value> = ctx
                .slots
                .iter()
                .filter(|(k, _)| spec.declares_slot(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            ctx.session.stack.push(
                &spec.name,
                spec.dax.clone(),
                spec.intent,
                Some(slots),
                Some(plan_id.clone()),
            )?;
        }
        ctx.session.dialogue.update_flags(Some(true), None, Some(true));
        tracing::info!(plan_id = %plan_id, steps = ?names, "plan pushed");

        let listing: Vec<String> = names
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{}. {}", i + 1, n))
            .collect();
        let result = PexResult::new(format!("Here's the plan: {}", listing.join(", ")))
            .with_data(data.clone())
            .with_interaction(Interaction::new("plan", data));
        Ok((result, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_fill_slots_leaves_unknown_placeholders() {
        let s = slots(&[("query", Value::from("rust"))]);
        assert_eq!(fill_slots("find {query} in {source}", &s), "find rust in {source}");
    }

    #[test]
    fn test_bind_params_whole_value_and_missing() {
        let template: Map<String, Value> = serde_json::from_str(
            r#"{"q": "{query}", "limit": "{limit}", "label": "top {query}", "fixed": 3}"#,
        )
        .unwrap();
        let s = slots(&[("query", Value::from("rust")), ("limit", Value::from(5))]);
        let params = bind_params(&template, &s);
        assert_eq!(params["q"], "rust");
        assert_eq!(params["limit"], 5);
        assert_eq!(params["label"], "top rust");
        assert_eq!(params["fixed"], 3);

        let params = bind_params(&template, &HashMap::new());
        assert!(!params.contains_key("q"));
    }
}
