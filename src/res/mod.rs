//! RES：回复组装
//!
//! 1. 清理栈上的终态条目（一轮完成多个 flow 时记一个检查点）
//! 2. 有歧义声明时直接返回澄清文案
//! 3. 后台意图 / 内部回合不做自然语言生成，只下发结构化载荷
//! 4. 套用回复模板；文本足够长时交给模型润色，润色失败退回模板文本
//! 5. 组装回复信封；文本与展示载荷都为空时补一条通用回复

pub mod templates;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::FrozenConfig;
use crate::core::SessionState;
use crate::dialogue::{FlowCatalog, FlowEntry, Frame};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::pex::{Interaction, PexResult};

pub use templates::{clarification, render, DEFAULT_RESPONSE_TEMPLATE};

/// 文本与展示载荷都为空时的兜底回复
pub const PROCESSED_MESSAGE: &str = "Your request has been processed.";

/// 发给传输层的回复信封
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResponse {
    pub message: String,
    /// 润色前的模板文本
    pub raw_utterance: String,
    pub actions: Vec<String>,
    pub interaction: Interaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
}

impl TurnResponse {
    /// 只有文本的回复（兜底 / 取消）
    pub fn text(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            raw_utterance: message.clone(),
            message,
            actions: Vec::new(),
            interaction: Interaction::default(),
            frame: None,
        }
    }

    /// 本轮被取消（传输层已断开，调用方不会再读取文本）
    pub fn cancelled() -> Self {
        let mut response = Self::text(String::new());
        response.interaction = Interaction {
            kind: "cancelled".to_string(),
            show: false,
            data: Value::Null,
        };
        response
    }

    pub fn is_cancelled(&self) -> bool {
        self.interaction.kind == "cancelled"
    }
}

pub struct ResponseAssembler {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<FlowCatalog>,
    config: FrozenConfig,
}

impl ResponseAssembler {
    pub fn new(llm: Arc<dyn LlmClient>, catalog: Arc<FlowCatalog>, config: FrozenConfig) -> Self {
        Self { llm, catalog, config }
    }

    /// `finished` 为本轮回合循环中已弹出的终态条目，与这里弹出的合并统计
    pub async fn respond(
        &self,
        pex: &PexResult,
        mut finished: Vec<FlowEntry>,
        session: &mut SessionState,
    ) -> TurnResponse {
        finished.extend(session.stack.pop_completed_and_invalid());
        if finished.len() > 1 {
            record_multi_completion(&finished, session);
        }

        if let Some(declaration) = session.ambiguity.current() {
            let message = clarification(
                declaration.level,
                Some(&declaration.metadata),
                declaration.observation.as_deref(),
            );
            tracing::info!(level = %declaration.level, "responding with clarification");
            return TurnResponse {
                raw_utterance: message.clone(),
                message,
                actions: pex.actions.clone(),
                interaction: pex.interaction.clone(),
                frame: None,
            };
        }

        let frame = session.frame.get().cloned();
        let background = session.dialogue.intent.is_background() || pex.internal_round;
        if background {
            tracing::debug!(flow = %session.dialogue.flow_name, "internal round, skipping generation");
            return TurnResponse {
                message: String::new(),
                raw_utterance: String::new(),
                actions: pex.actions.clone(),
                interaction: pex.interaction.clone(),
                frame,
            };
        }

        let raw = self.fill_template(pex, session);
        let message = if raw.chars().count() > self.config.response.naturalize_min_chars {
            match self.naturalize(&raw, frame.as_ref()).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "naturalization failed, using templated text");
                    raw.clone()
                }
            }
        } else {
            raw.clone()
        };

        let mut response = TurnResponse {
            message,
            raw_utterance: raw,
            actions: pex.actions.clone(),
            interaction: pex.interaction.clone(),
            frame,
        };
        let continuation = session.dialogue.keep_going;
        if response.message.trim().is_empty() && response.frame.is_none() && !continuation {
            response.message = PROCESSED_MESSAGE.to_string();
        }
        response
    }

    fn fill_template(&self, pex: &PexResult, session: &SessionState) -> String {
        let flow_name = &session.dialogue.flow_name;
        let template = self
            .catalog
            .get(flow_name)
            .and_then(|f| f.response_template.as_deref())
            .unwrap_or(DEFAULT_RESPONSE_TEMPLATE);
        let mut slot_pairs: Vec<String> = session
            .dialogue
            .slots
            .iter()
            .map(|(k, v)| match v.as_str() {
                Some(s) => format!("{k}: {s}"),
                None => format!("{k}: {v}"),
            })
            .collect();
        slot_pairs.sort();

        let mut vars = HashMap::new();
        vars.insert("message".to_string(), Value::from(pex.message.clone()));
        vars.insert("slots".to_string(), Value::from(slot_pairs.join(", ")));
        vars.insert("flow".to_string(), Value::from(flow_name.clone()));
        let (text, _) = render(template, &vars);
        text.trim().to_string()
    }

    async fn naturalize(&self, text: &str, frame: Option<&Frame>) -> Result<String, String> {
        let persona = &self.config.persona;
        let mut system = format!(
            "You are {}, a {} assistant. Rewrite the draft reply below so it reads naturally. \
             Keep it {}. Keep every fact, number and name; do not add new information. \
             Reply with the rewritten text only.",
            persona.name, persona.tone, persona.response_style
        );
        if let Some(frame) = frame {
            system.push_str(&format!(
                "\nA {} titled \"{}\" is shown next to the reply; refer to it instead of repeating its data.",
                frame.kind, frame.display_name
            ));
        }
        let messages = [Message::system(system), Message::user(text)];
        let out = self.llm.complete(&messages).await?;
        let out = out.trim();
        if out.is_empty() {
            return Err("empty naturalization".to_string());
        }
        Ok(out.to_string())
    }
}

fn record_multi_completion(finished: &[FlowEntry], session: &mut SessionState) {
    let flows: Vec<Value> = finished.iter().map(|e| Value::from(e.flow_name.clone())).collect();
    let mut metadata = HashMap::new();
    metadata.insert("flows".to_string(), Value::Array(flows));
    session.context.store_checkpoint("multi_completion", metadata);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::dialogue::catalog::test_catalog;
    use crate::dialogue::AmbiguityLevel;
    use crate::llm::ScriptedLlmClient;
    use crate::nlu::NluResult;

    fn assembler(llm: Arc<ScriptedLlmClient>) -> (ResponseAssembler, SessionState) {
        let config = test_config();
        let session = SessionState::new(&config);
        (ResponseAssembler::new(llm, Arc::new(test_catalog()), config), session)
    }

    fn set_flow(session: &mut SessionState, flow: &str) {
        let catalog = test_catalog();
        let spec = catalog.get(flow).unwrap();
        session
            .dialogue
            .update(&NluResult::from_spec(spec, 0.9, HashMap::new()), Vec::new(), true);
    }

    #[tokio::test]
    async fn test_ambiguity_preempts_pex_message() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (res, mut session) = assembler(llm.clone());
        set_flow(&mut session, "chat");
        session
            .ambiguity
            .declare(AmbiguityLevel::General, None, Some("Which chart did you mean?".into()));
        let response = res.respond(&PexResult::new("Here is the answer"), Vec::new(), &mut session).await;
        assert_eq!(response.message, "Which chart did you mean?");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_short_text_returned_verbatim() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (res, mut session) = assembler(llm.clone());
        set_flow(&mut session, "chat");
        let response = res.respond(&PexResult::new("Sure."), Vec::new(), &mut session).await;
        assert_eq!(response.message, "Sure.");
        assert_eq!(response.raw_utterance, "Sure.");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_long_text_naturalized_and_failure_falls_back() {
        let long = "The search finished and returned forty two matching records from the archive table.";
        let llm = Arc::new(ScriptedLlmClient::new(["I found 42 matching records in the archive."]));
        let (res, mut session) = assembler(llm.clone());
        set_flow(&mut session, "chat");
        let response = res.respond(&PexResult::new(long), Vec::new(), &mut session).await;
        assert_eq!(response.message, "I found 42 matching records in the archive.");
        assert_eq!(response.raw_utterance, long);

        // 脚本耗尽 -> 模型报错 -> 使用模板文本
        let response = res.respond(&PexResult::new(long), Vec::new(), &mut session).await;
        assert_eq!(response.message, long);
    }

    #[tokio::test]
    async fn test_background_round_skips_generation() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (res, mut session) = assembler(llm);
        set_flow(&mut session, "sync");
        let response = res
            .respond(&PexResult::new("bookkeeping done").internal(), Vec::new(), &mut session)
            .await;
        assert!(response.message.is_empty());
    }

    #[tokio::test]
    async fn test_empty_reply_post_hook() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (res, mut session) = assembler(llm);
        set_flow(&mut session, "chat");
        let response = res.respond(&PexResult::default(), Vec::new(), &mut session).await;
        assert_eq!(response.message, PROCESSED_MESSAGE);
    }

    #[tokio::test]
    async fn test_frame_attached_and_multi_completion_checkpointed() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (res, mut session) = assembler(llm);
        set_flow(&mut session, "plot");
        let catalog = test_catalog();
        for name in ["search", "plot"] {
            let spec = catalog.get(name).unwrap();
            session
                .stack
                .push(&spec.name, spec.dax.clone(), spec.intent, None, None)
                .unwrap();
        }
        session.stack.mark_complete(None).unwrap();
        session.stack.pop_completed_and_invalid();
        session.stack.mark_complete(None).unwrap();
        let spec = catalog.get("chat").unwrap();
        session
            .stack
            .push(&spec.name, spec.dax.clone(), spec.intent, None, None)
            .unwrap();
        session.stack.mark_complete(None).unwrap();
        session
            .frame
            .set(Frame::new("chart", serde_json::json!({"x": [1, 2]}), "plot"));

        let response = res.respond(&PexResult::new("Chart ready."), Vec::new(), &mut session).await;
        assert!(session.stack.is_empty());
        assert!(session.context.get_checkpoint("multi_completion").is_some());
        assert_eq!(response.frame.unwrap().source, "plot");
    }

    #[tokio::test]
    async fn test_entries_finished_in_earlier_rounds_count_towards_checkpoint() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (res, mut session) = assembler(llm);
        set_flow(&mut session, "search");
        let catalog = test_catalog();
        for name in ["outline", "search"] {
            let spec = catalog.get(name).unwrap();
            session
                .stack
                .push(&spec.name, spec.dax.clone(), spec.intent, None, None)
                .unwrap();
        }
        session.stack.mark_complete(None).unwrap();
        let earlier = session.stack.pop_completed_and_invalid();
        session.stack.mark_complete(None).unwrap();

        res.respond(&PexResult::new("Done."), earlier, &mut session).await;
        let checkpoint = session.context.get_checkpoint("multi_completion").unwrap();
        assert_eq!(checkpoint.metadata["flows"], serde_json::json!(["search", "outline"]));
        assert!(session.stack.is_empty());
    }
}
