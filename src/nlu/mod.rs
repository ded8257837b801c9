//! NLU：把用户话语解析为 flow 决策
//!
//! 顺序（命中即止）：前置快捷规则 -> gold label 直查 -> 多投票者共识；
//! 最后统一用目录做校验（intent / dax 以目录为准，丢弃未声明的槽位）。
//! 解析后写入 DialogueState；置信度低于下限时登记 general 级歧义（仅提示，不阻止执行）。

pub mod consensus;
pub mod parse;
pub mod shortcuts;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::FrozenConfig;
use crate::core::{AgentError, SessionState, VoterPool};
use crate::dialogue::{AmbiguityLevel, DaxCode, FlowCatalog, FlowEntry, FlowSpec, Intent, Prediction};
use crate::llm::LlmClient;
use crate::memory::Message;

pub use consensus::{tally, Consensus, ConsensusParams};
pub use parse::{parse_vote, vote_schema_json, VoteCandidate};
pub use shortcuts::{match_shortcut, ShortcutHit};

/// gold label 在目录中找不到时的置信度
pub const GOLD_MISS_CONFIDENCE: f64 = 0.5;
/// 所有投票都失败时的置信度
pub const NO_VOTE_CONFIDENCE: f64 = 0.3;
/// 投票 prompt 中附带的历史轮数
const HISTORY_LOOKBACK: usize = 6;

/// NLU 结果：构造后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NluResult {
    pub intent: Intent,
    pub dax_code: DaxCode,
    pub flow_name: String,
    pub confidence: f64,
    pub slots: HashMap<String, Value>,
}

impl NluResult {
    pub fn new(
        intent: Intent,
        dax_code: DaxCode,
        flow_name: impl Into<String>,
        confidence: f64,
        slots: HashMap<String, Value>,
    ) -> Self {
        Self {
            intent,
            dax_code,
            flow_name: flow_name.into(),
            confidence,
            slots,
        }
    }

    pub fn from_spec(spec: &FlowSpec, confidence: f64, slots: HashMap<String, Value>) -> Self {
        Self::new(spec.intent, spec.dax.clone(), spec.name.clone(), confidence, slots)
    }
}

/// 一次解析的内部结果：NLU 结果 + 候选 + 是否出现同意图分票
struct Resolution {
    result: NluResult,
    predictions: Vec<Prediction>,
    split_within_intent: bool,
}

impl Resolution {
    fn plain(result: NluResult) -> Self {
        Self {
            result,
            predictions: Vec::new(),
            split_within_intent: false,
        }
    }
}

/// 解析器：多个会话共享（只读），会话状态通过参数传入
pub struct Nlu {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<FlowCatalog>,
    config: FrozenConfig,
    pool: VoterPool,
}

impl Nlu {
    pub fn new(llm: Arc<dyn LlmClient>, catalog: Arc<FlowCatalog>, config: FrozenConfig) -> Self {
        let pool = VoterPool::new(config.llm.voter_pool_size, config.llm.timeouts.request);
        Self {
            llm,
            catalog,
            config,
            pool,
        }
    }

    /// 解析用户话语并写入会话状态
    pub async fn understand(
        &self,
        text: &str,
        gold_label: Option<&str>,
        session: &mut SessionState,
    ) -> NluResult {
        let resolution = if let Some(hit) = match_shortcut(text) {
            tracing::debug!(rule = hit.rule, flow = hit.flow_name, "nlu shortcut hit");
            Resolution::plain(self.shortcut_result(&hit))
        } else if let Some(label) = gold_label {
            Resolution::plain(self.gold_result(label))
        } else {
            self.vote(text, session).await
        };

        let result = self.validate(resolution.result);
        session
            .dialogue
            .update(&result, resolution.predictions, true);
        tracing::info!(
            flow = %result.flow_name,
            dax = %result.dax_code,
            confidence = result.confidence,
            "nlu resolved"
        );

        let min = self.config.thresholds.nlu_confidence_min;
        if session.ambiguity.needs_clarification(result.confidence, min) {
            let mut metadata = HashMap::new();
            metadata.insert("top_prediction".to_string(), Value::from(result.flow_name.clone()));
            metadata.insert("confidence".to_string(), Value::from(result.confidence));
            session
                .ambiguity
                .declare(AmbiguityLevel::General, Some(metadata), None);
        } else if resolution.split_within_intent {
            let mut metadata = HashMap::new();
            metadata.insert("intent".to_string(), Value::from(result.intent.to_string()));
            let candidates: Vec<Value> = session
                .dialogue
                .top_predictions
                .iter()
                .map(|p| Value::from(p.flow_name.clone()))
                .collect();
            metadata.insert("candidates".to_string(), Value::Array(candidates));
            session
                .ambiguity
                .declare(AmbiguityLevel::Partial, Some(metadata), None);
        }
        result
    }

    /// 回合间的再解析：以栈上当前 Active 的 flow 为准（不调用模型）
    pub fn resolve_from_stack(
        &self,
        entry: &FlowEntry,
        confidence: f64,
        session: &mut SessionState,
    ) -> NluResult {
        let result = self.validate(NluResult::new(
            entry.intent,
            entry.dax_code.clone(),
            entry.flow_name.clone(),
            confidence,
            entry.slots.clone(),
        ));
        session.dialogue.update(&result, Vec::new(), false);
        tracing::debug!(flow = %result.flow_name, "re-resolved from flow stack");
        result
    }

    /// 目录校验：flow 必须存在（否则退回默认 flow），intent / dax 以目录为准，丢弃未声明槽位。
    /// 对已校验结果再次调用不改变任何字段。
    pub fn validate(&self, result: NluResult) -> NluResult {
        let spec = match self.catalog.get(&result.flow_name) {
            Some(spec) => spec,
            None => {
                tracing::warn!(flow = %result.flow_name, "resolved flow not in catalog, using default");
                self.catalog.default_flow()
            }
        };
        let slots = result
            .slots
            .into_iter()
            .filter(|(name, _)| spec.declares_slot(name))
            .collect();
        NluResult::from_spec(spec, result.confidence, slots)
    }

    fn shortcut_result(&self, hit: &ShortcutHit) -> NluResult {
        let spec = self
            .catalog
            .get(hit.flow_name)
            .unwrap_or_else(|| self.catalog.default_flow());
        NluResult::from_spec(spec, hit.confidence, HashMap::new())
    }

    /// gold label 可以是 flow 名或 dax 码
    fn gold_result(&self, label: &str) -> NluResult {
        match self
            .catalog
            .get(label)
            .or_else(|| self.catalog.get_by_dax(label))
        {
            Some(spec) => NluResult::from_spec(spec, 1.0, HashMap::new()),
            None => {
                tracing::warn!(label, "gold label not in catalog");
                NluResult::from_spec(self.catalog.default_flow(), GOLD_MISS_CONFIDENCE, HashMap::new())
            }
        }
    }

    fn vote_prompt(&self, text: &str, session: &SessionState) -> Vec<Message> {
        let persona = &self.config.persona;
        let system = format!(
            "You are the intent resolver for {name}, a {tone} assistant.\n\
             Pick exactly one flow from the catalog below for the user's latest utterance \
             and fill any slots you can from the conversation.\n\n\
             ## Flow catalog\n{catalog}\n\n\
             Reply with a single JSON object matching this schema and nothing else:\n{schema}\n\
             Example: {{\"flow_name\": \"chat\", \"confidence\": 0.9, \"slots\": {{}}}}",
            name = persona.name,
            tone = persona.tone,
            catalog = self.catalog.prompt_listing(),
            schema = vote_schema_json(),
        );
        let history = session.context.compile_history(HISTORY_LOOKBACK);
        let user = if history.is_empty() {
            format!("Latest utterance: {text}")
        } else {
            format!("Conversation so far:\n{history}\n\nLatest utterance: {text}")
        };
        vec![Message::system(system), Message::user(user)]
    }

    /// N 次相同 prompt 的并行投票；单个投票失败只丢弃该票
    async fn vote(&self, text: &str, session: &SessionState) -> Resolution {
        let messages = Arc::new(self.vote_prompt(text, session));
        let voters = self.config.llm.voters;
        let jobs: Vec<_> = (0..voters)
            .map(|_| {
                let llm = Arc::clone(&self.llm);
                let messages = Arc::clone(&messages);
                async move {
                    let raw = llm.complete(&messages).await.map_err(AgentError::LlmError)?;
                    parse_vote(&raw).ok_or_else(|| AgentError::JsonParseError(raw))
                }
            })
            .collect();

        let mut votes = Vec::with_capacity(voters);
        for (idx, outcome) in self.pool.gather(jobs).await.into_iter().enumerate() {
            match outcome {
                Ok(vote) if self.catalog.contains(&vote.flow_name) => {
                    tracing::debug!(voter = idx, flow = %vote.flow_name, confidence = vote.confidence, "vote");
                    votes.push(vote);
                }
                Ok(vote) => {
                    tracing::debug!(voter = idx, flow = %vote.flow_name, "vote for unknown flow discarded");
                }
                Err(e) => tracing::warn!(voter = idx, error = %e, "voter failed"),
            }
        }

        let params = ConsensusParams {
            agreement_bonus: self.config.thresholds.agreement_bonus,
            disagreement_penalty: self.config.thresholds.disagreement_penalty,
        };
        let Some(consensus) = tally(&votes, params) else {
            tracing::warn!(voters, "no usable votes, falling back to default flow");
            return Resolution::plain(NluResult::from_spec(
                self.catalog.default_flow(),
                NO_VOTE_CONFIDENCE,
                HashMap::new(),
            ));
        };

        let split_within_intent = consensus.total_votes >= 2
            && !consensus.has_strict_majority()
            && self.votes_share_intent(&votes);
        let result = match self.catalog.get(&consensus.flow_name) {
            Some(spec) => NluResult::from_spec(spec, consensus.confidence, consensus.slots),
            None => NluResult::from_spec(self.catalog.default_flow(), NO_VOTE_CONFIDENCE, HashMap::new()),
        };
        Resolution {
            result,
            predictions: consensus.predictions,
            split_within_intent,
        }
    }

    fn votes_share_intent(&self, votes: &[VoteCandidate]) -> bool {
        let mut intents = votes
            .iter()
            .filter_map(|v| self.catalog.get(&v.flow_name).map(|s| s.intent));
        match intents.next() {
            Some(first) => intents.all(|i| i == first),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::dialogue::catalog::test_catalog;
    use crate::llm::ScriptedLlmClient;

    fn nlu_with(llm: Arc<ScriptedLlmClient>) -> (Nlu, SessionState) {
        let config = test_config();
        let session = SessionState::new(&config);
        (Nlu::new(llm, Arc::new(test_catalog()), config), session)
    }

    #[tokio::test]
    async fn test_empty_text_skips_model() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (nlu, mut session) = nlu_with(Arc::clone(&llm));
        let result = nlu.understand("", None, &mut session).await;
        assert_eq!(result.intent, Intent::Converse);
        assert_eq!(result.flow_name, "chat");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(llm.calls(), 0);
        assert!(!session.ambiguity.present());
    }

    #[tokio::test]
    async fn test_gold_label_lookup_and_miss() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (nlu, mut session) = nlu_with(Arc::clone(&llm));
        let hit = nlu.understand("draw it", Some("{023}"), &mut session).await;
        assert_eq!(hit.flow_name, "plot");
        assert_eq!(hit.confidence, 1.0);
        let miss = nlu.understand("draw it", Some("nonexistent"), &mut session).await;
        assert_eq!(miss.flow_name, "chat");
        assert_eq!(miss.confidence, GOLD_MISS_CONFIDENCE);
        assert_eq!(llm.calls(), 0);
        // 0.5 < 0.6 下限，登记 general 歧义
        assert_eq!(session.ambiguity.level(), Some(AmbiguityLevel::General));
    }

    #[tokio::test]
    async fn test_unanimous_votes_boost_and_validate() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"flow_name": "search", "confidence": 0.7, "slots": {"query": "cheap"}}"#,
            r#"```json
{"flow_name": "search", "confidence": 0.9, "slots": {"query": "rust books", "bogus": 1}}
```"#,
        ]));
        let (nlu, mut session) = nlu_with(Arc::clone(&llm));
        let result = nlu.understand("find rust books", None, &mut session).await;
        assert_eq!(llm.calls(), 2);
        assert_eq!(result.flow_name, "search");
        assert_eq!(result.intent, Intent::Search);
        assert_eq!(result.dax_code.to_string(), "014");
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.slots.len(), 1);
        assert_eq!(result.slots["query"], "rust books");
        assert_eq!(session.dialogue.flow_name, "search");
        assert!(!session.ambiguity.present());
    }

    #[tokio::test]
    async fn test_all_voters_fail_falls_back_to_chat() {
        let llm = Arc::new(ScriptedLlmClient::with_results([
            Err("timeout".to_string()),
            Ok("not json at all".to_string()),
        ]));
        let (nlu, mut session) = nlu_with(llm);
        let result = nlu.understand("qwerty uiop", None, &mut session).await;
        assert_eq!(result.flow_name, "chat");
        assert_eq!(result.confidence, NO_VOTE_CONFIDENCE);
        assert!(session.ambiguity.present());
    }

    #[tokio::test]
    async fn test_unknown_flow_vote_discarded() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"flow_name": "teleport", "confidence": 0.99}"#,
            r#"{"flow_name": "plot", "confidence": 0.8}"#,
        ]));
        let (nlu, mut session) = nlu_with(llm);
        let result = nlu.understand("chart the revenue", None, &mut session).await;
        assert_eq!(result.flow_name, "plot");
        // 只剩一票，不加成
        assert!((result.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_split_within_intent_declares_partial() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"flow_name": "search", "confidence": 0.9}"#,
            r#"{"flow_name": "lookup", "confidence": 0.8}"#,
        ]));
        let (nlu, mut session) = nlu_with(llm);
        let result = nlu.understand("look up order 42", None, &mut session).await;
        // 平票取先出现者，置信度取胜出组平均值
        assert_eq!(result.flow_name, "search");
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(session.ambiguity.level(), Some(AmbiguityLevel::Partial));
        assert_eq!(session.dialogue.top_predictions.len(), 2);
    }

    #[tokio::test]
    async fn test_majority_across_five_voters_is_not_partial() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"flow_name": "search", "confidence": 0.9}"#,
            r#"{"flow_name": "lookup", "confidence": 0.8}"#,
            r#"{"flow_name": "lookup", "confidence": 0.9}"#,
            r#"{"flow_name": "search", "confidence": 0.95}"#,
            r#"{"flow_name": "search", "confidence": 0.9}"#,
        ]));
        let raw = crate::config::TEST_CONFIG.replace("[session]", "[llm]\nvoters = 5\n\n[session]");
        let config = crate::config::config_from_toml(&raw).unwrap();
        let mut session = SessionState::new(&config);
        let nlu = Nlu::new(llm, Arc::new(test_catalog()), config);
        let result = nlu.understand("look up order 42", None, &mut session).await;
        assert_eq!(result.flow_name, "search");
        assert!(!session.ambiguity.present());
    }

    #[test]
    fn test_validate_is_idempotent() {
        let llm = Arc::new(ScriptedLlmClient::new(Vec::<String>::new()));
        let (nlu, _) = nlu_with(llm);
        let mut slots = HashMap::new();
        slots.insert("query".to_string(), Value::from("x"));
        slots.insert("undeclared".to_string(), Value::from("y"));
        let raw = NluResult::new(Intent::Plan, DaxCode::chat(), "search", 0.7, slots);
        let once = nlu.validate(raw);
        let twice = nlu.validate(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.intent, Intent::Search);
        assert!(!once.slots.contains_key("undeclared"));
    }
}
