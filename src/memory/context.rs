//! 上下文协调器：只追加的轮次历史、有限回看视图与命名检查点
//!
//! 每轮记录 speaker / text / form；检查点保存完整有序快照 + 标签 + 任意元数据，供之后按标签取回。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 发给 LLM 的单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Speaker {
    User,
    Agent,
    System,
}

/// 轮次的输入形式：文字，或点击等界面动作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnForm {
    Text,
    Action,
}

#[derive(Clone, Debug, Serialize)]
pub struct Turn {
    pub turn_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub form: TurnForm,
    pub turn_type: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Checkpoint {
    pub label: String,
    pub turns: Vec<Turn>,
    pub metadata: HashMap<String, Value>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ContextCoordinator {
    turns: Vec<Turn>,
    checkpoints: Vec<Checkpoint>,
    next_id: u64,
}

impl ContextCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一轮，返回该协调器内唯一的 turn_id
    pub fn add_turn(
        &mut self,
        speaker: Speaker,
        text: impl Into<String>,
        form: TurnForm,
        turn_type: Option<String>,
    ) -> String {
        self.next_id += 1;
        let turn_id = format!("turn-{}", self.next_id);
        self.turns.push(Turn {
            turn_id: turn_id.clone(),
            speaker,
            text: text.into(),
            form,
            turn_type,
            at: Utc::now(),
        });
        turn_id
    }

    /// 最近 lookback 轮（按时间顺序）
    pub fn recent(&self, lookback: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(lookback);
        &self.turns[start..]
    }

    pub fn last_user_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.speaker == Speaker::User)
    }

    /// 供 prompt 使用的历史文本（"User: ... / Agent: ..."）
    pub fn compile_history(&self, lookback: usize) -> String {
        self.recent(lookback)
            .iter()
            .map(|t| {
                let who = match t.speaker {
                    Speaker::User => "User",
                    Speaker::Agent => "Agent",
                    Speaker::System => "System",
                };
                format!("{who}: {}", t.text)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 最近 lookback 轮转为 LLM 消息（System 轮不发送）
    pub fn to_llm_messages(&self, lookback: usize) -> Vec<Message> {
        self.recent(lookback)
            .iter()
            .filter_map(|t| match t.speaker {
                Speaker::User => Some(Message::user(t.text.clone())),
                Speaker::Agent => Some(Message::assistant(t.text.clone())),
                Speaker::System => None,
            })
            .collect()
    }

    pub fn store_checkpoint(&mut self, label: impl Into<String>, metadata: HashMap<String, Value>) {
        let label = label.into();
        tracing::debug!(%label, turns = self.turns.len(), "checkpoint stored");
        self.checkpoints.push(Checkpoint {
            label,
            turns: self.turns.clone(),
            metadata,
            at: Utc::now(),
        });
    }

    /// 按标签取最近的检查点
    pub fn get_checkpoint(&self, label: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().rev().find(|c| c.label == label)
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn reset(&mut self) {
        self.turns.clear();
        self.checkpoints.clear();
    }
}
