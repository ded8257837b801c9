//! 对话行为（dialogue act）编码
//!
//! 每个 flow 的 dax 码由 3 位十六进制数字组成，每一位对应一个原子对话行为。
//! 内部逻辑只操作解码后的 [`DialogueAct`] 列表，文本形式只用于日志与测试夹具。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::AgentError;

/// dax 码固定宽度
pub const DAX_WIDTH: usize = 3;

/// 原子对话行为，判别值即其十六进制数字
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogueAct {
    Chat = 0x0,
    Query = 0x1,
    Measure = 0x2,
    Plot = 0x3,
    Retrieve = 0x4,
    Update = 0x5,
    Insert = 0x6,
    Delete = 0x7,
    User = 0x8,
    Agent = 0x9,
    Confirm = 0xA,
    Deny = 0xB,
    Plan = 0xC,
    Table = 0xD,
    Row = 0xE,
    Column = 0xF,
}

impl DialogueAct {
    const ALL: [DialogueAct; 16] = [
        DialogueAct::Chat,
        DialogueAct::Query,
        DialogueAct::Measure,
        DialogueAct::Plot,
        DialogueAct::Retrieve,
        DialogueAct::Update,
        DialogueAct::Insert,
        DialogueAct::Delete,
        DialogueAct::User,
        DialogueAct::Agent,
        DialogueAct::Confirm,
        DialogueAct::Deny,
        DialogueAct::Plan,
        DialogueAct::Table,
        DialogueAct::Row,
        DialogueAct::Column,
    ];

    pub fn from_digit(digit: u8) -> Option<Self> {
        Self::ALL.get(digit as usize).copied()
    }

    pub fn digit(self) -> u8 {
        self as u8
    }
}

/// 解码后的 dax 码
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DaxCode {
    acts: [DialogueAct; DAX_WIDTH],
}

impl DaxCode {
    pub fn new(acts: [DialogueAct; DAX_WIDTH]) -> Self {
        Self { acts }
    }

    pub fn acts(&self) -> &[DialogueAct] {
        &self.acts
    }

    pub fn contains(&self, act: DialogueAct) -> bool {
        self.acts.contains(&act)
    }

    /// 默认闲聊 flow 的 dax 码（000）
    pub fn chat() -> Self {
        Self::new([DialogueAct::Chat; DAX_WIDTH])
    }
}

impl FromStr for DaxCode {
    type Err = AgentError;

    /// 接受 `01A` 或带花括号的 `{01A}`，大小写不敏感
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().trim_start_matches('{').trim_end_matches('}');
        if code.chars().count() != DAX_WIDTH {
            return Err(AgentError::CatalogError(format!(
                "dax code must be {DAX_WIDTH} hex digits, got '{s}'"
            )));
        }
        let mut acts = [DialogueAct::Chat; DAX_WIDTH];
        for (slot, ch) in acts.iter_mut().zip(code.chars()) {
            let digit = ch
                .to_digit(16)
                .ok_or_else(|| AgentError::CatalogError(format!("invalid dax digit '{ch}' in '{s}'")))?;
            // to_digit(16) 保证 0..=15
            *slot = DialogueAct::from_digit(digit as u8)
                .ok_or_else(|| AgentError::CatalogError(format!("invalid dax digit '{ch}'")))?;
        }
        Ok(Self { acts })
    }
}

impl fmt::Display for DaxCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for act in &self.acts {
            write!(f, "{:X}", act.digit())?;
        }
        Ok(())
    }
}

impl Serialize for DaxCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DaxCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
