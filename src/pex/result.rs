//! PEX 结果类型（叶子模块，策略与调度表都只依赖它）

use serde::Serialize;
use serde_json::{Map, Value};

use crate::tools::ToolEnvelope;

/// 一次工具调用记录（成功或失败都会记录）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub action: String,
    pub params: Map<String, Value>,
    pub envelope: ToolEnvelope,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
}

impl ToolCallRecord {
    pub fn succeeded(&self) -> bool {
        self.envelope.is_success()
    }
}

/// 随回复下发的结构化交互块
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: String,
    pub show: bool,
    pub data: Value,
}

impl Interaction {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            show: true,
            data,
        }
    }
}

impl Default for Interaction {
    fn default() -> Self {
        Self {
            kind: "default".to_string(),
            show: false,
            data: Value::Null,
        }
    }
}

/// 策略执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PexResult {
    /// 策略给出的原始文本（RES 再套模板 / 润色）
    pub message: String,
    pub tool_log: Vec<ToolCallRecord>,
    /// 请求前端展示的动作按钮
    pub actions: Vec<String>,
    pub interaction: Interaction,
    /// 内部回合：RES 不做自然语言生成
    pub internal_round: bool,
    pub data: Value,
}

impl PexResult {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_interaction(mut self, interaction: Interaction) -> Self {
        self.interaction = interaction;
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal_round = true;
        self
    }

    pub fn failed_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.tool_log.iter().filter(|r| !r.succeeded())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_calls().next().is_some()
    }
}
