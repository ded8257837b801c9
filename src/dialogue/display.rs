//! 展示帧：单槽位，保存本轮随回复下发的结构化载荷；每轮结束无条件清空

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub show: bool,
    pub data: Value,
    pub source: String,
    pub display_name: String,
    pub panel: String,
}

impl Frame {
    pub fn new(kind: impl Into<String>, data: Value, source: impl Into<String>) -> Self {
        let source = source.into();
        Self {
            kind: kind.into(),
            show: true,
            data,
            display_name: source.clone(),
            source,
            panel: "main".to_string(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_panel(mut self, panel: impl Into<String>) -> Self {
        self.panel = panel.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DisplayFrame {
    slot: Option<Frame>,
}

impl DisplayFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, frame: Frame) {
        self.slot = Some(frame);
    }

    pub fn get(&self) -> Option<&Frame> {
        self.slot.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}
