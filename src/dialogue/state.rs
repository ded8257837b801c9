//! 对话状态：本轮解析出的意图 / flow / 置信度 / 槽位，以及会话级标志位
//!
//! 只由 NLU（`update`）与 PEX（`update_flags`）修改，仅在会话重置时清空。

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::dialogue::{DaxCode, Intent};
use crate::nlu::NluResult;

/// 候选预测（最多保留 3 个）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub flow_name: String,
    pub confidence: f64,
}

pub const MAX_TOP_PREDICTIONS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct DialogueState {
    pub intent: Intent,
    pub dax_code: DaxCode,
    pub flow_name: String,
    pub confidence: f64,
    pub slots: HashMap<String, Value>,
    pub turn_count: u32,
    pub top_predictions: Vec<Prediction>,
    pub keep_going: bool,
    pub has_issues: bool,
    pub has_plan: bool,
    /// 本轮 flow 是否由用户话语直接解析而来（而非从栈上派生）
    pub natural_birth: bool,
}

impl Default for DialogueState {
    fn default() -> Self {
        Self {
            intent: Intent::Converse,
            dax_code: DaxCode::chat(),
            flow_name: String::new(),
            confidence: 0.0,
            slots: HashMap::new(),
            turn_count: 0,
            top_predictions: Vec::new(),
            keep_going: false,
            has_issues: false,
            has_plan: false,
            natural_birth: true,
        }
    }
}

impl DialogueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// NLU 写入解析结果
    pub fn update(&mut self, result: &NluResult, predictions: Vec<Prediction>, natural_birth: bool) {
        self.intent = result.intent;
        self.dax_code = result.dax_code.clone();
        self.flow_name = result.flow_name.clone();
        self.confidence = result.confidence;
        self.slots = result.slots.clone();
        self.natural_birth = natural_birth;
        if natural_birth {
            self.turn_count += 1;
        }
        if !predictions.is_empty() {
            let mut predictions = predictions;
            predictions.truncate(MAX_TOP_PREDICTIONS);
            self.top_predictions = predictions;
        }
    }

    /// PEX 写入执行标志；None 表示保持原值
    pub fn update_flags(
        &mut self,
        keep_going: Option<bool>,
        has_issues: Option<bool>,
        has_plan: Option<bool>,
    ) {
        if let Some(v) = keep_going {
            self.keep_going = v;
        }
        if let Some(v) = has_issues {
            self.has_issues = v;
        }
        if let Some(v) = has_plan {
            self.has_plan = v;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_counts_only_natural_turns() {
        let mut state = DialogueState::new();
        let result = NluResult::new(Intent::Search, DaxCode::chat(), "search", 0.9, HashMap::new());
        let preds = (0..5)
            .map(|i| Prediction { flow_name: format!("f{i}"), confidence: 0.1 })
            .collect();
        state.update(&result, preds, true);
        state.update(&result, Vec::new(), false);
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.top_predictions.len(), MAX_TOP_PREDICTIONS);
        assert!(!state.natural_birth);
        assert_eq!(state.flow_name, "search");
    }

    #[test]
    fn test_update_flags_partial() {
        let mut state = DialogueState::new();
        state.update_flags(Some(true), None, Some(true));
        state.update_flags(None, Some(true), None);
        assert!(state.keep_going && state.has_issues && state.has_plan);
        state.reset();
        assert!(!state.keep_going && state.turn_count == 0);
    }
}
