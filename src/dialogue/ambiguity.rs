//! 歧义追踪器
//!
//! 同一时刻至多一个未决的歧义声明（级别 + 元数据 + 可选观察文本）；
//! 各级别计数在会话内持续累积，用于判断是否需要升级（转人工或扩大上下文由调用方决定）。

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityLevel {
    /// 完全不确定用户想做什么
    General,
    /// 知道大致意图，但不确定具体 flow
    Partial,
    /// flow 确定，但缺少必要信息
    Specific,
    /// 需要用户确认后才能执行
    Confirmation,
}

impl fmt::Display for AmbiguityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AmbiguityLevel::General => "general",
            AmbiguityLevel::Partial => "partial",
            AmbiguityLevel::Specific => "specific",
            AmbiguityLevel::Confirmation => "confirmation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguityDeclaration {
    pub level: AmbiguityLevel,
    pub metadata: HashMap<String, Value>,
    pub observation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AmbiguityTracker {
    current: Option<AmbiguityDeclaration>,
    counts: HashMap<AmbiguityLevel, u32>,
    escalation_turns: u32,
}

impl AmbiguityTracker {
    pub fn new(escalation_turns: u32) -> Self {
        Self {
            current: None,
            counts: HashMap::new(),
            escalation_turns,
        }
    }

    /// 记录声明（覆盖旧声明）并累加该级别计数
    pub fn declare(
        &mut self,
        level: AmbiguityLevel,
        metadata: Option<HashMap<String, Value>>,
        observation: Option<String>,
    ) {
        tracing::info!(%level, observation = observation.as_deref().unwrap_or(""), "ambiguity declared");
        *self.counts.entry(level).or_insert(0) += 1;
        self.current = Some(AmbiguityDeclaration {
            level,
            metadata: metadata.unwrap_or_default(),
            observation,
        });
    }

    pub fn present(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&AmbiguityDeclaration> {
        self.current.as_ref()
    }

    pub fn level(&self) -> Option<AmbiguityLevel> {
        self.current.as_ref().map(|d| d.level)
    }

    pub fn metadata(&self) -> Option<&HashMap<String, Value>> {
        self.current.as_ref().map(|d| &d.metadata)
    }

    pub fn observation(&self) -> Option<&str> {
        self.current.as_ref().and_then(|d| d.observation.as_deref())
    }

    /// 清除当前声明，计数保留
    pub fn resolve(&mut self) {
        self.current = None;
    }

    pub fn needs_clarification(&self, confidence: f64, threshold: f64) -> bool {
        confidence < threshold
    }

    pub fn count(&self, level: AmbiguityLevel) -> u32 {
        self.counts.get(&level).copied().unwrap_or(0)
    }

    pub fn should_escalate(&self) -> bool {
        self.counts.values().sum::<u32>() >= self.escalation_turns
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_live_declaration() {
        let mut tracker = AmbiguityTracker::new(3);
        tracker.declare(AmbiguityLevel::General, None, None);
        tracker.declare(AmbiguityLevel::Specific, None, Some("Which column?".into()));
        assert_eq!(tracker.level(), Some(AmbiguityLevel::Specific));
        assert_eq!(tracker.observation(), Some("Which column?"));
        tracker.resolve();
        assert!(!tracker.present());
        assert_eq!(tracker.count(AmbiguityLevel::General), 1);
    }

    #[test]
    fn test_escalation_counts_across_levels() {
        let mut tracker = AmbiguityTracker::new(3);
        tracker.declare(AmbiguityLevel::General, None, None);
        tracker.resolve();
        tracker.declare(AmbiguityLevel::Partial, None, None);
        assert!(!tracker.should_escalate());
        tracker.declare(AmbiguityLevel::Specific, None, None);
        assert!(tracker.should_escalate());
        assert!(tracker.needs_clarification(0.2, 0.5));
        assert!(!tracker.needs_clarification(0.5, 0.5));
    }
}
