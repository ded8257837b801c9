//! 前置快捷规则（不调用 LLM）
//!
//! 空输入与问候 / 告别 / "下一步" 这类高频低歧义话语直接命中，省掉一次模型往返。

use std::sync::OnceLock;

use regex::Regex;

use crate::dialogue::DEFAULT_FLOW;

/// 空输入命中时的置信度
pub const EMPTY_CONFIDENCE: f64 = 1.0;
/// 模式命中时的置信度
pub const PATTERN_CONFIDENCE: f64 = 0.8;
/// "下一步" 类话语的目标 flow（目录中没有时退回默认 flow）
pub const NEXT_STEP_FLOW: &str = "suggest";

/// 快捷命中结果
#[derive(Debug, Clone, PartialEq)]
pub struct ShortcutHit {
    pub flow_name: &'static str,
    pub confidence: f64,
    pub rule: &'static str,
}

struct Rule {
    name: &'static str,
    pattern: Regex,
    flow_name: &'static str,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let table: [(&str, &str, &str); 3] = [
            (
                "greeting",
                r"(?i)^\s*(hi|hello|hey|howdy|good (morning|afternoon|evening)|你好|您好|嗨)[\s!.,？?！。]*$",
                DEFAULT_FLOW,
            ),
            (
                "farewell",
                r"(?i)^\s*(bye|goodbye|see you|see ya|thanks,? bye|再见|拜拜)[\s!.,？?！。]*$",
                DEFAULT_FLOW,
            ),
            (
                "what_next",
                r"(?i)^\s*(what(')?s next|what now|what should i do next|next step|下一步(做什么)?)[\s!.,？?！。]*$",
                NEXT_STEP_FLOW,
            ),
        ];
        table
            .into_iter()
            .map(|(name, pattern, flow_name)| Rule {
                name,
                pattern: Regex::new(pattern).expect("shortcut pattern is valid"),
                flow_name,
            })
            .collect()
    })
}

/// 近乎为空：去掉空白后少于 2 个字符
pub fn is_near_empty(text: &str) -> bool {
    text.trim().chars().count() < 2
}

/// 依次尝试空输入与各条模式
pub fn match_shortcut(text: &str) -> Option<ShortcutHit> {
    if is_near_empty(text) {
        return Some(ShortcutHit {
            flow_name: DEFAULT_FLOW,
            confidence: EMPTY_CONFIDENCE,
            rule: "empty",
        });
    }
    rules()
        .iter()
        .find(|r| r.pattern.is_match(text))
        .map(|r| ShortcutHit {
            flow_name: r.flow_name,
            confidence: PATTERN_CONFIDENCE,
            rule: r.name,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_near_empty() {
        assert_eq!(match_shortcut("").unwrap().confidence, EMPTY_CONFIDENCE);
        assert_eq!(match_shortcut("  ?  ").unwrap().rule, "empty");
    }

    #[test]
    fn test_greeting_farewell_next() {
        assert_eq!(match_shortcut("Hello!").unwrap().rule, "greeting");
        assert_eq!(match_shortcut("你好").unwrap().rule, "greeting");
        assert_eq!(match_shortcut("bye.").unwrap().rule, "farewell");
        let hit = match_shortcut("what's next?").unwrap();
        assert_eq!(hit.flow_name, NEXT_STEP_FLOW);
        assert_eq!(hit.confidence, PATTERN_CONFIDENCE);
    }

    #[test]
    fn test_normal_text_falls_through() {
        assert!(match_shortcut("hello, can you plot revenue by month").is_none());
        assert!(match_shortcut("search for rust books").is_none());
    }
}
