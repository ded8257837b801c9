//! 回复模板与澄清模板
//!
//! 占位符写作 `{name}`；值为数组时以 ", " 连接。模板中有未能填上的占位符时，
//! 澄清文案退回该级别的通用句子。

use std::collections::HashMap;

use serde_json::Value;

use crate::dialogue::AmbiguityLevel;

/// flow 未配置 response_template 时使用
pub const DEFAULT_RESPONSE_TEMPLATE: &str = "{message}";

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(", "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 用 vars 填充模板；返回 (文本, 是否全部填上)
pub fn render(template: &str, vars: &HashMap<String, Value>) -> (String, bool) {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), &value_text(value));
    }
    let complete = !has_placeholder(&out);
    (out, complete)
}

fn has_placeholder(text: &str) -> bool {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return true;
                }
                rest = &after[close + 1..];
            }
            None => return false,
        }
    }
    false
}

fn clarification_template(level: AmbiguityLevel) -> &'static str {
    match level {
        AmbiguityLevel::General => {
            "I'm not sure I understood. Did you want help with {top_prediction}? Could you tell me a bit more?"
        }
        AmbiguityLevel::Partial => "I can do a few similar things here: {candidates}. Which one did you mean?",
        AmbiguityLevel::Specific => "Before I can run {flow}, I still need: {missing}. Could you provide that?",
        AmbiguityLevel::Confirmation => "Just to confirm: should I go ahead with {description}?",
    }
}

fn generic_clarification(level: AmbiguityLevel) -> &'static str {
    match level {
        AmbiguityLevel::General => "I'm not sure I understood. Could you rephrase that?",
        AmbiguityLevel::Partial => "That could mean a few different things. Could you be more specific?",
        AmbiguityLevel::Specific => "I need a bit more information before I can do that. Could you fill in the details?",
        AmbiguityLevel::Confirmation => "Should I go ahead with that?",
    }
}

/// 按级别生成澄清文案；有 observation 时直接使用
pub fn clarification(
    level: AmbiguityLevel,
    metadata: Option<&HashMap<String, Value>>,
    observation: Option<&str>,
) -> String {
    if let Some(text) = observation.map(str::trim).filter(|t| !t.is_empty()) {
        return text.to_string();
    }
    let empty = HashMap::new();
    let (text, complete) = render(clarification_template(level), metadata.unwrap_or(&empty));
    if complete {
        text
    } else {
        generic_clarification(level).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_lists_missing_slots() {
        let mut meta = HashMap::new();
        meta.insert("flow".to_string(), Value::from("search"));
        meta.insert("missing".to_string(), serde_json::json!(["query", "source"]));
        let text = clarification(AmbiguityLevel::Specific, Some(&meta), None);
        assert_eq!(
            text,
            "Before I can run search, I still need: query, source. Could you provide that?"
        );
    }

    #[test]
    fn test_observation_wins() {
        let text = clarification(AmbiguityLevel::General, None, Some("Which file do you mean?"));
        assert_eq!(text, "Which file do you mean?");
    }

    #[test]
    fn test_unfilled_template_falls_back_to_generic() {
        let text = clarification(AmbiguityLevel::Partial, None, None);
        assert_eq!(text, generic_clarification(AmbiguityLevel::Partial));
    }

    #[test]
    fn test_render_ignores_json_braces() {
        let vars = HashMap::from([("message".to_string(), Value::from("ok"))]);
        let (text, complete) = render("{message} {\"a\": 1}", &vars);
        assert_eq!(text, "ok {\"a\": 1}");
        assert!(complete);
    }
}
