//! 模型输出解析
//!
//! 投票结果应为单个 JSON 对象；容忍外层 ```json 代码块，严格解析失败时
//! 扫描出第一个括号平衡的对象再试一次，仍失败则视为无票。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

/// 单个投票者的输出
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct VoteCandidate {
    /// 目录中的 flow 名
    pub flow_name: String,
    /// 0 到 1 之间的置信度
    pub confidence: f64,
    /// 从话语中抽取的槽位
    #[serde(default)]
    pub slots: HashMap<String, Value>,
}

/// 给模型看的输出 schema
pub fn vote_schema_json() -> String {
    let schema = schema_for!(VoteCandidate);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}

fn fence_re() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").expect("fence pattern is valid"))
}

/// 去掉代码块围栏；没有围栏时原样返回
pub fn strip_code_fence(text: &str) -> &str {
    match fence_re().captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => text.trim(),
    }
}

/// 从文本中找出第一个括号平衡的 `{...}`（忽略字符串字面量中的括号）
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 解析一张选票；置信度被截断到 [0, 1]
pub fn parse_vote(raw: &str) -> Option<VoteCandidate> {
    let body = strip_code_fence(raw);
    let parsed = serde_json::from_str::<VoteCandidate>(body).ok().or_else(|| {
        let recovered = first_balanced_object(body)?;
        serde_json::from_str::<VoteCandidate>(recovered).ok()
    });
    let mut vote = parsed?;
    if vote.flow_name.trim().is_empty() || !vote.confidence.is_finite() {
        return None;
    }
    vote.flow_name = vote.flow_name.trim().to_string();
    vote.confidence = vote.confidence.clamp(0.0, 1.0);
    Some(vote)
}
