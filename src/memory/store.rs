//! 记忆存储：有界 LRU 草稿本（按字符串键）+ 无界持久偏好表
//!
//! 通过 PEX 的工具分发暴露给工具调用（memory.* / preference.*）。

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct MemoryStore {
    snippets: HashMap<String, String>,
    /// 访问顺序，队尾为最近使用
    order: VecDeque<String>,
    max_snippets: usize,
    preferences: HashMap<String, Value>,
}

impl MemoryStore {
    pub fn new(max_snippets: usize) -> Self {
        Self {
            snippets: HashMap::new(),
            order: VecDeque::new(),
            max_snippets: max_snippets.max(1),
            preferences: HashMap::new(),
        }
    }

    /// 写入片段；超出容量时淘汰最久未用的键并返回
    pub fn write_snippet(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        self.touch(&key);
        self.snippets.insert(key, value.into());
        if self.snippets.len() > self.max_snippets {
            let evicted = self.order.pop_front()?;
            self.snippets.remove(&evicted);
            tracing::debug!(key = %evicted, "scratchpad snippet evicted");
            return Some(evicted);
        }
        None
    }

    /// 读取片段并刷新其最近使用时间
    pub fn read_snippet(&mut self, key: &str) -> Option<String> {
        let value = self.snippets.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    /// 从旧到新
    pub fn snippets(&self) -> Vec<(&str, &str)> {
        self.order
            .iter()
            .filter_map(|k| self.snippets.get(k).map(|v| (k.as_str(), v.as_str())))
            .collect()
    }

    /// 拼入 prompt 的草稿本段落
    pub fn scratchpad_section(&self) -> String {
        if self.snippets.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = self
            .snippets()
            .into_iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect();
        format!("## Scratchpad\n{}\n", lines.join("\n"))
    }

    pub fn set_preference(&mut self, key: impl Into<String>, value: Value) {
        self.preferences.insert(key.into(), value);
    }

    pub fn get_preference(&self, key: &str) -> Option<&Value> {
        self.preferences.get(key)
    }

    pub fn len(&self) -> usize {
        self.snippets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.is_empty()
    }

    /// 会话重置：草稿本清空；偏好属于用户，保留
    pub fn reset(&mut self) {
        self.snippets.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction_respects_reads() {
        let mut store = MemoryStore::new(2);
        store.write_snippet("a", "1");
        store.write_snippet("b", "2");
        assert_eq!(store.read_snippet("a").as_deref(), Some("1"));
        let evicted = store.write_snippet("c", "3");
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(store.len(), 2);
        assert!(store.read_snippet("b").is_none());
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut store = MemoryStore::new(2);
        store.write_snippet("a", "1");
        store.write_snippet("b", "2");
        assert!(store.write_snippet("a", "updated").is_none());
        assert_eq!(store.snippets(), vec![("b", "2"), ("a", "updated")]);
    }

    #[test]
    fn test_preferences_survive_reset() {
        let mut store = MemoryStore::new(2);
        store.write_snippet("a", "1");
        store.set_preference("units", Value::from("metric"));
        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.get_preference("units"), Some(&Value::from("metric")));
        assert!(store.scratchpad_section().is_empty());
    }
}
