//! Flow 目录
//!
//! 从 config/flows.toml 加载的只读配置表：每个 flow 的意图、dax 码、槽位 schema、
//! 可派生的子 flow（edge_flows）以及固定工具序列。加载时完成一致性校验。

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::dialogue::DaxCode;

/// 默认闲聊 flow 名
pub const DEFAULT_FLOW: &str = "chat";

/// 意图类别：决定由哪个 Policy 执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Converse,
    Search,
    Analyze,
    Visualize,
    Clean,
    Transform,
    Plan,
    /// 后台/内部流程，不产生自然语言回复
    Internal,
}

impl Intent {
    pub fn is_background(self) -> bool {
        matches!(self, Intent::Internal)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::Converse => "converse",
            Intent::Search => "search",
            Intent::Analyze => "analyze",
            Intent::Visualize => "visualize",
            Intent::Clean => "clean",
            Intent::Transform => "transform",
            Intent::Plan => "plan",
            Intent::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// 槽位声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// 固定工具序列中的一步；params 中的 `{slot}` 占位符在执行前用槽位值替换
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStep {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// 目录中的一条 flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSpec {
    pub name: String,
    pub intent: Intent,
    pub dax: DaxCode,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
    #[serde(default)]
    pub edge_flows: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolStep>,
    /// Converse 类 flow 的技能模板
    pub skill_template: Option<String>,
    /// 回复模板，`{message}` / `{slots}` 占位
    pub response_template: Option<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl FlowSpec {
    pub fn declares_slot(&self, name: &str) -> bool {
        self.slots.iter().any(|s| s.name == name)
    }

    pub fn required_slots(&self) -> impl Iterator<Item = &SlotSpec> {
        self.slots.iter().filter(|s| s.required)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogToml {
    #[serde(default)]
    flow: Vec<FlowSpec>,
}

/// 已校验的 flow 目录，按名字与 dax 码索引
#[derive(Debug, Clone)]
pub struct FlowCatalog {
    flows: Vec<FlowSpec>,
    by_name: HashMap<String, usize>,
    by_dax: HashMap<String, usize>,
}

impl FlowCatalog {
    /// 校验：名字唯一、dax 唯一、edge flow 存在、默认 chat flow 存在
    pub fn new(flows: Vec<FlowSpec>) -> Result<Self, AgentError> {
        let mut by_name = HashMap::new();
        let mut by_dax = HashMap::new();
        for (idx, flow) in flows.iter().enumerate() {
            if by_name.insert(flow.name.clone(), idx).is_some() {
                return Err(AgentError::CatalogError(format!("duplicate flow name '{}'", flow.name)));
            }
            if by_dax.insert(flow.dax.to_string(), idx).is_some() {
                return Err(AgentError::CatalogError(format!(
                    "duplicate dax code '{}' on flow '{}'",
                    flow.dax, flow.name
                )));
            }
        }
        for flow in &flows {
            if let Some(missing) = flow.edge_flows.iter().find(|e| !by_name.contains_key(*e)) {
                return Err(AgentError::CatalogError(format!(
                    "flow '{}' names unknown edge flow '{}'",
                    flow.name, missing
                )));
            }
        }
        match by_name.get(DEFAULT_FLOW).map(|&i| &flows[i]) {
            Some(chat) if chat.intent == Intent::Converse => {}
            Some(_) => {
                return Err(AgentError::CatalogError(format!(
                    "default flow '{DEFAULT_FLOW}' must have intent converse"
                )))
            }
            None => {
                return Err(AgentError::CatalogError(format!(
                    "catalog must define the default flow '{DEFAULT_FLOW}'"
                )))
            }
        }
        Ok(Self {
            flows,
            by_name,
            by_dax,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, AgentError> {
        let parsed: CatalogToml =
            toml::from_str(text).map_err(|e| AgentError::CatalogError(e.to_string()))?;
        Self::new(parsed.flow)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AgentError::CatalogError(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn get(&self, name: &str) -> Option<&FlowSpec> {
        self.by_name.get(name).map(|&i| &self.flows[i])
    }

    pub fn get_by_dax(&self, dax: &str) -> Option<&FlowSpec> {
        let key = dax.parse::<DaxCode>().ok()?.to_string();
        self.by_dax.get(&key).map(|&i| &self.flows[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn default_flow(&self) -> &FlowSpec {
        // new() 保证默认 flow 存在
        &self.flows[self.by_name[DEFAULT_FLOW]]
    }

    pub fn flows(&self) -> &[FlowSpec] {
        &self.flows
    }

    /// 供 NLU prompt 使用的目录摘要（每行一个 flow）
    pub fn prompt_listing(&self) -> String {
        self.flows
            .iter()
            .map(|f| {
                let slots: Vec<&str> = f.slots.iter().map(|s| s.name.as_str()).collect();
                format!(
                    "- {} [{}]: {} (slots: {})",
                    f.name,
                    f.intent,
                    f.description,
                    if slots.is_empty() { "none".to_string() } else { slots.join(", ") }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
pub(crate) const TEST_CATALOG: &str = r#"
[[flow]]
name = "chat"
intent = "converse"
dax = "000"
description = "General conversation"

[[flow]]
name = "search"
intent = "search"
dax = "014"
description = "Look something up"
slots = [
    { name = "query", required = true, description = "what to search for" },
    { name = "source", description = "where to search" },
]
tools = [{ action = "search", params = { q = "{query}" } }]

[[flow]]
name = "lookup"
intent = "search"
dax = "114"
description = "Look up a single record"
slots = [{ name = "key", required = false }]

[[flow]]
name = "plot"
intent = "visualize"
dax = "023"
description = "Draw a chart"
slots = [{ name = "column", required = false }]
tools = [{ action = "chart", params = { column = "{column}" } }]

[[flow]]
name = "outline"
intent = "plan"
dax = "0C0"
description = "Break a request into steps"
edge_flows = ["search", "plot"]

[[flow]]
name = "drop_rows"
intent = "clean"
dax = "07E"
description = "Delete rows"
requires_confirmation = true

[[flow]]
name = "sync"
intent = "internal"
dax = "099"
description = "Background bookkeeping"
"#;

#[cfg(test)]
pub(crate) fn test_catalog() -> FlowCatalog {
    FlowCatalog::from_toml_str(TEST_CATALOG).expect("test catalog")
}
