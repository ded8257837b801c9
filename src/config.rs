//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DIALOGUE__*` 覆盖（双下划线表示嵌套，如 `DIALOGUE__LLM__PROVIDER=openai`）。
//! 必填字段没有 serde 默认值：缺失即反序列化失败，进程拒绝启动。
//! 校验通过后得到 [`FrozenConfig`]，之后不再修改，各组件只持有其引用。

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub thresholds: ThresholdsSection,
    pub session: SessionSection,
    pub memory: MemorySection,
    pub persona: PersonaSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub response: ResponseSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub catalog: CatalogSection,
}

/// [thresholds] 段：NLU 置信度下限、歧义升级轮数、共识加成/惩罚
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdsSection {
    pub nlu_confidence_min: f64,
    pub ambiguity_escalation_turns: u32,
    /// 自检闸门的硬下限，低于此值直接回退
    #[serde(default = "default_self_check_floor")]
    pub self_check_floor: f64,
    /// 全票一致时的置信度加成
    #[serde(default = "default_agreement_bonus")]
    pub agreement_bonus: f64,
    /// 无多数派时的置信度缩放系数
    #[serde(default = "default_disagreement_penalty")]
    pub disagreement_penalty: f64,
}

fn default_self_check_floor() -> f64 {
    0.1
}

fn default_agreement_bonus() -> f64 {
    0.1
}

fn default_disagreement_penalty() -> f64 {
    0.8
}

/// [session] 段：Flow 栈深度、每轮最大执行回合、空闲回收
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    pub max_flow_depth: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_max_rounds() -> usize {
    5
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    pub scratchpad: ScratchpadSection,
    pub summarization: SummarizationSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScratchpadSection {
    pub max_snippets: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizationSection {
    pub trigger_turn_count: u32,
    /// 摘要检查点包含的最近轮数
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

fn default_lookback() -> usize {
    6
}

/// [persona] 段：助手名字、语气、回复风格
#[derive(Debug, Clone, Deserialize)]
pub struct PersonaSection {
    pub name: String,
    pub tone: String,
    pub response_style: String,
}

/// [llm] 段：后端选择、投票数与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// NLU 并行投票次数
    #[serde(default = "default_voters")]
    pub voters: usize,
    /// 投票工作池大小
    #[serde(default = "default_voter_pool_size")]
    pub voter_pool_size: usize,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            voters: default_voters(),
            voter_pool_size: default_voter_pool_size(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_voters() -> usize {
    2
}

fn default_voter_pool_size() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [response] 段：润色阈值
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseSection {
    /// 模板文本超过此长度才走 LLM 润色
    #[serde(default = "default_naturalize_min_chars")]
    pub naturalize_min_chars: usize,
}

impl Default for ResponseSection {
    fn default() -> Self {
        Self {
            naturalize_min_chars: default_naturalize_min_chars(),
        }
    }
}

fn default_naturalize_min_chars() -> usize {
    80
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [catalog] 段：flow 目录文件
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSection {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("config/flows.toml")
}

impl AppConfig {
    /// 范围校验；通过后冻结为 FrozenConfig
    pub fn validate(self) -> Result<FrozenConfig, AgentError> {
        let t = &self.thresholds;
        for (name, v) in [
            ("thresholds.nlu_confidence_min", t.nlu_confidence_min),
            ("thresholds.self_check_floor", t.self_check_floor),
            ("thresholds.agreement_bonus", t.agreement_bonus),
            ("thresholds.disagreement_penalty", t.disagreement_penalty),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(AgentError::ConfigError(format!("{name} must be within [0, 1], got {v}")));
            }
        }
        if t.ambiguity_escalation_turns == 0 {
            return Err(AgentError::ConfigError(
                "thresholds.ambiguity_escalation_turns must be >= 1".into(),
            ));
        }
        if self.session.max_flow_depth == 0 {
            return Err(AgentError::ConfigError("session.max_flow_depth must be >= 1".into()));
        }
        if self.session.max_rounds == 0 {
            return Err(AgentError::ConfigError("session.max_rounds must be >= 1".into()));
        }
        if self.memory.scratchpad.max_snippets == 0 {
            return Err(AgentError::ConfigError(
                "memory.scratchpad.max_snippets must be >= 1".into(),
            ));
        }
        if self.memory.summarization.trigger_turn_count == 0 {
            return Err(AgentError::ConfigError(
                "memory.summarization.trigger_turn_count must be >= 1".into(),
            ));
        }
        if self.llm.voters == 0 || self.llm.voter_pool_size == 0 {
            return Err(AgentError::ConfigError("llm.voters and llm.voter_pool_size must be >= 1".into()));
        }
        let p = &self.persona;
        if p.name.trim().is_empty() || p.tone.trim().is_empty() || p.response_style.trim().is_empty() {
            return Err(AgentError::ConfigError(
                "persona.name, persona.tone and persona.response_style must be non-empty".into(),
            ));
        }
        Ok(FrozenConfig(Arc::new(self)))
    }
}

/// 校验通过、不可变的配置；clone 只增加引用计数
#[derive(Debug, Clone)]
pub struct FrozenConfig(Arc<AppConfig>);

impl Deref for FrozenConfig {
    type Target = AppConfig;

    fn deref(&self) -> &AppConfig {
        &self.0
    }
}

/// 从 config 目录加载配置，环境变量 DIALOGUE__* 可覆盖，并完成校验
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DIALOGUE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<FrozenConfig, AgentError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DIALOGUE")
            .separator("__")
            .try_parsing(true),
    );

    let raw: AppConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;
    raw.validate()
}

/// 直接从 TOML 文本解析并校验（测试与嵌入场景）
pub fn config_from_toml(text: &str) -> Result<FrozenConfig, AgentError> {
    let raw: AppConfig = config::Config::builder()
        .add_source(config::File::from_str(text, config::FileFormat::Toml))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AgentError::ConfigError(e.to_string()))?;
    raw.validate()
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"
[thresholds]
nlu_confidence_min = 0.6
ambiguity_escalation_turns = 3

[session]
max_flow_depth = 8

[memory.scratchpad]
max_snippets = 4

[memory.summarization]
trigger_turn_count = 10

[persona]
name = "Bee"
tone = "friendly"
response_style = "concise"
"#;

#[cfg(test)]
pub(crate) fn test_config() -> FrozenConfig {
    config_from_toml(TEST_CONFIG).expect("test config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_fields() {
        let cfg = test_config();
        assert_eq!(cfg.session.max_rounds, 5);
        assert_eq!(cfg.llm.voters, 2);
        assert!((cfg.thresholds.self_check_floor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_persona_is_fatal() {
        let text = TEST_CONFIG.replace("[persona]\nname = \"Bee\"\n", "[persona]\n");
        let err = config_from_toml(&text).unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(msg) if msg.contains("name")));
    }

    #[test]
    fn test_missing_section_is_fatal() {
        let text = TEST_CONFIG.replace("[session]\nmax_flow_depth = 8\n", "");
        assert!(config_from_toml(&text).is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let text = TEST_CONFIG.replace("nlu_confidence_min = 0.6", "nlu_confidence_min = 1.5");
        assert!(matches!(config_from_toml(&text), Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, TEST_CONFIG).unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.session.max_flow_depth, 8);
        assert_eq!(cfg.persona.name, "Bee");
    }
}
