//! Echo 工具（本地运行与测试用）

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::tools::Tool;

/// 原样返回参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the given params unchanged"
    }

    async fn execute(&self, params: Map<String, Value>) -> Result<Value, String> {
        Ok(Value::Object(params))
    }
}
