//! Dialogue Engine - 本地行式传输
//!
//! 入口：初始化日志、加载并校验配置（失败即退出）、构建共享组件与会话管理器，
//! 然后逐行读取 stdin：普通文本或 JSON 请求（`{"text": ..., "last_action": [...], "gold_label": ...}`），
//! 每轮回复以一行 JSON 写到 stdout。`/reset` 重置会话，`/quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use dialogue_engine::config::load_config;
use dialogue_engine::{observability, AgentComponents, CleanupSource, SessionManager, TurnRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const SESSION_KEY: &str = "local";
const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Invalid configuration")?;
    let components = AgentComponents::from_config(config).context("Failed to build agent components")?;
    let manager = Arc::new(SessionManager::new(Arc::new(components)));

    let reaper = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            loop {
                ticker.tick().await;
                let reaped = manager.reap_idle(Instant::now()).await;
                if reaped > 0 {
                    tracing::info!(reaped, "idle sessions reaped");
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        match line {
            "/quit" => break,
            "/reset" => {
                manager.reset(SESSION_KEY).await;
                continue;
            }
            _ => {}
        }
        let request = if line.starts_with('{') {
            match serde_json::from_str::<TurnRequest>(line) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed request line, treating as text");
                    TurnRequest {
                        text: line.to_string(),
                        ..TurnRequest::default()
                    }
                }
            }
        } else {
            TurnRequest {
                text: line.to_string(),
                ..TurnRequest::default()
            }
        };

        let agent = manager.get_or_create(SESSION_KEY).await;
        let response = agent.lock().await.handle_request(request).await;
        let mut out = serde_json::to_string(&response).context("Failed to encode response")?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await.context("Failed to write stdout")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }

    manager.cleanup(SESSION_KEY, CleanupSource::Disconnect).await;
    manager.shutdown().await;
    reaper.abort();
    Ok(())
}
