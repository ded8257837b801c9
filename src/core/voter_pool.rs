//! 投票工作池：固定并发上限的并行任务 + 汇合屏障
//!
//! 每个任务单独 spawn，用 Semaphore 限制同时运行的数量，并各自施加超时；
//! 某个任务出错、超时或 panic 只影响它自己的结果，不会取消其它任务。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::core::AgentError;

/// 固定大小的工作池（默认 4 个并发槽位）
#[derive(Debug, Clone)]
pub struct VoterPool {
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl VoterPool {
    pub fn new(max_concurrent: usize, timeout_secs: u64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 提交全部任务并等待每一个结束；返回值与输入顺序一致
    pub async fn gather<T, Fut>(&self, jobs: Vec<Fut>) -> Vec<Result<T, AgentError>>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, AgentError>> + Send + 'static,
    {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let semaphore = Arc::clone(&self.semaphore);
                let limit = self.timeout;
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| AgentError::LlmError("voter pool closed".to_string()))?;
                    match timeout(limit, job).await {
                        Ok(result) => result,
                        Err(_) => Err(AgentError::LlmError(format!(
                            "voter timed out after {}s",
                            limit.as_secs()
                        ))),
                    }
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(AgentError::LlmError(format!("voter task failed: {e}"))))
            })
            .collect()
    }
}

impl Default for VoterPool {
    fn default() -> Self {
        Self::new(4, 60)
    }
}
