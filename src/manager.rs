//! 会话管理器：session_key -> Agent
//!
//! 进程内唯一的会话注册表，启动时构建一次并以引用传递。
//! 命中已有会话只走读锁；未命中时取写锁并再次检查，避免并发创建出两个 Agent。
//! 每个会话的 Agent 放在自己的 Mutex 里，保证同一会话同一时刻只处理一轮；不同会话互不影响。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

use crate::agent::{Agent, AgentComponents};
use crate::core::SessionSupervisor;

/// 会话被清理的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupSource {
    Disconnect,
    Logout,
    Inactivity,
    Shutdown,
}

impl fmt::Display for CleanupSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CleanupSource::Disconnect => "disconnect",
            CleanupSource::Logout => "logout",
            CleanupSource::Inactivity => "inactivity",
            CleanupSource::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// 注册表中的一项；取消令牌放在锁外，清理时无需等待进行中的轮次
struct SessionHandle {
    agent: Arc<Mutex<Agent>>,
    supervisor: SessionSupervisor,
}

pub struct SessionManager {
    components: Arc<AgentComponents>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(components: Arc<AgentComponents>) -> Self {
        let idle_timeout = Duration::from_secs(components.config.session.idle_timeout_secs);
        Self {
            components,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// 获取或创建会话
    pub async fn get_or_create(&self, session_key: &str) -> Arc<Mutex<Agent>> {
        if let Some(handle) = self.sessions.read().await.get(session_key) {
            return Arc::clone(&handle.agent);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_key) {
            return Arc::clone(&handle.agent);
        }
        let supervisor = SessionSupervisor::new();
        let agent = Agent::new(session_key, Arc::clone(&self.components)).with_supervisor(supervisor.clone());
        let agent = Arc::new(Mutex::new(agent));
        sessions.insert(
            session_key.to_string(),
            SessionHandle {
                agent: Arc::clone(&agent),
                supervisor,
            },
        );
        tracing::info!(session = session_key, total = sessions.len(), "session created");
        agent
    }

    pub async fn get(&self, session_key: &str) -> Option<Arc<Mutex<Agent>>> {
        self.sessions
            .read()
            .await
            .get(session_key)
            .map(|h| Arc::clone(&h.agent))
    }

    /// 移除并关闭会话：取消进行中的轮次；不存在时返回 false
    pub async fn cleanup(&self, session_key: &str, source: CleanupSource) -> bool {
        let removed = self.sessions.write().await.remove(session_key);
        match removed {
            Some(handle) => {
                handle.supervisor.cancel();
                tracing::info!(session = session_key, %source, "session cleaned up");
                true
            }
            None => false,
        }
    }

    /// 原地重置会话状态，注册表项保留；不存在时返回 false
    pub async fn reset(&self, session_key: &str) -> bool {
        let Some(agent) = self.get(session_key).await else {
            return false;
        };
        agent.lock().await.reset();
        true
    }

    /// 回收空闲超时的会话（正在处理轮次的会话不回收），返回回收数量
    pub async fn reap_idle(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().await;
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, handle)| match handle.agent.try_lock() {
                Ok(agent) => now.saturating_duration_since(agent.last_active()) > self.idle_timeout,
                Err(_) => false,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            if let Some(handle) = sessions.remove(key) {
                handle.supervisor.cancel();
                tracing::info!(session = %key, source = %CleanupSource::Inactivity, "session cleaned up");
            }
        }
        idle.len()
    }

    /// 关闭全部会话
    pub async fn shutdown(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (key, handle) in sessions.drain() {
            handle.supervisor.cancel();
            tracing::debug!(session = %key, source = %CleanupSource::Shutdown, "session cleaned up");
        }
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::dialogue::catalog::test_catalog;
    use crate::llm::MockLlmClient;
    use crate::tools::NoopDispatch;

    fn components() -> Arc<AgentComponents> {
        Arc::new(AgentComponents::new(
            test_config(),
            Arc::new(test_catalog()),
            Arc::new(MockLlmClient),
            Arc::new(NoopDispatch),
        ))
    }

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(components()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_agent() {
        let manager = manager();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_or_create("shared").await })
            })
            .collect();
        let mut agents = Vec::new();
        for h in handles {
            agents.push(h.await.unwrap());
        }
        assert!(agents.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_cancels_and_removes() {
        let manager = manager();
        let agent = manager.get_or_create("a").await;
        assert!(manager.cleanup("a", CleanupSource::Logout).await);
        assert!(!manager.cleanup("a", CleanupSource::Logout).await);
        assert!(agent.lock().await.supervisor().is_cancelled());
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_reset_keeps_registry_entry() {
        let manager = manager();
        let agent = manager.get_or_create("a").await;
        agent.lock().await.handle_turn("", Vec::new(), None).await;
        assert!(!agent.lock().await.state().context.is_empty());
        assert!(manager.reset("a").await);
        assert!(agent.lock().await.state().context.is_empty());
        assert_eq!(manager.session_count().await, 1);
        assert!(!manager.reset("missing").await);
    }

    #[tokio::test]
    async fn test_reap_idle_removes_only_stale_sessions() {
        let manager = SessionManager::new(components()).with_idle_timeout(Duration::from_secs(60));
        manager.get_or_create("old").await;
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(manager.reap_idle(Instant::now()).await, 0);
        assert_eq!(manager.reap_idle(later).await, 1);
        assert_eq!(manager.session_count().await, 0);
    }
}
