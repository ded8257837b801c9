//! 会话状态：单个 Agent 独占的全部可变组件
//!
//! NLU / PEX / RES 都以 `&mut SessionState` 的形式接收它；同一会话同一时刻只处理一轮，
//! 不同会话之间没有任何共享。

use crate::config::FrozenConfig;
use crate::dialogue::{AmbiguityTracker, DialogueState, DisplayFrame, FlowStack};
use crate::memory::{ContextCoordinator, MemoryStore};

#[derive(Debug, Clone)]
pub struct SessionState {
    pub dialogue: DialogueState,
    pub stack: FlowStack,
    pub context: ContextCoordinator,
    pub memory: MemoryStore,
    pub frame: DisplayFrame,
    pub ambiguity: AmbiguityTracker,
    /// 本轮用户附带的界面动作（如 "confirm"）
    pub last_actions: Vec<String>,
}

impl SessionState {
    pub fn new(config: &FrozenConfig) -> Self {
        Self {
            dialogue: DialogueState::new(),
            stack: FlowStack::new(config.session.max_flow_depth),
            context: ContextCoordinator::new(),
            memory: MemoryStore::new(config.memory.scratchpad.max_snippets),
            frame: DisplayFrame::new(),
            ambiguity: AmbiguityTracker::new(config.thresholds.ambiguity_escalation_turns),
            last_actions: Vec::new(),
        }
    }

    /// 原地重置（偏好保留）
    pub fn reset(&mut self) {
        self.dialogue.reset();
        self.stack.clear();
        self.context.reset();
        self.memory.reset();
        self.frame.clear();
        self.ambiguity.reset();
        self.last_actions.clear();
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.last_actions.iter().any(|a| a.eq_ignore_ascii_case(action))
    }
}
