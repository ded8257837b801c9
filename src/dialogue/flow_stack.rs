//! Flow 栈：深度有限的 LIFO 调度器
//!
//! 生命周期：入栈时栈为空则 Active，否则 Pending；只有栈顶可以被标记为 Completed / Invalid；
//! `pop_completed_and_invalid` 移除所有终态条目后，若新栈顶为 Pending 则提升为 Active。
//! 这是 Pending -> Active 的唯一入口，保证打断者先于被打断者执行。

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::dialogue::{DaxCode, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowStatus {
    Pending,
    Active,
    Completed,
    Invalid,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Invalid)
    }
}

/// 栈中的一条 flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowEntry {
    pub flow_id: String,
    pub flow_name: String,
    pub dax_code: DaxCode,
    pub intent: Intent,
    pub status: FlowStatus,
    pub slots: HashMap<String, Value>,
    pub plan_id: Option<String>,
    pub turn_ids: Vec<String>,
    pub result: Option<Value>,
}

/// 深度有限的 flow 栈（索引 0 为栈底）
#[derive(Debug, Clone)]
pub struct FlowStack {
    entries: Vec<FlowEntry>,
    max_depth: usize,
}

impl FlowStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_depth,
        }
    }

    /// 入栈；超过深度上限返回 StackOverflow，栈保持不变
    pub fn push(
        &mut self,
        flow_name: &str,
        dax_code: DaxCode,
        intent: Intent,
        slots: Option<HashMap<String, Value>>,
        plan_id: Option<String>,
    ) -> Result<&FlowEntry, AgentError> {
        if self.entries.len() >= self.max_depth {
            tracing::warn!(flow = flow_name, depth = self.max_depth, "flow stack overflow");
            return Err(AgentError::StackOverflow {
                depth: self.max_depth,
            });
        }
        let status = if self.entries.is_empty() {
            FlowStatus::Active
        } else {
            FlowStatus::Pending
        };
        self.entries.push(FlowEntry {
            flow_id: uuid::Uuid::new_v4().to_string(),
            flow_name: flow_name.to_string(),
            dax_code,
            intent,
            status,
            slots: slots.unwrap_or_default(),
            plan_id,
            turn_ids: Vec::new(),
            result: None,
        });
        tracing::debug!(flow = flow_name, ?status, depth = self.entries.len(), "flow pushed");
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn pop(&mut self) -> Option<FlowEntry> {
        self.entries.pop()
    }

    pub fn peek(&self) -> Option<&FlowEntry> {
        self.entries.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut FlowEntry> {
        self.entries.last_mut()
    }

    /// 自顶向下找第一个 Active 条目（不变式保证至多一个）
    pub fn get_active_flow(&self) -> Option<&FlowEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.status == FlowStatus::Active)
    }

    /// 标记栈顶完成
    pub fn mark_complete(&mut self, result: Option<Value>) -> Result<(), AgentError> {
        let top = self.terminate_top(FlowStatus::Completed)?;
        top.result = result;
        Ok(())
    }

    /// 标记栈顶无效
    pub fn mark_invalid(&mut self) -> Result<(), AgentError> {
        self.terminate_top(FlowStatus::Invalid).map(|_| ())
    }

    fn terminate_top(&mut self, status: FlowStatus) -> Result<&mut FlowEntry, AgentError> {
        let top = self
            .entries
            .last_mut()
            .ok_or_else(|| AgentError::IllegalTransition("flow stack is empty".to_string()))?;
        if top.status.is_terminal() {
            return Err(AgentError::IllegalTransition(format!(
                "flow '{}' is already {:?}",
                top.flow_name, top.status
            )));
        }
        top.status = status;
        Ok(top)
    }

    /// 移除所有终态条目（不论位置），随后把 Pending 的新栈顶提升为 Active
    pub fn pop_completed_and_invalid(&mut self) -> Vec<FlowEntry> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.status.is_terminal());
        self.entries = kept;
        if self.entries.last().map(|e| e.status) == Some(FlowStatus::Pending) {
            self.promote_top();
        }
        removed
    }

    /// 栈顶提升为 Active，被打断的旧 Active 退回 Pending
    fn promote_top(&mut self) {
        let Some((top, below)) = self.entries.split_last_mut() else {
            return;
        };
        for entry in below.iter_mut().filter(|e| e.status == FlowStatus::Active) {
            entry.status = FlowStatus::Pending;
        }
        top.status = FlowStatus::Active;
        tracing::debug!(flow = %top.flow_name, "flow promoted to active");
    }

    /// 按名字查找未结束的条目，自顶向下（最近入栈者优先）
    pub fn find_by_name(&self, flow_name: &str) -> Option<&FlowEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.flow_name == flow_name && !e.status.is_terminal())
    }

    /// 把栈中未结束的条目移到栈顶并激活（用户回到一个被搁置的 flow）；找不到时返回 false
    pub fn raise(&mut self, flow_id: &str) -> bool {
        let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.flow_id == flow_id && !e.status.is_terminal())
        else {
            return false;
        };
        let entry = self.entries.remove(idx);
        self.entries.push(entry);
        self.promote_top();
        true
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
