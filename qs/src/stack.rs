//! Execution stack of a process
//!
//! Each running query is pushed on entry and popped by [`QueryGuard`] on every
//! exit path, including unwinding. Nested calls (a function body running its
//! own statement) appear as deeper entries.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::host::{BackendState, ProcSlot};
use crate::instrument::PlanNode;

/// A query currently executing in a process
#[derive(Debug)]
pub struct ActiveQuery {
    query_text: String,
    plan: Arc<PlanNode>,
}

impl ActiveQuery {
    pub fn new(query_text: impl Into<String>, plan: Arc<PlanNode>) -> Self {
        Self {
            query_text: query_text.into(),
            plan,
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    pub fn plan(&self) -> &Arc<PlanNode> {
        &self.plan
    }
}

/// Stack of active queries, outermost first
#[derive(Debug, Default)]
pub struct ExecutionStack {
    frames: Mutex<Vec<Arc<ActiveQuery>>>,
}

impl ExecutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, query: Arc<ActiveQuery>) {
        self.lock().push(query);
    }

    /// Remove `query`; returns the remaining depth
    fn pop(&self, query: &Arc<ActiveQuery>) -> usize {
        let mut frames = self.lock();
        if let Some(pos) = frames.iter().rposition(|q| Arc::ptr_eq(q, query)) {
            frames.remove(pos);
        }
        frames.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<ActiveQuery>> {
        self.lock().clone()
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ActiveQuery>>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a query on its process's stack for as long as it lives
#[must_use = "the query leaves the stack as soon as the guard is dropped"]
pub struct QueryGuard {
    slot: Arc<ProcSlot>,
    query: Arc<ActiveQuery>,
}

impl QueryGuard {
    pub(crate) fn enter(slot: Arc<ProcSlot>, query: Arc<ActiveQuery>) -> Self {
        slot.stack.push(query.clone());
        slot.set_state(BackendState::Active);
        Self { slot, query }
    }
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        let remaining = self.slot.stack.pop(&self.query);
        debug!(pid = %self.slot.pid(), %remaining, "QueryGuard::drop: popped");
        if remaining == 0 {
            self.slot.set_state(BackendState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str) -> Arc<ActiveQuery> {
        Arc::new(ActiveQuery::new(text, Arc::new(PlanNode::new("Result"))))
    }

    #[test]
    fn test_push_pop_order() {
        let stack = ExecutionStack::new();
        let outer = query("outer");
        let inner = query("inner");
        stack.push(outer.clone());
        stack.push(inner.clone());
        let snapshot = stack.snapshot();
        assert_eq!(snapshot[0].query_text(), "outer");
        assert_eq!(snapshot[1].query_text(), "inner");
        assert_eq!(stack.pop(&inner), 1);
        assert_eq!(stack.pop(&outer), 0);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_pop_out_of_order_removes_right_entry() {
        let stack = ExecutionStack::new();
        let a = query("a");
        let b = query("b");
        stack.push(a.clone());
        stack.push(b.clone());
        stack.pop(&a);
        assert_eq!(stack.snapshot()[0].query_text(), "b");
    }

    #[test]
    fn test_guard_pops_on_panic() {
        use crate::config::Config;
        use crate::host::{Host, UserId};

        let host = Host::new(&Config::default());
        let backend = host.spawn_backend(UserId(1), false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = backend.enter_query("select boom()", Arc::new(PlanNode::new("Result")));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(backend.active_queries().is_empty());
        assert_eq!(backend.state(), BackendState::Idle);
    }
}
