//! Remote invocation triggers
//!
//! A requester marks a target as addressee of a trigger and wakes it; the target
//! runs the registered handler at its next safe point. Handlers are registered
//! once, when the host is built, into a fixed number of slots.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::host::Backend;

/// Number of custom trigger slots a host offers
pub const DEFAULT_TRIGGER_SLOTS: usize = 8;

/// Identifier returned by [`SignalRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerId(usize);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trigger#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("all {0} trigger slots are in use, cannot register '{1}'")]
    SlotsExhausted(usize, String),
}

/// Work executed inside a target process when its trigger fires
#[async_trait]
pub trait SignalHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, backend: &Backend);
}

/// Fixed-capacity table of registered handlers
pub struct SignalRegistry {
    slots: Vec<Arc<dyn SignalHandler>>,
    capacity: usize,
}

impl SignalRegistry {
    pub fn new(capacity: usize) -> Self {
        debug!(%capacity, "SignalRegistry::new: called");
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Claim the next free slot for `handler`
    pub fn register(&mut self, handler: Arc<dyn SignalHandler>) -> Result<TriggerId, SignalError> {
        debug!(name = handler.name(), "SignalRegistry::register: called");
        if self.slots.len() >= self.capacity {
            return Err(SignalError::SlotsExhausted(self.capacity, handler.name().to_string()));
        }
        self.slots.push(handler);
        Ok(TriggerId(self.slots.len() - 1))
    }

    pub fn handler(&self, id: TriggerId) -> Option<Arc<dyn SignalHandler>> {
        self.slots.get(id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.slots.iter().map(|h| h.name()).collect();
        f.debug_struct("SignalRegistry")
            .field("capacity", &self.capacity)
            .field("handlers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl SignalHandler for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _backend: &Backend) {}
    }

    #[test]
    fn test_register_returns_distinct_ids() {
        let mut registry = SignalRegistry::new(4);
        let a = registry.register(Arc::new(Noop("a"))).unwrap();
        let b = registry.register(Arc::new(Noop("b"))).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.handler(b).unwrap().name(), "b");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_slots_exhausted() {
        let mut registry = SignalRegistry::new(1);
        registry.register(Arc::new(Noop("a"))).unwrap();
        let err = registry.register(Arc::new(Noop("b"))).unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }
}
