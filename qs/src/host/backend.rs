//! Backend - the handle a process task owns

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{BackendState, Host, Pid, ProcSlot, UserId};
use crate::error::{QueryStateError, Result};
use crate::instrument::PlanNode;
use crate::stack::{ActiveQuery, QueryGuard};

/// One live process
///
/// All waits a process performs go through [`Backend::interruptible`] or
/// [`Backend::check_for_interrupts`], which are its safe points: pending
/// triggers run there, and a raised interrupt aborts the wait.
pub struct Backend {
    host: Host,
    slot: Arc<ProcSlot>,
}

impl Backend {
    pub(super) fn new(host: Host, slot: Arc<ProcSlot>) -> Self {
        Self { host, slot }
    }

    pub fn pid(&self) -> Pid {
        self.slot.pid
    }

    pub fn user_id(&self) -> UserId {
        self.slot.user_id
    }

    pub fn is_superuser(&self) -> bool {
        self.slot.superuser
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn state(&self) -> BackendState {
        self.slot.state()
    }

    pub fn set_state(&self, state: BackendState) {
        debug!(pid = %self.pid(), %state, "Backend::set_state: called");
        self.slot.set_state(state);
    }

    /// Push a running query; it stays on the stack until the guard drops
    pub fn enter_query(&self, query_text: impl Into<String>, plan: Arc<PlanNode>) -> QueryGuard {
        let query = Arc::new(ActiveQuery::new(query_text, plan));
        debug!(pid = %self.pid(), depth = self.slot.stack.depth(), "Backend::enter_query: called");
        QueryGuard::enter(self.slot.clone(), query)
    }

    /// Active queries, outermost first
    pub fn active_queries(&self) -> Vec<Arc<ActiveQuery>> {
        self.slot.stack.snapshot()
    }

    /// Run every trigger delivered since the last safe point
    pub async fn run_pending_triggers(&self) {
        let pending = self.slot.take_pending();
        for trigger in pending {
            match self.host.signals().handler(trigger) {
                Some(handler) => {
                    debug!(pid = %self.pid(), handler = handler.name(), "Backend::run_pending_triggers: running");
                    handler.handle(self).await;
                }
                None => warn!(pid = %self.pid(), %trigger, "no handler registered for trigger"),
            }
        }
    }

    /// Safe point: run pending triggers, then honour a raised interrupt
    pub async fn check_for_interrupts(&self) -> Result<()> {
        self.run_pending_triggers().await;
        if self.slot.take_interrupt() {
            debug!(pid = %self.pid(), "Backend::check_for_interrupts: interrupted");
            return Err(QueryStateError::Interrupted);
        }
        Ok(())
    }

    /// Await `fut` while servicing triggers; a raised interrupt abandons it
    pub async fn interruptible<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::pin!(fut);
        loop {
            self.check_for_interrupts().await?;
            tokio::select! {
                biased;
                _ = self.slot.interrupt.notified() => {}
                _ = self.slot.latch.notified() => {}
                out = &mut fut => return Ok(out),
            }
        }
    }

    /// Sleep at a safe point
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.interruptible(tokio::time::sleep(duration)).await
    }

    /// Idle loop: service triggers until `shutdown` resolves or an interrupt arrives
    pub async fn serve<F: Future>(&self, shutdown: F) {
        debug!(pid = %self.pid(), "Backend::serve: called");
        match self.interruptible(shutdown).await {
            Ok(_) => debug!(pid = %self.pid(), "Backend::serve: shutdown"),
            Err(e) => debug!(pid = %self.pid(), "Backend::serve: {}", e),
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.host.exit(self.slot.pid);
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.slot).finish()
    }
}
