//! Effective identity lookup
//!
//! The requester asks a target for the user it runs as, to decide whether it
//! may inspect it. Must be called with the request lock held: the answer
//! travels through the single identity slot in shared memory.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{QueryStateError, Result};
use crate::host::{Backend, Pid, UserId};
use crate::signal::SignalHandler;

/// Publishes this process's effective user id
pub struct IdentityHandler;

#[async_trait]
impl SignalHandler for IdentityHandler {
    fn name(&self) -> &str {
        "report-identity"
    }

    async fn handle(&self, backend: &Backend) {
        debug!(pid = %backend.pid(), "IdentityHandler::handle: called");
        backend
            .host()
            .shmem()
            .identity()
            .publish(backend.pid(), backend.user_id());
    }
}

/// Ask `target` for its effective user id, bounded by the identity timeout
pub async fn remote_user_id(requester: &Backend, target: Pid) -> Result<UserId> {
    debug!(requester = %requester.pid(), %target, "remote_user_id: called");
    let host = requester.host();
    let triggers = host.triggers()?;
    let slot = host.shmem().identity();
    let timeout = host.transport().identity_timeout();

    slot.reset();
    host.deliver(triggers.identity, target)?;
    match requester.interruptible(slot.wait_for(target, timeout)).await? {
        Some(user_id) => Ok(user_id),
        None => Err(QueryStateError::Timeout(target, timeout)),
    }
}

/// Requesters may inspect their own user's processes; privileged ones any
pub fn may_inspect(requester: &Backend, target_user: UserId) -> bool {
    requester.is_superuser() || requester.user_id() == target_user
}
