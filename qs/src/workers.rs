//! Helper discovery
//!
//! The leader is asked which helper processes it launched for its running
//! queries; only helpers still alive are reported.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::channel::{receive_by_parts, send_by_parts};
use crate::error::{QueryStateError, Result};
use crate::host::{Backend, Pid};
use crate::signal::SignalHandler;
use crate::wire::WorkerListMessage;

/// Replies with the pids of this process's live helpers
pub struct WorkerListHandler;

#[async_trait]
impl SignalHandler for WorkerListHandler {
    fn name(&self) -> &str {
        "report-helpers"
    }

    async fn handle(&self, backend: &Backend) {
        let pid = backend.pid();
        let host = backend.host();
        let shmem = host.shmem();
        let epoch = shmem.params().epoch;
        debug!(%pid, %epoch, "WorkerListHandler::handle: called");

        let Some((_guard, handle)) = shmem.claim_sender(pid, epoch, host.transport().send_timeout()).await else {
            return;
        };

        let pids = live_helpers(backend);
        let msg = WorkerListMessage { epoch, pids };
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%pid, "failed to encode helper list: {}", e);
                return;
            }
        };
        if let Err(e) = send_by_parts(&handle, &bytes, host.transport()).await {
            warn!(%pid, "peer seems to have detached: {}", e);
        }
    }
}

/// Helpers launched by any active query of `backend` that are still alive
fn live_helpers(backend: &Backend) -> Vec<Pid> {
    let host = backend.host();
    let mut pids: Vec<Pid> = backend
        .active_queries()
        .iter()
        .flat_map(|q| q.plan().collect_workers())
        .filter(|p| host.contains(*p))
        .collect();
    pids.sort();
    pids.dedup();
    pids
}

/// Ask `leader` for its live helpers, in a single round trip
///
/// A reply tagged with another epoch counts as "no helpers".
pub async fn discover_helpers(requester: &Backend, leader: Pid, epoch: u64) -> Result<Vec<Pid>> {
    debug!(requester = %requester.pid(), %leader, %epoch, "discover_helpers: called");
    let host = requester.host();
    let shmem = host.shmem();
    let transport = host.transport();
    let triggers = host.triggers()?;
    let timeout = transport.receive_timeout();

    requester
        .interruptible(shmem.prepare_channel(leader, requester.pid()))
        .await?;
    host.deliver(triggers.worker_list, leader)?;
    let handle = shmem
        .channel()
        .attach(requester.pid())
        .map_err(|e| QueryStateError::Internal(e.to_string()))?;

    let bytes = requester
        .interruptible(receive_by_parts(&handle, Some(timeout), transport))
        .await?
        .map_err(|e| QueryStateError::from_transport(leader, e, timeout))?;
    drop(handle);

    let msg = WorkerListMessage::decode(&bytes)?;
    if msg.epoch != epoch {
        debug!(got = msg.epoch, %epoch, "discover_helpers: stale helper list discarded");
        return Ok(Vec::new());
    }
    Ok(msg.pids.into_iter().filter(|p| host.contains(*p)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TransportConfig};
    use crate::host::{Host, UserId};
    use crate::instrument::PlanNode;
    use crate::shmem::RequestParams;
    use std::sync::Arc;
    use std::time::Duration;

    fn host() -> Host {
        Host::new(&Config {
            transport: TransportConfig::fast(),
            ..Default::default()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_discover_live_helpers_only() {
        let host = host();
        let requester = host.spawn_backend(UserId(1), true);
        let leader = host.spawn_backend(UserId(1), false);
        let alive = host.spawn_backend(UserId(1), false);
        let gone = host.spawn_backend(UserId(1), false);

        let gather = Arc::new(PlanNode::new("Gather").workers_planned(2));
        gather.launch_worker(alive.pid());
        gather.launch_worker(gone.pid());
        drop(gone);

        let leader_pid = leader.pid();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _query = leader.enter_query("select count(*) from big", gather);
            leader.serve(stop_rx).await;
        });

        let epoch = host.shmem().begin_request(RequestParams::default());
        let helpers = discover_helpers(&requester, leader_pid, epoch).await.unwrap();
        assert_eq!(helpers, vec![alive.pid()]);

        let _ = stop_tx.send(());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unresponsive_leader_times_out() {
        let host = host();
        let requester = host.spawn_backend(UserId(1), true);
        let leader = host.spawn_backend(UserId(1), false);
        let epoch = host.shmem().begin_request(RequestParams::default());
        let result = discover_helpers(&requester, leader.pid(), epoch).await;
        assert!(matches!(result, Err(QueryStateError::Timeout(pid, _)) if pid == leader.pid()));
    }

    #[tokio::test]
    async fn test_interrupt_while_channel_is_busy() {
        let host = host();
        let requester = host.spawn_backend(UserId(1), true);
        let leader = host.spawn_backend(UserId(1), false);
        let epoch = host.shmem().begin_request(RequestParams::default());
        let _busy = host.shmem().lock_channel().await;

        let requester_pid = requester.pid();
        let interrupter = host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            interrupter.interrupt(requester_pid).unwrap();
        });
        let result = discover_helpers(&requester, leader.pid(), epoch).await;
        assert!(matches!(result, Err(QueryStateError::Interrupted)));
    }

    #[tokio::test]
    async fn test_dead_leader_is_delivery_failure() {
        let host = host();
        let requester = host.spawn_backend(UserId(1), true);
        let leader = host.spawn_backend(UserId(1), false);
        let leader_pid = leader.pid();
        drop(leader);
        let epoch = host.shmem().begin_request(RequestParams::default());
        let result = discover_helpers(&requester, leader_pid, epoch).await;
        assert!(matches!(result, Err(QueryStateError::DeliveryFailure(_))));
    }
}
