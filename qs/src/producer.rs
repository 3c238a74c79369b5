//! Snapshot producer
//!
//! Runs inside a target at a safe point: waits to be bound as channel sender
//! for the request it was triggered by, renders its execution stack and sends
//! it. Peer accounting is settled on every exit.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::channel::send_by_parts;
use crate::error::Result;
use crate::host::Backend;
use crate::instrument::ExplainOptions;
use crate::shmem::RequestParams;
use crate::signal::SignalHandler;
use crate::wire::{Frame, ResultCode, SnapshotMessage, WarningFlags};

/// Replies with this process's snapshot
pub struct SnapshotHandler;

#[async_trait]
impl SignalHandler for SnapshotHandler {
    fn name(&self) -> &str {
        "report-snapshot"
    }

    async fn handle(&self, backend: &Backend) {
        let pid = backend.pid();
        let host = backend.host();
        let shmem = host.shmem();
        let params = shmem.params();
        let epoch = params.epoch;
        debug!(%pid, %epoch, "SnapshotHandler::handle: called");

        if let Some((_guard, handle)) = shmem.claim_sender(pid, epoch, host.transport().send_timeout()).await {
            match build_snapshot(backend, &params).and_then(|msg| msg.encode().map_err(Into::into)) {
                Ok(bytes) => {
                    if let Err(e) = send_by_parts(&handle, &bytes, host.transport()).await {
                        warn!(%pid, "peer seems to have detached: {}", e);
                    }
                }
                Err(e) => warn!(%pid, "failed to build snapshot: {}", e),
            }
        }

        if shmem.settle_peer(pid, epoch) {
            debug!(%pid, %epoch, "SnapshotHandler::handle: settled");
        }
    }
}

/// Render the current execution stack of `backend` for `params`
pub fn build_snapshot(backend: &Backend, params: &RequestParams) -> Result<SnapshotMessage> {
    let host = backend.host();
    let toggles = host.shmem().toggles();
    let pid = backend.pid();

    if !toggles.enable() {
        return Ok(SnapshotMessage::status(params.epoch, pid, ResultCode::StatDisabled));
    }
    let queries = backend.active_queries();
    if queries.is_empty() {
        return Ok(SnapshotMessage::status(params.epoch, pid, ResultCode::NotRunning));
    }

    let mut warnings = WarningFlags::empty();
    if params.timing && !toggles.enable_timing() {
        warnings.insert(WarningFlags::TIMING_OFF);
    }
    if params.buffers && !toggles.enable_buffers() {
        warnings.insert(WarningFlags::BUFFERS_OFF);
    }
    let options = ExplainOptions {
        format: params.format,
        verbose: params.verbose,
        costs: params.costs,
        timing: params.timing && toggles.enable_timing(),
        buffers: params.buffers && toggles.enable_buffers(),
        triggers: params.triggers,
    };

    let explainer = host.explainer();
    let frames = queries
        .iter()
        .map(|q| Ok(Frame::new(q.query_text(), explainer.explain(q, &options)?)))
        .collect::<Result<Vec<_>>>()?;
    debug!(%pid, depth = frames.len(), "build_snapshot: rendered");

    Ok(SnapshotMessage {
        epoch: params.epoch,
        producer: pid,
        result: ResultCode::Returned,
        warnings,
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::{Host, UserId};
    use crate::instrument::{ExplainFormat, PlanNode};
    use std::sync::Arc;

    fn params() -> RequestParams {
        RequestParams {
            epoch: 3,
            format: ExplainFormat::Json,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_process_not_running() {
        let host = Host::new(&Config::default());
        let backend = host.spawn_backend(UserId(1), false);
        let msg = build_snapshot(&backend, &params()).unwrap();
        assert_eq!(msg.result, ResultCode::NotRunning);
        assert!(msg.frames.is_empty());
        assert_eq!(msg.epoch, 3);
    }

    #[test]
    fn test_disabled_module() {
        let host = Host::new(&Config::default());
        host.set_enable(false);
        let backend = host.spawn_backend(UserId(1), false);
        let _q = backend.enter_query("select 1", Arc::new(PlanNode::new("Result")));
        let msg = build_snapshot(&backend, &params()).unwrap();
        assert_eq!(msg.result, ResultCode::StatDisabled);
    }

    #[test]
    fn test_frames_outermost_first_with_warnings() {
        let host = Host::new(&Config::default());
        let backend = host.spawn_backend(UserId(1), false);
        let _outer = backend.enter_query("select f()", Arc::new(PlanNode::new("Result")));
        let _inner = backend.enter_query("select * from t", Arc::new(PlanNode::new("Seq Scan").on("t")));
        let msg = build_snapshot(&backend, &RequestParams {
            timing: true,
            buffers: true,
            ..params()
        })
        .unwrap();
        assert_eq!(msg.result, ResultCode::Returned);
        assert_eq!(msg.frames.len(), 2);
        assert_eq!(msg.frames[0].query_text, "select f()");
        assert_eq!(msg.frames[1].query_text, "select * from t");
        assert!(msg.warnings.contains(WarningFlags::TIMING_OFF));
        assert!(msg.warnings.contains(WarningFlags::BUFFERS_OFF));
        assert!(!msg.frames[1].plan_text.contains("Actual Total Time"));
    }

    #[test]
    fn test_timing_enabled_has_no_warning() {
        let host = Host::new(&Config::default());
        host.set_enable_timing(true);
        let backend = host.spawn_backend(UserId(1), false);
        let _q = backend.enter_query("select 1", Arc::new(PlanNode::new("Seq Scan")));
        let msg = build_snapshot(&backend, &RequestParams {
            timing: true,
            ..params()
        })
        .unwrap();
        assert!(msg.warnings.is_empty());
        assert!(msg.frames[0].plan_text.contains("Actual Total Time"));
    }
}
