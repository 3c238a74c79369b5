//! Request coordinator
//!
//! Runs inside the requester and drives one snapshot request end to end:
//! validation, the request lock, the permission check, a fresh epoch, helper
//! discovery, the leader round trip and the helper fan-out. The lock and the
//! peer accounting are released by guards on every exit path.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::receive_by_parts;
use crate::error::{QueryStateError, Result};
use crate::host::{Backend, BackendState, Pid};
use crate::identity::{may_inspect, remote_user_id};
use crate::instrument::ExplainFormat;
use crate::shmem::{PeerAccounting, RequestParams};
use crate::wire::{ResultCode, SnapshotMessage, WarningFlags};
use crate::workers::discover_helpers;

/// What the caller asks of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStateRequest {
    pub pid: Pid,
    pub verbose: bool,
    pub costs: bool,
    pub timing: bool,
    pub buffers: bool,
    pub triggers: bool,
    pub format: ExplainFormat,
}

impl QueryStateRequest {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            verbose: false,
            costs: false,
            timing: false,
            buffers: false,
            triggers: false,
            format: ExplainFormat::Text,
        }
    }

    /// Set the output format by name (`text`, `xml`, `json`, `yaml`)
    pub fn with_format(mut self, format: &str) -> Result<Self> {
        self.format = format.parse()?;
        Ok(self)
    }
}

/// One returned frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateRow {
    pub pid: Pid,
    pub frame_number: usize,
    pub query_text: String,
    pub plan: String,
    /// Set for helper rows; `None` for the leader's own frames
    pub leader_pid: Option<Pid>,
}

/// Outcome of a snapshot request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum QueryStateReport {
    /// Leader frames first, then each responding helper's
    Rows {
        rows: Vec<StateRow>,
        warnings: Vec<String>,
        captured_at: DateTime<Utc>,
    },
    /// The target is not executing anything
    NotRunning { backend_state: Option<BackendState> },
    /// Statistics collection is disabled module-wide
    StatDisabled,
    /// Nothing usable came back from the leader
    NoReply,
}

impl QueryStateReport {
    pub fn rows(&self) -> &[StateRow] {
        match self {
            Self::Rows { rows, .. } => rows,
            _ => &[],
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Rows { warnings, .. } => warnings,
            _ => &[],
        }
    }

    /// The informational outcome of `pid` behind an empty report
    ///
    /// `None` for rows and for a leader that did not reply.
    pub fn status(&self, pid: Pid) -> Option<QueryStateError> {
        match self {
            Self::NotRunning { .. } => Some(QueryStateError::NotRunning(pid)),
            Self::StatDisabled => Some(QueryStateError::StatDisabled),
            Self::Rows { .. } | Self::NoReply => None,
        }
    }

    /// Human-readable explanation for an empty result
    pub fn notice(&self) -> Option<String> {
        match self {
            Self::Rows { .. } => None,
            Self::NotRunning {
                backend_state: Some(state),
            } => Some(format!("state of backend is {}", state)),
            Self::NotRunning { backend_state: None } => Some("backend is not running query".to_string()),
            Self::StatDisabled => Some(QueryStateError::StatDisabled.to_string()),
            Self::NoReply => Some("backend does not reply".to_string()),
        }
    }
}

/// Reject replies that belong to another request
pub fn ensure_current(msg: &SnapshotMessage, epoch: u64) -> Result<()> {
    if msg.epoch != epoch {
        return Err(QueryStateError::StaleEpoch {
            expected: epoch,
            got: msg.epoch,
        });
    }
    Ok(())
}

/// Collect the execution state of `request.pid` and its helpers
///
/// The leader is asked first. Helpers are then enlisted together but
/// triggered and collected one at a time, each within the receive timeout. A
/// helper that is gone, times out or detaches is omitted with a warning.
pub async fn pg_query_state(requester: &Backend, request: &QueryStateRequest) -> Result<QueryStateReport> {
    debug!(requester = %requester.pid(), target = %request.pid, "pg_query_state: called");
    let host = requester.host();
    host.triggers()?;
    if request.pid == requester.pid() {
        return Err(QueryStateError::SelfTarget);
    }
    if !host.contains(request.pid) {
        return Err(QueryStateError::NotFound(request.pid));
    }
    let shmem = host.shmem();
    let transport = host.transport();

    let _lock = requester.interruptible(shmem.lock_request()).await?;
    debug!(requester = %requester.pid(), "pg_query_state: lock acquired");
    requester
        .interruptible(shmem.wait_for_drained(transport.receive_timeout()))
        .await?;

    let target_user = remote_user_id(requester, request.pid).await?;
    if !may_inspect(requester, target_user) {
        debug!(requester = %requester.pid(), %target_user, "pg_query_state: permission denied");
        return Err(QueryStateError::PermissionDenied);
    }

    let epoch = shmem.begin_request(RequestParams {
        epoch: 0,
        leader: Some(request.pid),
        verbose: request.verbose,
        costs: request.costs,
        timing: request.timing,
        buffers: request.buffers,
        triggers: request.triggers,
        format: request.format,
    });
    let _accounting = PeerAccounting::new(shmem, epoch);

    let helpers = discover_helpers(requester, request.pid, epoch).await?;
    debug!(%epoch, helpers = helpers.len(), "pg_query_state: discovered helpers");

    let leader = receive_snapshot(requester, request.pid, None).await?;
    if let Err(e) = ensure_current(&leader, epoch) {
        debug!("pg_query_state: {}", e);
        warn!(pid = %request.pid, "backend does not reply");
        return Ok(QueryStateReport::NoReply);
    }
    match leader.result {
        ResultCode::NotRunning => {
            let backend_state = host.backend_state(request.pid);
            let report = QueryStateReport::NotRunning { backend_state };
            if let Some(notice) = report.notice() {
                info!(pid = %request.pid, "{}", notice);
            }
            return Ok(report);
        }
        ResultCode::StatDisabled => {
            info!(pid = %request.pid, "query execution statistics disabled");
            return Ok(QueryStateReport::StatDisabled);
        }
        ResultCode::Returned => {}
    }

    let mut warnings = warning_messages(leader.warnings);
    for warning in &warnings {
        warn!(pid = %request.pid, "{}", warning);
    }
    let mut rows = frame_rows(&leader, None);

    for helper in &helpers {
        shmem.enlist_peer(*helper, epoch);
    }
    for helper in helpers {
        match receive_snapshot(requester, helper, Some(transport.receive_timeout())).await {
            Ok(msg) => match ensure_current(&msg, epoch) {
                Ok(()) if msg.result == ResultCode::Returned => rows.extend(frame_rows(&msg, Some(request.pid))),
                Ok(()) => debug!(%helper, result = %msg.result, "pg_query_state: helper has nothing to report"),
                Err(e) => debug!(%helper, "pg_query_state: discarded reply: {}", e),
            },
            Err(QueryStateError::Interrupted) => return Err(QueryStateError::Interrupted),
            Err(e) => {
                warn!(%helper, "helper omitted from snapshot: {}", e);
                warnings.push(format!("helper {} omitted from snapshot: {}", helper, e));
            }
        }
        shmem.settle_peer(helper, epoch);
    }

    debug!(rows = rows.len(), "pg_query_state: done");
    Ok(QueryStateReport::Rows {
        rows,
        warnings,
        captured_at: Utc::now(),
    })
}

/// Bind the channel to `peer`, trigger it and wait for its snapshot
///
/// `timeout` of `None` waits unconditionally.
async fn receive_snapshot(requester: &Backend, peer: Pid, timeout: Option<Duration>) -> Result<SnapshotMessage> {
    debug!(%peer, ?timeout, "receive_snapshot: called");
    let host = requester.host();
    let shmem = host.shmem();
    let transport = host.transport();
    let triggers = host.triggers()?;

    requester
        .interruptible(shmem.prepare_channel(peer, requester.pid()))
        .await?;
    host.deliver(triggers.snapshot, peer)?;
    let handle = shmem
        .channel()
        .attach(requester.pid())
        .map_err(|e| QueryStateError::Internal(e.to_string()))?;

    let bytes = requester
        .interruptible(receive_by_parts(&handle, timeout, transport))
        .await?
        .map_err(|e| QueryStateError::from_transport(peer, e, timeout.unwrap_or(transport.receive_timeout())))?;
    drop(handle);

    Ok(SnapshotMessage::decode(&bytes)?)
}

fn frame_rows(msg: &SnapshotMessage, leader_pid: Option<Pid>) -> Vec<StateRow> {
    msg.frames
        .iter()
        .enumerate()
        .map(|(frame_number, frame)| StateRow {
            pid: msg.producer,
            frame_number,
            query_text: frame.query_text.clone(),
            plan: frame.plan_text.clone(),
            leader_pid,
        })
        .collect()
}

fn warning_messages(flags: WarningFlags) -> Vec<String> {
    let mut warnings = Vec::new();
    if flags.contains(WarningFlags::TIMING_OFF) {
        warnings.push("timing statistics disabled".to_string());
    }
    if flags.contains(WarningFlags::BUFFERS_OFF) {
        warnings.push("buffers statistics disabled".to_string());
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Frame;

    #[test]
    fn test_stale_reply_rejected() {
        let msg = SnapshotMessage::status(1, Pid(5), ResultCode::NotRunning);
        assert!(ensure_current(&msg, 1).is_ok());
        assert!(matches!(
            ensure_current(&msg, 2),
            Err(QueryStateError::StaleEpoch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_frame_rows_numbering() {
        let msg = SnapshotMessage {
            epoch: 1,
            producer: Pid(9),
            result: ResultCode::Returned,
            warnings: WarningFlags::empty(),
            frames: vec![Frame::new("outer", "p0"), Frame::new("inner", "p1")],
        };
        let rows = frame_rows(&msg, Some(Pid(3)));
        assert_eq!(rows[0].frame_number, 0);
        assert_eq!(rows[1].query_text, "inner");
        assert!(rows.iter().all(|r| r.pid == Pid(9) && r.leader_pid == Some(Pid(3))));
    }

    #[test]
    fn test_warning_messages() {
        let mut flags = WarningFlags::empty();
        assert!(warning_messages(flags).is_empty());
        flags.insert(WarningFlags::TIMING_OFF);
        assert_eq!(warning_messages(flags), vec!["timing statistics disabled".to_string()]);
    }

    #[test]
    fn test_request_format_by_name() {
        let request = QueryStateRequest::new(Pid(1)).with_format("yaml").unwrap();
        assert_eq!(request.format, ExplainFormat::Yaml);
        assert!(matches!(
            QueryStateRequest::new(Pid(1)).with_format("csv"),
            Err(QueryStateError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_report_notice() {
        let report = QueryStateReport::NotRunning {
            backend_state: Some(BackendState::IdleInTransaction),
        };
        assert_eq!(report.notice().unwrap(), "state of backend is idle in transaction");
        assert!(report.rows().is_empty());
        assert_eq!(
            QueryStateReport::StatDisabled.notice().unwrap(),
            "query execution statistics disabled"
        );
    }

    #[test]
    fn test_report_status_codes() {
        let idle = QueryStateReport::NotRunning { backend_state: None };
        assert_eq!(idle.status(Pid(4)).unwrap().code(), "not-running");
        assert_eq!(QueryStateReport::StatDisabled.status(Pid(4)).unwrap().code(), "stat-disabled");
        assert!(QueryStateReport::NoReply.status(Pid(4)).is_none());
        let rows = QueryStateReport::Rows {
            rows: Vec::new(),
            warnings: Vec::new(),
            captured_at: Utc::now(),
        };
        assert!(rows.status(Pid(4)).is_none());
    }
}
