//! Progress estimation
//!
//! The estimate is the average, over contributing plan nodes, of how far each
//! node got relative to its planned row count. `Result` and `ModifyTable`
//! nodes never contribute; a filtering node counts as done once it has
//! filtered anything. An exact 1.0 is reported as [`ALMOST_DONE`] since only a
//! finished query is complete.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::coordinator::{QueryStateReport, QueryStateRequest, pg_query_state};
use crate::error::{QueryStateError, Result};
use crate::host::{Backend, Pid};
use crate::instrument::ExplainFormat;

/// Returned when no plan node allows an estimate
pub const NO_ESTIMATE: f64 = -1.0;

/// Ceiling for an unfinished query
pub const ALMOST_DONE: f64 = 0.999999;

/// Estimate completion from a JSON-rendered plan
pub fn estimate_progress(plan_text: &str) -> f64 {
    match serde_json::from_str::<Value>(plan_text) {
        Ok(plan) => estimate_plan(&plan),
        Err(e) => {
            debug!("estimate_progress: plan is not JSON: {}", e);
            NO_ESTIMATE
        }
    }
}

/// Estimate completion from a parsed plan document
pub fn estimate_plan(plan: &Value) -> f64 {
    let mut total = 0.0;
    let mut nodes = 0usize;
    walk(plan, &mut total, &mut nodes);
    if nodes == 0 {
        return NO_ESTIMATE;
    }
    let progress = total / nodes as f64;
    if progress >= 1.0 { ALMOST_DONE } else { progress }
}

fn walk(value: &Value, total: &mut f64, nodes: &mut usize) {
    match value {
        Value::Object(map) => {
            if let Some(node_type) = map.get("Node Type").and_then(Value::as_str)
                && let Some(contribution) = node_contribution(node_type, map)
            {
                *total += contribution;
                *nodes += 1;
            }
            for child in map.values() {
                walk(child, total, nodes);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, total, nodes);
            }
        }
        _ => {}
    }
}

fn node_contribution(node_type: &str, node: &serde_json::Map<String, Value>) -> Option<f64> {
    if node_type == "Result" || node_type == "ModifyTable" {
        return None;
    }
    if let Some(removed) = node.get("Rows Removed by Filter") {
        let removed = removed.as_f64().unwrap_or(0.0);
        return Some(if removed != 0.0 { 1.0 } else { 0.0 });
    }
    let actual = node.get("Actual Rows")?.as_f64()?;
    let planned = node.get("Plan Rows")?.as_f64()?;
    Some(if planned > actual { actual / planned } else { 1.0 })
}

/// Estimate from a report: the innermost frame of the leader
pub fn estimate_report(report: &QueryStateReport) -> f64 {
    report
        .rows()
        .iter()
        .rev()
        .find(|row| row.leader_pid.is_none())
        .map(|row| estimate_progress(&row.plan))
        .unwrap_or(NO_ESTIMATE)
}

fn progress_request(pid: Pid) -> QueryStateRequest {
    QueryStateRequest {
        costs: true,
        format: ExplainFormat::Json,
        ..QueryStateRequest::new(pid)
    }
}

/// One-shot progress of `pid`, or [`NO_ESTIMATE`]
pub async fn progress_bar(requester: &Backend, pid: Pid) -> Result<f64> {
    debug!(requester = %requester.pid(), %pid, "progress_bar: called");
    let report = pg_query_state(requester, &progress_request(pid)).await?;
    if let Some(status) = report.status(pid) {
        info!(%pid, code = status.code(), "{}", status);
        return Ok(NO_ESTIMATE);
    }
    let progress = estimate_report(&report);
    if progress < 0.0 {
        info!(%pid, "counting progress is not available");
    }
    Ok(progress)
}

/// Poll progress of `pid` every `interval` until the query finishes
///
/// `observer` sees each strictly increasing estimate, and 1.0 once the query
/// has finished. Returns 1.0 on completion, or [`NO_ESTIMATE`] if no estimate
/// was available. A second poller of the same target is rejected.
pub async fn progress_bar_visual<F>(requester: &Backend, pid: Pid, interval: Duration, mut observer: F) -> Result<f64>
where
    F: FnMut(f64),
{
    debug!(requester = %requester.pid(), %pid, ?interval, "progress_bar_visual: called");
    if interval < Duration::from_secs(1) {
        return Err(QueryStateError::InvalidArgument(format!(
            "polling interval must be at least one second, got {:?}",
            interval
        )));
    }
    let _poller = requester.host().shmem().register_poller(pid)?;

    let mut last = 0.0;
    let mut estimated = false;
    loop {
        let report = pg_query_state(requester, &progress_request(pid)).await?;
        if !matches!(report, QueryStateReport::Rows { .. }) {
            match report.status(pid) {
                Some(status) => info!(%pid, code = status.code(), "{}", status),
                None => debug!(%pid, "progress_bar_visual: backend does not reply"),
            }
            break;
        }
        let progress = estimate_report(&report);
        if progress < 0.0 {
            info!(%pid, "counting progress is not available");
            return Ok(NO_ESTIMATE);
        }
        estimated = true;
        if progress > last {
            info!(%pid, "Progress = {:.6}", progress);
            observer(progress);
            last = progress;
        }
        requester.sleep(interval).await?;
    }

    if !estimated {
        return Ok(NO_ESTIMATE);
    }
    info!(%pid, "Progress = {:.6}", 1.0);
    observer(1.0);
    Ok(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(node: Value) -> String {
        json!({ "Plan": node }).to_string()
    }

    #[test]
    fn test_half_done_node() {
        let text = plan(json!({"Node Type": "Seq Scan", "Plan Rows": 100, "Actual Rows": 50}));
        assert_eq!(estimate_progress(&text), 0.5);
    }

    #[test]
    fn test_overrun_is_clamped() {
        let text = plan(json!({"Node Type": "Seq Scan", "Plan Rows": 100, "Actual Rows": 150}));
        let progress = estimate_progress(&text);
        assert!(progress < 1.0);
        assert_eq!(progress, ALMOST_DONE);
    }

    #[test]
    fn test_no_usable_node() {
        let text = plan(json!({"Node Type": "Result", "Plan Rows": 1, "Actual Rows": 0}));
        assert_eq!(estimate_progress(&text), NO_ESTIMATE);
        assert_eq!(estimate_progress("not json"), NO_ESTIMATE);
        // Costs off: no planned rows
        let text = plan(json!({"Node Type": "Seq Scan", "Actual Rows": 10}));
        assert_eq!(estimate_progress(&text), NO_ESTIMATE);
    }

    #[test]
    fn test_filter_and_skipped_nodes() {
        let text = plan(json!({
            "Node Type": "ModifyTable",
            "Plans": [
                {"Node Type": "Seq Scan", "Plan Rows": 100, "Actual Rows": 25,
                 "Filter": "(x > 1)", "Rows Removed by Filter": 0},
                {"Node Type": "Index Scan", "Plan Rows": 10, "Actual Rows": 5,
                 "Filter": "(y > 1)", "Rows Removed by Filter": 7},
                {"Node Type": "Hash", "Plan Rows": 40, "Actual Rows": 10}
            ]
        }));
        // (0 + 1 + 0.25) / 3
        let progress = estimate_progress(&text);
        assert!((progress - 1.25 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_planned_rows_counts_as_done() {
        let text = plan(json!({
            "Node Type": "Nested Loop", "Plan Rows": 0, "Actual Rows": 0,
            "Plans": [{"Node Type": "Seq Scan", "Plan Rows": 10, "Actual Rows": 0}]
        }));
        assert_eq!(estimate_progress(&text), 0.5);
    }
}
