//! Simulated workload
//!
//! Spawns a leader process executing a nested query whose innermost frame
//! scans a table, optionally with helper processes scanning in parallel. The
//! scan counters advance between safe points, so snapshots and progress
//! estimates see a query that is genuinely moving.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::host::{Backend, Host, Pid, UserId};
use crate::instrument::PlanNode;
use crate::stack::QueryGuard;

/// Shape of the simulated job
#[derive(Debug, Clone)]
pub struct SimulatedJob {
    /// Helper processes launched by the leader
    pub helpers: usize,
    /// Nesting depth of the leader's execution stack (at least 1)
    pub depth: usize,
    /// Rows the scan is planned to produce
    pub rows: u64,
    /// Rows produced per step
    pub batch: u64,
    /// Pause between steps
    pub step: Duration,
    /// Helpers that never reach a safe point
    pub unresponsive_helpers: usize,
    /// Effective user of every process of the job
    pub user: UserId,
}

impl Default for SimulatedJob {
    fn default() -> Self {
        Self {
            helpers: 0,
            depth: 1,
            rows: 10_000,
            batch: 500,
            step: Duration::from_millis(50),
            unresponsive_helpers: 0,
            user: UserId(10),
        }
    }
}

/// Handle to a running simulated job
pub struct RunningJob {
    leader: Pid,
    helpers: Vec<Pid>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningJob {
    pub fn leader(&self) -> Pid {
        self.leader
    }

    pub fn helpers(&self) -> &[Pid] {
        &self.helpers
    }

    /// Stop every process of the job and wait for them to exit
    pub async fn shutdown(self) {
        debug!(leader = %self.leader, "RunningJob::shutdown: called");
        let _ = self.stop.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                debug!("RunningJob::shutdown: task failed: {}", e);
            }
        }
    }
}

impl SimulatedJob {
    /// Start the leader and its helpers on `host`
    pub fn spawn(&self, host: &Host) -> RunningJob {
        debug!(helpers = self.helpers, depth = self.depth, rows = self.rows, "SimulatedJob::spawn: called");
        let (stop, stop_rx) = watch::channel(false);
        let leader = host.spawn_backend(self.user, false);
        let leader_pid = leader.pid();

        let scan = Arc::new(
            PlanNode::new("Seq Scan")
                .on("events")
                .rows(self.rows)
                .cost(0.0, self.rows as f64 * 0.0155),
        );
        let innermost = if self.helpers > 0 {
            Arc::new(
                PlanNode::new("Gather")
                    .rows(self.rows)
                    .cost(1000.0, 1000.0 + self.rows as f64 * 0.01)
                    .workers_planned(self.helpers as u32)
                    .child(scan.clone()),
            )
        } else {
            scan.clone()
        };

        // Frames are entered before the tasks start so the job is running on return
        let mut frames = Vec::new();
        for level in 1..self.depth.max(1) {
            frames.push(leader.enter_query(
                format!("select report_level_{}()", level),
                Arc::new(PlanNode::new("Result")),
            ));
        }
        frames.push(leader.enter_query("select * from events where kind = 'click'", innermost.clone()));
        innermost.start_loop();
        let mut nodes = vec![scan];
        if !Arc::ptr_eq(&innermost, &nodes[0]) {
            nodes[0].start_loop();
            nodes.insert(0, innermost.clone());
        }

        let mut tasks = Vec::new();
        let mut helpers = Vec::new();
        let responsive = self.helpers - self.unresponsive_helpers.min(self.helpers);
        for index in 0..self.helpers {
            let helper = host.spawn_backend(self.user, false);
            innermost.launch_worker(helper.pid());
            helpers.push(helper.pid());
            let stop_rx = stop_rx.clone();
            if index < responsive {
                let share = self.rows / (self.helpers as u64 + 1);
                let scan = Arc::new(PlanNode::new("Seq Scan").on("events").rows(share));
                let guard = helper.enter_query("select * from events where kind = 'click'", scan.clone());
                scan.start_loop();
                let job = self.clone();
                tasks.push(tokio::spawn(async move {
                    run(helper, job, vec![guard], vec![scan], stop_rx).await;
                }));
            } else {
                tasks.push(tokio::spawn(stall(helper, stop_rx)));
            }
        }

        let job = self.clone();
        tasks.push(tokio::spawn(run(leader, job, frames, nodes, stop_rx)));
        info!(leader = %leader_pid, helpers = helpers.len(), "simulated job started");

        RunningJob {
            leader: leader_pid,
            helpers,
            stop,
            tasks,
        }
    }
}

/// Execute until done, then idle serving triggers until stopped
async fn run(
    backend: Backend,
    job: SimulatedJob,
    frames: Vec<QueryGuard>,
    nodes: Vec<Arc<PlanNode>>,
    stop: watch::Receiver<bool>,
) {
    let pid = backend.pid();
    let finished = advance(&backend, &job, &nodes, &stop).await;
    drop(frames);
    if finished {
        info!(%pid, "simulated query finished");
    }
    backend.serve(stopped(stop)).await;
}

/// A process that is alive but never reaches a safe point
async fn stall(backend: Backend, stop: watch::Receiver<bool>) {
    debug!(pid = %backend.pid(), "stall: called");
    stopped(stop).await;
}

/// Advance counters until the planned rows are reached; false if stopped early
async fn advance(backend: &Backend, job: &SimulatedJob, nodes: &[Arc<PlanNode>], stop: &watch::Receiver<bool>) -> bool {
    let target = nodes.last().map(|n| n.plan_rows()).unwrap_or(0);
    loop {
        let produced = nodes.last().map(|n| n.actual_rows()).unwrap_or(0);
        if produced >= target {
            return true;
        }
        let rows = next_batch(job.batch).min(target - produced);
        for node in nodes {
            node.add_rows(rows);
            node.add_elapsed(job.step);
            node.add_buffers(rows / 50, rows / 200);
        }
        let stopping = *stop.borrow();
        if stopping || backend.sleep(job.step).await.is_err() {
            return false;
        }
    }
}

/// Batch size with a little jitter
fn next_batch(batch: u64) -> u64 {
    if batch < 4 {
        return batch.max(1);
    }
    let spread = batch / 4;
    rand::rng().random_range(batch - spread..=batch + spread)
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        let stopping = *stop.borrow_and_update();
        if stopping || stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_next_batch_within_spread() {
        for _ in 0..100 {
            let rows = next_batch(100);
            assert!((75..=125).contains(&rows));
        }
        assert_eq!(next_batch(0), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_job_runs_to_completion() {
        let host = Host::new(&Config::default());
        let job = SimulatedJob {
            helpers: 2,
            depth: 2,
            rows: 100,
            batch: 50,
            step: Duration::from_millis(5),
            ..Default::default()
        };
        let running = job.spawn(&host);
        assert_eq!(running.helpers().len(), 2);
        let leader = running.leader();
        assert_eq!(host.backend_state(leader), Some(crate::host::BackendState::Active));
        for _ in 0..200 {
            if host.backend_state(leader) == Some(crate::host::BackendState::Idle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(host.backend_state(leader), Some(crate::host::BackendState::Idle));
        running.shutdown().await;
        assert!(!host.contains(leader));
    }
}
