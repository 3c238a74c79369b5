//! Host environment: the registry of cooperating processes
//!
//! Every participating process is an independent tokio task owning a
//! [`Backend`]. The host keeps one [`ProcSlot`] per live process (identity,
//! privilege, pending triggers, interrupt latch, state) and the
//! [`SharedMemory`] all processes coordinate through. Processes only interact
//! through that shared state and through trigger delivery.

mod backend;

pub use backend::Backend;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{Config, TransportConfig};
use crate::error::{QueryStateError, Result};
use crate::identity::IdentityHandler;
use crate::instrument::{Explainer, RuntimeExplainer};
use crate::producer::SnapshotHandler;
use crate::shmem::SharedMemory;
use crate::signal::{DEFAULT_TRIGGER_SLOTS, SignalHandler, SignalRegistry, TriggerId};
use crate::stack::ExecutionStack;
use crate::workers::WorkerListHandler;

/// First pid handed out by a host
const FIRST_PID: u32 = 4000;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Effective user a process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Activity state of a process as seen by other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendState {
    Idle,
    Active,
    IdleInTransaction,
    FastPath,
    IdleInTransactionAborted,
    Disabled,
    Undefined,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::IdleInTransaction => "idle in transaction",
            Self::FastPath => "fastpath function call",
            Self::IdleInTransactionAborted => "idle in transaction (aborted)",
            Self::Disabled => "disabled",
            Self::Undefined => "undefined",
        };
        write!(f, "{}", s)
    }
}

/// Trigger ids of the three handlers every initialized host carries
#[derive(Debug, Clone, Copy)]
pub struct Triggers {
    pub identity: TriggerId,
    pub snapshot: TriggerId,
    pub worker_list: TriggerId,
}

/// Per-process state visible to other processes
pub struct ProcSlot {
    pub(crate) pid: Pid,
    pub(crate) user_id: UserId,
    pub(crate) superuser: bool,
    pub(crate) stack: ExecutionStack,
    pending: Mutex<Vec<TriggerId>>,
    pub(crate) latch: Notify,
    interrupt_pending: AtomicBool,
    pub(crate) interrupt: Notify,
    state: Mutex<BackendState>,
    alive: AtomicBool,
}

impl ProcSlot {
    fn new(pid: Pid, user_id: UserId, superuser: bool) -> Self {
        Self {
            pid,
            user_id,
            superuser,
            stack: ExecutionStack::new(),
            pending: Mutex::new(Vec::new()),
            latch: Notify::new(),
            interrupt_pending: AtomicBool::new(false),
            interrupt: Notify::new(),
            state: Mutex::new(BackendState::Idle),
            alive: AtomicBool::new(true),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> BackendState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: BackendState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue a trigger; repeated deliveries of one trigger coalesce until it runs
    fn post(&self, trigger: TriggerId) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.contains(&trigger) {
            pending.push(trigger);
        }
        drop(pending);
        self.latch.notify_one();
    }

    pub(crate) fn take_pending(&self) -> Vec<TriggerId> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn raise_interrupt(&self) {
        self.interrupt_pending.store(true, Ordering::Release);
        self.interrupt.notify_one();
    }

    /// Consume a pending interrupt, if any
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt_pending.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for ProcSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcSlot")
            .field("pid", &self.pid)
            .field("user_id", &self.user_id)
            .field("superuser", &self.superuser)
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct HostInner {
    shmem: SharedMemory,
    transport: TransportConfig,
    signals: SignalRegistry,
    triggers: Option<Triggers>,
    explainer: Arc<dyn Explainer>,
    procs: RwLock<HashMap<Pid, Arc<ProcSlot>>>,
    next_pid: AtomicU32,
}

/// Shared handle to the host; cheap to clone
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

/// Builder for [`Host`]
pub struct HostBuilder {
    config: Config,
    trigger_slots: usize,
    explainer: Arc<dyn Explainer>,
    foreign_handlers: Vec<Arc<dyn SignalHandler>>,
}

impl HostBuilder {
    /// Number of custom trigger slots available to all extensions
    pub fn trigger_slots(mut self, slots: usize) -> Self {
        self.trigger_slots = slots;
        self
    }

    /// Replace the plan renderer used by snapshot producers
    pub fn explainer(mut self, explainer: Arc<dyn Explainer>) -> Self {
        self.explainer = explainer;
        self
    }

    /// Register an unrelated handler ahead of ours, consuming a slot
    pub fn foreign_handler(mut self, handler: Arc<dyn SignalHandler>) -> Self {
        self.foreign_handlers.push(handler);
        self
    }

    pub fn build(self) -> Host {
        debug!(trigger_slots = self.trigger_slots, "HostBuilder::build: called");
        let mut signals = SignalRegistry::new(self.trigger_slots);
        for handler in self.foreign_handlers {
            if let Err(e) = signals.register(handler) {
                warn!("HostBuilder::build: {}", e);
            }
        }

        let triggers = match install_handlers(&mut signals) {
            Ok(triggers) => {
                info!("query state module initialized");
                Some(triggers)
            }
            Err(e) => {
                warn!("query state module not loaded: {}", e);
                None
            }
        };

        Host {
            inner: Arc::new(HostInner {
                shmem: SharedMemory::new(&self.config),
                transport: self.config.transport,
                signals,
                triggers,
                explainer: self.explainer,
                procs: RwLock::new(HashMap::new()),
                next_pid: AtomicU32::new(FIRST_PID),
            }),
        }
    }
}

fn install_handlers(signals: &mut SignalRegistry) -> std::result::Result<Triggers, crate::signal::SignalError> {
    Ok(Triggers {
        identity: signals.register(Arc::new(IdentityHandler))?,
        snapshot: signals.register(Arc::new(SnapshotHandler))?,
        worker_list: signals.register(Arc::new(WorkerListHandler))?,
    })
}

impl Host {
    pub fn new(config: &Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: &Config) -> HostBuilder {
        HostBuilder {
            config: config.clone(),
            trigger_slots: DEFAULT_TRIGGER_SLOTS,
            explainer: Arc::new(RuntimeExplainer),
            foreign_handlers: Vec::new(),
        }
    }

    /// Start a new process and return its handle; dropping the handle ends the process
    pub fn spawn_backend(&self, user_id: UserId, superuser: bool) -> Backend {
        let pid = Pid(self.inner.next_pid.fetch_add(1, Ordering::Relaxed));
        debug!(%pid, %user_id, %superuser, "Host::spawn_backend: called");
        let slot = Arc::new(ProcSlot::new(pid, user_id, superuser));
        self.procs_mut().insert(pid, slot.clone());
        Backend::new(self.clone(), slot)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.triggers.is_some()
    }

    pub fn triggers(&self) -> Result<Triggers> {
        self.inner.triggers.ok_or(QueryStateError::NotInitialized)
    }

    pub fn shmem(&self) -> &SharedMemory {
        &self.inner.shmem
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.inner.transport
    }

    pub fn explainer(&self) -> &Arc<dyn Explainer> {
        &self.inner.explainer
    }

    pub(crate) fn signals(&self) -> &SignalRegistry {
        &self.inner.signals
    }

    pub(crate) fn slot(&self, pid: Pid) -> Option<Arc<ProcSlot>> {
        self.procs().get(&pid).cloned()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.slot(pid).is_some_and(|s| s.is_alive())
    }

    pub fn backend_state(&self, pid: Pid) -> Option<BackendState> {
        self.slot(pid).map(|s| s.state())
    }

    /// Pids of all live processes, ascending
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.procs().keys().copied().collect();
        pids.sort();
        pids
    }

    /// Mark `pid` as addressee of `trigger` and wake it; returns immediately
    pub fn deliver(&self, trigger: TriggerId, pid: Pid) -> Result<()> {
        debug!(%trigger, %pid, "Host::deliver: called");
        match self.slot(pid) {
            Some(slot) if slot.is_alive() => {
                slot.post(trigger);
                Ok(())
            }
            _ => {
                debug!(%pid, "Host::deliver: target is gone");
                Err(QueryStateError::DeliveryFailure(pid))
            }
        }
    }

    /// Raise the interrupt latch of `pid`; its current wait aborts with `Interrupted`
    pub fn interrupt(&self, pid: Pid) -> Result<()> {
        debug!(%pid, "Host::interrupt: called");
        let slot = self.slot(pid).ok_or(QueryStateError::NotFound(pid))?;
        slot.raise_interrupt();
        Ok(())
    }

    pub fn set_enable(&self, on: bool) {
        info!(%on, "Host::set_enable: called");
        self.shmem().toggles().set_enable(on);
    }

    pub fn set_enable_timing(&self, on: bool) {
        info!(%on, "Host::set_enable_timing: called");
        self.shmem().toggles().set_enable_timing(on);
    }

    pub fn set_enable_buffers(&self, on: bool) {
        info!(%on, "Host::set_enable_buffers: called");
        self.shmem().toggles().set_enable_buffers(on);
    }

    /// Process exit: drop the slot and release anything it held on the channel
    pub(crate) fn exit(&self, pid: Pid) {
        debug!(%pid, "Host::exit: called");
        if let Some(slot) = self.procs_mut().remove(&pid) {
            slot.alive.store(false, Ordering::Release);
            slot.latch.notify_one();
        }
        self.shmem().channel().detach_process(pid);
    }

    fn procs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Pid, Arc<ProcSlot>>> {
        self.inner.procs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn procs_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Pid, Arc<ProcSlot>>> {
        self.inner.procs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("initialized", &self.is_initialized())
            .field("signals", &self.inner.signals)
            .field("pids", &self.pids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn test_backend_state_strings() {
        assert_eq!(BackendState::IdleInTransaction.to_string(), "idle in transaction");
        assert_eq!(
            BackendState::IdleInTransactionAborted.to_string(),
            "idle in transaction (aborted)"
        );
        assert_eq!(BackendState::FastPath.to_string(), "fastpath function call");
    }

    #[test]
    fn test_spawned_pids_are_unique() {
        let host = Host::new(&Config::default());
        let a = host.spawn_backend(UserId(10), false);
        let b = host.spawn_backend(UserId(10), false);
        assert_ne!(a.pid(), b.pid());
        assert!(host.contains(a.pid()));
        assert_eq!(host.pids(), vec![a.pid(), b.pid()]);
    }

    #[test]
    fn test_dropping_backend_removes_process() {
        let host = Host::new(&Config::default());
        let backend = host.spawn_backend(UserId(10), false);
        let pid = backend.pid();
        drop(backend);
        assert!(!host.contains(pid));
        let triggers = host.triggers().unwrap();
        assert!(matches!(
            host.deliver(triggers.snapshot, pid),
            Err(QueryStateError::DeliveryFailure(p)) if p == pid
        ));
    }

    #[test]
    fn test_repeated_delivery_coalesces() {
        let host = Host::new(&Config::default());
        let backend = host.spawn_backend(UserId(10), false);
        let triggers = host.triggers().unwrap();
        host.deliver(triggers.identity, backend.pid()).unwrap();
        host.deliver(triggers.identity, backend.pid()).unwrap();
        let slot = host.slot(backend.pid()).unwrap();
        assert_eq!(slot.take_pending(), vec![triggers.identity]);
    }

    struct Foreign;

    #[async_trait]
    impl SignalHandler for Foreign {
        fn name(&self) -> &str {
            "foreign"
        }

        async fn handle(&self, _backend: &Backend) {}
    }

    #[test]
    fn test_exhausted_slots_leave_module_uninitialized() {
        let host = Host::builder(&Config::default())
            .trigger_slots(3)
            .foreign_handler(Arc::new(Foreign))
            .build();
        assert!(!host.is_initialized());
        assert!(matches!(host.triggers(), Err(QueryStateError::NotInitialized)));
    }

    #[test]
    fn test_interrupt_unknown_pid() {
        let host = Host::new(&Config::default());
        assert!(matches!(host.interrupt(Pid(1)), Err(QueryStateError::NotFound(_))));
    }
}
