//! Shared coordination state
//!
//! Everything processes coordinate through lives here: the request lock that
//! serializes requesters, the channel lock that serializes channel setup
//! against producers, the request epoch and parameters, the outstanding-peer
//! accounting, the identity slot and the module toggles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelHandle, Role};
use crate::config::Config;
use crate::error::{QueryStateError, Result};
use crate::host::{Pid, UserId};
use crate::instrument::ExplainFormat;

/// Held for the whole of one request
pub type RequestLock = OwnedMutexGuard<()>;

/// Parameters of the request currently being served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParams {
    pub epoch: u64,
    pub leader: Option<Pid>,
    pub verbose: bool,
    pub costs: bool,
    pub timing: bool,
    pub buffers: bool,
    pub triggers: bool,
    pub format: ExplainFormat,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            epoch: 0,
            leader: None,
            verbose: false,
            costs: false,
            timing: false,
            buffers: false,
            triggers: false,
            format: ExplainFormat::Text,
        }
    }
}

/// Live module-wide switches
#[derive(Debug)]
pub struct ModuleToggles {
    enable: AtomicBool,
    enable_timing: AtomicBool,
    enable_buffers: AtomicBool,
}

impl ModuleToggles {
    fn new(config: &Config) -> Self {
        Self {
            enable: AtomicBool::new(config.module.enable),
            enable_timing: AtomicBool::new(config.module.enable_timing),
            enable_buffers: AtomicBool::new(config.module.enable_buffers),
        }
    }

    pub fn enable(&self) -> bool {
        self.enable.load(Ordering::Acquire)
    }

    pub fn enable_timing(&self) -> bool {
        self.enable_timing.load(Ordering::Acquire)
    }

    pub fn enable_buffers(&self) -> bool {
        self.enable_buffers.load(Ordering::Acquire)
    }

    pub fn set_enable(&self, on: bool) {
        self.enable.store(on, Ordering::Release);
    }

    pub fn set_enable_timing(&self, on: bool) {
        self.enable_timing.store(on, Ordering::Release);
    }

    pub fn set_enable_buffers(&self, on: bool) {
        self.enable_buffers.store(on, Ordering::Release);
    }
}

/// Where a target publishes its effective user id
#[derive(Debug, Default)]
pub struct IdentitySlot {
    answer: Mutex<Option<(Pid, UserId)>>,
    ready: Notify,
}

impl IdentitySlot {
    pub fn reset(&self) {
        *self.lock() = None;
    }

    pub fn publish(&self, pid: Pid, user_id: UserId) {
        debug!(%pid, %user_id, "IdentitySlot::publish: called");
        *self.lock() = Some((pid, user_id));
        self.ready.notify_waiters();
    }

    /// Wait until `pid` has published its identity
    pub async fn wait_for(&self, pid: Pid, timeout: Duration) -> Option<UserId> {
        let wait = async {
            loop {
                let notified = self.ready.notified();
                let answer = *self.lock();
                if let Some((published, user_id)) = answer
                    && published == pid
                {
                    return user_id;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    fn lock(&self) -> MutexGuard<'_, Option<(Pid, UserId)>> {
        self.answer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The shared memory segment
#[derive(Debug)]
pub struct SharedMemory {
    request_lock: Arc<tokio::sync::Mutex<()>>,
    channel_lock: tokio::sync::Mutex<()>,
    channel: Arc<Channel>,
    queue_size: usize,
    epoch: AtomicU64,
    params: RwLock<RequestParams>,
    outstanding_peers: AtomicU32,
    roster: Mutex<HashMap<Pid, u64>>,
    drained: Notify,
    identity: IdentitySlot,
    toggles: ModuleToggles,
    pollers: Mutex<HashSet<Pid>>,
}

impl SharedMemory {
    pub fn new(config: &Config) -> Self {
        debug!(queue_size = config.transport.queue_size, "SharedMemory::new: called");
        Self {
            request_lock: Arc::new(tokio::sync::Mutex::new(())),
            channel_lock: tokio::sync::Mutex::new(()),
            channel: Arc::new(Channel::new(config.transport.queue_size)),
            queue_size: config.transport.queue_size,
            epoch: AtomicU64::new(0),
            params: RwLock::new(RequestParams::default()),
            outstanding_peers: AtomicU32::new(0),
            roster: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            identity: IdentitySlot::default(),
            toggles: ModuleToggles::new(config),
            pollers: Mutex::new(HashSet::new()),
        }
    }

    /// Acquire the exclusive request lock
    pub async fn lock_request(&self) -> RequestLock {
        self.request_lock.clone().lock_owned().await
    }

    pub fn try_lock_request(&self) -> Option<RequestLock> {
        self.request_lock.clone().try_lock_owned().ok()
    }

    /// Serializes channel setup against producers sending on it
    pub async fn lock_channel(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.channel_lock.lock().await
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Recreate the channel for one transfer from `sender` to `receiver`
    pub async fn prepare_channel(&self, sender: Pid, receiver: Pid) {
        let _guard = self.lock_channel().await;
        self.channel.create(self.queue_size);
        self.channel.set_sender(sender);
        self.channel.set_receiver(receiver);
    }

    /// Producer side: wait to be bound as sender for `epoch` and attach
    ///
    /// The returned guard keeps the channel from being recreated while the
    /// producer sends. `None` means the request moved on without us.
    pub async fn claim_sender(
        &self,
        pid: Pid,
        epoch: u64,
        timeout: Duration,
    ) -> Option<(tokio::sync::MutexGuard<'_, ()>, ChannelHandle)> {
        if !self.channel.wait_for_sender(pid, timeout).await {
            warn!(%pid, %epoch, "timed out waiting to be bound as channel sender");
            return None;
        }
        let guard = self.lock_channel().await;
        // A newer request may own this binding and has its own trigger queued
        if self.current_epoch() != epoch {
            debug!(%pid, %epoch, current = self.current_epoch(), "SharedMemory::claim_sender: stale request");
            return None;
        }
        match self.channel.attach(pid) {
            Ok(handle) if handle.role() == Role::Sender => Some((guard, handle)),
            _ => {
                debug!(%pid, "SharedMemory::claim_sender: no longer bound as sender");
                None
            }
        }
    }

    pub fn identity(&self) -> &IdentitySlot {
        &self.identity
    }

    pub fn toggles(&self) -> &ModuleToggles {
        &self.toggles
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Issue a fresh epoch and publish `params` under it
    pub fn begin_request(&self, mut params: RequestParams) -> u64 {
        let mut slot = self.params.write().unwrap_or_else(PoisonError::into_inner);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        params.epoch = epoch;
        *slot = params;
        debug!(%epoch, "SharedMemory::begin_request: called");
        epoch
    }

    pub fn params(&self) -> RequestParams {
        self.params.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn outstanding_peers(&self) -> u32 {
        self.outstanding_peers.load(Ordering::Acquire)
    }

    /// Count `pid` as a helper owing a reply for `epoch`
    pub fn enlist_peer(&self, pid: Pid, epoch: u64) {
        let mut roster = self.roster();
        if roster.insert(pid, epoch).is_none() {
            self.outstanding_peers.fetch_add(1, Ordering::AcqRel);
        }
        debug!(%pid, %epoch, outstanding = self.outstanding_peers(), "SharedMemory::enlist_peer: called");
    }

    /// Resolve `pid`'s obligation for `epoch`; only the first call counts
    pub fn settle_peer(&self, pid: Pid, epoch: u64) -> bool {
        let mut roster = self.roster();
        if roster.get(&pid) != Some(&epoch) {
            return false;
        }
        roster.remove(&pid);
        let remaining = self.outstanding_peers.fetch_sub(1, Ordering::AcqRel) - 1;
        drop(roster);
        debug!(%pid, %epoch, %remaining, "SharedMemory::settle_peer: settled");
        if remaining == 0 {
            self.drained.notify_waiters();
        }
        true
    }

    /// Resolve every obligation still open for `epoch`
    pub fn settle_all(&self, epoch: u64) -> usize {
        let pids: Vec<Pid> = self
            .roster()
            .iter()
            .filter(|(_, e)| **e == epoch)
            .map(|(pid, _)| *pid)
            .collect();
        pids.into_iter().filter(|pid| self.settle_peer(*pid, epoch)).count()
    }

    /// Wait for every peer of the previous request to finish
    ///
    /// On expiry the accounting is reset and `false` is returned.
    pub async fn wait_for_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.outstanding_peers() == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_ok() {
            return true;
        }
        warn!("last request was interrupted");
        self.roster().clear();
        self.outstanding_peers.store(0, Ordering::Release);
        false
    }

    /// Claim the right to poll progress of `target`
    pub fn register_poller(&self, target: Pid) -> Result<PollerGuard<'_>> {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        if !pollers.insert(target) {
            return Err(QueryStateError::AlreadyPolling(target));
        }
        Ok(PollerGuard { shmem: self, target })
    }

    fn roster(&self) -> MutexGuard<'_, HashMap<Pid, u64>> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles whatever a request left open when it ends
pub struct PeerAccounting<'a> {
    shmem: &'a SharedMemory,
    epoch: u64,
}

impl<'a> PeerAccounting<'a> {
    pub fn new(shmem: &'a SharedMemory, epoch: u64) -> Self {
        Self { shmem, epoch }
    }
}

impl Drop for PeerAccounting<'_> {
    fn drop(&mut self) {
        let settled = self.shmem.settle_all(self.epoch);
        if settled > 0 {
            debug!(epoch = self.epoch, %settled, "PeerAccounting::drop: settled abandoned peers");
        }
    }
}

/// Registration of a progress poller; released on drop
pub struct PollerGuard<'a> {
    shmem: &'a SharedMemory,
    target: Pid,
}

impl Drop for PollerGuard<'_> {
    fn drop(&mut self) {
        self.shmem
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shmem() -> SharedMemory {
        SharedMemory::new(&Config::default())
    }

    #[test]
    fn test_epochs_strictly_increase() {
        let shmem = shmem();
        let first = shmem.begin_request(RequestParams::default());
        let second = shmem.begin_request(RequestParams {
            verbose: true,
            ..Default::default()
        });
        assert!(second > first);
        assert_eq!(shmem.current_epoch(), second);
        let params = shmem.params();
        assert_eq!(params.epoch, second);
        assert!(params.verbose);
    }

    #[test]
    fn test_settle_exactly_once() {
        let shmem = shmem();
        shmem.enlist_peer(Pid(1), 5);
        shmem.enlist_peer(Pid(2), 5);
        assert_eq!(shmem.outstanding_peers(), 2);
        assert!(shmem.settle_peer(Pid(1), 5));
        assert!(!shmem.settle_peer(Pid(1), 5));
        // Wrong epoch does not settle
        assert!(!shmem.settle_peer(Pid(2), 4));
        assert_eq!(shmem.outstanding_peers(), 1);
        assert_eq!(shmem.settle_all(5), 1);
        assert_eq!(shmem.outstanding_peers(), 0);
    }

    #[test]
    fn test_peer_accounting_guard() {
        let shmem = shmem();
        {
            let _accounting = PeerAccounting::new(&shmem, 3);
            shmem.enlist_peer(Pid(7), 3);
            shmem.enlist_peer(Pid(8), 3);
            shmem.settle_peer(Pid(7), 3);
        }
        assert_eq!(shmem.outstanding_peers(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_drained_resets_on_timeout() {
        let shmem = shmem();
        shmem.enlist_peer(Pid(1), 1);
        assert!(!shmem.wait_for_drained(Duration::from_millis(20)).await);
        assert_eq!(shmem.outstanding_peers(), 0);
        assert!(!shmem.settle_peer(Pid(1), 1));
    }

    #[tokio::test]
    async fn test_wait_for_drained_wakes_on_settle() {
        let shmem = Arc::new(shmem());
        shmem.enlist_peer(Pid(1), 1);
        let settler = shmem.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            settler.settle_peer(Pid(1), 1);
        });
        assert!(shmem.wait_for_drained(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_request_lock_is_exclusive() {
        let shmem = shmem();
        let held = shmem.lock_request().await;
        assert!(shmem.try_lock_request().is_none());
        drop(held);
        assert!(shmem.try_lock_request().is_some());
    }

    #[tokio::test]
    async fn test_stale_producer_leaves_newer_binding() {
        let shmem = shmem();
        let stale = shmem.begin_request(RequestParams::default());
        let current = shmem.begin_request(RequestParams::default());
        shmem.prepare_channel(Pid(1), Pid(2)).await;

        assert!(shmem.claim_sender(Pid(1), stale, Duration::from_millis(20)).await.is_none());

        let (_guard, tx) = shmem
            .claim_sender(Pid(1), current, Duration::from_millis(20))
            .await
            .expect("current producer is still bound");
        let rx = shmem.channel().attach(Pid(2)).unwrap();
        tx.try_send(b"fresh").unwrap();
        assert_eq!(rx.try_receive().unwrap(), b"fresh");
    }

    #[test]
    fn test_second_poller_rejected() {
        let shmem = shmem();
        let first = shmem.register_poller(Pid(9)).unwrap();
        assert!(matches!(
            shmem.register_poller(Pid(9)),
            Err(QueryStateError::AlreadyPolling(Pid(9)))
        ));
        drop(first);
        assert!(shmem.register_poller(Pid(9)).is_ok());
    }

    #[tokio::test]
    async fn test_identity_slot_matches_pid() {
        let slot = IdentitySlot::default();
        slot.publish(Pid(1), UserId(10));
        assert_eq!(slot.wait_for(Pid(2), Duration::from_millis(20)).await, None);
        assert_eq!(slot.wait_for(Pid(1), Duration::from_millis(20)).await, Some(UserId(10)));
        slot.reset();
        assert_eq!(slot.wait_for(Pid(1), Duration::from_millis(20)).await, None);
    }
}
