//! Bounded single-producer / single-consumer byte channel
//!
//! One [`Channel`] lives in shared memory and is reused serially: every cycle
//! calls [`Channel::create`], binds a sender and a receiver, and each side
//! attaches a [`ChannelHandle`]. Recreating the channel invalidates handles of
//! the previous cycle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::host::Pid;

/// Outcomes of channel operations other than success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation would block")]
    WouldBlock,

    #[error("counterpart detached from the channel")]
    Detached,

    #[error("timed out waiting on the channel")]
    TimedOut,

    #[error("chunk of {len} bytes exceeds channel capacity of {capacity} bytes")]
    Oversized { len: usize, capacity: usize },

    #[error("process {0} is not bound to the channel")]
    NotBound(Pid),

    #[error("malformed transfer: {0}")]
    Malformed(&'static str),
}

/// Which end of the channel a handle holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Default)]
struct ChannelState {
    generation: u64,
    capacity: usize,
    sender: Option<Pid>,
    receiver: Option<Pid>,
    chunks: VecDeque<Vec<u8>>,
    used: usize,
    sender_detached: bool,
    receiver_detached: bool,
}

/// The shared channel slot
#[derive(Debug)]
pub struct Channel {
    state: Mutex<ChannelState>,
    changed: Notify,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                capacity,
                ..Default::default()
            }),
            changed: Notify::new(),
        }
    }

    /// Reset the slot for a new cycle, dropping queued data and bindings
    pub fn create(&self, capacity: usize) {
        let mut state = self.lock();
        let generation = state.generation + 1;
        debug!(%generation, %capacity, "Channel::create: called");
        *state = ChannelState {
            generation,
            capacity,
            ..Default::default()
        };
        drop(state);
        self.changed.notify_waiters();
    }

    pub fn set_sender(&self, pid: Pid) {
        debug!(%pid, "Channel::set_sender: called");
        self.lock().sender = Some(pid);
        self.changed.notify_waiters();
    }

    pub fn set_receiver(&self, pid: Pid) {
        debug!(%pid, "Channel::set_receiver: called");
        self.lock().receiver = Some(pid);
        self.changed.notify_waiters();
    }

    /// Bytes currently queued
    pub fn used(&self) -> usize {
        self.lock().used
    }

    /// Wait until `pid` is bound as sender of the current cycle
    pub async fn wait_for_sender(&self, pid: Pid, timeout: Duration) -> bool {
        debug!(%pid, ?timeout, "Channel::wait_for_sender: called");
        let wait = async {
            loop {
                let notified = self.changed.notified();
                {
                    let state = self.lock();
                    if state.sender == Some(pid) && !state.sender_detached {
                        return;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Attach to the current cycle in the role `pid` is bound to
    pub fn attach(self: &Arc<Self>, pid: Pid) -> Result<ChannelHandle, TransportError> {
        let state = self.lock();
        let role = if state.sender == Some(pid) {
            Role::Sender
        } else if state.receiver == Some(pid) {
            Role::Receiver
        } else {
            return Err(TransportError::NotBound(pid));
        };
        debug!(%pid, ?role, generation = state.generation, "Channel::attach: called");
        Ok(ChannelHandle {
            channel: self.clone(),
            generation: state.generation,
            role,
            pid,
        })
    }

    /// Release whatever end `pid` holds; used when a process exits
    pub fn detach_process(&self, pid: Pid) {
        let mut state = self.lock();
        let mut touched = false;
        if state.sender == Some(pid) {
            state.sender_detached = true;
            touched = true;
        }
        if state.receiver == Some(pid) {
            state.receiver_detached = true;
            touched = true;
        }
        drop(state);
        if touched {
            debug!(%pid, "Channel::detach_process: released");
            self.changed.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One attached end of the channel; dropping it detaches
#[derive(Debug)]
pub struct ChannelHandle {
    channel: Arc<Channel>,
    generation: u64,
    role: Role,
    pid: Pid,
}

impl ChannelHandle {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Enqueue one chunk without waiting
    pub fn try_send(&self, chunk: &[u8]) -> Result<(), TransportError> {
        if self.role != Role::Sender {
            return Err(TransportError::NotBound(self.pid));
        }
        let mut state = self.channel.lock();
        if state.generation != self.generation || state.receiver_detached || state.sender_detached {
            return Err(TransportError::Detached);
        }
        if chunk.len() > state.capacity {
            return Err(TransportError::Oversized {
                len: chunk.len(),
                capacity: state.capacity,
            });
        }
        if state.used + chunk.len() > state.capacity {
            return Err(TransportError::WouldBlock);
        }
        state.used += chunk.len();
        state.chunks.push_back(chunk.to_vec());
        drop(state);
        self.channel.changed.notify_waiters();
        Ok(())
    }

    /// Enqueue one chunk, waiting for room unless `nowait`
    pub async fn send(&self, chunk: &[u8], nowait: bool) -> Result<(), TransportError> {
        loop {
            let notified = self.channel.changed.notified();
            match self.try_send(chunk) {
                Err(TransportError::WouldBlock) if !nowait => notified.await,
                other => return other,
            }
        }
    }

    /// Dequeue one chunk without waiting
    ///
    /// Data queued before the sender detached is still delivered.
    pub fn try_receive(&self) -> Result<Vec<u8>, TransportError> {
        if self.role != Role::Receiver {
            return Err(TransportError::NotBound(self.pid));
        }
        let mut state = self.channel.lock();
        if state.generation != self.generation || state.receiver_detached {
            return Err(TransportError::Detached);
        }
        if let Some(chunk) = state.chunks.pop_front() {
            state.used -= chunk.len();
            drop(state);
            self.channel.changed.notify_waiters();
            return Ok(chunk);
        }
        if state.sender_detached {
            return Err(TransportError::Detached);
        }
        Err(TransportError::WouldBlock)
    }

    /// Dequeue one chunk, waiting for data unless `nowait`
    pub async fn receive(&self, nowait: bool) -> Result<Vec<u8>, TransportError> {
        loop {
            let notified = self.channel.changed.notified();
            match self.try_receive() {
                Err(TransportError::WouldBlock) if !nowait => notified.await,
                other => return other,
            }
        }
    }

    /// Dequeue one chunk, waiting at most `timeout`
    pub async fn receive_with_timeout(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        match tokio::time::timeout(timeout, self.receive(false)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::TimedOut),
        }
    }

    /// Release this end explicitly
    pub fn detach(self) {}
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        let mut state = self.channel.lock();
        if state.generation != self.generation {
            return;
        }
        match self.role {
            Role::Sender => state.sender_detached = true,
            Role::Receiver => state.receiver_detached = true,
        }
        drop(state);
        debug!(pid = %self.pid, role = ?self.role, "ChannelHandle::drop: detached");
        self.channel.changed.notify_waiters();
    }
}
