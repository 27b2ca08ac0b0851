//! Leader-elected distributed mutex. `MutexCoordinator` is
//! the server-side state every node carries (meaningful only while that
//! node is leader); `acquire`/`release` are the client-side protocol any
//! node runs against whoever the current leader is.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::debug;

use crate::{gossip::Gossip, net};

const LOCK_BACKOFF: Duration = Duration::from_millis(50);
const LOCK_IO_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, PartialEq, Eq)]
pub enum ReqOutcome {
    Granted,
    Queued,
}

struct State {
    held_by: Option<u8>,
    waiters: VecDeque<u8>,
}

/// FIFO wait queue guarded by a single mutex.
pub struct MutexCoordinator {
    state: Mutex<State>,
}

impl Default for MutexCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexCoordinator {
    pub fn new() -> Self {
        Self { state: Mutex::new(State { held_by: None, waiters: VecDeque::new() }) }
    }

    pub fn req(&self, node_id: u8) -> ReqOutcome {
        let mut state = self.state.lock().unwrap();
        if state.held_by.is_none() {
            state.held_by = Some(node_id);
            return ReqOutcome::Granted;
        }
        if !state.waiters.contains(&node_id) {
            state.waiters.push_back(node_id);
        }
        ReqOutcome::Queued
    }

    /// No-op unless `node_id` is the current holder. Pops the next waiter
    /// into `held_by` if any, but does not proactively notify them --
    /// queued waiters learn they were granted only by retrying `LOCK_REQ`.
    pub fn rel(&self, node_id: u8) -> Option<u8> {
        let mut state = self.state.lock().unwrap();
        if state.held_by != Some(node_id) {
            return None;
        }
        state.held_by = None;
        if let Some(next) = state.waiters.pop_front() {
            state.held_by = Some(next);
            return Some(next);
        }
        None
    }

    pub fn held_by(&self) -> Option<u8> {
        self.state.lock().unwrap().held_by
    }
}

/// Opt-out switch: when disabled, PUT skips mutex acquisition entirely,
/// producing the racy interleavings the trace collector is designed to
/// reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexMode {
    Enabled,
    Disabled,
}

/// Client-side acquisition, modeled as the loop:
/// `LookupLeader -> SendReq -> AwaitGrant -> Backoff -> LookupLeader`.
/// Retries are unbounded by design: there is no timeout, so this retries
/// forever rather than giving up.
pub async fn acquire(self_id: u8, gossip: &Arc<Gossip>, local_coordinator: &MutexCoordinator) {
    loop {
        let Some(leader) = gossip.leader() else {
            tokio::time::sleep(LOCK_BACKOFF).await;
            continue;
        };
        if leader == self_id {
            if local_coordinator.req(self_id) == ReqOutcome::Granted {
                return;
            }
            tokio::time::sleep(LOCK_BACKOFF).await;
            continue;
        }
        let Some(addr) = gossip.stream_addr_of(leader) else {
            tokio::time::sleep(LOCK_BACKOFF).await;
            continue;
        };
        let request = format!("LOCK_REQ {self_id}\n");
        match net::send_request(addr, &request, LOCK_IO_TIMEOUT).await {
            Ok(resp) if resp == "GRANTED" => return,
            Ok(_) => {}
            Err(err) => debug!(%err, leader, "lock request failed, retrying from leader lookup"),
        }
        tokio::time::sleep(LOCK_BACKOFF).await;
    }
}

/// Releases the mutex to whoever is leader *right now* -- may differ from
/// who granted it -- a known, accepted limitation.
pub async fn release(self_id: u8, gossip: &Arc<Gossip>, local_coordinator: &MutexCoordinator) {
    let Some(leader) = gossip.leader() else { return };
    if leader == self_id {
        local_coordinator.rel(self_id);
        return;
    }
    let Some(addr) = gossip.stream_addr_of(leader) else { return };
    let request = format!("LOCK_REL {self_id}\n");
    if let Err(err) = net::send_request(addr, &request, LOCK_IO_TIMEOUT).await {
        debug!(%err, leader, "lock release failed, dropping per best-effort policy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_requester_is_granted_immediately() {
        let coord = MutexCoordinator::new();
        assert_eq!(coord.req(1), ReqOutcome::Granted);
    }

    #[test]
    fn second_requester_is_queued() {
        let coord = MutexCoordinator::new();
        assert_eq!(coord.req(1), ReqOutcome::Granted);
        assert_eq!(coord.req(2), ReqOutcome::Queued);
    }

    #[test]
    fn duplicate_waiter_is_not_enqueued_twice() {
        let coord = MutexCoordinator::new();
        coord.req(1);
        coord.req(2);
        coord.req(2);
        coord.rel(1);
        assert_eq!(coord.held_by(), Some(2));
        assert_eq!(coord.rel(2), None);
        assert_eq!(coord.held_by(), None);
    }

    #[test]
    fn release_by_non_holder_is_noop() {
        let coord = MutexCoordinator::new();
        coord.req(1);
        assert_eq!(coord.rel(2), None);
        assert_eq!(coord.held_by(), Some(1));
    }

    #[test]
    fn fifo_order_across_waiters() {
        let coord = MutexCoordinator::new();
        coord.req(1);
        coord.req(2);
        coord.req(3);
        assert_eq!(coord.rel(1), Some(2));
        assert_eq!(coord.rel(2), Some(3));
        assert_eq!(coord.rel(3), None);
    }
}
