//! Lamport scalar + vector clock, kept behind a single mutex so the two
//! advance atomically (cSpell:ignore lamport).
//!
//! Owned directly by the dispatcher and ticked inline on every request
//! path, rather than routed through a separate clock service.

use std::sync::Mutex;

/// A snapshot of the clock at the moment some stage completed. Cheap to
/// clone; every `TraceEvent` carries one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub lamport: u64,
    pub vector: Vec<u64>,
}

struct Inner {
    lamport: u64,
    vector: Vec<u64>,
    self_index: usize,
}

/// `self_index` is `node_id - 1`; `num_nodes` sizes the vector.
pub struct Clock {
    inner: Mutex<Inner>,
}

impl Clock {
    pub fn new(self_index: usize, num_nodes: usize) -> Self {
        assert!(self_index < num_nodes, "self index out of range");
        Self {
            inner: Mutex::new(Inner {
                lamport: 0,
                vector: vec![0; num_nodes],
                self_index,
            }),
        }
    }

    /// The clock advances before any locally-initiated observable stage.
    /// Call once per stage, immediately before emitting its trace event.
    pub fn tick_local(&self) -> Snapshot {
        let mut inner = self.inner.lock().unwrap();
        inner.lamport += 1;
        let idx = inner.self_index;
        inner.vector[idx] += 1;
        snapshot(&inner)
    }

    /// On receipt of a message carrying `(lamport, vector)`, fold it into
    /// the local clock and bump our own component. Afterward
    /// `lamport >= max(old, remote) + 1` and
    /// `vector[i] >= max(old[i], remote[i])` for all `i`.
    pub fn merge(&self, remote_lamport: u64, remote_vector: &[u64]) -> Snapshot {
        let mut inner = self.inner.lock().unwrap();
        inner.lamport = inner.lamport.max(remote_lamport) + 1;
        for (local, remote) in inner.vector.iter_mut().zip(remote_vector) {
            *local = (*local).max(*remote);
        }
        let idx = inner.self_index;
        inner.vector[idx] += 1;
        snapshot(&inner)
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().unwrap();
        snapshot(&inner)
    }
}

fn snapshot(inner: &Inner) -> Snapshot {
    Snapshot {
        lamport: inner.lamport,
        vector: inner.vector.clone(),
    }
}

/// `a <= b` componentwise: every component of `a` is no greater than the
/// matching component of `b`.
pub fn vector_leq(a: &[u64], b: &[u64]) -> bool {
    a.iter().zip(b).all(|(x, y)| x <= y)
}

/// `a < b` iff `a <= b` and some component is strictly smaller, i.e. `a`
/// causally precedes `b`.
pub fn vector_lt(a: &[u64], b: &[u64]) -> bool {
    vector_leq(a, b) && a.iter().zip(b).any(|(x, y)| x < y)
}

/// Neither `a <= b` nor `b <= a`: concurrent events.
pub fn vector_concurrent(a: &[u64], b: &[u64]) -> bool {
    !vector_leq(a, b) && !vector_leq(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_local_advances_lamport_and_self_component() {
        let clock = Clock::new(0, 3);
        let a = clock.tick_local();
        let b = clock.tick_local();
        assert!(a.lamport < b.lamport);
        assert!(a.vector[0] < b.vector[0]);
        assert_eq!(b.vector[1], 0);
    }

    #[test]
    fn merge_satisfies_receive_invariant() {
        let clock = Clock::new(1, 3);
        clock.tick_local();
        let before = clock.snapshot();
        let remote_vector = vec![5, 0, 0];
        let after = clock.merge(10, &remote_vector);
        assert!(after.lamport >= before.lamport.max(10) + 1);
        for i in 0..3 {
            assert!(after.vector[i] >= before.vector[i].max(remote_vector[i]));
        }
        assert!(after.vector[1] > before.vector[1]);
    }

    #[test]
    fn vector_ordering_helpers() {
        assert!(vector_lt(&[0, 0], &[1, 0]));
        assert!(!vector_lt(&[1, 0], &[1, 0]));
        assert!(vector_concurrent(&[1, 0], &[0, 1]));
        assert!(vector_leq(&[1, 0], &[1, 1]));
    }
}
