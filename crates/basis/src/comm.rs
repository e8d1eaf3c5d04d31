//! Collective communication layer.
//!
//! The solver core only ever talks to other workers through broadcast,
//! all-reduce, and barrier; there is no peer-to-peer path. Every call is a
//! synchronous barrier from the caller's perspective: a worker that reaches
//! a reduction early blocks until all workers arrive (fail-stop, no
//! timeouts).
//!
//! Two implementations ship here: [`SoloCollective`] for single-worker runs,
//! and [`LocalCluster`], a fixed set of in-process worker threads sharing a
//! barrier and a reduction slot. The trait is shaped so a network transport
//! can replace the local one as a drop-in.

use std::sync::{Arc, Barrier, Mutex};

/// Collective primitives across a fixed set of worker processes.
pub trait Collective: Send + Sync {
    /// This worker's rank in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of workers.
    fn size(&self) -> usize;

    /// Block until every worker has arrived.
    fn barrier(&self);

    /// Replace `buf` on every worker with root's copy.
    fn broadcast(&self, buf: &mut [f64], root: usize);

    /// Element-wise sum `buf` across all workers; every worker ends up with
    /// the identical reduced copy.
    fn allreduce_sum(&self, buf: &mut [f64]);

    /// Collectively abort the run. Used for configuration errors where
    /// proceeding would leave workers in divergent states.
    fn abort(&self, code: i32, reason: &str) -> !;
}

/// Single-worker collective: all synchronization is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoloCollective;

impl Collective for SoloCollective {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn broadcast(&self, _buf: &mut [f64], _root: usize) {}

    fn allreduce_sum(&self, _buf: &mut [f64]) {}

    fn abort(&self, code: i32, reason: &str) -> ! {
        tracing::error!("collective abort (code {}): {}", code, reason);
        std::process::exit(code);
    }
}

struct ClusterShared {
    size: usize,
    barrier: Barrier,
    slot: Mutex<Vec<f64>>,
}

/// Factory for a fixed-size set of in-process collective endpoints.
///
/// Spawn one worker thread per rank and hand each its [`LocalComm`]; the
/// endpoints rendezvous on a shared barrier and reduce through a shared
/// mutex-guarded slot.
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    /// Create a cluster of `size` workers.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "cluster must have at least one worker");
        Self {
            shared: Arc::new(ClusterShared {
                size,
                barrier: Barrier::new(size),
                slot: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Endpoint for worker `rank`.
    pub fn comm(&self, rank: usize) -> LocalComm {
        assert!(rank < self.shared.size);
        LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// One worker's endpoint into a [`LocalCluster`].
pub struct LocalComm {
    rank: usize,
    shared: Arc<ClusterShared>,
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn broadcast(&self, buf: &mut [f64], root: usize) {
        self.shared.barrier.wait();
        if self.rank == root {
            let mut slot = self.shared.slot.lock().unwrap();
            slot.clear();
            slot.extend_from_slice(buf);
        }
        self.shared.barrier.wait();
        if self.rank != root {
            let slot = self.shared.slot.lock().unwrap();
            buf.copy_from_slice(&slot);
        }
        self.shared.barrier.wait();
    }

    fn allreduce_sum(&self, buf: &mut [f64]) {
        self.shared.barrier.wait();
        if self.rank == 0 {
            let mut slot = self.shared.slot.lock().unwrap();
            slot.clear();
            slot.resize(buf.len(), 0.0);
        }
        self.shared.barrier.wait();
        {
            let mut slot = self.shared.slot.lock().unwrap();
            for (s, v) in slot.iter_mut().zip(buf.iter()) {
                *s += v;
            }
        }
        self.shared.barrier.wait();
        {
            let slot = self.shared.slot.lock().unwrap();
            buf.copy_from_slice(&slot);
        }
        self.shared.barrier.wait();
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        tracing::error!(
            "worker {} collective abort (code {}): {}",
            self.rank,
            code,
            reason
        );
        // Fail-stop: taking the process down stops every in-process worker.
        std::process::exit(code);
    }
}
