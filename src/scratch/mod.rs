//! Pre-allocated per-thread search scratch and the pool that hands it out.
//!
//! A query borrows one [`ThreadData`] slot for its whole lifetime and
//! returns it on drop. Slots are never freed mid-query and `reset` keeps
//! every capacity, so steady-state search does not allocate.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};

use crate::defaults::{MAX_N_SECTOR_READS, SECTOR_LEN};
use crate::distance::Element;
use crate::io::IoContext;
use crate::pq::NUM_PQ_CENTROIDS;
use crate::search::frontier::{Neighbor, NeighborQueue};

/// Per-query scratch buffers.
pub struct QueryScratch<T: Element> {
    /// Query in element space, padded to the aligned dimension.
    pub aligned_query: Vec<T>,
    /// Query as floats, padded to the aligned dimension.
    pub query_float: Vec<f32>,
    /// Centered/rotated query for PQ table lookups.
    pub rotated_query: Vec<f32>,
    /// Per-query `[n_chunks x 256]` PQ chunk-distance table.
    pub pq_dist_table: Vec<f32>,
    /// Gathered PQ codes for one batch of ids.
    pub pq_code_scratch: Vec<u8>,
    /// Distances for one batch of ids.
    pub dist_scratch: Vec<f32>,
    /// Sector read buffer.
    pub sector_scratch: Vec<u8>,
    /// Decode buffer for one node's coordinates.
    pub coord_scratch: Vec<T>,
    pub visited: HashSet<u32>,
    pub retset: NeighborQueue,
    pub full_retset: Vec<Neighbor>,
    /// Exact-distance memo, used by the recompute + dedup path.
    pub node_distances: HashMap<u32, f32>,
}

impl<T: Element> QueryScratch<T> {
    pub fn new(aligned_dim: usize, n_chunks: usize, visited_reserve: usize) -> Self {
        Self {
            aligned_query: vec![T::default(); aligned_dim],
            query_float: vec![0.0; aligned_dim],
            rotated_query: vec![0.0; aligned_dim],
            pq_dist_table: vec![0.0; n_chunks * NUM_PQ_CENTROIDS],
            pq_code_scratch: Vec::new(),
            dist_scratch: Vec::new(),
            sector_scratch: vec![0u8; MAX_N_SECTOR_READS * SECTOR_LEN],
            coord_scratch: vec![T::default(); aligned_dim],
            visited: HashSet::with_capacity(visited_reserve),
            retset: NeighborQueue::new(visited_reserve),
            full_retset: Vec::with_capacity(visited_reserve),
            node_distances: HashMap::new(),
        }
    }

    /// Clear per-query state; capacities survive.
    pub fn reset(&mut self) {
        self.aligned_query.fill(T::default());
        self.query_float.fill(0.0);
        self.visited.clear();
        self.full_retset.clear();
        self.node_distances.clear();
    }

    /// Make the id-batch buffers large enough for `n_ids` entries.
    pub fn reserve_batch(&mut self, n_ids: usize, n_chunks: usize) {
        if self.pq_code_scratch.len() < n_ids * n_chunks {
            self.pq_code_scratch.resize(n_ids * n_chunks, 0);
        }
        if self.dist_scratch.len() < n_ids {
            self.dist_scratch.resize(n_ids, 0.0);
        }
    }
}

/// One pool slot: scratch plus this thread's reader contexts.
pub struct ThreadData<T: Element> {
    pub scratch: QueryScratch<T>,
    pub ctx: IoContext,
    pub graph_ctx: Option<IoContext>,
}

/// Blocking LIFO pool of scratch slots.
///
/// The pool is sized to the worker count at load time; if every slot is out,
/// `take` blocks until a query finishes. LIFO order keeps recently-used
/// (cache-warm) scratch hot.
pub struct ScratchPool<T: Element> {
    slots: Mutex<Vec<ThreadData<T>>>,
    available: Condvar,
}

impl<T: Element> ScratchPool<T> {
    pub fn new(slots: Vec<ThreadData<T>>) -> Self {
        Self {
            slots: Mutex::new(slots),
            available: Condvar::new(),
        }
    }

    /// Borrow a slot, blocking until one is free.
    pub fn take(&self) -> ScratchGuard<'_, T> {
        let mut slots = self.slots.lock();
        while slots.is_empty() {
            self.available.wait(&mut slots);
        }
        let slot = slots.pop().expect("non-empty after wait");
        ScratchGuard {
            pool: self,
            slot: Some(slot),
        }
    }

    fn put_back(&self, slot: ThreadData<T>) {
        self.slots.lock().push(slot);
        self.available.notify_one();
    }
}

/// RAII borrow of one pool slot.
pub struct ScratchGuard<'a, T: Element> {
    pool: &'a ScratchPool<T>,
    slot: Option<ThreadData<T>>,
}

impl<T: Element> ScratchGuard<'_, T> {
    pub fn data(&mut self) -> &mut ThreadData<T> {
        self.slot.as_mut().expect("slot present until drop")
    }
}

impl<T: Element> Drop for ScratchGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.put_back(slot);
        }
    }
}
