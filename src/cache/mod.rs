//! In-memory node cache: immutable after warmup, consulted on every beam
//! pop to skip sector reads for hot nodes.
//!
//! Entries live in two flat backing buffers (coordinate bytes and adjacency
//! ids) with an id -> slot map on top; the cache neither evicts nor inserts
//! once built.

use std::collections::{HashMap, HashSet};

use tracing::info;

use crate::defaults::CACHE_FRACTION_CAP;

#[derive(Debug, Clone, Copy)]
struct CacheSlot {
    coord_start: usize,
    nbr_start: usize,
    nbr_len: usize,
}

/// Immutable coordinate + adjacency cache.
#[derive(Debug, Default)]
pub struct NodeCache {
    coord_buf: Vec<u8>,
    nbr_buf: Vec<u32>,
    entries: HashMap<u32, CacheSlot>,
    bytes_per_point: usize,
}

impl NodeCache {
    /// Build from `(id, coord_bytes, neighbors)` triples. Coordinate runs
    /// must all be `bytes_per_point` long.
    pub fn build(
        bytes_per_point: usize,
        items: impl IntoIterator<Item = (u32, Vec<u8>, Vec<u32>)>,
    ) -> Self {
        let mut cache = NodeCache {
            bytes_per_point,
            ..Default::default()
        };
        for (id, coords, nbrs) in items {
            debug_assert_eq!(coords.len(), bytes_per_point);
            let slot = CacheSlot {
                coord_start: cache.coord_buf.len(),
                nbr_start: cache.nbr_buf.len(),
                nbr_len: nbrs.len(),
            };
            cache.coord_buf.extend_from_slice(&coords);
            cache.nbr_buf.extend_from_slice(&nbrs);
            cache.entries.insert(id, slot);
        }
        info!(nodes = cache.entries.len(), "node cache built");
        cache
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Coordinate bytes and adjacency of a cached node.
    #[inline]
    pub fn get(&self, id: u32) -> Option<(&[u8], &[u32])> {
        let slot = self.entries.get(&id)?;
        Some((
            &self.coord_buf[slot.coord_start..slot.coord_start + self.bytes_per_point],
            &self.nbr_buf[slot.nbr_start..slot.nbr_start + slot.nbr_len],
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Pick nodes to cache by breadth-first expansion from the entry points.
///
/// `fetch` resolves a block of ids to their adjacency lists (`None` for a
/// failed read, which silently skips the node). Never selects more than
/// 10% of the index, and never asks `fetch` about a node twice.
pub fn bfs_node_list(
    seeds: &[u32],
    num_points: usize,
    num_to_cache: usize,
    mut fetch: impl FnMut(&[u32]) -> Vec<Option<Vec<u32>>>,
) -> Vec<u32> {
    let cap = ((num_points as f64 * CACHE_FRACTION_CAP).round() as usize).max(1);
    let num_to_cache = num_to_cache.min(cap).min(num_points);

    let mut node_set: HashSet<u32> = HashSet::new();
    let mut cur_level: HashSet<u32> = seeds.iter().copied().collect();

    while node_set.len() + cur_level.len() < num_to_cache && !cur_level.is_empty() {
        let prev_level = std::mem::take(&mut cur_level);

        let mut to_expand: Vec<u32> = prev_level
            .into_iter()
            .filter(|id| node_set.insert(*id))
            .collect();
        to_expand.sort_unstable();

        let mut done = false;
        const BLOCK: usize = 1024;
        for block in to_expand.chunks(BLOCK) {
            if done {
                break;
            }
            for nbrs in fetch(block).into_iter().flatten() {
                for nbr in nbrs {
                    if !node_set.contains(&nbr) {
                        cur_level.insert(nbr);
                    }
                    if node_set.len() + cur_level.len() >= num_to_cache {
                        done = true;
                        break;
                    }
                }
                if done {
                    break;
                }
            }
        }
    }

    let mut list: Vec<u32> = node_set.into_iter().collect();
    list.extend(cur_level);
    list.truncate(num_to_cache);
    list
}
