//! Cached beam search: the traversal core.
//!
//! One call runs one query top to bottom on one borrowed scratch slot.
//! Each hop pops up to `beam_width` unexpanded candidates from the
//! frontier, serves what it can from the node cache, issues one batched
//! sector read for the rest, scores every expanded node for the full
//! retset, and feeds PQ-scored (or remotely recomputed) neighbors back
//! into the frontier.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::defaults::{FULL_PRECISION_REORDER_MULTIPLIER, MAX_N_SECTOR_READS, SECTOR_LEN};
use crate::distance::{l2_squared, l2_squared_f32, Element, Metric};
use crate::embed::{fetch_embeddings, preprocess_embeddings};
use crate::error::{AnnError, Result};
use crate::io::AlignedRead;
use crate::labels::LabelId;
use crate::pq::{aggregate_codes, pq_dist_lookup};
use crate::scratch::QueryScratch;
use crate::search::frontier::Neighbor;
use crate::search::{DiskIndex, SearchOptions};
use crate::stats::QueryStats;

/// Candidate in the global pruning pool, ordered ascending by distance with
/// an id tie-break.
#[derive(Debug, PartialEq)]
struct ScoredNode {
    dist: f32,
    id: u32,
}

impl Eq for ScoredNode {}

impl Ord for ScoredNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ScoredNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct LocalStats {
    n_hops: u32,
    n_cmps: u32,
    n_ios: u32,
    n_4k: u32,
    n_cache_hits: u32,
    n_memo_hits: u32,
    n_memo_lookups: u32,
    io_us: f32,
    cpu_us: f32,
}

fn ensure_f32(buf: &mut Vec<f32>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0.0);
    }
}

fn ensure_u8(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}

impl<T: Element, L: LabelId> DiskIndex<T, L> {
    /// Approximate top-`k` search.
    ///
    /// Returns ascending `(ids, distances)` of length `min(k, visited)`.
    /// `l_search` bounds the frontier, `beam_width` the concurrent
    /// expansions per hop.
    pub fn search(
        &self,
        query: &[T],
        k: usize,
        l_search: usize,
        beam_width: usize,
        opts: &SearchOptions<L>,
        mut stats: Option<&mut QueryStats>,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        self.validate(query, k, l_search, beam_width, opts)?;
        let query_timer = Instant::now();
        let mut lstats = LocalStats::default();

        let mut guard = self.scratch.take();
        let td = guard.data();
        td.scratch.reset();
        td.scratch.retset.clear(l_search);
        let QueryScratch {
            aligned_query,
            query_float,
            rotated_query,
            pq_dist_table,
            pq_code_scratch,
            dist_scratch,
            sector_scratch,
            coord_scratch,
            visited,
            retset,
            full_retset,
            node_distances,
        } = &mut td.scratch;
        let ctx = &mut td.ctx;
        let graph_ctx = &mut td.graph_ctx;

        // Normalize the query. Cosine normalizes everything; MIPS
        // normalizes the first d-1 coordinates and zeroes the lift
        // coordinate that converted it to L2 at build time.
        let query_norm = self.prepare_query(query, aligned_query, query_float);

        self.pq_table.preprocess_query(query_float, rotated_query);
        self.pq_table
            .populate_chunk_distances(rotated_query, pq_dist_table);

        // Seed the frontier with the best entry point.
        let best_medoid = self.pick_medoid(
            opts,
            query_float,
            aligned_query,
            pq_dist_table,
            pq_code_scratch,
            coord_scratch,
            node_distances,
            &mut lstats,
        )?;
        let mut seed_dist = [0f32];
        self.score_ids(
            opts,
            &[best_medoid],
            aligned_query,
            pq_dist_table,
            pq_code_scratch,
            coord_scratch,
            node_distances,
            &mut lstats,
            &mut seed_dist,
        );
        retset.insert(Neighbor::new(best_medoid, seed_dist[0]));
        visited.insert(best_medoid);

        let spn = if self.partition.is_some() {
            1
        } else {
            self.layout.sectors_per_node()
        };
        let stride = spn * SECTOR_LEN;

        let mut num_ios: u32 = 0;
        let mut frontier: SmallVec<[u32; 16]> = SmallVec::new();
        let mut cached_ids: SmallVec<[u32; 16]> = SmallVec::new();
        let mut read_ok: Vec<bool> = Vec::with_capacity(2 * beam_width);
        let mut part_pos: Vec<usize> = Vec::with_capacity(2 * beam_width);
        let mut nbrs_buf: Vec<u32> = Vec::with_capacity(self.max_degree + 1);
        let mut prune_dists: Vec<f32> = Vec::new();
        let mut batched_ids: Vec<u32> = Vec::new();
        let mut batched_dists: Vec<f32> = Vec::new();
        let mut global_pool: BinaryHeap<Reverse<ScoredNode>> = BinaryHeap::new();

        while retset.has_unexpanded() && num_ios < opts.io_limit {
            frontier.clear();
            cached_ids.clear();
            batched_ids.clear();

            let mut num_seen = 0;
            while retset.has_unexpanded() && frontier.len() < beam_width && num_seen < beam_width {
                let nbr = retset.closest_unexpanded();
                num_seen += 1;
                if self.cache.contains(nbr.id) {
                    cached_ids.push(nbr.id);
                    lstats.n_cache_hits += 1;
                } else {
                    frontier.push(nbr.id);
                }
                if self.count_visits.load(Ordering::Acquire) {
                    if let Some(counter) = self.visit_counter.get(nbr.id as usize) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            // one batched read for all uncached frontier nodes, capped to
            // the remaining io budget
            let remaining_ios = (opts.io_limit - num_ios) as usize;
            if frontier.len() > remaining_ios {
                frontier.truncate(remaining_ios);
            }
            read_ok.clear();
            part_pos.clear();
            if !frontier.is_empty() {
                lstats.n_hops += 1;
                if sector_scratch.len() < frontier.len() * stride {
                    sector_scratch.resize(frontier.len() * stride, 0);
                }
                let io_timer = Instant::now();
                match &self.partition {
                    None => {
                        let reader = self.reader.as_ref().expect("inline mode has a reader");
                        let mut batch: Vec<AlignedRead<'_>> = sector_scratch
                            .chunks_mut(stride)
                            .zip(frontier.iter())
                            .map(|(chunk, &id)| {
                                AlignedRead::new(
                                    self.layout.node_sector(id) * SECTOR_LEN as u64,
                                    chunk,
                                )
                            })
                            .collect();
                        num_ios += frontier.len() as u32;
                        lstats.n_ios += frontier.len() as u32;
                        lstats.n_4k += (frontier.len() * spn) as u32;
                        read_ok = reader.read(&mut batch, ctx)?;
                        part_pos.resize(frontier.len(), 0);
                    }
                    Some(p) => {
                        read_ok.resize(frontier.len(), true);
                        part_pos.resize(frontier.len(), 0);
                        let mut batch = Vec::with_capacity(frontier.len());
                        let mut batch_map = Vec::with_capacity(frontier.len());
                        for (i, (chunk, &id)) in sector_scratch
                            .chunks_mut(stride)
                            .zip(frontier.iter())
                            .enumerate()
                        {
                            match p.map.locate(id) {
                                Some((pid, pos)) => {
                                    part_pos[i] = pos;
                                    batch_map.push(i);
                                    batch.push(AlignedRead::new(p.map.sector_offset(pid), chunk));
                                }
                                None => {
                                    warn!(id, "node missing from partition tables");
                                    read_ok[i] = false;
                                }
                            }
                        }
                        num_ios += batch.len() as u32;
                        lstats.n_ios += batch.len() as u32;
                        lstats.n_4k += batch.len() as u32;
                        let gctx = graph_ctx.as_mut().expect("partition mode has a graph ctx");
                        let ok = p.reader.read(&mut batch, gctx)?;
                        for (bi, &fi) in batch_map.iter().enumerate() {
                            if !ok[bi] {
                                read_ok[fi] = false;
                            }
                        }
                    }
                }
                lstats.io_us += io_timer.elapsed().as_micros() as f32;
            }

            // cached frontier nodes first
            for ci in 0..cached_ids.len() {
                let id = cached_ids[ci];
                let (coord_bytes, cache_nbrs) =
                    self.cache.get(id).expect("cached id stays cached");
                let cur_dist = if opts.skip_search_reorder {
                    let mut d = [0f32];
                    self.score_ids(
                        opts,
                        &[id],
                        aligned_query,
                        pq_dist_table,
                        pq_code_scratch,
                        coord_scratch,
                        node_distances,
                        &mut lstats,
                        &mut d,
                    );
                    d[0]
                } else if opts.deferred_fetch {
                    0.0
                } else if self.partition.is_some() {
                    // graph-only cache entries carry no coordinates
                    if opts.recompute_neighbor_embeddings && opts.dedup_node_dis {
                        node_distances.get(&id).copied().unwrap_or(0.0)
                    } else {
                        let mut d = [0f32];
                        self.score_pq(&[id], pq_dist_table, pq_code_scratch, &mut d);
                        d[0]
                    }
                } else {
                    self.exact_from_coords(coord_bytes, aligned_query, query_float, coord_scratch)
                };
                full_retset.push(Neighbor::new(id, cur_dist));

                let cpu_timer = Instant::now();
                nbrs_buf.clear();
                nbrs_buf.extend_from_slice(cache_nbrs);
                ensure_f32(dist_scratch, nbrs_buf.len());
                self.score_ids(
                    opts,
                    &nbrs_buf,
                    aligned_query,
                    pq_dist_table,
                    pq_code_scratch,
                    coord_scratch,
                    node_distances,
                    &mut lstats,
                    dist_scratch,
                );
                lstats.n_cmps += nbrs_buf.len() as u32;
                lstats.cpu_us += cpu_timer.elapsed().as_micros() as f32;

                for (m, &nid) in nbrs_buf.iter().enumerate() {
                    if self.admit(visited, opts, nid) {
                        retset.insert(Neighbor::new(nid, dist_scratch[m]));
                    }
                }
            }

            // freshly read frontier nodes
            let sectors: &[u8] = sector_scratch;
            for (i, &id) in frontier.iter().enumerate() {
                if !read_ok.get(i).copied().unwrap_or(false) {
                    // failed read: drop this node's expansion entirely
                    continue;
                }

                nbrs_buf.clear();
                let cur_dist;
                match &self.partition {
                    None => {
                        let record = &sectors[i * stride + self.layout.node_offset(id)..]
                            [..self.layout.max_node_len];
                        let Some((coord_bytes, nlist)) = self.layout.decode_node(record) else {
                            warn!(id, "undecodable node record");
                            continue;
                        };
                        cur_dist = if opts.skip_search_reorder {
                            let mut d = [0f32];
                            self.score_ids(
                                opts,
                                &[id],
                                aligned_query,
                                pq_dist_table,
                                pq_code_scratch,
                                coord_scratch,
                                node_distances,
                                &mut lstats,
                                &mut d,
                            );
                            d[0]
                        } else if opts.deferred_fetch {
                            0.0
                        } else {
                            self.exact_from_coords(
                                coord_bytes,
                                aligned_query,
                                query_float,
                                coord_scratch,
                            )
                        };
                        nbrs_buf.extend(nlist.iter());
                    }
                    Some(p) => {
                        let sector = &sectors[i * stride..i * stride + SECTOR_LEN];
                        let Some(nlist) = p.map.decode_adjacency(sector, part_pos[i]) else {
                            warn!(id, "undecodable partition record");
                            continue;
                        };
                        cur_dist = if opts.skip_search_reorder {
                            let mut d = [0f32];
                            self.score_ids(
                                opts,
                                &[id],
                                aligned_query,
                                pq_dist_table,
                                pq_code_scratch,
                                coord_scratch,
                                node_distances,
                                &mut lstats,
                                &mut d,
                            );
                            d[0]
                        } else if opts.deferred_fetch {
                            0.0
                        } else if opts.recompute_neighbor_embeddings && opts.dedup_node_dis {
                            // graph-only reads carry no coordinates; the
                            // memo set by the recompute path is the exact
                            // source here
                            node_distances.get(&id).copied().unwrap_or(0.0)
                        } else {
                            let mut d = [0f32];
                            self.score_pq(&[id], pq_dist_table, pq_code_scratch, &mut d);
                            d[0]
                        };
                        nbrs_buf.extend(nlist.iter());
                    }
                }
                full_retset.push(Neighbor::new(id, cur_dist));

                if opts.batch_recompute {
                    batched_ids.extend_from_slice(&nbrs_buf);
                    continue;
                }

                let cpu_timer = Instant::now();
                self.prune_neighbors(
                    opts,
                    &mut nbrs_buf,
                    pq_dist_table,
                    pq_code_scratch,
                    &mut prune_dists,
                    visited,
                    &mut global_pool,
                );
                ensure_f32(dist_scratch, nbrs_buf.len());
                self.score_ids(
                    opts,
                    &nbrs_buf,
                    aligned_query,
                    pq_dist_table,
                    pq_code_scratch,
                    coord_scratch,
                    node_distances,
                    &mut lstats,
                    dist_scratch,
                );
                lstats.n_cmps += nbrs_buf.len() as u32;
                lstats.cpu_us += cpu_timer.elapsed().as_micros() as f32;

                for (m, &nid) in nbrs_buf.iter().enumerate() {
                    if self.admit(visited, opts, nid) {
                        retset.insert(Neighbor::new(nid, dist_scratch[m]));
                    }
                }
            }

            // one recompute round for the whole hop
            if opts.batch_recompute && !batched_ids.is_empty() {
                self.prune_neighbors(
                    opts,
                    &mut batched_ids,
                    pq_dist_table,
                    pq_code_scratch,
                    &mut prune_dists,
                    visited,
                    &mut global_pool,
                );
                ensure_f32(&mut batched_dists, batched_ids.len());
                self.score_ids(
                    opts,
                    &batched_ids,
                    aligned_query,
                    pq_dist_table,
                    pq_code_scratch,
                    coord_scratch,
                    node_distances,
                    &mut lstats,
                    &mut batched_dists,
                );
                lstats.n_cmps += batched_ids.len() as u32;
                for (m, &nid) in batched_ids.iter().enumerate() {
                    if self.admit(visited, opts, nid) {
                        retset.insert(Neighbor::new(nid, batched_dists[m]));
                    }
                }
            }
        }

        // deferred rerank: one bulk fetch of real embeddings, distances
        // overwritten in place
        if opts.deferred_fetch && !full_retset.is_empty() {
            let ids: Vec<u32> = full_retset.iter().map(|n| n.id).collect();
            let mut embs = fetch_embeddings(&ids, self.embedding_port())?;
            if embs.len() != ids.len() {
                return Err(AnnError::Protocol(format!(
                    "deferred fetch returned {} embeddings for {} ids",
                    embs.len(),
                    ids.len()
                )));
            }
            preprocess_embeddings(&mut embs, self.metric, self.max_base_norm, self.data_dim);
            for (i, emb) in embs.iter_mut().enumerate() {
                emb.resize(self.aligned_dim, 0.0);
                for (d, v) in emb.iter().enumerate() {
                    coord_scratch[d] = T::from_f32(*v);
                }
                full_retset[i].distance =
                    l2_squared(&aligned_query[..self.aligned_dim], &coord_scratch[..self.aligned_dim]);
            }
        }

        full_retset.sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });

        if opts.use_reorder_data {
            self.rerank_from_reorder_region(
                k,
                aligned_query,
                coord_scratch,
                sector_scratch,
                full_retset,
                ctx,
                &mut lstats,
            )?;
        }

        // top-k, remapping dummies and undoing the MIPS lift
        let k_out = k.min(full_retset.len());
        let mut out_ids = Vec::with_capacity(k_out);
        let mut out_dists = Vec::with_capacity(k_out);
        for nbr in full_retset.iter().take(k_out) {
            let id = match &self.filters {
                Some(f) => f.dummies.resolve(nbr.id),
                None => nbr.id,
            };
            out_ids.push(id);
            let mut d = nbr.distance;
            if self.metric == Metric::InnerProduct && T::IS_FLOAT {
                // flip min back to max and undo base/query normalization
                d = -d;
                if self.max_base_norm != 0.0 {
                    d *= self.max_base_norm * query_norm;
                }
            }
            out_dists.push(d);
        }

        if opts.recompute_neighbor_embeddings && opts.dedup_node_dis && lstats.n_memo_lookups > 0 {
            debug!(
                requested = lstats.n_memo_lookups,
                memo_hits = lstats.n_memo_hits,
                "node distance memo hit rate"
            );
        }

        if let Some(s) = stats.as_deref_mut() {
            s.n_hops += lstats.n_hops;
            s.n_cmps += lstats.n_cmps;
            s.n_ios += lstats.n_ios;
            s.n_4k += lstats.n_4k;
            s.n_cache_hits += lstats.n_cache_hits;
            s.n_memo_hits += lstats.n_memo_hits;
            s.n_memo_lookups += lstats.n_memo_lookups;
            s.io_us += lstats.io_us;
            s.cpu_us += lstats.cpu_us;
            s.total_us += query_timer.elapsed().as_micros() as f32;
        }

        Ok((out_ids, out_dists))
    }

    fn validate(
        &self,
        query: &[T],
        k: usize,
        l_search: usize,
        beam_width: usize,
        opts: &SearchOptions<L>,
    ) -> Result<()> {
        if k == 0 {
            return Err(AnnError::InvalidParameter("k must be positive".into()));
        }
        if l_search < k {
            return Err(AnnError::InvalidParameter(format!(
                "l_search {l_search} must be at least k {k}"
            )));
        }
        if query.len() < self.query_dim() {
            return Err(AnnError::DimensionMismatch {
                query_dim: query.len(),
                index_dim: self.query_dim(),
            });
        }
        let spn = self.layout.sectors_per_node();
        if beam_width == 0 || beam_width > spn * MAX_N_SECTOR_READS {
            return Err(AnnError::InvalidParameter(format!(
                "beam width {beam_width} outside 1..={}",
                spn * MAX_N_SECTOR_READS
            )));
        }
        if opts.use_reorder_data {
            if self.reorder.is_none() {
                return Err(AnnError::InvalidParameter(
                    "reorder data requested but not present in the index".into(),
                ));
            }
            if self.partition.is_some() {
                return Err(AnnError::InvalidParameter(
                    "reorder data is unavailable in partition mode".into(),
                ));
            }
        }
        if opts.deferred_fetch && self.disk_pq_table.is_some() {
            return Err(AnnError::InvalidParameter(
                "deferred fetch does not support disk-PQ indexes".into(),
            ));
        }
        if opts.filter.is_some() && self.filters.is_none() {
            return Err(AnnError::FilterNotFound);
        }
        if !(0.0..=1.0).contains(&opts.prune_ratio) {
            return Err(AnnError::InvalidParameter(format!(
                "prune ratio {} outside [0, 1]",
                opts.prune_ratio
            )));
        }
        Ok(())
    }

    /// Copy and normalize the query into scratch; returns the query norm
    /// (used to rescale inner-product outputs).
    fn prepare_query(&self, query: &[T], aligned_query: &mut [T], query_float: &mut [f32]) -> f32 {
        let mut query_norm = 0.0f32;
        if (self.metric == Metric::Cosine || self.metric == Metric::InnerProduct) && T::IS_FLOAT {
            let inherent = self.query_dim();
            for i in 0..inherent {
                aligned_query[i] = query[i];
                let v = query[i].to_f32();
                query_norm += v * v;
            }
            if self.metric == Metric::InnerProduct {
                aligned_query[self.data_dim - 1] = T::default();
            }
            query_norm = query_norm.sqrt();
            if query_norm > 0.0 {
                for q in aligned_query.iter_mut().take(inherent) {
                    *q = T::from_f32(q.to_f32() / query_norm);
                }
            }
        } else {
            aligned_query[..self.data_dim].copy_from_slice(&query[..self.data_dim]);
        }
        for (f, q) in query_float.iter_mut().zip(aligned_query.iter()) {
            *f = q.to_f32();
        }
        query_norm
    }

    #[allow(clippy::too_many_arguments)]
    fn pick_medoid(
        &self,
        opts: &SearchOptions<L>,
        query_float: &[f32],
        aligned_query: &[T],
        pq_dist_table: &[f32],
        pq_code_scratch: &mut Vec<u8>,
        coord_scratch: &mut [T],
        memo: &mut HashMap<u32, f32>,
        lstats: &mut LocalStats,
    ) -> Result<u32> {
        let mut best_medoid = 0u32;
        let mut best_dist = f32::MAX;
        match opts.filter {
            None => {
                // exact float distance against the stored centroid vectors
                for (m, &id) in self.medoids.iter().enumerate() {
                    let row = &self.centroid_data[m * self.aligned_dim..(m + 1) * self.aligned_dim];
                    let d = l2_squared_f32(&query_float[..self.aligned_dim], row);
                    if d < best_dist {
                        best_medoid = id;
                        best_dist = d;
                    }
                }
            }
            Some(label) => {
                // no centroid data per label; PQ approximation decides
                let filters = self.filters.as_ref().expect("validated");
                let medoid_ids = filters.medoids_for(label).ok_or(AnnError::FilterNotFound)?;
                let mut d = [0f32];
                for &id in medoid_ids {
                    self.score_ids(
                        opts,
                        &[id],
                        aligned_query,
                        pq_dist_table,
                        pq_code_scratch,
                        coord_scratch,
                        memo,
                        lstats,
                        &mut d,
                    );
                    if d[0] < best_dist {
                        best_medoid = id;
                        best_dist = d[0];
                    }
                }
            }
        }
        Ok(best_medoid)
    }

    /// Frontier admission: unvisited, not an unfiltered dummy, and passing
    /// the label filter when one is active.
    fn admit(&self, visited: &mut HashSet<u32>, opts: &SearchOptions<L>, id: u32) -> bool {
        if !visited.insert(id) {
            return false;
        }
        match (opts.filter, &self.filters) {
            (None, Some(f)) => !f.dummies.is_dummy(id),
            (None, None) => true,
            (Some(label), Some(f)) => f.point_passes(id, label),
            (Some(_), None) => false,
        }
    }

    /// Exact full-retset distance from inline (or cached) coordinate bytes.
    fn exact_from_coords(
        &self,
        coord_bytes: &[u8],
        aligned_query: &[T],
        query_float: &[f32],
        coord_scratch: &mut [T],
    ) -> f32 {
        match &self.disk_pq_table {
            Some(table) => {
                if self.metric == Metric::InnerProduct {
                    table.inner_product(query_float, coord_bytes)
                } else {
                    table.l2_distance(query_float, coord_bytes)
                }
            }
            None => {
                T::decode_slice(coord_bytes, &mut coord_scratch[..self.data_dim]);
                for c in coord_scratch[self.data_dim..self.aligned_dim].iter_mut() {
                    *c = T::default();
                }
                l2_squared(
                    &aligned_query[..self.aligned_dim],
                    &coord_scratch[..self.aligned_dim],
                )
            }
        }
    }

    /// PQ lookup scoring for a batch of ids.
    fn score_pq(
        &self,
        ids: &[u32],
        pq_dist_table: &[f32],
        pq_code_scratch: &mut Vec<u8>,
        dists_out: &mut [f32],
    ) {
        ensure_u8(pq_code_scratch, ids.len() * self.n_chunks);
        aggregate_codes(ids, &self.pq_codes, self.n_chunks, pq_code_scratch);
        pq_dist_lookup(
            pq_code_scratch,
            ids.len(),
            self.n_chunks,
            pq_dist_table,
            dists_out,
        );
    }

    /// Score a batch of ids by the configured path: PQ lookups, or remote
    /// exact recomputation with optional per-query memoization, falling
    /// back to PQ when the service misbehaves.
    #[allow(clippy::too_many_arguments)]
    fn score_ids(
        &self,
        opts: &SearchOptions<L>,
        ids: &[u32],
        aligned_query: &[T],
        pq_dist_table: &[f32],
        pq_code_scratch: &mut Vec<u8>,
        coord_scratch: &mut [T],
        memo: &mut HashMap<u32, f32>,
        lstats: &mut LocalStats,
        dists_out: &mut [f32],
    ) {
        if ids.is_empty() {
            return;
        }
        if !opts.recompute_neighbor_embeddings {
            self.score_pq(ids, pq_dist_table, pq_code_scratch, dists_out);
            return;
        }

        lstats.n_memo_lookups += ids.len() as u32;
        let mut memoized = vec![false; ids.len()];
        let mut to_fetch: Vec<u32> = Vec::with_capacity(ids.len());
        if opts.dedup_node_dis {
            for (i, &id) in ids.iter().enumerate() {
                if let Some(&d) = memo.get(&id) {
                    dists_out[i] = d;
                    memoized[i] = true;
                    lstats.n_memo_hits += 1;
                } else {
                    to_fetch.push(id);
                }
            }
            if to_fetch.is_empty() {
                return;
            }
        } else {
            to_fetch.extend_from_slice(ids);
        }

        match fetch_embeddings(&to_fetch, self.embedding_port()) {
            Ok(mut embs) if embs.len() == to_fetch.len() => {
                preprocess_embeddings(&mut embs, self.metric, self.max_base_norm, self.data_dim);
                let mut next = 0usize;
                for (i, &id) in ids.iter().enumerate() {
                    if memoized[i] {
                        continue;
                    }
                    let emb = &mut embs[next];
                    next += 1;
                    emb.resize(self.aligned_dim, 0.0);
                    for (d, v) in emb.iter().enumerate() {
                        coord_scratch[d] = T::from_f32(*v);
                    }
                    let dist = l2_squared(
                        &aligned_query[..self.aligned_dim],
                        &coord_scratch[..self.aligned_dim],
                    );
                    dists_out[i] = dist;
                    if opts.dedup_node_dis {
                        memo.insert(id, dist);
                    }
                }
            }
            other => {
                if let Err(e) = other {
                    warn!(error = %e, "embedding fetch failed; falling back to PQ distances");
                } else {
                    warn!("embedding fetch returned a short batch; falling back to PQ distances");
                }
                self.score_pq(ids, pq_dist_table, pq_code_scratch, dists_out);
            }
        }
    }

    /// Drop the least-promising fraction of an adjacency before the (much
    /// more expensive) remote recompute, ranked by cheap PQ scores.
    #[allow(clippy::too_many_arguments)]
    fn prune_neighbors(
        &self,
        opts: &SearchOptions<L>,
        nbrs: &mut Vec<u32>,
        pq_dist_table: &[f32],
        pq_code_scratch: &mut Vec<u8>,
        prune_dists: &mut Vec<f32>,
        visited: &HashSet<u32>,
        global_pool: &mut BinaryHeap<Reverse<ScoredNode>>,
    ) {
        if !opts.recompute_neighbor_embeddings || nbrs.len() <= 10 {
            return;
        }
        let keep_ratio = 1.0 - opts.prune_ratio;

        ensure_f32(prune_dists, nbrs.len());
        self.score_pq(nbrs, pq_dist_table, pq_code_scratch, prune_dists);

        if opts.global_pruning {
            for (i, &id) in nbrs.iter().enumerate() {
                global_pool.push(Reverse(ScoredNode {
                    dist: prune_dists[i],
                    id,
                }));
            }
            let take_n = (keep_ratio * global_pool.len() as f32) as usize;
            let mut rolled_back = Vec::with_capacity(take_n);
            let mut promising = Vec::new();
            for _ in 0..take_n {
                let Some(Reverse(top)) = global_pool.pop() else {
                    break;
                };
                if !visited.contains(&top.id) {
                    promising.push(top.id);
                }
                rolled_back.push(top);
            }
            for node in rolled_back {
                global_pool.push(Reverse(node));
            }
            nbrs.clear();
            nbrs.extend(promising);
        } else {
            let mut scored: Vec<(u32, f32)> = nbrs
                .iter()
                .zip(prune_dists.iter())
                .map(|(&id, &d)| (id, d))
                .collect();
            scored.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let new_n = ((nbrs.len() as f32 * keep_ratio) as usize).max(10);
            if new_n < nbrs.len() {
                nbrs.clear();
                nbrs.extend(scored.iter().take(new_n).map(|(id, _)| *id));
            }
        }
    }

    /// Rerank the top `3k` against the full-precision reorder region.
    #[allow(clippy::too_many_arguments)]
    fn rerank_from_reorder_region(
        &self,
        k: usize,
        aligned_query: &[T],
        coord_scratch: &mut [T],
        sector_scratch: &mut Vec<u8>,
        full_retset: &mut Vec<Neighbor>,
        ctx: &mut crate::io::IoContext,
        lstats: &mut LocalStats,
    ) -> Result<()> {
        let reorder = self.reorder.expect("validated");
        let reader = self.reader.as_ref().expect("validated");

        full_retset.truncate(k * FULL_PRECISION_REORDER_MULTIPLIER);
        let ids: Vec<u32> = full_retset.iter().map(|n| n.id).collect();

        let io_timer = Instant::now();
        for group_start in (0..ids.len()).step_by(MAX_N_SECTOR_READS) {
            let group = &ids[group_start..(group_start + MAX_N_SECTOR_READS).min(ids.len())];
            if sector_scratch.len() < group.len() * SECTOR_LEN {
                sector_scratch.resize(group.len() * SECTOR_LEN, 0);
            }
            let mut batch: Vec<AlignedRead<'_>> = sector_scratch
                .chunks_mut(SECTOR_LEN)
                .zip(group.iter())
                .map(|(chunk, &id)| {
                    AlignedRead::new(reorder.sector(id) * SECTOR_LEN as u64, chunk)
                })
                .collect();
            lstats.n_ios += group.len() as u32;
            lstats.n_4k += group.len() as u32;
            let ok = reader.read(&mut batch, ctx)?;
            drop(batch);

            for (j, &id) in group.iter().enumerate() {
                if !ok[j] {
                    continue;
                }
                let off = j * SECTOR_LEN + reorder.offset_in_sector(id);
                let bytes = &sector_scratch[off..off + self.data_dim * T::WIDTH];
                T::decode_slice(bytes, &mut coord_scratch[..self.data_dim]);
                full_retset[group_start + j].distance = l2_squared(
                    &aligned_query[..self.data_dim],
                    &coord_scratch[..self.data_dim],
                );
            }
        }
        lstats.io_us += io_timer.elapsed().as_micros() as f32;

        full_retset.sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(())
    }
}
