//! Per-query search statistics.

use serde::{Deserialize, Serialize};

/// Counters recorded by a single `cached_beam_search` call.
///
/// All fields start at zero; the engine only ever adds to them, so a caller
/// can reuse one instance across queries to accumulate totals.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueryStats {
    /// Beam iterations that issued at least one disk read.
    pub n_hops: u32,
    /// Distance comparisons (PQ and full precision).
    pub n_cmps: u32,
    /// Sector read requests issued.
    pub n_ios: u32,
    /// 4 KiB-granularity reads issued (equals `n_ios` for packed layouts).
    pub n_4k: u32,
    /// Frontier nodes served from the node cache.
    pub n_cache_hits: u32,
    /// Neighbor distances served from the per-query memo
    /// (recompute + dedup only).
    pub n_memo_hits: u32,
    /// Neighbor distances requested through the recompute path.
    pub n_memo_lookups: u32,
    /// Microseconds spent in distance computation.
    pub cpu_us: f32,
    /// Microseconds spent blocked on disk reads.
    pub io_us: f32,
    /// Total wall-clock microseconds for the query.
    pub total_us: f32,
}
