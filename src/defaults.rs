//! Index-wide constants.

/// Fixed disk sector size; every read is a multiple of this.
pub const SECTOR_LEN: usize = 4096;

/// Upper bound on sectors issued in one batched read.
pub const MAX_N_SECTOR_READS: usize = 128;

/// Upper bound on graph out-degree accepted at load time.
pub const MAX_GRAPH_DEGREE: usize = 512;

/// Upper bound on PQ chunks accepted at load time.
pub const MAX_PQ_CHUNKS: usize = 512;

/// Reorder rerank considers the top `k * this` candidates.
pub const FULL_PRECISION_REORDER_MULTIPLIER: usize = 3;

/// BFS cache warmup never caches more than this fraction of the index.
pub const CACHE_FRACTION_CAP: f64 = 0.1;

/// Send/recv timeout for the embedding service, in seconds.
pub const EMBEDDING_TIMEOUT_SECS: u64 = 300;

/// Round `x` up to the next multiple of `align`.
#[inline]
#[must_use]
pub const fn round_up(x: usize, align: usize) -> usize {
    x.div_ceil(align) * align
}

/// `ceil(x / y)` for positive integers.
#[inline]
#[must_use]
pub const fn div_round_up(x: usize, y: usize) -> usize {
    x.div_ceil(y)
}
