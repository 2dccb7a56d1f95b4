//! Product quantization: centroid table, per-query lookup tables, and code
//! aggregation.
//!
//! The pivot table is a `256 x dim` matrix chopped into `n_chunks`
//! contiguous column ranges. Per query we precompute the squared-distance
//! contribution of every (chunk, centroid) pair once, after which scoring a
//! node is `n_chunks` table lookups and adds.

use std::path::Path;

use tracing::{debug, info};

use crate::defaults::MAX_PQ_CHUNKS;
use crate::distance::dot;
use crate::error::{AnnError, Result};
use crate::io::bin;

/// Every codebook has exactly 256 centroids; codes are single bytes.
pub const NUM_PQ_CENTROIDS: usize = 256;

/// PQ centroid table with fixed chunk boundaries.
#[derive(Debug, Clone)]
pub struct FixedChunkPQTable {
    /// `256 x dim`, row-major by centroid.
    pivots: Vec<f32>,
    /// Global centroid subtracted from queries before chunk distances.
    centroid: Vec<f32>,
    /// `n_chunks + 1` ascending column offsets; `offsets[0] == 0`,
    /// `offsets[n_chunks] == dim`.
    chunk_offsets: Vec<u32>,
    /// Optional `dim x dim` rotation applied after centering.
    rotation: Option<Vec<f32>>,
    dim: usize,
    n_chunks: usize,
}

impl FixedChunkPQTable {
    /// Load a pivots file.
    ///
    /// `expected_chunks` is the chunk count implied by the compressed-code
    /// file; pass 0 to accept whatever the pivots file declares (used for
    /// the disk-PQ table, whose chunk count only lives here).
    pub fn load(path: impl AsRef<Path>, expected_chunks: usize) -> Result<Self> {
        let path = path.as_ref();
        let (data, nrows, dim) = bin::load_bin_f32(path)?;
        if nrows != NUM_PQ_CENTROIDS {
            return Err(AnnError::Load(format!(
                "PQ pivot file {} has {} centroids, expected {}",
                path.display(),
                nrows,
                NUM_PQ_CENTROIDS
            )));
        }

        // Trailing payload: centroid, chunk count, offsets.
        use byteorder::{LittleEndian, ReadBytesExt};
        use std::io::{Seek, SeekFrom};
        let mut f = std::fs::File::open(path)?;
        f.seek(SeekFrom::Start(8 + (NUM_PQ_CENTROIDS * dim * 4) as u64))?;
        let mut centroid = vec![0f32; dim];
        f.read_f32_into::<LittleEndian>(&mut centroid)?;
        let n_chunks = f.read_u32::<LittleEndian>()? as usize;
        if n_chunks == 0 || n_chunks > MAX_PQ_CHUNKS {
            return Err(AnnError::Load(format!(
                "PQ chunk count {n_chunks} out of range (max {MAX_PQ_CHUNKS})"
            )));
        }
        if expected_chunks != 0 && expected_chunks != n_chunks {
            return Err(AnnError::Load(format!(
                "PQ pivots declare {n_chunks} chunks but compressed codes have {expected_chunks}"
            )));
        }
        let mut chunk_offsets = vec![0u32; n_chunks + 1];
        f.read_u32_into::<LittleEndian>(&mut chunk_offsets)?;
        if chunk_offsets[0] != 0
            || chunk_offsets[n_chunks] as usize != dim
            || chunk_offsets.windows(2).any(|w| w[0] > w[1])
        {
            return Err(AnnError::Format(format!(
                "PQ chunk offsets are not an ascending partition of 0..{dim}"
            )));
        }

        let rotation_path = path.with_file_name(format!(
            "{}_rotation_matrix.bin",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));
        let rotation = if rotation_path.is_file() {
            let (rot, r, c) = bin::load_bin_f32(&rotation_path)?;
            if r != dim || c != dim {
                return Err(AnnError::Load(format!(
                    "rotation matrix is {r}x{c}, expected {dim}x{dim}"
                )));
            }
            info!("loaded PQ rotation matrix");
            Some(rot)
        } else {
            None
        };

        debug!(dim, n_chunks, "loaded PQ pivots");
        Ok(Self {
            pivots: data,
            centroid,
            chunk_offsets,
            rotation,
            dim,
            n_chunks,
        })
    }

    pub fn n_chunks(&self) -> usize {
        self.n_chunks
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Center the query on the table centroid, then rotate if a rotation
    /// matrix was trained. `out` must hold `dim` floats.
    pub fn preprocess_query(&self, query: &[f32], out: &mut [f32]) {
        debug_assert!(query.len() >= self.dim && out.len() >= self.dim);
        match &self.rotation {
            None => {
                for d in 0..self.dim {
                    out[d] = query[d] - self.centroid[d];
                }
            }
            Some(rot) => {
                let mut centered = vec![0f32; self.dim];
                for d in 0..self.dim {
                    centered[d] = query[d] - self.centroid[d];
                }
                for (r, o) in out.iter_mut().enumerate().take(self.dim) {
                    *o = dot(&rot[r * self.dim..(r + 1) * self.dim], &centered);
                }
            }
        }
    }

    /// Fill the per-query `[n_chunks x 256]` chunk-distance table:
    /// `table[c * 256 + k]` is the squared distance between query chunk `c`
    /// and centroid `k` restricted to that chunk's columns.
    pub fn populate_chunk_distances(&self, rotated_query: &[f32], table: &mut [f32]) {
        debug_assert!(table.len() >= self.n_chunks * NUM_PQ_CENTROIDS);
        table[..self.n_chunks * NUM_PQ_CENTROIDS].fill(0.0);
        for c in 0..self.n_chunks {
            let (lo, hi) = (self.chunk_offsets[c] as usize, self.chunk_offsets[c + 1] as usize);
            let out = &mut table[c * NUM_PQ_CENTROIDS..(c + 1) * NUM_PQ_CENTROIDS];
            for d in lo..hi {
                let q = rotated_query[d];
                for (k, o) in out.iter_mut().enumerate() {
                    let diff = self.pivots[k * self.dim + d] - q;
                    *o += diff * diff;
                }
            }
        }
    }

    /// Reconstruct a full-precision vector from one node's code bytes.
    pub fn inflate(&self, code: &[u8], out: &mut [f32]) {
        debug_assert!(code.len() >= self.n_chunks && out.len() >= self.dim);
        for c in 0..self.n_chunks {
            let k = code[c] as usize;
            for d in self.chunk_offsets[c] as usize..self.chunk_offsets[c + 1] as usize {
                out[d] = self.pivots[k * self.dim + d] + self.centroid[d];
            }
        }
    }

    /// Exact squared L2 between a float query and one node's code bytes
    /// (used for disk-PQ rerank; no rotation support).
    pub fn l2_distance(&self, query: &[f32], code: &[u8]) -> f32 {
        let mut res = 0.0f32;
        for c in 0..self.n_chunks {
            let k = code[c] as usize;
            for d in self.chunk_offsets[c] as usize..self.chunk_offsets[c + 1] as usize {
                let diff = query[d] - (self.pivots[k * self.dim + d] + self.centroid[d]);
                res += diff * diff;
            }
        }
        res
    }

    /// Negated inner product between a float query and one node's code
    /// bytes; negated so that smaller is better, like every other distance.
    pub fn inner_product(&self, query: &[f32], code: &[u8]) -> f32 {
        let mut res = 0.0f32;
        for c in 0..self.n_chunks {
            let k = code[c] as usize;
            for d in self.chunk_offsets[c] as usize..self.chunk_offsets[c + 1] as usize {
                res += query[d] * (self.pivots[k * self.dim + d] + self.centroid[d]);
            }
        }
        -res
    }
}

/// Gather the code bytes of `ids` from the flat `codes` array
/// (`n_chunks` bytes per node) into `out`, packed in id order.
pub fn aggregate_codes(ids: &[u32], codes: &[u8], n_chunks: usize, out: &mut [u8]) {
    debug_assert!(out.len() >= ids.len() * n_chunks);
    for (i, &id) in ids.iter().enumerate() {
        let src = &codes[id as usize * n_chunks..(id as usize + 1) * n_chunks];
        out[i * n_chunks..(i + 1) * n_chunks].copy_from_slice(src);
    }
}

/// Score `n_ids` packed codes against the per-query chunk-distance table.
pub fn pq_dist_lookup(
    packed: &[u8],
    n_ids: usize,
    n_chunks: usize,
    table: &[f32],
    dists_out: &mut [f32],
) {
    debug_assert!(packed.len() >= n_ids * n_chunks);
    debug_assert!(dists_out.len() >= n_ids);
    for (i, out) in dists_out.iter_mut().enumerate().take(n_ids) {
        let code = &packed[i * n_chunks..(i + 1) * n_chunks];
        let mut sum = 0.0f32;
        for (c, &k) in code.iter().enumerate() {
            sum += table[c * NUM_PQ_CENTROIDS + k as usize];
        }
        *out = sum;
    }
}
