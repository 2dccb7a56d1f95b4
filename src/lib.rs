//! quiver: disk-resident approximate nearest neighbor search over a
//! PQ-compressed graph index.
//!
//! The index keeps a few PQ code bytes per point in RAM; full-precision
//! coordinates and the proximity graph live in 4 KiB sectors on disk. A query runs a best-first beam traversal: each hop
//! expands up to `beam_width` frontier candidates, serving hot nodes from
//! an immutable warmup cache and fetching the rest with one batched
//! aligned read, while PQ lookup tables score tens of thousands of
//! neighbors without touching the disk.
//!
//! ```text
//! RAM:   [PQ codes, N x n_chunks] [chunk-distance table] [node cache]
//!            |  approximate, steers the frontier
//! SSD:   [sector 0: meta][node: coords + adjacency][node: ...]
//!            |  exact, scores the result set
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use quiver::{DiskIndex, Metric, OpenParams, SearchOptions};
//!
//! let params = OpenParams::new("/data/wiki", Metric::L2);
//! let index: DiskIndex<f32> = DiskIndex::open(&params)?;
//! let query = vec![0.0f32; index.data_dim()];
//! let (ids, dists) =
//!     index.search(&query, 10, 100, 4, &SearchOptions::default(), None)?;
//! # Ok::<(), quiver::AnnError>(())
//! ```
//!
//! # Layout variants
//!
//! - **Inline** (default): each node record packs coordinates and adjacency
//!   together; `nnodes_per_sector` records per sector, or several sectors
//!   per record for wide nodes.
//! - **Partition mode**: adjacency lives in a separate graph-only file,
//!   one partition per sector; coordinates are served out-of-band (node
//!   cache, disk-PQ codes, or the remote embedding service).
//!
//! # Exactness knobs
//!
//! Search is PQ-guided but result distances can come from four places,
//! selected per query through [`SearchOptions`]: inline coordinates (the
//! default), the on-disk reorder region (`use_reorder_data`), a remote
//! embedding service fetched during traversal
//! (`recompute_neighbor_embeddings`), or one deferred bulk fetch after
//! traversal (`deferred_fetch`).

pub mod cache;
pub mod defaults;
pub mod distance;
pub mod embed;
pub mod error;
pub mod io;
pub mod labels;
pub mod layout;
pub mod pq;
pub mod scratch;
pub mod search;
pub mod stats;

pub use distance::{Element, Metric};
pub use error::{AnnError, Result};
pub use labels::LabelId;
pub use search::{CacheWarmup, DiskIndex, OpenParams, SearchOptions};
pub use stats::QueryStats;
