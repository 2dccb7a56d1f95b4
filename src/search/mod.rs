//! Index lifecycle: file loading, node reads, cache warmup, and the outer
//! search entry points. The traversal itself lives in [`beam`].

pub mod beam;
pub mod frontier;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cache::{bfs_node_list, NodeCache};
use crate::defaults::{round_up, MAX_GRAPH_DEGREE, MAX_PQ_CHUNKS, SECTOR_LEN};
use crate::distance::{Element, Metric};
use crate::error::{AnnError, Result};
use crate::io::{bin, AlignedRead, AlignedReader};
use crate::labels::{FilterData, LabelId};
use crate::layout::{DiskMeta, NodeLayout, PartitionMap, ReorderMeta};
use crate::pq::FixedChunkPQTable;
use crate::scratch::{QueryScratch, ScratchPool, ThreadData};

/// How to open a disk index.
#[derive(Debug, Clone)]
pub struct OpenParams {
    /// Prefix of the index files: `<prefix>_disk.index` and siblings.
    pub index_prefix: PathBuf,
    /// Prefix of the PQ files; defaults to `index_prefix`.
    pub pq_prefix: Option<PathBuf>,
    /// Prefix of the partition files; enables partition mode when set.
    pub partition_prefix: Option<PathBuf>,
    pub metric: Metric,
    /// Scratch slots to pre-allocate; one query runs per slot.
    pub num_threads: usize,
    /// Port of the embedding service on localhost.
    pub embedding_port: u16,
}

impl OpenParams {
    pub fn new(index_prefix: impl Into<PathBuf>, metric: Metric) -> Self {
        Self {
            index_prefix: index_prefix.into(),
            pq_prefix: None,
            partition_prefix: None,
            metric,
            num_threads: 1,
            embedding_port: 5555,
        }
    }
}

/// Cache warmup strategy.
#[derive(Debug, Clone)]
pub enum CacheWarmup {
    /// Breadth-first expansion from the medoids.
    Bfs { count: usize },
    /// Run sample queries with the visit counter on; cache the most-visited
    /// nodes.
    SampleQueries {
        sample_file: PathBuf,
        l_search: usize,
        beam_width: usize,
        count: usize,
    },
}

/// Per-query feature flags. `Default` is a plain PQ-guided search.
#[derive(Debug, Clone)]
pub struct SearchOptions<L: LabelId = u32> {
    /// Restrict results to points carrying this label (or the universal
    /// label).
    pub filter: Option<L>,
    /// Hard cap on issued sector reads.
    pub io_limit: u32,
    /// Rerank the top `3k` from the full-precision reorder region.
    pub use_reorder_data: bool,
    /// Skip in-loop exact distances; bulk-fetch real embeddings afterwards
    /// and rescore.
    pub deferred_fetch: bool,
    /// Use PQ distances for the full retset during the loop.
    pub skip_search_reorder: bool,
    /// Fetch neighbor embeddings from the service instead of PQ lookups.
    pub recompute_neighbor_embeddings: bool,
    /// Memoize exact per-node distances across a query.
    pub dedup_node_dis: bool,
    /// Fraction of each adjacency to drop after a cheap PQ ranking
    /// (recompute only).
    pub prune_ratio: f32,
    /// Accumulate neighbor ids across the beam and recompute once per hop.
    pub batch_recompute: bool,
    /// Prune against a query-wide candidate pool instead of per-node.
    pub global_pruning: bool,
}

impl<L: LabelId> Default for SearchOptions<L> {
    fn default() -> Self {
        Self {
            filter: None,
            io_limit: u32::MAX,
            use_reorder_data: false,
            deferred_fetch: false,
            skip_search_reorder: false,
            recompute_neighbor_embeddings: false,
            dedup_node_dis: false,
            prune_ratio: 0.0,
            batch_recompute: false,
            global_pruning: false,
        }
    }
}

pub(crate) struct PartitionBacking {
    pub reader: AlignedReader,
    pub map: PartitionMap,
}

/// One node's data as returned by [`DiskIndex::read_nodes`].
pub(crate) struct NodeRead {
    /// Raw coordinate bytes; absent in partition mode.
    pub coords: Option<Vec<u8>>,
    pub nbrs: Vec<u32>,
}

/// A disk-resident PQ-compressed graph index.
///
/// Read-only after [`open`](Self::open) apart from cache warmup; searches
/// take `&self` and run one per scratch slot.
pub struct DiskIndex<T: Element, L: LabelId = u32> {
    pub(crate) reader: Option<AlignedReader>,
    pub(crate) partition: Option<PartitionBacking>,

    pub(crate) metric: Metric,
    pub(crate) num_points: usize,
    pub(crate) data_dim: usize,
    pub(crate) aligned_dim: usize,
    pub(crate) disk_bytes_per_point: usize,
    pub(crate) max_degree: usize,
    pub(crate) layout: NodeLayout,
    pub(crate) reorder: Option<ReorderMeta>,
    pub(crate) num_frozen_points: u64,
    pub(crate) frozen_location: u64,

    pub(crate) pq_codes: Vec<u8>,
    pub(crate) n_chunks: usize,
    pub(crate) pq_table: FixedChunkPQTable,
    pub(crate) disk_pq_table: Option<FixedChunkPQTable>,

    pub(crate) medoids: Vec<u32>,
    /// `medoids.len() x aligned_dim` floats.
    pub(crate) centroid_data: Vec<f32>,
    pub(crate) max_base_norm: f32,

    pub(crate) filters: Option<FilterData<L>>,
    pub(crate) cache: NodeCache,

    pub(crate) visit_counter: Vec<AtomicU32>,
    pub(crate) count_visits: AtomicBool,

    pub(crate) scratch: ScratchPool<T>,
    embedding_port: AtomicU32,

    _elem: PhantomData<T>,
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

impl<T: Element, L: LabelId> DiskIndex<T, L> {
    /// Load an index from its file family.
    pub fn open(params: &OpenParams) -> Result<Self> {
        let metric = params.metric;
        // Kernel choice is static: cosine/MIPS float data is pre-processed
        // at build time, integral data falls back with a warning.
        let _resolved = metric.resolve::<T>();

        let pq_prefix = params.pq_prefix.as_deref().unwrap_or(&params.index_prefix);
        let disk_index_path = suffixed(&params.index_prefix, "_disk.index");
        let pq_pivots_path = suffixed(pq_prefix, "_pq_pivots.bin");
        let pq_codes_path = suffixed(pq_prefix, "_pq_compressed.bin");

        bin::require_file(&pq_pivots_path, "PQ pivots file")?;
        bin::require_file(&pq_codes_path, "PQ compressed file")?;

        let (pq_rows, pq_dim) = bin::bin_metadata(&pq_pivots_path)?;
        if pq_rows != crate::pq::NUM_PQ_CENTROIDS {
            return Err(AnnError::Load(format!(
                "number of PQ centroids is {pq_rows}, not 256"
            )));
        }
        let data_dim = pq_dim;
        let aligned_dim = round_up(data_dim, 8);
        let mut disk_bytes_per_point = data_dim * T::WIDTH;

        let (pq_codes, num_points, n_chunks) = bin::load_bin_u8(&pq_codes_path)?;
        if n_chunks > MAX_PQ_CHUNKS {
            return Err(AnnError::Load(format!(
                "in-memory PQ uses {n_chunks} chunks, max is {MAX_PQ_CHUNKS}"
            )));
        }
        let pq_table = FixedChunkPQTable::load(&pq_pivots_path, n_chunks)?;
        info!(
            num_points,
            data_dim, aligned_dim, n_chunks, "loaded PQ centroids and compressed vectors"
        );

        let filters = FilterData::<L>::load(&disk_index_path, num_points)?;

        // Very large datasets store PQ codes in the disk index too.
        let disk_pq_pivots_path = suffixed(&disk_index_path, "_pq_pivots.bin");
        let disk_pq_table = if disk_pq_pivots_path.is_file() {
            let table = FixedChunkPQTable::load(&disk_pq_pivots_path, 0)?;
            disk_bytes_per_point = table.n_chunks();
            info!(
                chunks = table.n_chunks(),
                "disk index stores PQ-compressed points"
            );
            Some(table)
        } else {
            None
        };

        let partition_mode = params.partition_prefix.is_some();

        let (reader, partition, layout, reorder, max_degree, num_frozen_points, frozen_location, medoid_on_file) =
            if let Some(partition_prefix) = params.partition_prefix.as_deref() {
                let graph_path = suffixed(partition_prefix, "_disk_graph.index");
                let partition_path = suffixed(partition_prefix, "_partition.bin");
                bin::require_file(&graph_path, "partition graph file")?;
                bin::require_file(&partition_path, "partition map file")?;

                let map = PartitionMap::load(&partition_path, &graph_path, disk_bytes_per_point)?;
                let graph_reader = AlignedReader::open(&graph_path)?;
                let graph_node_len = map.graph_node_len;
                let max_degree = graph_node_len / 4 - 1;
                let layout = NodeLayout {
                    max_node_len: graph_node_len + disk_bytes_per_point,
                    nnodes_per_sector: 0,
                    disk_bytes_per_point,
                };
                (
                    None,
                    Some(PartitionBacking {
                        reader: graph_reader,
                        map,
                    }),
                    layout,
                    None,
                    max_degree,
                    0u64,
                    0u64,
                    None,
                )
            } else {
                bin::require_file(&disk_index_path, "disk index file")?;
                let meta = DiskMeta::load(&disk_index_path)?;
                if meta.num_points as usize != num_points {
                    return Err(AnnError::Load(format!(
                        "disk index has {} points, compressed data has {num_points}",
                        meta.num_points
                    )));
                }
                if meta.reorder.is_some() && disk_pq_table.is_none() {
                    return Err(AnnError::Load(
                        "reorder data requires the disk-PQ compression option".into(),
                    ));
                }
                if (meta.max_node_len as usize) < disk_bytes_per_point + 8 {
                    return Err(AnnError::Format(format!(
                        "max_node_len {} does not cover {disk_bytes_per_point} coordinate bytes plus an adjacency record",
                        meta.max_node_len
                    )));
                }
                let layout = NodeLayout {
                    max_node_len: meta.max_node_len as usize,
                    nnodes_per_sector: meta.nnodes_per_sector as usize,
                    disk_bytes_per_point,
                };
                let max_degree = layout.max_degree_bound();
                if max_degree > MAX_GRAPH_DEGREE {
                    return Err(AnnError::Load(format!(
                        "max graph degree {max_degree} exceeds {MAX_GRAPH_DEGREE}"
                    )));
                }
                debug!(
                    nnodes_per_sector = layout.nnodes_per_sector,
                    max_node_len = layout.max_node_len,
                    max_degree,
                    "disk index metadata"
                );
                let reader = AlignedReader::open(&disk_index_path)?;
                (
                    Some(reader),
                    None,
                    layout,
                    meta.reorder,
                    max_degree,
                    meta.num_frozen_points,
                    meta.frozen_location,
                    Some(meta.medoid_id as u32),
                )
            };

        let mut index = Self {
            reader,
            partition,
            metric,
            num_points,
            data_dim,
            aligned_dim,
            disk_bytes_per_point,
            max_degree,
            layout,
            reorder,
            num_frozen_points,
            frozen_location,
            pq_codes,
            n_chunks,
            pq_table,
            disk_pq_table,
            medoids: Vec::new(),
            centroid_data: Vec::new(),
            max_base_norm: 0.0,
            filters,
            cache: NodeCache::default(),
            visit_counter: Vec::new(),
            count_visits: AtomicBool::new(false),
            scratch: ScratchPool::new(Vec::new()),
            embedding_port: AtomicU32::new(params.embedding_port as u32),
            _elem: PhantomData,
        };

        index.scratch = index.build_scratch_pool(params.num_threads.max(1));
        index.load_medoids(&disk_index_path, medoid_on_file, partition_mode)?;

        let norm_path = suffixed(&disk_index_path, "_max_base_norm.bin");
        if metric == Metric::InnerProduct && norm_path.is_file() {
            let (vals, _, _) = bin::load_bin_f32(&norm_path)?;
            index.max_base_norm = vals.first().copied().unwrap_or(0.0);
            info!(max_base_norm = index.max_base_norm, "base re-scaling factor");
        }

        Ok(index)
    }

    fn build_scratch_pool(&self, num_threads: usize) -> ScratchPool<T> {
        let mut slots = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let ctx = match (&self.reader, &self.partition) {
                (Some(r), _) => r.register_thread(),
                (None, Some(p)) => p.reader.register_thread(),
                (None, None) => unreachable!("index has no backing file"),
            };
            let graph_ctx = self.partition.as_ref().map(|p| p.reader.register_thread());
            slots.push(ThreadData {
                scratch: QueryScratch::new(self.aligned_dim, self.n_chunks, 4096),
                ctx,
                graph_ctx,
            });
        }
        ScratchPool::new(slots)
    }

    fn load_medoids(
        &mut self,
        disk_index_path: &Path,
        medoid_on_file: Option<u32>,
        partition_mode: bool,
    ) -> Result<()> {
        let medoids_path = suffixed(disk_index_path, "_medoids.bin");
        let centroids_path = suffixed(disk_index_path, "_centroids.bin");

        if medoids_path.is_file() {
            let (medoids, n, dim) = bin::load_bin_u32(&medoids_path)?;
            if dim != 1 {
                return Err(AnnError::Load(
                    "medoids file must be an n x 1 vector of u32".into(),
                ));
            }
            self.medoids = medoids;
            debug!(n, "loaded medoids");

            if centroids_path.is_file() {
                let (data, rows, _cols, aligned) = bin::load_aligned_bin_f32(&centroids_path)?;
                if aligned != self.aligned_dim || rows != self.medoids.len() {
                    return Err(AnnError::Load(
                        "centroids file must hold one data_dim float vector per medoid".into(),
                    ));
                }
                self.centroid_data = data;
            } else if partition_mode {
                return Err(AnnError::Load(
                    "partition mode requires a centroids file next to the medoids".into(),
                ));
            } else {
                info!("centroid data file not found; using medoid vectors");
                self.use_medoids_data_as_centroids()?;
            }
        } else {
            if partition_mode {
                // the partition file carries no usable entry point
                return Err(AnnError::Load(
                    "partition mode requires a medoids file".into(),
                ));
            }
            self.medoids = vec![medoid_on_file.expect("inline mode has a header medoid")];
            self.use_medoids_data_as_centroids()?;
        }
        Ok(())
    }

    /// Read the medoid vectors off disk and use them as centroid data.
    fn use_medoids_data_as_centroids(&mut self) -> Result<()> {
        info!(n = self.medoids.len(), "loading centroid data from medoids");
        let medoids = self.medoids.clone();
        let reads = self.read_nodes(&medoids, true, false)?;
        let mut centroid_data = vec![0f32; self.medoids.len() * self.aligned_dim];
        for (m, read) in reads.into_iter().enumerate() {
            let node = read.ok_or_else(|| AnnError::Load("unable to read a medoid".into()))?;
            let coords = node
                .coords
                .ok_or_else(|| AnnError::Load("medoid read returned no coordinates".into()))?;
            let row = &mut centroid_data[m * self.aligned_dim..(m + 1) * self.aligned_dim];
            match &self.disk_pq_table {
                Some(table) => table.inflate(&coords, row),
                None => {
                    let mut elems = vec![T::default(); self.data_dim];
                    T::decode_slice(&coords, &mut elems);
                    for (d, e) in elems.iter().enumerate() {
                        row[d] = e.to_f32();
                    }
                }
            }
        }
        self.centroid_data = centroid_data;
        Ok(())
    }

    /// Batched node fetch used by warmup and the medoid bootstrap.
    ///
    /// Returns `None` for entries whose read failed. Coordinates are only
    /// available in the default layout; partition mode serves adjacency
    /// alone.
    pub(crate) fn read_nodes(
        &self,
        ids: &[u32],
        want_coords: bool,
        want_nbrs: bool,
    ) -> Result<Vec<Option<NodeRead>>> {
        if let Some(p) = &self.partition {
            return self.read_nodes_partition(p, ids, want_nbrs);
        }
        let reader = self.reader.as_ref().expect("inline mode has a reader");
        let mut ctx = reader.register_thread();

        let spn = self.layout.sectors_per_node();
        let stride = spn * SECTOR_LEN;
        let mut buf = vec![0u8; ids.len() * stride];
        let mut batch: Vec<AlignedRead<'_>> = buf
            .chunks_mut(stride)
            .zip(ids.iter())
            .map(|(chunk, &id)| {
                AlignedRead::new(self.layout.node_sector(id) * SECTOR_LEN as u64, chunk)
            })
            .collect();
        let ok = reader.read(&mut batch, &mut ctx)?;
        drop(batch);

        let mut out = Vec::with_capacity(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            if !ok[i] {
                out.push(None);
                continue;
            }
            let record = &buf[i * stride + self.layout.node_offset(id)..]
                [..self.layout.max_node_len.min(stride)];
            match self.layout.decode_node(record) {
                Some((coords, nbrs)) => out.push(Some(NodeRead {
                    coords: want_coords.then(|| coords.to_vec()),
                    nbrs: if want_nbrs { nbrs.to_vec() } else { Vec::new() },
                })),
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn read_nodes_partition(
        &self,
        p: &PartitionBacking,
        ids: &[u32],
        want_nbrs: bool,
    ) -> Result<Vec<Option<NodeRead>>> {
        let mut ctx = p.reader.register_thread();
        let mut out: Vec<Option<NodeRead>> = (0..ids.len()).map(|_| None).collect();
        if !want_nbrs {
            return Ok(out);
        }

        // group by partition so each sector is read once
        let mut by_partition: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, &id) in ids.iter().enumerate() {
            if let Some((pid, _)) = p.map.locate(id) {
                by_partition.entry(pid).or_default().push(i);
            }
        }

        let mut sector = vec![0u8; SECTOR_LEN];
        for (pid, indices) in by_partition {
            let mut batch = vec![AlignedRead::new(p.map.sector_offset(pid), &mut sector)];
            let ok = p.reader.read(&mut batch, &mut ctx)?;
            drop(batch);
            if !ok[0] {
                continue;
            }
            for i in indices {
                let Some((_, pos)) = p.map.locate(ids[i]) else {
                    continue;
                };
                if let Some(nbrs) = p.map.decode_adjacency(&sector, pos) {
                    out[i] = Some(NodeRead {
                        coords: None,
                        nbrs: nbrs.to_vec(),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Populate the node cache.
    ///
    /// Returns how many nodes were cached. BFS failures and unreadable
    /// nodes are skipped silently.
    pub fn warmup_cache(&mut self, warmup: &CacheWarmup) -> Result<usize> {
        let node_list = match warmup {
            CacheWarmup::Bfs { count } => {
                let mut seeds = self.medoids.clone();
                // label medoids are entry points too
                if let Some(filters) = &self.filters {
                    for label_medoids in filters.all_medoid_lists() {
                        seeds.extend_from_slice(label_medoids);
                    }
                }
                seeds.sort_unstable();
                seeds.dedup();
                bfs_node_list(&seeds, self.num_points, *count, |block| {
                    match self.read_nodes(block, false, true) {
                        Ok(reads) => reads
                            .into_iter()
                            .map(|r| r.map(|n| n.nbrs))
                            .collect(),
                        Err(_) => block.iter().map(|_| None).collect(),
                    }
                })
            }
            CacheWarmup::SampleQueries {
                sample_file,
                l_search,
                beam_width,
                count,
            } => self.sample_query_node_list(sample_file, *l_search, *beam_width, *count)?,
        };

        self.load_cache_list(&node_list)?;
        Ok(self.cache.len())
    }

    fn sample_query_node_list(
        &mut self,
        sample_file: &Path,
        l_search: usize,
        beam_width: usize,
        count: usize,
    ) -> Result<Vec<u32>> {
        if count >= self.num_points {
            return Ok((0..self.num_points as u32).collect());
        }

        bin::require_file(sample_file, "sample query file")?;
        let (bytes, n_samples, sample_dim) = bin::load_bin_elems(sample_file, T::WIDTH)?;
        if sample_dim < self.query_dim() {
            return Err(AnnError::Load(format!(
                "sample queries have {sample_dim} dims, need {}",
                self.query_dim()
            )));
        }

        self.visit_counter = (0..self.num_points).map(|_| AtomicU32::new(0)).collect();
        self.count_visits.store(true, Ordering::Release);

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let labels: Vec<Option<L>> = (0..n_samples)
            .map(|_| self.filters.as_ref().map(|f| f.sample_label(&mut rng)))
            .collect();

        let this = &*self;
        (0..n_samples).into_par_iter().for_each(|i| {
            let mut query = vec![T::default(); sample_dim];
            T::decode_slice(&bytes[i * sample_dim * T::WIDTH..], &mut query);
            let opts = SearchOptions::<L> {
                filter: labels[i],
                ..Default::default()
            };
            if let Err(e) = this.search(&query[..this.query_dim()], 1, l_search, beam_width, &opts, None)
            {
                warn!(error = %e, "sample warmup query failed");
            }
        });

        self.count_visits.store(false, Ordering::Release);
        let mut counted: Vec<(u32, u32)> = self
            .visit_counter
            .iter()
            .enumerate()
            .map(|(id, c)| (id as u32, c.load(Ordering::Relaxed)))
            .collect();
        self.visit_counter = Vec::new();
        counted.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(counted.into_iter().take(count).map(|(id, _)| id).collect())
    }

    fn load_cache_list(&mut self, node_list: &[u32]) -> Result<()> {
        const BLOCK: usize = 64;
        let want_coords = self.partition.is_none();
        let mut items = Vec::with_capacity(node_list.len());
        for block in node_list.chunks(BLOCK) {
            let reads = self.read_nodes(block, want_coords, true)?;
            for (&id, read) in block.iter().zip(reads) {
                // failed reads silently skip the node
                if let Some(node) = read {
                    let coords = node
                        .coords
                        .unwrap_or_else(|| vec![0u8; self.disk_bytes_per_point]);
                    items.push((id, coords, node.nbrs));
                }
            }
        }
        self.cache = NodeCache::build(self.disk_bytes_per_point, items);
        Ok(())
    }

    /// Dimension a caller-facing query must have.
    pub fn query_dim(&self) -> usize {
        if self.metric == Metric::InnerProduct && T::IS_FLOAT {
            self.data_dim - 1
        } else {
            self.data_dim
        }
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Frozen-point bookkeeping carried by streaming-built indexes:
    /// `(count, location)`. Frozen points never appear in results.
    pub fn frozen_points(&self) -> (u64, u64) {
        (self.num_frozen_points, self.frozen_location)
    }

    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    /// In-memory PQ code of one node.
    pub fn pq_code(&self, id: u32) -> &[u8] {
        &self.pq_codes[id as usize * self.n_chunks..(id as usize + 1) * self.n_chunks]
    }

    /// Map a label name to its id, falling back to the universal label.
    pub fn convert_label(&self, name: &str) -> Result<L> {
        self.filters
            .as_ref()
            .ok_or(AnnError::FilterNotFound)?
            .convert_label(name)
    }

    pub fn set_embedding_port(&self, port: u16) {
        self.embedding_port.store(port as u32, Ordering::Relaxed);
    }

    pub fn embedding_port(&self) -> u16 {
        self.embedding_port.load(Ordering::Relaxed) as u16
    }

    /// Search many queries on a work-stealing pool.
    ///
    /// `queries` is a flat row-major array of `Q` queries of
    /// [`query_dim`](Self::query_dim) elements each. Returns flat `Q x k`
    /// ids and distances.
    pub fn batch_search(
        &self,
        queries: &[T],
        k: usize,
        l_search: usize,
        beam_width: usize,
        num_threads: usize,
        opts: &SearchOptions<L>,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        let dim = self.query_dim();
        if dim == 0 || queries.len() % dim != 0 {
            return Err(AnnError::InvalidParameter(format!(
                "flat query array of {} elements is not a multiple of {dim}",
                queries.len()
            )));
        }
        let nq = queries.len() / dim;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .build()
            .map_err(|e| AnnError::InvalidParameter(format!("worker pool: {e}")))?;

        let results: Result<Vec<(Vec<u32>, Vec<f32>)>> = pool.install(|| {
            (0..nq)
                .into_par_iter()
                .map(|q| {
                    self.search(&queries[q * dim..(q + 1) * dim], k, l_search, beam_width, opts, None)
                })
                .collect()
        });

        let results = results?;
        let mut ids = Vec::with_capacity(nq * k);
        let mut dists = Vec::with_capacity(nq * k);
        for (mut qids, mut qdists) in results {
            qids.resize(k, u32::MAX);
            qdists.resize(k, f32::MAX);
            ids.extend_from_slice(&qids);
            dists.extend_from_slice(&qdists);
        }
        Ok((ids, dists))
    }

    /// Return every neighbor within `radius`, growing the candidate list
    /// until fewer than half the returned results fall inside it.
    pub fn range_search(
        &self,
        query: &[T],
        radius: f32,
        min_l_search: usize,
        max_l_search: usize,
        min_beam_width: usize,
    ) -> Result<(Vec<u32>, Vec<f32>)> {
        let mut l_search = min_l_search.max(1);

        loop {
            let beam_width = min_beam_width.max(l_search / 5).min(100);
            let opts = SearchOptions::<L>::default();
            let (cur_ids, cur_dists) =
                self.search(query, l_search, l_search, beam_width, &opts, None)?;

            let mut res_count = 0;
            for (i, &d) in cur_dists.iter().enumerate() {
                if d > radius {
                    break;
                }
                res_count = i + 1;
            }

            let done = res_count < l_search / 2 || l_search * 2 > max_l_search;
            if done {
                return Ok((
                    cur_ids[..res_count].to_vec(),
                    cur_dists[..res_count].to_vec(),
                ));
            }
            l_search *= 2;
        }
    }
}
