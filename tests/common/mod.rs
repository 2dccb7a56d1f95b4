//! Shared fixtures: synthetic on-disk indexes, ground truth, and a mock
//! embedding service.
#![allow(dead_code)]

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use prost::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quiver::embed::{read_frame, write_frame, EmbeddingRequest, EmbeddingResponse};

pub const SECTOR_LEN: usize = 4096;

pub fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Exact top-k by linear scan, `(id, distance)` ascending.
pub fn brute_force_knn(vectors: &[Vec<f32>], query: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut scored: Vec<(u32, f32)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (i as u32, l2(v, query)))
        .collect();
    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

/// k-NN graph plus a couple of random long-range edges per node.
pub fn build_graph(vectors: &[Vec<f32>], degree: usize, seed: u64) -> Vec<Vec<u32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = vectors.len();
    (0..n)
        .map(|i| {
            let mut nbrs: Vec<u32> = brute_force_knn(vectors, &vectors[i], degree + 1)
                .into_iter()
                .map(|(id, _)| id)
                .filter(|&id| id != i as u32)
                .take(degree)
                .collect();
            for _ in 0..2 {
                let r = rng.gen_range(0..n) as u32;
                if r != i as u32 && !nbrs.contains(&r) {
                    nbrs.push(r);
                }
            }
            nbrs
        })
        .collect()
}

/// Node closest to the dataset centroid.
pub fn medoid_of(vectors: &[Vec<f32>]) -> u32 {
    let dim = vectors[0].len();
    let mut centroid = vec![0f32; dim];
    for v in vectors {
        for (c, x) in centroid.iter_mut().zip(v) {
            *c += x / vectors.len() as f32;
        }
    }
    brute_force_knn(vectors, &centroid, 1)[0].0
}

fn suffixed(prefix: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

/// Write the PQ pivot and compressed-code files.
///
/// One chunk per dimension with 256 grid centroids spanning the data
/// range, so PQ distances track exact distances closely.
pub fn write_pq(prefix: &Path, vectors: &[Vec<f32>]) {
    let dim = vectors[0].len();
    let bound = vectors
        .iter()
        .flat_map(|v| v.iter())
        .fold(0f32, |m, x| m.max(x.abs()))
        .max(1e-3)
        * 1.0001;
    let cell = 2.0 * bound / 256.0;

    let mut f = File::create(suffixed(prefix, "_pq_pivots.bin")).unwrap();
    f.write_u32::<LittleEndian>(256).unwrap();
    f.write_u32::<LittleEndian>(dim as u32).unwrap();
    for k in 0..256 {
        let val = -bound + (k as f32 + 0.5) * cell;
        for _ in 0..dim {
            f.write_f32::<LittleEndian>(val).unwrap();
        }
    }
    for _ in 0..dim {
        f.write_f32::<LittleEndian>(0.0).unwrap();
    }
    f.write_u32::<LittleEndian>(dim as u32).unwrap();
    for off in 0..=dim {
        f.write_u32::<LittleEndian>(off as u32).unwrap();
    }
    f.flush().unwrap();

    let mut f = File::create(suffixed(prefix, "_pq_compressed.bin")).unwrap();
    f.write_u32::<LittleEndian>(vectors.len() as u32).unwrap();
    f.write_u32::<LittleEndian>(dim as u32).unwrap();
    for v in vectors {
        for &x in v {
            let code = (((x + bound) / cell) as i32).clamp(0, 255) as u8;
            f.write_all(&[code]).unwrap();
        }
    }
    f.flush().unwrap();
}

/// Write `<prefix>_disk.index` in the default inline layout, plus the PQ
/// files. Returns the medoid id stored in the header.
pub fn write_inline_index(
    prefix: &Path,
    vectors: &[Vec<f32>],
    adjacency: &[Vec<u32>],
    with_medoids_file: bool,
) -> u32 {
    let n = vectors.len();
    let dim = vectors[0].len();
    let dbpp = dim * 4;
    let max_degree = adjacency.iter().map(Vec::len).max().unwrap();
    let max_node_len = dbpp + 4 + 4 * max_degree;
    let nnodes_per_sector = SECTOR_LEN / max_node_len;
    assert!(nnodes_per_sector > 0, "fixture nodes must fit in one sector");
    let medoid = medoid_of(vectors);

    let path = suffixed(prefix, "_disk.index");
    let mut f = File::create(&path).unwrap();
    f.write_u32::<LittleEndian>(9).unwrap();
    f.write_u32::<LittleEndian>(1).unwrap();
    for v in [
        n as u64,
        dim as u64,
        medoid as u64,
        max_node_len as u64,
        nnodes_per_sector as u64,
        0,
        0,
        0,
        0,
    ] {
        f.write_u64::<LittleEndian>(v).unwrap();
    }

    let num_sectors = n.div_ceil(nnodes_per_sector);
    for s in 0..num_sectors {
        f.seek(SeekFrom::Start(((s + 1) * SECTOR_LEN) as u64)).unwrap();
        for j in 0..nnodes_per_sector {
            let id = s * nnodes_per_sector + j;
            if id >= n {
                break;
            }
            let mut record = Vec::with_capacity(max_node_len);
            for &x in &vectors[id] {
                record.extend_from_slice(&x.to_le_bytes());
            }
            record.extend_from_slice(&(adjacency[id].len() as u32).to_le_bytes());
            for &nbr in &adjacency[id] {
                record.extend_from_slice(&nbr.to_le_bytes());
            }
            record.resize(max_node_len, 0);
            f.write_all(&record).unwrap();
        }
    }
    f.flush().unwrap();
    // pad the final sector
    f.set_len(((num_sectors + 1) * SECTOR_LEN) as u64).unwrap();

    write_pq(prefix, vectors);

    if with_medoids_file {
        let mut f = File::create(suffixed(&path, "_medoids.bin")).unwrap();
        f.write_u32::<LittleEndian>(1).unwrap();
        f.write_u32::<LittleEndian>(1).unwrap();
        f.write_u32::<LittleEndian>(medoid).unwrap();
    }
    medoid
}

/// Write the partition-mode file family: graph-only index, partition map,
/// PQ files, medoids and centroids.
pub fn write_partition_index(
    prefix: &Path,
    vectors: &[Vec<f32>],
    adjacency: &[Vec<u32>],
    partition_size: usize,
) {
    let n = vectors.len();
    let dim = vectors[0].len();
    let dbpp = dim * 4;
    let max_degree = adjacency.iter().map(Vec::len).max().unwrap();
    let graph_node_len = 4 + 4 * max_degree;
    let max_node_len = dbpp + graph_node_len;
    assert!(
        partition_size * graph_node_len <= SECTOR_LEN,
        "partition must fit in one sector"
    );

    let partitions: Vec<Vec<u32>> = (0..n)
        .step_by(partition_size)
        .map(|start| (start..(start + partition_size).min(n)).map(|i| i as u32).collect())
        .collect();

    // graph-only index: sector 0 metadata, one partition per sector
    let graph_path = suffixed(prefix, "_disk_graph.index");
    let mut f = File::create(&graph_path).unwrap();
    f.write_u32::<LittleEndian>(9).unwrap();
    f.write_u32::<LittleEndian>(1).unwrap();
    let file_size = ((partitions.len() + 1) * SECTOR_LEN) as u64;
    for v in [
        n as u64,
        dim as u64,
        0,
        max_node_len as u64,
        partition_size as u64,
        0,
        0,
        0,
        file_size,
    ] {
        f.write_u64::<LittleEndian>(v).unwrap();
    }
    for (p, members) in partitions.iter().enumerate() {
        f.seek(SeekFrom::Start(((p + 1) * SECTOR_LEN) as u64)).unwrap();
        let mut sector = vec![0u8; SECTOR_LEN];
        for (j, &id) in members.iter().enumerate() {
            let off = j * graph_node_len;
            let nbrs = &adjacency[id as usize];
            sector[off..off + 4].copy_from_slice(&(nbrs.len() as u32).to_le_bytes());
            for (m, &nbr) in nbrs.iter().enumerate() {
                sector[off + 4 + m * 4..off + 8 + m * 4].copy_from_slice(&nbr.to_le_bytes());
            }
        }
        f.write_all(&sector).unwrap();
    }
    f.flush().unwrap();

    // partition map
    let mut f = File::create(suffixed(prefix, "_partition.bin")).unwrap();
    f.write_u64::<LittleEndian>(partition_size as u64).unwrap();
    f.write_u64::<LittleEndian>(partitions.len() as u64).unwrap();
    f.write_u64::<LittleEndian>(n as u64).unwrap();
    for members in &partitions {
        f.write_u32::<LittleEndian>(members.len() as u32).unwrap();
        for &id in members {
            f.write_u32::<LittleEndian>(id).unwrap();
        }
    }
    for id in 0..n {
        f.write_u32::<LittleEndian>((id / partition_size) as u32).unwrap();
    }
    f.flush().unwrap();

    write_pq(prefix, vectors);

    // partition mode needs explicit entry points
    let disk_index_path = suffixed(prefix, "_disk.index");
    let medoid = medoid_of(vectors);
    let mut f = File::create(suffixed(&disk_index_path, "_medoids.bin")).unwrap();
    f.write_u32::<LittleEndian>(1).unwrap();
    f.write_u32::<LittleEndian>(1).unwrap();
    f.write_u32::<LittleEndian>(medoid).unwrap();

    let mut f = File::create(suffixed(&disk_index_path, "_centroids.bin")).unwrap();
    f.write_u32::<LittleEndian>(1).unwrap();
    f.write_u32::<LittleEndian>(dim as u32).unwrap();
    for &x in &vectors[medoid as usize] {
        f.write_f32::<LittleEndian>(x).unwrap();
    }
    f.flush().unwrap();
}

/// Write a sample-query bin file for warmup.
pub fn write_sample_bin(path: &Path, queries: &[Vec<f32>]) {
    let mut f = File::create(path).unwrap();
    f.write_u32::<LittleEndian>(queries.len() as u32).unwrap();
    f.write_u32::<LittleEndian>(queries[0].len() as u32).unwrap();
    for q in queries {
        for &x in q {
            f.write_f32::<LittleEndian>(x).unwrap();
        }
    }
    f.flush().unwrap();
}

/// Write the label files next to the disk index.
pub fn write_labels(prefix: &Path, labels: &[Vec<u32>], label_medoids: &[(u32, Vec<u32>)]) {
    let disk_index_path = suffixed(prefix, "_disk.index");
    let text: String = labels
        .iter()
        .map(|ls| {
            ls.iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n";
    std::fs::write(suffixed(&disk_index_path, "_labels.txt"), text).unwrap();

    let text: String = label_medoids
        .iter()
        .map(|(label, medoids)| {
            let ms = medoids
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("{label},{ms}")
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n";
    std::fs::write(suffixed(&disk_index_path, "_labels_to_medoids.txt"), text).unwrap();
}

/// Spawn a mock embedding service returning `vectors[id]` for each id.
///
/// After `fail_after` successful responses (if set) every later response
/// carries a truncated payload. Returns the listening port.
pub fn spawn_embedding_server(vectors: Vec<Vec<f32>>, fail_after: Option<usize>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = Arc::new(AtomicUsize::new(0));
    let vectors = Arc::new(vectors);

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let vectors = Arc::clone(&vectors);
            let served = Arc::clone(&served);
            std::thread::spawn(move || {
                let dim = vectors[0].len();
                while let Ok(body) = read_frame(&mut stream) {
                    let Ok(req) = EmbeddingRequest::decode(body.as_slice()) else {
                        return;
                    };
                    let mut blob = Vec::with_capacity(req.node_ids.len() * dim * 4);
                    for &id in &req.node_ids {
                        for &x in &vectors[id as usize] {
                            blob.extend_from_slice(&x.to_le_bytes());
                        }
                    }
                    let n = served.fetch_add(1, Ordering::SeqCst);
                    if fail_after.is_some_and(|limit| n >= limit) {
                        blob.truncate(blob.len() / 2);
                    }
                    let resp = EmbeddingResponse {
                        embeddings_data: blob,
                        dimensions: vec![req.node_ids.len() as i32, dim as i32],
                        missing_ids: vec![],
                    };
                    if write_frame(&mut stream, &resp.encode_to_vec()).is_err() {
                        return;
                    }
                }
            });
        }
    });
    port
}

/// Recall of `got` against ground-truth ids.
pub fn recall(got: &[u32], truth: &[u32]) -> f64 {
    let hit = got.iter().filter(|id| truth.contains(id)).count();
    hit as f64 / truth.len() as f64
}
