//! End-to-end search against synthetic on-disk indexes.

mod common;

use common::*;
use quiver::{CacheWarmup, DiskIndex, Metric, OpenParams, QueryStats, SearchOptions};

fn open_index(prefix: &std::path::Path, threads: usize) -> DiskIndex<f32> {
    let mut params = OpenParams::new(prefix, Metric::L2);
    params.num_threads = threads;
    DiskIndex::open(&params).unwrap()
}

/// One tight cluster at the origin: the ten smallest-norm points must win.
#[test]
fn cluster_at_origin_returns_smallest_norms() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("s1");

    let mut vectors = random_vectors(1000, 8, 7);
    // squash everything toward the origin so norms are well separated
    for (i, v) in vectors.iter_mut().enumerate() {
        let scale = 0.05 + (i as f32) / 1000.0;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
    let adjacency = build_graph(&vectors, 8, 1);
    write_inline_index(&prefix, &vectors, &adjacency, false);

    let index = open_index(&prefix, 1);
    let query = vec![0.0f32; 8];
    let (ids, dists) = index
        .search(&query, 10, 200, 8, &SearchOptions::default(), None)
        .unwrap();

    let truth: Vec<u32> = brute_force_knn(&vectors, &query, 10)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(ids, truth);
    for w in dists.windows(2) {
        assert!(w[0] <= w[1]);
    }
}

#[test]
fn recall_on_random_data() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("recall");

    let vectors = random_vectors(2000, 16, 11);
    let adjacency = build_graph(&vectors, 10, 2);
    write_inline_index(&prefix, &vectors, &adjacency, true);
    let index = open_index(&prefix, 1);

    let queries = random_vectors(20, 16, 99);
    let mut total = 0.0;
    for q in &queries {
        let (ids, dists) = index
            .search(q, 10, 100, 4, &SearchOptions::default(), None)
            .unwrap();
        let truth: Vec<u32> = brute_force_knn(&vectors, q, 10)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        total += recall(&ids, &truth);

        // distances must be the exact full-precision values
        for (&id, &d) in ids.iter().zip(dists.iter()) {
            assert!((d - l2(&vectors[id as usize], q)).abs() < 1e-4);
        }
    }
    assert!(total / 20.0 >= 0.9, "mean recall {} too low", total / 20.0);
}

/// An io budget cuts the walk short but still returns best-found-so-far.
#[test]
fn io_limit_bounds_sector_reads() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("iolimit");

    let vectors = random_vectors(1500, 12, 3);
    let adjacency = build_graph(&vectors, 8, 4);
    write_inline_index(&prefix, &vectors, &adjacency, false);
    let index = open_index(&prefix, 1);

    let query = random_vectors(1, 12, 55).pop().unwrap();
    let opts = SearchOptions {
        io_limit: 4,
        ..Default::default()
    };
    let mut stats = QueryStats::default();
    let (ids, dists) = index
        .search(&query, 5, 50, 2, &opts, Some(&mut stats))
        .unwrap();

    assert!(stats.n_ios <= 4, "issued {} reads", stats.n_ios);
    assert!(!ids.is_empty());
    for w in dists.windows(2) {
        assert!(w[0] <= w[1]);
    }
}

#[test]
fn results_have_no_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("dedup");

    let vectors = random_vectors(800, 8, 21);
    let adjacency = build_graph(&vectors, 8, 5);
    write_inline_index(&prefix, &vectors, &adjacency, false);
    let index = open_index(&prefix, 1);

    for (i, q) in random_vectors(10, 8, 77).iter().enumerate() {
        let (ids, _) = index
            .search(q, 20, 60, 4, &SearchOptions::default(), None)
            .unwrap();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len(), "duplicates in query {i}");
    }
}

#[test]
fn bfs_warmup_caches_and_preserves_results() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("bfs");

    let vectors = random_vectors(1000, 8, 31);
    let adjacency = build_graph(&vectors, 8, 6);
    write_inline_index(&prefix, &vectors, &adjacency, true);

    let mut index = open_index(&prefix, 1);
    let query = random_vectors(1, 8, 13).pop().unwrap();
    let (before, _) = index
        .search(&query, 10, 80, 4, &SearchOptions::default(), None)
        .unwrap();

    let cached = index.warmup_cache(&CacheWarmup::Bfs { count: 80 }).unwrap();
    assert!(cached <= 80);
    assert!(cached > 0);

    let mut stats = QueryStats::default();
    let (after, _) = index
        .search(&query, 10, 80, 4, &SearchOptions::default(), Some(&mut stats))
        .unwrap();
    assert_eq!(before, after, "cache must not change results");
    assert!(stats.n_cache_hits > 0, "warm cache saw no hits");
}

#[test]
fn bfs_warmup_caps_at_ten_percent() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("cap");

    let vectors = random_vectors(500, 8, 41);
    let adjacency = build_graph(&vectors, 6, 7);
    write_inline_index(&prefix, &vectors, &adjacency, false);

    let mut index = open_index(&prefix, 1);
    let cached = index
        .warmup_cache(&CacheWarmup::Bfs { count: 400 })
        .unwrap();
    assert!(cached <= 50, "cached {cached} of 500 nodes");
}

#[test]
fn sample_query_warmup() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("sample");

    let vectors = random_vectors(1000, 8, 51);
    let adjacency = build_graph(&vectors, 8, 8);
    write_inline_index(&prefix, &vectors, &adjacency, false);
    let sample_path = dir.path().join("samples.bin");
    write_sample_bin(&sample_path, &random_vectors(10, 8, 101));

    let mut index = open_index(&prefix, 2);
    let cached = index
        .warmup_cache(&CacheWarmup::SampleQueries {
            sample_file: sample_path,
            l_search: 30,
            beam_width: 4,
            count: 150,
        })
        .unwrap();
    assert!(cached > 0 && cached <= 150);

    // the medoid is visited by every query, so it must be cached
    let mut stats = QueryStats::default();
    let query = random_vectors(1, 8, 5).pop().unwrap();
    index
        .search(&query, 5, 40, 4, &SearchOptions::default(), Some(&mut stats))
        .unwrap();
    assert!(stats.n_cache_hits > 0);
}

#[test]
fn batch_search_matches_single_queries() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("batch");

    let vectors = random_vectors(900, 8, 61);
    let adjacency = build_graph(&vectors, 8, 9);
    write_inline_index(&prefix, &vectors, &adjacency, false);
    let index = open_index(&prefix, 4);

    let queries = random_vectors(16, 8, 202);
    let flat: Vec<f32> = queries.iter().flatten().copied().collect();
    let (batch_ids, batch_dists) = index
        .batch_search(&flat, 5, 50, 4, 4, &SearchOptions::default())
        .unwrap();
    assert_eq!(batch_ids.len(), 16 * 5);

    for (i, q) in queries.iter().enumerate() {
        let (ids, dists) = index
            .search(q, 5, 50, 4, &SearchOptions::default(), None)
            .unwrap();
        assert_eq!(&batch_ids[i * 5..i * 5 + 5], &ids[..]);
        for (a, b) in batch_dists[i * 5..i * 5 + 5].iter().zip(dists.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}

#[test]
fn filtered_search_respects_labels() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("filters");

    let vectors = random_vectors(500, 8, 71);
    let adjacency = build_graph(&vectors, 8, 10);
    // label 7 marks exactly 20 points; everyone carries label 1
    let special: Vec<u32> = (0..20).map(|i| i * 25).collect();
    let labels: Vec<Vec<u32>> = (0..500)
        .map(|i| {
            if special.contains(&(i as u32)) {
                vec![1, 7]
            } else {
                vec![1]
            }
        })
        .collect();
    write_inline_index(&prefix, &vectors, &adjacency, true);
    write_labels(&prefix, &labels, &[(1, vec![0]), (7, vec![special[0]])]);

    let index = open_index(&prefix, 1);
    let query = random_vectors(1, 8, 303).pop().unwrap();
    let opts = SearchOptions {
        filter: Some(7u32),
        ..Default::default()
    };
    let (ids, _) = index.search(&query, 10, 60, 4, &opts, None).unwrap();

    assert!(!ids.is_empty());
    for id in &ids {
        assert!(special.contains(id), "{id} lacks the filter label");
    }

    // a label with no registered medoid fails loudly
    let opts = SearchOptions {
        filter: Some(99u32),
        ..Default::default()
    };
    assert!(index.search(&query, 10, 60, 4, &opts, None).is_err());
}

#[test]
fn range_search_returns_radius_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("range");

    let vectors = random_vectors(1000, 8, 81);
    let adjacency = build_graph(&vectors, 8, 11);
    write_inline_index(&prefix, &vectors, &adjacency, false);
    let index = open_index(&prefix, 1);

    let query = random_vectors(1, 8, 404).pop().unwrap();
    let radius = 0.4f32;
    let (ids, dists) = index
        .range_search(&query, radius, 20, 200, 4)
        .unwrap();

    assert_eq!(ids.len(), dists.len());
    for &d in &dists {
        assert!(d <= radius);
    }
    for w in dists.windows(2) {
        assert!(w[0] <= w[1]);
    }

    // distances are the true full-precision values for the returned ids
    for (&id, &d) in ids.iter().zip(dists.iter()) {
        assert!((d - l2(&vectors[id as usize], &query)).abs() < 1e-4);
    }
}

#[test]
fn invalid_parameters_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("params");

    let vectors = random_vectors(300, 8, 91);
    let adjacency = build_graph(&vectors, 6, 12);
    write_inline_index(&prefix, &vectors, &adjacency, false);
    let index = open_index(&prefix, 1);
    let query = vec![0.0f32; 8];

    // l_search below k
    assert!(index
        .search(&query, 10, 5, 4, &SearchOptions::default(), None)
        .is_err());
    // oversized beam
    assert!(index
        .search(&query, 5, 50, 100_000, &SearchOptions::default(), None)
        .is_err());
    // short query
    assert!(index
        .search(&query[..4], 5, 50, 4, &SearchOptions::default(), None)
        .is_err());
    // reorder data is not in this index
    let opts = SearchOptions {
        use_reorder_data: true,
        ..Default::default()
    };
    assert!(index.search(&query, 5, 50, 4, &opts, None).is_err());
}
