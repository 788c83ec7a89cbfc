//! Recall and structural properties of the graph index: bulk-load quality
//! against brute force, ordering, determinism, and layer-0 reachability.

use rand::Rng;
use vesper_engine::{l2_sq, HnswIndex};

fn random_vectors(n: usize, dim: usize) -> Vec<Vec<f32>> {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(0.0..1.0)).collect())
        .collect()
}

/// Brute force k-NN ground truth.
fn brute_force_knn(vectors: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u32> {
    let mut all: Vec<(f32, u32)> = vectors
        .iter()
        .enumerate()
        .map(|(i, v)| (l2_sq(query, v), i as u32))
        .collect();
    all.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    all.into_iter().take(k).map(|(_, id)| id).collect()
}

/// Fraction of ground-truth ids present in the approximate result.
fn recall(approx: &[u32], truth: &[u32]) -> f64 {
    let found = approx.iter().filter(|id| truth.contains(id)).count();
    found as f64 / truth.len() as f64
}

#[test]
fn bulk_load_recall_at_10() {
    let dim = 32;
    let n = 2000;
    let vectors = random_vectors(n, dim);
    let index = HnswIndex::new(dim, n, 16, 200).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.insert_bulk(v, i as u32).unwrap();
    }

    let mut total = 0.0;
    let queries = 100;
    let mut rng = rand::thread_rng();
    for _ in 0..queries {
        let mut query = vectors[rng.gen_range(0..n)].clone();
        for x in query.iter_mut() {
            *x += rng.gen_range(-0.02..0.02);
        }
        let truth = brute_force_knn(&vectors, &query, 10);
        let got = index.search_knn(&query, 10, 100);
        total += recall(&got, &truth);
    }
    let avg = total / queries as f64;
    assert!(avg >= 0.95, "recall@10 too low: {avg:.4}");
}

#[test]
fn streaming_insert_recall_at_10() {
    let dim = 32;
    let n = 1500;
    let vectors = random_vectors(n, dim);
    let index = HnswIndex::new(dim, n, 16, 200).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.insert(v, i as u32).unwrap();
    }

    let mut total = 0.0;
    let queries = 100;
    for q in 0..queries {
        let query = &vectors[q * 7 % n];
        let truth = brute_force_knn(&vectors, query, 10);
        let got = index.search_knn(query, 10, 100);
        total += recall(&got, &truth);
    }
    let avg = total / queries as f64;
    assert!(avg >= 0.95, "recall@10 too low: {avg:.4}");
}

#[test]
fn search_results_ordered_by_distance() {
    let dim = 16;
    let vectors = random_vectors(500, dim);
    let index = HnswIndex::new(dim, 512, 8, 100).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.insert_bulk(v, i as u32).unwrap();
    }
    for query in vectors.iter().take(20) {
        let ids = index.search_knn(query, 10, 64);
        let dists: Vec<f32> = ids.iter().map(|&id| l2_sq(query, index.vector(id))).collect();
        assert!(
            dists.windows(2).all(|w| w[0] <= w[1]),
            "unordered result: {dists:?}"
        );
    }
}

#[test]
fn fixed_graph_yields_repeatable_results() {
    let dim = 16;
    let vectors = random_vectors(400, dim);
    let index = HnswIndex::new(dim, 512, 8, 100).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.insert(v, i as u32).unwrap();
    }
    for query in vectors.iter().take(25) {
        let first = index.search_knn(query, 10, 80);
        let second = index.search_knn(query, 10, 80);
        assert_eq!(first, second);
    }
}

#[test]
fn every_inserted_id_is_reachable_on_layer_zero() {
    let dim = 8;
    let n = 600;
    let vectors = random_vectors(n, dim);
    let index = HnswIndex::new(dim, n, 8, 100).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.insert(v, i as u32).unwrap();
    }

    let entry = index.entry_point().expect("non-empty graph");
    let mut seen = vec![false; n];
    let mut stack = vec![entry];
    seen[entry as usize] = true;
    let mut reached = 0usize;
    while let Some(id) = stack.pop() {
        reached += 1;
        for nb in index.layer_links(id, 0) {
            if !seen[nb as usize] {
                seen[nb as usize] = true;
                stack.push(nb);
            }
        }
    }
    assert_eq!(reached, n, "layer-0 graph is not fully connected");
}

#[test]
fn self_query_returns_self_first() {
    let dim = 16;
    let vectors = random_vectors(300, dim);
    let index = HnswIndex::new(dim, 512, 8, 100).unwrap();
    for (i, v) in vectors.iter().enumerate() {
        index.insert_bulk(v, i as u32).unwrap();
    }
    let mut hits = 0;
    for (i, v) in vectors.iter().enumerate() {
        let got = index.search_knn(v, 1, 50);
        if got.first() == Some(&(i as u32)) {
            hits += 1;
        }
    }
    assert!(hits >= 297, "self query misses: {}/300", 300 - hits);
}
