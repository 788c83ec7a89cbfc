//! In-process workload driver: bulk-load a random base corpus into the graph
//! across all cores, then run concurrent search and insert threads against
//! the engine through the boundary service, reporting latency percentiles.

use anyhow::{Context, Result};
use clap::Parser;
use hdrhistogram::Histogram;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::info;
use vesper_engine::{
    l2_sq, EngineConfig, InsertRequest, SearchRequest, VectorEngine, VectorService, CODE_OK,
};

#[derive(Parser, Debug)]
#[command(
    name = "streaming_workload",
    about = "Bulk-load a random corpus, then drive concurrent searches and inserts in-process."
)]
struct Args {
    #[arg(long, default_value_t = 128)]
    dim: usize,

    /// Base corpus size loaded through the bulk path before streaming starts.
    #[arg(long, default_value_t = 100_000)]
    base_vectors: usize,

    /// Extra node capacity reserved for streaming inserts.
    #[arg(long, default_value_t = 200_000)]
    stream_headroom: usize,

    #[arg(long, default_value_t = 10)]
    k: usize,

    #[arg(long, default_value_t = 16)]
    m: usize,

    #[arg(long = "ef-construction", default_value_t = 200)]
    ef_construction: usize,

    #[arg(long = "ef-search", default_value_t = 100)]
    ef_search: usize,

    #[arg(long, default_value_t = 50_000)]
    buffer_capacity: usize,

    #[arg(long, default_value_t = 2)]
    bg_threads: usize,

    /// Bulk-load threads; 0 uses all available cores.
    #[arg(long, default_value_t = 0)]
    bulk_threads: usize,

    #[arg(long, default_value_t = 4)]
    search_threads: usize,

    #[arg(long, default_value_t = 2)]
    insert_threads: usize,

    /// Length of the streaming phase.
    #[arg(long, default_value_t = 10)]
    stream_secs: u64,

    /// Queries sampled for the post-bulk-load recall check; 0 disables it.
    #[arg(long, default_value_t = 200)]
    recall_queries: usize,
}

fn random_corpus(n: usize, dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..n * dim).map(|_| rng.gen_range(0.0..1.0)).collect()
}

fn brute_force_knn(base: &[f32], n: usize, dim: usize, query: &[f32], k: usize) -> Vec<u32> {
    let mut all: Vec<(f32, u32)> = (0..n)
        .map(|i| (l2_sq(query, &base[i * dim..(i + 1) * dim]), i as u32))
        .collect();
    all.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    all.into_iter().take(k).map(|(_, id)| id).collect()
}

fn percentile_line(name: &str, hist: &Histogram<u64>) {
    println!(
        "{name}: count={} p50={}us p99={}us p999={}us max={}us",
        hist.len(),
        hist.value_at_quantile(0.50) / 1_000,
        hist.value_at_quantile(0.99) / 1_000,
        hist.value_at_quantile(0.999) / 1_000,
        hist.max() / 1_000,
    );
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, 60_000_000_000, 3).expect("histogram bounds")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let dim = args.dim;
    let bulk_threads = if args.bulk_threads == 0 {
        std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
    } else {
        args.bulk_threads
    };

    let cfg = EngineConfig {
        dim,
        max_elements: args.base_vectors + args.stream_headroom,
        m: args.m,
        ef_construction: args.ef_construction,
        buffer_capacity: args.buffer_capacity,
        bg_threads: args.bg_threads,
        ..Default::default()
    };
    let engine = std::sync::Arc::new(VectorEngine::new(cfg).context("engine construction")?);

    info!(base = args.base_vectors, dim, "generating base corpus");
    let base = random_corpus(args.base_vectors, dim);

    // Bulk-load phase: every thread strides the base set and writes straight
    // into the graph, bypassing the foreground buffers.
    info!(threads = bulk_threads, "starting bulk load");
    let built = AtomicUsize::new(0);
    let bulk_start = Instant::now();
    std::thread::scope(|scope| {
        for t in 0..bulk_threads {
            let engine = &engine;
            let base = &base;
            let built = &built;
            scope.spawn(move || {
                let mut i = t;
                while i < args.base_vectors {
                    engine
                        .index()
                        .insert_bulk(&base[i * dim..(i + 1) * dim], i as u32)
                        .expect("bulk insert");
                    let done = built.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % 100_000 == 0 {
                        info!(done, total = args.base_vectors, "bulk load progress");
                    }
                    i += bulk_threads;
                }
            });
        }
    });
    println!(
        "bulk load: {} vectors in {:.2}s",
        args.base_vectors,
        bulk_start.elapsed().as_secs_f64()
    );

    // Recall spot-check against brute force on perturbed base vectors.
    if args.recall_queries > 0 {
        let mut rng = rand::thread_rng();
        let mut hits = 0usize;
        let mut total = 0usize;
        for _ in 0..args.recall_queries {
            let pick = rng.gen_range(0..args.base_vectors);
            let mut query: Vec<f32> = base[pick * dim..(pick + 1) * dim].to_vec();
            for x in query.iter_mut() {
                *x += rng.gen_range(-0.01..0.01);
            }
            let truth = brute_force_knn(&base, args.base_vectors, dim, &query, args.k);
            let got = engine.index().search_knn(&query, args.k, args.ef_search);
            hits += got.iter().filter(|id| truth.contains(id)).count();
            total += truth.len();
        }
        println!(
            "recall@{}: {:.4} over {} queries",
            args.k,
            hits as f64 / total as f64,
            args.recall_queries
        );
    }

    // Streaming phase: searches and inserts hammer the boundary service
    // concurrently, the way the RPC front-end would.
    let service = VectorService::new(engine.clone());
    let service = &service;
    let deadline = Instant::now() + Duration::from_secs(args.stream_secs);
    let next_id = AtomicU64::new(args.base_vectors as u64);
    let search_failures = AtomicU64::new(0);
    info!(
        search_threads = args.search_threads,
        insert_threads = args.insert_threads,
        secs = args.stream_secs,
        "starting streaming phase"
    );

    let (search_hist, insert_hist) = std::thread::scope(|scope| {
        let mut search_handles = Vec::new();
        for _ in 0..args.search_threads {
            let base = &base;
            let search_failures = &search_failures;
            search_handles.push(scope.spawn(move || {
                let mut rng = rand::thread_rng();
                let mut hist = new_histogram();
                while Instant::now() < deadline {
                    let pick = rng.gen_range(0..args.base_vectors);
                    let request = SearchRequest {
                        query: base[pick * dim..(pick + 1) * dim].to_vec(),
                        k: args.k as u32,
                        ef_search: args.ef_search as u32,
                    };
                    let start = Instant::now();
                    let response = service.search(&request);
                    hist.record(start.elapsed().as_nanos() as u64).ok();
                    if response.code != CODE_OK {
                        search_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                hist
            }));
        }

        let mut insert_handles = Vec::new();
        for _ in 0..args.insert_threads {
            let next_id = &next_id;
            insert_handles.push(scope.spawn(move || {
                let mut rng = rand::thread_rng();
                let mut hist = new_histogram();
                while Instant::now() < deadline {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    if id >= (args.base_vectors + args.stream_headroom) as u64 {
                        break;
                    }
                    // Noise vectors far outside the base distribution.
                    let vector: Vec<f32> =
                        (0..dim).map(|_| rng.gen_range(1000.0..2000.0)).collect();
                    let request = InsertRequest {
                        vector,
                        id: id as u32,
                    };
                    let start = Instant::now();
                    let response = service.insert(&request);
                    hist.record(start.elapsed().as_nanos() as u64).ok();
                    assert_eq!(response.code, CODE_OK, "insert rejected");
                }
                hist
            }));
        }

        let mut search_hist = new_histogram();
        for handle in search_handles {
            search_hist.add(&handle.join().expect("search thread")).unwrap();
        }
        let mut insert_hist = new_histogram();
        for handle in insert_handles {
            insert_hist.add(&handle.join().expect("insert thread")).unwrap();
        }
        (search_hist, insert_hist)
    });

    percentile_line("search latency", &search_hist);
    percentile_line("insert latency", &insert_hist);
    println!(
        "search failures: {}",
        search_failures.load(Ordering::Relaxed)
    );

    engine.wait_for_compaction();
    let stats = engine.stats();
    println!(
        "engine stats: inserts={} searches={} compacted_buffers={} queue_depth={}",
        stats.inserts_total, stats.searches_total, stats.buffers_compacted, stats.queue_depth
    );
    Ok(())
}
