//! Quiver benchmark binary.
//!
//! Builds an index over random vectors and reports build time, query
//! latency and recall against an exhaustive scan.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiver::distance::DistanceProvider;
use quiver::prelude::*;

/// Quiver - build and query an HNSW index over random data
#[derive(Parser, Debug, Clone)]
#[command(name = "quiver")]
#[command(about = "Benchmark the Quiver HNSW index on random vectors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct QuiverArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    output_format: OutputFormat,

    /// Number of indexed vectors
    #[arg(short = 'n', long, default_value_t = 10_000)]
    count: u64,

    /// Number of held-out queries
    #[arg(short, long, default_value_t = 100)]
    queries: usize,

    /// Vector dimensions
    #[arg(short, long, default_value_t = 128)]
    dimensions: usize,

    /// Results per query
    #[arg(short, long, default_value_t = 10)]
    k: usize,

    /// Maximum connections per node (M)
    #[arg(short, long, default_value_t = 32)]
    m: usize,

    /// Beam width while building
    #[arg(long, default_value_t = 64)]
    ef_construction: usize,

    /// Beam width while searching
    #[arg(long, default_value_t = 100)]
    ef: usize,

    /// Distance metric (l2-squared, cosine, dot)
    #[arg(long, default_value = "l2-squared")]
    distance: String,

    /// Train product quantization with this many segments after building
    #[arg(long)]
    pq_segments: Option<usize>,

    /// Seed for data and level generation
    #[arg(long, default_value_t = 42, env = "QUIVER_SEED")]
    seed: u64,

    /// Persist the commit log here instead of keeping the index in memory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Debug, Serialize)]
struct Report {
    count: u64,
    dimensions: usize,
    queries: usize,
    k: usize,
    build_secs: f64,
    mean_query_micros: f64,
    p99_query_micros: f64,
    recall: f64,
    stats: IndexStats,
}

fn random_vector(rng: &mut StdRng, dimensions: usize) -> Vec<f32> {
    (0..dimensions).map(|_| rng.random::<f32>()).collect()
}

/// Exact top-k by exhaustive scan.
fn ground_truth(
    metric: DistanceMetric,
    data: &[(u64, Vec<f32>)],
    query: &[f32],
    k: usize,
) -> Result<Vec<u64>> {
    let mut prepared = query.to_vec();
    metric.provider().prepare(&mut prepared);
    let mut scored = Vec::with_capacity(data.len());
    for (id, vector) in data {
        let mut candidate = vector.clone();
        metric.provider().prepare(&mut candidate);
        scored.push((metric.distance(&prepared, &candidate)?, *id));
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    Ok(scored.into_iter().take(k).map(|(_, id)| id).collect())
}

fn run(args: &QuiverArgs) -> Result<Report> {
    let metric = DistanceMetric::parse_str(&args.distance)?;
    let config = UserConfig::default()
        .with_distance(metric)
        .with_max_connections(args.m)
        .with_ef_construction(args.ef_construction)
        .with_ef(args.ef)
        .with_seed(args.seed);

    let store = Arc::new(MemoryVectorStore::new());
    let mut options = IndexOptions::new("bench", args.dimensions, store.clone()).with_config(config);
    if let Some(dir) = &args.data_dir {
        options = options.with_storage(Arc::new(FileStorage::open(dir)?));
    }
    let index = HnswIndex::open(options)?;
    let ctx = Context::background();

    let mut rng = StdRng::seed_from_u64(args.seed);
    let data: Vec<(u64, Vec<f32>)> = (0..args.count)
        .map(|id| (id, random_vector(&mut rng, args.dimensions)))
        .collect();
    for (id, vector) in &data {
        store.put(*id, vector.clone());
    }

    let started = Instant::now();
    index.add_batch(&ctx, &data)?;
    if let Some(segments) = args.pq_segments {
        let pq = PqConfig {
            enabled: true,
            segments,
            ..PqConfig::default()
        };
        index.update_user_config(&ctx, index.config().with_pq(pq))?;
    }
    let build = started.elapsed();
    info!(count = args.count, secs = build.as_secs_f64(), "index built");

    let mut latencies = Vec::with_capacity(args.queries);
    let mut hits = 0usize;
    for _ in 0..args.queries {
        let query = random_vector(&mut rng, args.dimensions);
        let started = Instant::now();
        let results = index.search_by_vector(&ctx, &query, args.k, None)?;
        latencies.push(started.elapsed());

        let truth = ground_truth(metric, &data, &query, args.k)?;
        hits += results.ids.iter().filter(|id| truth.contains(id)).count();
    }
    latencies.sort();

    index.flush()?;
    let stats = index.stats()?;
    index.shutdown()?;

    let total: Duration = latencies.iter().sum();
    let p99 = latencies
        .get((latencies.len() * 99 / 100).min(latencies.len().saturating_sub(1)))
        .copied()
        .unwrap_or_default();
    Ok(Report {
        count: args.count,
        dimensions: args.dimensions,
        queries: args.queries,
        k: args.k,
        build_secs: build.as_secs_f64(),
        mean_query_micros: total.as_micros() as f64 / args.queries.max(1) as f64,
        p99_query_micros: p99.as_micros() as f64,
        recall: hits as f64 / (args.queries * args.k).max(1) as f64,
        stats,
    })
}

fn print_report(report: &Report, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Human => {
            println!("vectors:        {} x {}", report.count, report.dimensions);
            println!("build time:     {:.2}s", report.build_secs);
            println!("mean latency:   {:.1}us", report.mean_query_micros);
            println!("p99 latency:    {:.1}us", report.p99_query_micros);
            println!("recall@{}:      {:.4}", report.k, report.recall);
            println!("max level:      {}", report.stats.max_level);
            println!("compressed:     {}", report.stats.compressed);
        }
    }
    Ok(())
}

fn main() {
    let args = QuiverArgs::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = run(&args).and_then(|report| print_report(&report, args.output_format));
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
