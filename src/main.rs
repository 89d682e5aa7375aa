//! xsync - buffer benchmarks and flush pipeline demo
//!
//! Measures write/drain latency of both buffers, then runs a full pipeline:
//! producer threads -> buffer -> flusher thread -> mmap journal.
//!
//! Usage:
//!   cargo run --release -- [OPTIONS]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use xsync::{Flusher, FlusherConfig, MmapJournal, RingBuffer, TripleBuffer, WriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ring,
    Triple,
    All,
}

/// Benchmark configuration
struct BenchConfig {
    mode: Mode,
    producers: usize,
    records: usize,
    record_size: usize,
    capacity: usize,
    journal_path: String,
    verbose: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            mode: Mode::All,
            producers: 4,
            records: 250_000,
            record_size: 64,
            capacity: 1024 * 1024,
            journal_path: "xsync_bench.jnl".to_string(),
            verbose: false,
        }
    }
}

fn main() {
    let config = parse_args();
    init_tracing(config.verbose);

    println!("xsync - lock-free log buffers");
    println!("=============================\n");

    if matches!(config.mode, Mode::Ring | Mode::All) {
        benchmark_ring_buffer(&config);
        if let Err(e) = run_pipeline(&config, Mode::Ring) {
            error!(error = %e, "ring pipeline failed");
            std::process::exit(1);
        }
    }

    if matches!(config.mode, Mode::Triple | Mode::All) {
        benchmark_triple_buffer(&config);
        if let Err(e) = run_pipeline(&config, Mode::Triple) {
            error!(error = %e, "triple pipeline failed");
            std::process::exit(1);
        }
    }

    println!("\nAll benchmarks complete!");
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "xsync=debug" } else { "xsync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn benchmark_ring_buffer(config: &BenchConfig) {
    println!("Ring Buffer Benchmark (single thread)");
    println!("-------------------------------------");

    let iterations = config.records;
    let rb = RingBuffer::new(config.capacity);
    let record = vec![0xA5u8; config.record_size];

    // Warm up
    for _ in 0..1000 {
        rb.write(&record);
    }
    while !rb.read(config.capacity).is_empty() {}

    // Write latency; drain whenever the ring fills up
    let start = Instant::now();
    for _ in 0..iterations {
        while !rb.write(&record) {
            rb.read(config.capacity);
        }
    }
    let write_duration = start.elapsed();
    while !rb.read(config.capacity).is_empty() {}

    // Read latency, one record per read
    let per_round = (config.capacity - 1) / config.record_size;
    let mut remaining = iterations;
    let mut read_duration = Duration::ZERO;
    while remaining > 0 {
        let round = remaining.min(per_round);
        for _ in 0..round {
            rb.write(&record);
        }
        let start = Instant::now();
        for _ in 0..round {
            rb.read(config.record_size);
        }
        read_duration += start.elapsed();
        remaining -= round;
    }

    print_latency(iterations, config.record_size, write_duration, read_duration);
}

fn benchmark_triple_buffer(config: &BenchConfig) {
    println!("Triple Buffer Benchmark (single thread)");
    println!("---------------------------------------");

    let iterations = config.records;
    let slot_size = config.capacity / 3;
    let tb = TripleBuffer::new(slot_size);
    let record = vec![0x5Au8; config.record_size];

    let start = Instant::now();
    for _ in 0..iterations {
        while !tb.write(record.len(), |dst| dst.copy_from_slice(&record)) {
            tb.flush(|_| {});
        }
    }
    let write_duration = start.elapsed();

    let start = Instant::now();
    let mut flushed = 0usize;
    // Visit every slot twice
    for _ in 0..xsync::core::SLOTS * 2 {
        tb.flush(|batch| flushed += batch.len());
    }
    let flush_duration = start.elapsed();

    print_latency(iterations, config.record_size, write_duration, flush_duration);
    println!("  Flushed tail: {} bytes\n", flushed);
}

fn print_latency(iterations: usize, record_size: usize, write: Duration, drain: Duration) {
    let write_ns = write.as_nanos() as f64 / iterations as f64;
    let drain_ns = drain.as_nanos() as f64 / iterations as f64;

    println!("  Record size:   {} bytes", record_size);
    println!("  Operations:    {}", iterations);
    println!(
        "  Write latency: {:.2} ns/op ({:.3} us/op)",
        write_ns,
        write_ns / 1000.0
    );
    println!(
        "  Drain latency: {:.2} ns/op ({:.3} us/op)",
        drain_ns,
        drain_ns / 1000.0
    );
    println!(
        "  Throughput:    {:.2} M records/sec\n",
        iterations as f64 / write.as_secs_f64() / 1_000_000.0
    );
}

/// Producers -> buffer -> flusher -> journal
fn run_pipeline(config: &BenchConfig, mode: Mode) -> xsync::Result<()> {
    let label = if mode == Mode::Ring { "ring" } else { "triple" };
    println!("Pipeline ({}, {} producers)", label, config.producers);
    println!("-----------------------------------");

    let total_records = config.producers * config.records;
    let journal_capacity = total_records * config.record_size;
    let journal = MmapJournal::open(&config.journal_path, journal_capacity)?;
    let flusher_config = FlusherConfig::default()
        .with_interval(Duration::from_millis(1))
        .with_thread_name(format!("xsync-{}-flusher", label));

    let retries = Arc::new(AtomicU64::new(0));
    let record_size = config.record_size;
    let records = config.records;

    let start = Instant::now();
    let (flusher, producers): (Flusher<MmapJournal>, Vec<thread::JoinHandle<()>>) = match mode {
        Mode::Ring => {
            let (producer, consumer) = RingBuffer::new(config.capacity).split();
            let flusher = Flusher::spawn(consumer, journal, flusher_config)?;
            let handles = (0..config.producers)
                .map(|id| {
                    let producer = producer.clone();
                    let retries = Arc::clone(&retries);
                    thread::spawn(move || {
                        let record = vec![id as u8; record_size];
                        for _ in 0..records {
                            while let Err(e) = producer.try_write(&record) {
                                backpressure(e, &retries);
                            }
                        }
                    })
                })
                .collect();
            (flusher, handles)
        }
        _ => {
            let (writer, flusher_side) = TripleBuffer::new(config.capacity / 3).split();
            let flusher = Flusher::spawn(flusher_side, journal, flusher_config)?;
            let handles = (0..config.producers)
                .map(|id| {
                    let writer = writer.clone();
                    let retries = Arc::clone(&retries);
                    thread::spawn(move || {
                        for _ in 0..records {
                            while let Err(e) = writer.try_write(record_size, |dst| dst.fill(id as u8)) {
                                backpressure(e, &retries);
                            }
                        }
                    })
                })
                .collect();
            (flusher, handles)
        }
    };

    for handle in producers {
        if handle.join().is_err() {
            error!("producer thread panicked");
        }
    }
    let produce_duration = start.elapsed();

    let errors = flusher.stats().errors();
    let journal = flusher.shutdown()?;
    let total_duration = start.elapsed();

    let total_bytes = total_records * record_size;
    println!("  Records:       {}", total_records);
    println!("  Journal bytes: {} / {}", journal.len(), total_bytes);
    println!("  Retries:       {}", retries.load(Ordering::Relaxed));
    println!("  Sink errors:   {}", errors);
    println!(
        "  Produce:       {:.2} M records/sec",
        total_records as f64 / produce_duration.as_secs_f64() / 1_000_000.0
    );
    println!(
        "  End to end:    {:.2} MB/sec\n",
        total_bytes as f64 / total_duration.as_secs_f64() / 1_000_000.0
    );

    info!(path = %journal.path().display(), len = journal.len(), "journal written");
    std::fs::remove_file(journal.path()).ok();
    Ok(())
}

/// Producer-side policy for rejected records: oversized records are a bug in
/// the demo, full buffers are waited out.
fn backpressure(e: WriteError, retries: &AtomicU64) {
    assert!(e.is_transient(), "{}", e);
    retries.fetch_add(1, Ordering::Relaxed);
    thread::yield_now();
}

fn parse_args() -> BenchConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = BenchConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" | "-m" => {
                if i + 1 < args.len() {
                    config.mode = match args[i + 1].as_str() {
                        "ring" => Mode::Ring,
                        "triple" => Mode::Triple,
                        _ => Mode::All,
                    };
                    i += 1;
                }
            }
            "--producers" | "-p" => {
                if i + 1 < args.len() {
                    config.producers = args[i + 1].parse().unwrap_or(4).max(1);
                    i += 1;
                }
            }
            "--records" | "-n" => {
                if i + 1 < args.len() {
                    config.records = args[i + 1].parse().unwrap_or(250_000).max(1);
                    i += 1;
                }
            }
            "--record-size" => {
                if i + 1 < args.len() {
                    config.record_size = args[i + 1].parse().unwrap_or(64).max(1);
                    i += 1;
                }
            }
            "--capacity" | "-c" => {
                if i + 1 < args.len() {
                    config.capacity = args[i + 1].parse().unwrap_or(1024 * 1024);
                    i += 1;
                }
            }
            "--journal" | "-j" => {
                if i + 1 < args.len() {
                    config.journal_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                println!("xsync - lock-free log buffer benchmarks\n");
                println!("Usage: xsync [OPTIONS]\n");
                println!("Options:");
                println!("  -m, --mode <MODE>       ring | triple | all (default: all)");
                println!("  -p, --producers <N>     Producer threads (default: 4)");
                println!("  -n, --records <N>       Records per producer (default: 250000)");
                println!("      --record-size <B>   Record size in bytes (default: 64)");
                println!("  -c, --capacity <B>      Buffer capacity in bytes (default: 1048576)");
                println!("  -j, --journal <PATH>    Journal file (default: xsync_bench.jnl)");
                println!("  -v, --verbose           Debug logging");
                println!("  -h, --help              Show this help");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    // Every record must fit a triple buffer slot
    config.capacity = config.capacity.max(config.record_size * 3 + 3);
    config
}
