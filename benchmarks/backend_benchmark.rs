//! Host vs GPU inference benchmark
//!
//! Runs the same synthetic network on every available backend, checks each result against
//! the host reference forward pass and reports wall-clock and device time per inference.
//!
//! Run with: cargo run --release --bin backend_benchmark

use std::time::Instant;

use clap::Parser;
use log::{error, info, warn};
use sinenet_inference::errors::BackendError;
use sinenet_inference::network::{LayerDefinition, TOPOLOGY};
use sinenet_inference::{
    ComputeBackend, HostBackend, InferencePipeline, KernelCatalog, NetworkDefinition,
    PipelineConfig, WgpuBackend,
};

const TOLERANCE: f32 = 1e-4;

#[derive(Parser, Debug)]
#[command(name = "backend_benchmark")]
struct Args {
    /// Inferences per backend
    #[arg(long, default_value_t = 1_000)]
    iterations: usize,

    /// Seed for the synthetic weights
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Deterministic parameters in [-1, 1) from a linear congruential generator.
fn synthetic_network(seed: u64) -> NetworkDefinition {
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    };

    let layers = TOPOLOGY
        .iter()
        .map(|&(input_width, output_width)| {
            let weights = (0..input_width * output_width).map(|_| next()).collect();
            let bias = (0..output_width).map(|_| next() * 0.1).collect();
            LayerDefinition::new(input_width, output_width, weights, bias)
        })
        .collect();

    NetworkDefinition { layers }
}

struct BenchmarkResult {
    backend: String,
    wall_ms: f64,
    device_ms: f64,
    max_error: f32,
}

fn run_benchmark<B: ComputeBackend>(
    backend: B,
    network: &NetworkDefinition,
    iterations: usize,
) -> Result<BenchmarkResult, Box<dyn std::error::Error>> {
    let mut pipeline = InferencePipeline::new(backend, network)?;
    let name = pipeline.device_info().device.clone();
    info!("Benchmarking {} ({} iterations)", name, iterations);

    // Warmup
    for _ in 0..10 {
        pipeline.infer(0.0)?;
    }

    let mut device_ns = 0u64;
    let mut max_error = 0.0f32;
    let start = Instant::now();
    for i in 0..iterations {
        let x = (i as f32 / iterations as f32) * std::f32::consts::TAU - std::f32::consts::PI;
        let (output, report) = pipeline.infer_profiled(x)?;
        device_ns += report.total_ns;
        let expected = network.reference_forward(x);
        max_error = max_error.max((output - expected).abs() / expected.abs().max(1.0));
    }
    let elapsed = start.elapsed();

    let runs = iterations.max(1) as f64;
    Ok(BenchmarkResult {
        backend: name,
        wall_ms: elapsed.as_secs_f64() * 1000.0 / runs,
        device_ms: device_ns as f64 / 1_000_000.0 / runs,
        max_error,
    })
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    println!("\n=== Backend Inference Benchmark ===\n");
    println!("Network: 1 -> 16 (relu) -> 16 (relu) -> 1");
    println!("Iterations per backend: {}\n", args.iterations);

    let network = synthetic_network(args.seed);
    let catalog = KernelCatalog::bundled();
    let mut results = Vec::new();

    match HostBackend::initialize(&catalog) {
        Ok(backend) => match run_benchmark(backend, &network, args.iterations) {
            Ok(result) => results.push(result),
            Err(e) => error!("Host benchmark failed: {}", e),
        },
        Err(e) => error!("Failed to initialize host device: {}", e),
    }

    match WgpuBackend::initialize(&catalog, &PipelineConfig::default()) {
        Ok(backend) => match run_benchmark(backend, &network, args.iterations) {
            Ok(result) => results.push(result),
            Err(e) => error!("GPU benchmark failed: {}", e),
        },
        Err(BackendError::DeviceUnavailable { message }) => {
            warn!("Skipping GPU benchmark: {}", message);
        }
        Err(e) => error!("Failed to initialize GPU device: {}", e),
    }

    println!(
        "{:<32} {:>14} {:>14} {:>12}",
        "Backend", "Wall (ms/inf)", "Device (ms)", "Max error"
    );
    println!("{}", "-".repeat(75));
    let mut failed = results.is_empty();
    for result in &results {
        let status = if result.max_error <= TOLERANCE { "" } else { "  MISMATCH" };
        failed |= result.max_error > TOLERANCE;
        println!(
            "{:<32} {:>14.4} {:>14.4} {:>12.2e}{}",
            result.backend, result.wall_ms, result.device_ms, result.max_error, status
        );
    }

    if failed {
        std::process::exit(1);
    }
}
