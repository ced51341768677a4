//! Runs one profiled inference of a network definition and prints the timing report.

use std::error::Error;
use std::f32::consts::FRAC_PI_4;
use std::path::PathBuf;

use clap::Parser;
use log::error;
use sinenet_inference::{
    BackendKind, ComputeBackend, HostBackend, InferencePipeline, NetworkDefinition, PipelineConfig,
    WgpuBackend,
};

#[derive(Parser, Debug)]
#[command(name = "sinenet", about = "Dense-network inference on a compute backend")]
struct Cli {
    /// Network definition (JSON) with the three layers' weights and biases
    #[arg(long)]
    network: PathBuf,

    /// Input value
    #[arg(long, default_value_t = FRAC_PI_4)]
    input: f32,

    /// Pipeline configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Kernel program to compile instead of the bundled one
    #[arg(long)]
    kernel_source: Option<PathBuf>,

    /// Print the timing report as JSON
    #[arg(long)]
    json: bool,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("Inference failed: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if cli.kernel_source.is_some() {
        config.kernel_source = cli.kernel_source.clone();
    }

    let network = NetworkDefinition::from_json_file(&cli.network)?;
    let catalog = config.kernel_catalog()?;
    println!("Fetched kernel source: {} bytes", catalog.source().len());

    match config.backend {
        BackendKind::Host => run_on(HostBackend::initialize(&catalog)?, &network, &cli),
        BackendKind::Wgpu => run_on(
            WgpuBackend::initialize(&catalog, &config)?,
            &network,
            &cli,
        ),
    }
}

fn run_on<B: ComputeBackend>(
    backend: B,
    network: &NetworkDefinition,
    cli: &Cli,
) -> Result<(), Box<dyn Error>> {
    let mut pipeline = InferencePipeline::new(backend, network)?;
    println!("{}", pipeline.device_info());
    println!("Input: {}", cli.input);

    let (output, report) = pipeline.infer_profiled(cli.input)?;
    println!("Output: {}", output);
    println!();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}
