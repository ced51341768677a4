//! GPU inference tests comparing with host results.
//!
//! Every test returns early when no GPU adapter is available.

use std::f32::consts::FRAC_PI_4;

use sinenet_inference::backend::{CompletionSource, ComputeBackend, TimingClock};
use sinenet_inference::errors::{BackendError, PipelineError};
use sinenet_inference::kernels::{DENSE_KERNEL_SOURCE, KernelLaunch};
use sinenet_inference::config::MIN_PROFILING_CAPACITY;
use sinenet_inference::network::{LAUNCHES_PER_PASS, LayerDefinition, TOPOLOGY};
use sinenet_inference::tensor::{BufferId, TensorDescriptor, TensorRole};
use sinenet_inference::{
    HostBackend, InferencePipeline, KernelCatalog, NetworkDefinition, PipelineConfig, WgpuBackend,
};

const TOLERANCE: f32 = 1e-4;

fn gpu_backend(catalog: &KernelCatalog) -> Option<WgpuBackend> {
    match WgpuBackend::initialize(catalog, &PipelineConfig::default()) {
        Ok(backend) => Some(backend),
        Err(BackendError::DeviceUnavailable { message }) => {
            eprintln!("Skipping GPU test: {}", message);
            None
        }
        Err(e) => panic!("Failed to initialize GPU backend: {}", e),
    }
}

fn test_network() -> NetworkDefinition {
    let value = |i: usize, layer: usize| (((i * 31 + layer * 17) % 23) as f32 - 11.0) / 16.0;
    let layers = TOPOLOGY
        .iter()
        .enumerate()
        .map(|(layer, &(input_width, output_width))| {
            LayerDefinition::new(
                input_width,
                output_width,
                (0..input_width * output_width)
                    .map(|i| value(i, layer))
                    .collect(),
                (0..output_width).map(|i| value(i + 5, layer) / 4.0).collect(),
            )
        })
        .collect();
    NetworkDefinition::new(layers).unwrap()
}

fn compare_results(gpu: f32, host: f32, test_name: &str) {
    let diff = (gpu - host).abs();
    assert!(
        diff <= TOLERANCE * host.abs().max(1.0),
        "{}: GPU={}, host={}, diff={}",
        test_name,
        gpu,
        host,
        diff
    );
}

#[test]
fn test_gpu_matches_host() {
    let catalog = KernelCatalog::bundled();
    let Some(backend) = gpu_backend(&catalog) else {
        return;
    };
    let network = test_network();
    let mut gpu = InferencePipeline::new(backend, &network).unwrap();
    let mut host =
        InferencePipeline::new(HostBackend::initialize(&catalog).unwrap(), &network).unwrap();

    for x in [-2.0, 0.0, 0.3, FRAC_PI_4, 1.7] {
        compare_results(
            gpu.infer(x).unwrap(),
            host.infer(x).unwrap(),
            &format!("input {x}"),
        );
    }
}

#[test]
fn test_gpu_traced_layers_match_reference() {
    let catalog = KernelCatalog::bundled();
    let Some(backend) = gpu_backend(&catalog) else {
        return;
    };
    let network = test_network();
    let mut pipeline = InferencePipeline::new(backend, &network).unwrap();

    let trace = pipeline.infer_traced(FRAC_PI_4).unwrap();
    let expected = network.reference_layer_outputs(FRAC_PI_4);
    for (layer, (gpu, host)) in trace.layer_outputs.iter().zip(&expected).enumerate() {
        assert_eq!(gpu.len(), host.len());
        for (row, (g, h)) in gpu.iter().zip(host).enumerate() {
            compare_results(*g, *h, &format!("layer {} row {}", layer + 1, row));
        }
    }
}

#[test]
fn test_gpu_inference_is_deterministic() {
    let catalog = KernelCatalog::bundled();
    let Some(backend) = gpu_backend(&catalog) else {
        return;
    };
    let mut pipeline = InferencePipeline::new(backend, &test_network()).unwrap();

    let first = pipeline.infer(FRAC_PI_4).unwrap();
    for _ in 0..10 {
        assert_eq!(pipeline.infer(FRAC_PI_4).unwrap().to_bits(), first.to_bits());
    }
}

#[test]
fn test_gpu_profiled_report() {
    let catalog = KernelCatalog::bundled();
    let Some(backend) = gpu_backend(&catalog) else {
        return;
    };
    let mut pipeline = InferencePipeline::new(backend, &test_network()).unwrap();
    let clock = pipeline.device_info().clock;

    // Repeated passes must not exhaust the timestamp query slots.
    for _ in 0..20 {
        let (output, report) = pipeline.infer_profiled(0.5).unwrap();
        assert!(output.is_finite());
        assert_eq!(report.stages().count(), 8);
        let layer_sum: u64 = report.layers.iter().map(|layer| layer.total_ns).sum();
        assert_eq!(report.total_ns, layer_sum);
    }
    assert!(matches!(clock, TimingClock::Device | TimingClock::Host));
}

#[test]
fn test_gpu_full_query_slots_drain_instead_of_failing() {
    let catalog = KernelCatalog::bundled();
    let config = PipelineConfig {
        profiling_capacity: MIN_PROFILING_CAPACITY,
        ..PipelineConfig::default()
    };
    let mut backend = match WgpuBackend::initialize(&catalog, &config) {
        Ok(backend) => backend,
        Err(BackendError::DeviceUnavailable { message }) => {
            eprintln!("Skipping GPU test: {}", message);
            return;
        }
        Err(e) => panic!("Failed to initialize GPU backend: {}", e),
    };

    let id = BufferId::new(0);
    let descriptor = TensorDescriptor::new("values", 4, TensorRole::Scratch);
    backend
        .allocate(id, &descriptor, Some([-1.0f32, 2.0, -3.0, 4.0].as_slice()))
        .unwrap();
    let launch = KernelLaunch::Activate {
        input: id,
        output: id,
        len: 4,
    };

    let mut handles = Vec::new();
    for _ in 0..3 * MIN_PROFILING_CAPACITY {
        let after: Vec<_> = handles.last().copied().into_iter().collect();
        handles.push(backend.submit(&launch, &after).unwrap());
    }
    backend.wait_all(&handles).unwrap();
    for handle in &handles {
        assert!(backend.timing(handle).is_ok());
    }
    assert_eq!(backend.read(id).unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
}

#[test]
fn test_gpu_minimum_profiling_capacity_runs_passes() {
    let catalog = KernelCatalog::bundled();
    let config = PipelineConfig {
        profiling_capacity: MIN_PROFILING_CAPACITY,
        ..PipelineConfig::default()
    };
    let backend = match WgpuBackend::initialize(&catalog, &config) {
        Ok(backend) => backend,
        Err(BackendError::DeviceUnavailable { message }) => {
            eprintln!("Skipping GPU test: {}", message);
            return;
        }
        Err(e) => panic!("Failed to initialize GPU backend: {}", e),
    };
    let network = test_network();
    let mut pipeline = InferencePipeline::new(backend, &network).unwrap();

    for x in [0.1, 0.2, 0.3] {
        let (output, report) = pipeline.infer_profiled(x).unwrap();
        compare_results(output, network.reference_forward(x), "profiled pass");
        assert_eq!(report.stages().count(), LAUNCHES_PER_PASS);
    }
}

#[test]
fn test_gpu_missing_entry_point() {
    let source = DENSE_KERNEL_SOURCE.replace("fn activate(", "fn rectify(");
    let catalog = KernelCatalog::from_source(source);
    match WgpuBackend::initialize(&catalog, &PipelineConfig::default()) {
        Err(BackendError::DeviceUnavailable { message }) => {
            eprintln!("Skipping GPU test: {}", message);
        }
        Err(BackendError::KernelCreationError { name }) => assert_eq!(name, "activate"),
        Err(e) => panic!("expected KernelCreationError, got {}", e),
        Ok(_) => panic!("expected KernelCreationError"),
    }
}

#[test]
fn test_gpu_compile_error_surfaces_the_log() {
    let source = DENSE_KERNEL_SOURCE.replace("max(0.0, lhs[i])", "max(0.0, lhs[i]) +");
    let catalog = KernelCatalog::from_source(source);
    match WgpuBackend::initialize(&catalog, &PipelineConfig::default()) {
        Err(BackendError::DeviceUnavailable { message }) => {
            eprintln!("Skipping GPU test: {}", message);
        }
        Err(BackendError::CompileError { log }) => assert!(!log.is_empty()),
        Err(e) => panic!("expected CompileError, got {}", e),
        Ok(_) => panic!("expected CompileError"),
    }
}

#[test]
fn test_gpu_pipeline_rejects_invalid_network() {
    let catalog = KernelCatalog::bundled();
    let Some(backend) = gpu_backend(&catalog) else {
        return;
    };
    let mut network = test_network();
    network.layers[2].bias.push(0.0);

    assert!(matches!(
        InferencePipeline::new(backend, &network),
        Err(PipelineError::Network(_))
    ));
}
