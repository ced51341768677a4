//! Layered dense-network inference dispatched as compute kernels.
//!
//! This library runs single-sample forward inference of a fixed three-layer network
//! (1 -> 16 -> 16 -> 1) by enqueueing matrix-multiply, bias-addition and activation
//! kernels on a compute backend: a GPU through `wgpu`, or a host reference device.
//! Per-launch completion handles feed a profiling report with per-stage timings.

pub mod backend;
pub mod config;
pub mod errors;
pub mod kernels;
pub mod layer_executor;
pub mod network;
pub mod pipeline;
pub mod profiling;
pub mod tensor;

pub use backend::{ComputeBackend, HostBackend, WgpuBackend};
pub use config::{BackendKind, PipelineConfig};
pub use kernels::KernelCatalog;
pub use network::NetworkDefinition;
pub use pipeline::{InferencePipeline, InferenceTrace};
pub use profiling::TimingReport;
