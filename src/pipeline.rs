//! Inference pipeline: three layer executions over a fixed set of arena slots.

use log::{debug, info};

use crate::backend::{CompletionHandle, ComputeBackend, DeviceInfo};
use crate::errors::{BackendError, PipelineResult};
use crate::layer_executor::{LayerBuffers, LayerExecutor, LayerHandles};
use crate::network::{LayerSpec, MAX_LAYER_WIDTH, NetworkDefinition};
use crate::profiling::{self, TimingReport};
use crate::tensor::{BufferId, TensorArena, TensorDescriptor, TensorRole};

/// Result of [`InferencePipeline::infer_traced`].
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceTrace {
    pub output: f32,
    /// Each layer's output vector, `output_width` elements long.
    pub layer_outputs: Vec<Vec<f32>>,
    pub report: TimingReport,
}

/// Owns a backend loaded with one network and runs single-sample inference on it.
///
/// Slots: `input` (1), `hidden` (activations between layers), `scratch` (multiply
/// accumulator), `output` (1), plus each layer's weights and bias. Both reusable slots
/// are sized to the widest layer.
pub struct InferencePipeline<B: ComputeBackend> {
    backend: B,
    arena: TensorArena,
    layers: Vec<LayerSpec>,
    input: BufferId,
    hidden: BufferId,
    scratch: BufferId,
    output: BufferId,
}

impl<B: ComputeBackend> InferencePipeline<B> {
    /// Declares every slot and uploads the network's parameters to the backend.
    pub fn new(mut backend: B, network: &NetworkDefinition) -> PipelineResult<Self> {
        network.validate()?;

        let mut arena = TensorArena::new();
        let mut declare = |descriptor: TensorDescriptor,
                           contents: Option<&[f32]>|
         -> Result<BufferId, BackendError> {
            let id = arena.declare(descriptor.clone());
            backend.allocate(id, &descriptor, contents)?;
            Ok(id)
        };

        let input = declare(TensorDescriptor::new("input", 1, TensorRole::Input), None)?;
        let hidden = declare(
            TensorDescriptor::new("hidden", MAX_LAYER_WIDTH, TensorRole::Scratch),
            None,
        )?;
        let scratch = declare(
            TensorDescriptor::new("scratch", MAX_LAYER_WIDTH, TensorRole::Scratch),
            None,
        )?;
        let output = declare(TensorDescriptor::new("output", 1, TensorRole::Output), None)?;

        let mut layers = Vec::with_capacity(network.layers.len());
        for (position, definition) in network.layers.iter().enumerate() {
            let index = position + 1;
            let weights = declare(
                TensorDescriptor::new(
                    format!("layer{index}.weights"),
                    definition.weights.len(),
                    TensorRole::Weight,
                ),
                Some(definition.weights.as_slice()),
            )?;
            let bias = declare(
                TensorDescriptor::new(
                    format!("layer{index}.bias"),
                    definition.bias.len(),
                    TensorRole::Bias,
                ),
                Some(definition.bias.as_slice()),
            )?;
            layers.push(LayerSpec {
                index,
                input_width: definition.input_width,
                output_width: definition.output_width,
                weights,
                bias,
                apply_activation: network.applies_activation(position),
            });
        }

        info!(
            "Pipeline ready on {}: {} layers, {} slots, {} bytes",
            backend.device_info().device,
            layers.len(),
            arena.len(),
            arena.footprint_bytes()
        );

        Ok(Self {
            backend,
            arena,
            layers,
            input,
            hidden,
            scratch,
            output,
        })
    }

    /// Runs one forward pass and returns the output scalar.
    pub fn infer(&mut self, x: f32) -> PipelineResult<f32> {
        let layers = self.enqueue(x)?;
        let handles: Vec<CompletionHandle> = layers
            .iter()
            .flat_map(|layer| layer.handles.iter().copied())
            .collect();
        self.backend.wait_all(&handles)?;
        self.read_output()
    }

    /// Runs one forward pass and aggregates the timings of all its launches.
    pub fn infer_profiled(&mut self, x: f32) -> PipelineResult<(f32, TimingReport)> {
        let layers = self.enqueue(x)?;
        let report = profiling::report(&layers, &mut self.backend)?;
        let output = self.read_output()?;
        Ok((output, report))
    }

    /// Runs one forward pass layer by layer, reading back every layer's output.
    ///
    /// Waits after each layer, so the reported timings include no overlap between layers.
    pub fn infer_traced(&mut self, x: f32) -> PipelineResult<InferenceTrace> {
        self.backend.write(self.input, &[x])?;

        let executor = LayerExecutor::new(&self.arena);
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut layer_outputs = Vec::with_capacity(self.layers.len());
        let mut after = None;
        for (position, layer) in self.layers.iter().enumerate() {
            let buffers = self.layer_buffers(position);
            let handles = executor.run_layer(&mut self.backend, layer, &buffers, after)?;
            self.backend.wait_all(&handles.handles)?;

            let mut values = self.backend.read(buffers.output)?;
            values.truncate(layer.output_width);
            debug!("Layer {} output: {:?}", layer.index, values);
            layer_outputs.push(values);

            after = handles.last();
            layers.push(handles);
        }

        let report = profiling::report(&layers, &mut self.backend)?;
        let output = self.read_output()?;
        Ok(InferenceTrace {
            output,
            layer_outputs,
            report,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn device_info(&self) -> &DeviceInfo {
        self.backend.device_info()
    }

    pub fn arena(&self) -> &TensorArena {
        &self.arena
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Buffers for the layer at `position`: the first reads `input`, the last writes
    /// `output`, and everything in between goes through `hidden`.
    fn layer_buffers(&self, position: usize) -> LayerBuffers {
        LayerBuffers {
            input: if position == 0 { self.input } else { self.hidden },
            output: if position + 1 == self.layers.len() {
                self.output
            } else {
                self.hidden
            },
            scratch: self.scratch,
        }
    }

    /// Writes `x` and enqueues all layers without waiting.
    fn enqueue(&mut self, x: f32) -> PipelineResult<Vec<LayerHandles>> {
        self.backend.write(self.input, &[x])?;

        let executor = LayerExecutor::new(&self.arena);
        let mut layers = Vec::with_capacity(self.layers.len());
        let mut after = None;
        for (position, layer) in self.layers.iter().enumerate() {
            let buffers = self.layer_buffers(position);
            let handles = executor.run_layer(&mut self.backend, layer, &buffers, after)?;
            after = handles.last();
            layers.push(handles);
        }
        Ok(layers)
    }

    fn read_output(&mut self) -> PipelineResult<f32> {
        let values = self.backend.read(self.output)?;
        values.first().copied().ok_or_else(|| {
            BackendError::BufferLengthMismatch {
                label: "output".to_string(),
                expected: 1,
                actual: values.len(),
            }
            .into()
        })
    }
}
