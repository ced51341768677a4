//! Layer executor: turns one dense layer into bound kernel launches and enqueues them.
//!
//! A layer with activation runs `multiply -> add_bias -> activate`; the final layer runs
//! `multiply -> add_bias` with the bias addition writing straight into the layer output.
//! Every launch is checked against the arena before anything is submitted, and every
//! launch after the first names its predecessor as a dependency.

use log::debug;

use crate::backend::{CompletionHandle, ComputeBackend};
use crate::errors::{PipelineError, PipelineResult};
use crate::kernels::KernelLaunch;
use crate::network::LayerSpec;
use crate::tensor::{BufferId, TensorArena, TensorDescriptor};

/// Buffers a layer reads from and writes to, besides its own parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerBuffers {
    pub input: BufferId,
    pub output: BufferId,
    /// Multiply accumulator. Must differ from `input`.
    pub scratch: BufferId,
}

/// Completion handles of one layer, in stage order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerHandles {
    /// 1-based layer index.
    pub layer: usize,
    pub handles: Vec<CompletionHandle>,
}

impl LayerHandles {
    /// Handle of the layer's final stage.
    pub fn last(&self) -> Option<CompletionHandle> {
        self.handles.last().copied()
    }
}

/// Binds layers to kernels against the slots of a [`TensorArena`].
pub struct LayerExecutor<'a> {
    arena: &'a TensorArena,
}

impl<'a> LayerExecutor<'a> {
    pub fn new(arena: &'a TensorArena) -> Self {
        Self { arena }
    }

    /// The launches for `layer`, in submission order.
    pub fn plan(&self, layer: &LayerSpec, buffers: &LayerBuffers) -> Vec<KernelLaunch> {
        let rows = layer.output_width as u32;
        let bias_output = if layer.apply_activation {
            buffers.scratch
        } else {
            buffers.output
        };

        let mut launches = vec![
            KernelLaunch::Multiply {
                weights: layer.weights,
                input: buffers.input,
                output: buffers.scratch,
                rows,
                cols: layer.input_width as u32,
            },
            KernelLaunch::AddBias {
                a: buffers.scratch,
                b: layer.bias,
                output: bias_output,
                len: rows,
            },
        ];
        if layer.apply_activation {
            launches.push(KernelLaunch::Activate {
                input: buffers.scratch,
                output: buffers.output,
                len: rows,
            });
        }
        launches
    }

    /// Cross-checks a launch's shape arguments against the descriptors of its buffers.
    pub fn validate(&self, layer: &LayerSpec, launch: &KernelLaunch) -> PipelineResult<()> {
        let stage = launch.kernel();

        if let Some(aliased) = launch.aliased_output() {
            return Err(PipelineError::AliasedOperands {
                layer: layer.index,
                stage,
                buffer: self.descriptor(layer, aliased)?.label().to_string(),
            });
        }

        for (id, required) in launch.extents() {
            let descriptor = self.descriptor(layer, id)?;
            if !descriptor.admits(required) {
                return Err(PipelineError::ShapeMismatch {
                    layer: layer.index,
                    stage,
                    buffer: descriptor.label().to_string(),
                    expected: required,
                    actual: descriptor.element_count(),
                });
            }
        }
        Ok(())
    }

    /// Validates and enqueues every stage of `layer`.
    ///
    /// `after` is the last handle of the previous layer; the first stage waits on it.
    pub fn run_layer<B: ComputeBackend>(
        &self,
        backend: &mut B,
        layer: &LayerSpec,
        buffers: &LayerBuffers,
        after: Option<CompletionHandle>,
    ) -> PipelineResult<LayerHandles> {
        let launches = self.plan(layer, buffers);
        for launch in &launches {
            self.validate(layer, launch)?;
        }

        let mut handles = Vec::with_capacity(launches.len());
        let mut previous = after;
        for launch in &launches {
            let dependencies: Vec<CompletionHandle> = previous.into_iter().collect();
            let handle = backend
                .submit(launch, &dependencies)
                .map_err(|source| PipelineError::Stage {
                    layer: layer.index,
                    stage: launch.kernel(),
                    source,
                })?;
            debug!("Layer {} {} enqueued", layer.index, launch.kernel());
            handles.push(handle);
            previous = Some(handle);
        }

        Ok(LayerHandles {
            layer: layer.index,
            handles,
        })
    }

    fn descriptor(&self, layer: &LayerSpec, id: BufferId) -> PipelineResult<&'a TensorDescriptor> {
        self.arena
            .descriptor(id)
            .ok_or(PipelineError::UnknownSlot {
                layer: layer.index,
                id: id.index(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelId;
    use crate::tensor::TensorRole;

    struct Slots {
        arena: TensorArena,
        layer: LayerSpec,
        buffers: LayerBuffers,
    }

    fn slots(apply_activation: bool) -> Slots {
        let mut arena = TensorArena::new();
        let input = arena.declare(TensorDescriptor::new("hidden", 16, TensorRole::Scratch));
        let weights = arena.declare(TensorDescriptor::new("w", 16 * 16, TensorRole::Weight));
        let bias = arena.declare(TensorDescriptor::new("b", 16, TensorRole::Bias));
        let scratch = arena.declare(TensorDescriptor::new("scratch", 16, TensorRole::Scratch));
        Slots {
            arena,
            layer: LayerSpec {
                index: 2,
                input_width: 16,
                output_width: 16,
                weights,
                bias,
                apply_activation,
            },
            buffers: LayerBuffers {
                input,
                output: input,
                scratch,
            },
        }
    }

    #[test]
    fn test_plan_with_activation_has_three_stages() {
        let slots = slots(true);
        let executor = LayerExecutor::new(&slots.arena);
        let kernels: Vec<KernelId> = executor
            .plan(&slots.layer, &slots.buffers)
            .iter()
            .map(KernelLaunch::kernel)
            .collect();
        assert_eq!(
            kernels,
            vec![KernelId::Multiply, KernelId::AddBias, KernelId::Activate]
        );
    }

    #[test]
    fn test_plan_without_activation_writes_bias_into_output() {
        let slots = slots(false);
        let executor = LayerExecutor::new(&slots.arena);
        let launches = executor.plan(&slots.layer, &slots.buffers);
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[1].output(), slots.buffers.output);
    }

    #[test]
    fn test_valid_plan_passes_validation() {
        let slots = slots(true);
        let executor = LayerExecutor::new(&slots.arena);
        for launch in executor.plan(&slots.layer, &slots.buffers) {
            assert!(executor.validate(&slots.layer, &launch).is_ok());
        }
    }

    #[test]
    fn test_multiply_into_its_input_is_rejected() {
        let mut slots = slots(true);
        slots.buffers.scratch = slots.buffers.input;
        let executor = LayerExecutor::new(&slots.arena);
        let launch = executor.plan(&slots.layer, &slots.buffers)[0];
        assert!(matches!(
            executor.validate(&slots.layer, &launch),
            Err(PipelineError::AliasedOperands { layer: 2, stage: KernelId::Multiply, ref buffer }) if buffer == "hidden"
        ));
    }

    #[test]
    fn test_bias_of_wrong_length_is_a_shape_mismatch() {
        let mut slots = slots(true);
        slots.layer.bias = slots
            .arena
            .declare(TensorDescriptor::new("short bias", 8, TensorRole::Bias));
        let executor = LayerExecutor::new(&slots.arena);
        let launch = executor.plan(&slots.layer, &slots.buffers)[1];
        assert!(matches!(
            executor.validate(&slots.layer, &launch),
            Err(PipelineError::ShapeMismatch {
                stage: KernelId::AddBias,
                expected: 16,
                actual: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_slot_is_reported() {
        let mut slots = slots(true);
        slots.layer.weights = BufferId::new(99);
        let executor = LayerExecutor::new(&slots.arena);
        let launch = executor.plan(&slots.layer, &slots.buffers)[0];
        assert!(matches!(
            executor.validate(&slots.layer, &launch),
            Err(PipelineError::UnknownSlot { layer: 2, id: 99 })
        ));
    }
}
