//! Profiling aggregator: turns resolved completion handles into a timing report.
//!
//! The aggregator only consumes handles after the whole pass has been submitted. It waits
//! once for all of them, then reads each launch's timestamps.

use std::fmt;

use serde::Serialize;

use crate::backend::CompletionSource;
use crate::errors::{PipelineError, PipelineResult};
use crate::kernels::KernelId;
use crate::layer_executor::LayerHandles;

const NANOS_PER_MILLI: f64 = 1_000_000.0;

pub fn nanos_to_millis(nanos: u64) -> f64 {
    nanos as f64 / NANOS_PER_MILLI
}

/// Elapsed time of one kernel launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub layer: usize,
    pub stage: KernelId,
    pub elapsed_ns: u64,
}

impl StageTiming {
    /// Report label, e.g. `Layer 1 MatMul`.
    pub fn name(&self) -> String {
        format!("Layer {} {}", self.layer, self.stage)
    }

    pub fn elapsed_ms(&self) -> f64 {
        nanos_to_millis(self.elapsed_ns)
    }
}

/// Stage timings of one layer and their sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerTiming {
    pub layer: usize,
    pub stages: Vec<StageTiming>,
    pub total_ns: u64,
}

impl LayerTiming {
    pub fn total_ms(&self) -> f64 {
        nanos_to_millis(self.total_ns)
    }
}

/// Per-stage, per-layer and whole-pass timings of one inference call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TimingReport {
    pub layers: Vec<LayerTiming>,
    pub total_ns: u64,
}

impl TimingReport {
    /// All stage timings in submission order.
    pub fn stages(&self) -> impl Iterator<Item = &StageTiming> {
        self.layers.iter().flat_map(|layer| layer.stages.iter())
    }

    pub fn total_ms(&self) -> f64 {
        nanos_to_millis(self.total_ns)
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== Execution Info ====")?;
        for layer in &self.layers {
            writeln!(f, "=== Layer {} ===", layer.layer)?;
            for stage in &layer.stages {
                writeln!(f, "{}: {} ms", stage.name(), stage.elapsed_ms())?;
            }
            writeln!(
                f,
                "Layer {} elapsed time: {} ms",
                layer.layer,
                layer.total_ms()
            )?;
            writeln!(f)?;
        }
        write!(f, "Total Inference time: {} ms", self.total_ms())
    }
}

/// Waits for every handle of the pass, then sums elapsed times per layer and overall.
pub fn report<S: CompletionSource + ?Sized>(
    layers: &[LayerHandles],
    source: &mut S,
) -> PipelineResult<TimingReport> {
    let all: Vec<_> = layers
        .iter()
        .flat_map(|layer| layer.handles.iter().copied())
        .collect();
    source.wait_all(&all)?;

    let mut report = TimingReport::default();
    for layer in layers {
        let mut stages = Vec::with_capacity(layer.handles.len());
        for handle in &layer.handles {
            let timing = source
                .timing(handle)
                .map_err(|error| PipelineError::Stage {
                    layer: layer.layer,
                    stage: handle.kernel(),
                    source: error,
                })?;
            stages.push(StageTiming {
                layer: layer.layer,
                stage: handle.kernel(),
                elapsed_ns: timing.elapsed_ns(),
            });
        }

        let total_ns = stages.iter().map(|stage| stage.elapsed_ns).sum();
        report.total_ns += total_ns;
        report.layers.push(LayerTiming {
            layer: layer.layer,
            stages,
            total_ns,
        });
    }
    Ok(report)
}
