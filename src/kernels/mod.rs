//! Kernel catalog: the three dense-layer compute kernels and their launch contracts.
//!
//! Kernels are stateless. Every launch carries its buffer bindings and its shape
//! parameters; the shape is never inferred from buffer sizes.

use std::borrow::Cow;
use std::fmt;

use serde::Serialize;

use crate::tensor::BufferId;

/// Bundled WGSL source defining `multiply`, `add_bias` and `activate`.
pub const DENSE_KERNEL_SOURCE: &str = include_str!("dense.wgsl");

/// Workgroup size declared by every entry point of [`DENSE_KERNEL_SOURCE`].
pub const WORKGROUP_SIZE: u32 = 64;

/// Identifies one of the catalog's kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum KernelId {
    Multiply,
    AddBias,
    Activate,
}

impl KernelId {
    pub const ALL: [KernelId; 3] = [KernelId::Multiply, KernelId::AddBias, KernelId::Activate];

    /// Entry point name in the kernel program.
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelId::Multiply => "multiply",
            KernelId::AddBias => "add_bias",
            KernelId::Activate => "activate",
        }
    }

    /// Stage name used in timing reports and error messages.
    pub fn stage_name(self) -> &'static str {
        match self {
            KernelId::Multiply => "MatMul",
            KernelId::AddBias => "Add",
            KernelId::Activate => "ReLU",
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stage_name())
    }
}

/// Shape parameters uploaded alongside each launch. Layout matches `KernelParams` in WGSL.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub rows: u32,
    pub cols: u32,
    pub len: u32,
    pub pad: u32,
}

/// A fully bound kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelLaunch {
    /// `output[r] = sum_k weights[r * cols + k] * input[k]` for `r < rows`.
    Multiply {
        weights: BufferId,
        input: BufferId,
        output: BufferId,
        rows: u32,
        cols: u32,
    },
    /// `output[i] = a[i] + b[i]` for `i < len`. `a` may alias `output`.
    AddBias {
        a: BufferId,
        b: BufferId,
        output: BufferId,
        len: u32,
    },
    /// `output[i] = max(0, input[i])` for `i < len`. `input` may alias `output`.
    Activate {
        input: BufferId,
        output: BufferId,
        len: u32,
    },
}

impl KernelLaunch {
    pub fn kernel(&self) -> KernelId {
        match self {
            KernelLaunch::Multiply { .. } => KernelId::Multiply,
            KernelLaunch::AddBias { .. } => KernelId::AddBias,
            KernelLaunch::Activate { .. } => KernelId::Activate,
        }
    }

    pub fn params(&self) -> KernelParams {
        match *self {
            KernelLaunch::Multiply { rows, cols, .. } => KernelParams {
                rows,
                cols,
                len: rows,
                pad: 0,
            },
            KernelLaunch::AddBias { len, .. } | KernelLaunch::Activate { len, .. } => {
                KernelParams {
                    rows: len,
                    cols: 1,
                    len,
                    pad: 0,
                }
            }
        }
    }

    /// Number of work-items: one per output element.
    pub fn work_size(&self) -> u32 {
        match *self {
            KernelLaunch::Multiply { rows, .. } => rows,
            KernelLaunch::AddBias { len, .. } | KernelLaunch::Activate { len, .. } => len,
        }
    }

    pub fn output(&self) -> BufferId {
        match *self {
            KernelLaunch::Multiply { output, .. }
            | KernelLaunch::AddBias { output, .. }
            | KernelLaunch::Activate { output, .. } => output,
        }
    }

    /// `(binding slot, buffer)` pairs in the order the kernel program declares them.
    pub fn bindings(&self) -> Vec<(u32, BufferId)> {
        match *self {
            KernelLaunch::Multiply {
                weights,
                input,
                output,
                ..
            } => vec![(0, weights), (1, input), (2, output)],
            KernelLaunch::AddBias { a, b, output, .. } => vec![(0, a), (1, b), (2, output)],
            KernelLaunch::Activate { input, output, .. } => vec![(0, input), (2, output)],
        }
    }

    /// Element count each bound buffer must provide, derived from the shape arguments.
    pub fn extents(&self) -> Vec<(BufferId, usize)> {
        match *self {
            KernelLaunch::Multiply {
                weights,
                input,
                output,
                rows,
                cols,
            } => vec![
                (weights, rows as usize * cols as usize),
                (input, cols as usize),
                (output, rows as usize),
            ],
            KernelLaunch::AddBias { a, b, output, len } => {
                vec![(a, len as usize), (b, len as usize), (output, len as usize)]
            }
            KernelLaunch::Activate { input, output, len } => {
                vec![(input, len as usize), (output, len as usize)]
            }
        }
    }

    /// Returns the output buffer when it is illegally bound to one of the operands.
    ///
    /// Only `multiply` forbids aliasing: its work-items read the whole input while
    /// others write their output row.
    pub fn aliased_output(&self) -> Option<BufferId> {
        match *self {
            KernelLaunch::Multiply {
                weights,
                input,
                output,
                ..
            } if output == weights || output == input => Some(output),
            _ => None,
        }
    }
}

/// The kernel program handed to a backend as a single compilation unit.
#[derive(Debug, Clone)]
pub struct KernelCatalog {
    source: Cow<'static, str>,
}

impl KernelCatalog {
    /// Catalog backed by the bundled [`DENSE_KERNEL_SOURCE`].
    pub fn bundled() -> Self {
        Self {
            source: Cow::Borrowed(DENSE_KERNEL_SOURCE),
        }
    }

    /// Catalog backed by caller-provided kernel source text.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Cow::Owned(source.into()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Parses and validates the program.
    pub fn compile(&self) -> Result<naga::Module, String> {
        compile_source(&self.source)
    }

    /// Compute entry points declared by the program.
    pub fn entry_points(&self) -> Result<Vec<String>, String> {
        self.compile().map(|module| compute_entry_points(&module))
    }
}

impl Default for KernelCatalog {
    fn default() -> Self {
        Self::bundled()
    }
}

/// Parses and validates a WGSL program. On failure returns the front end's or the
/// validator's diagnostics rendered against the source.
pub fn compile_source(source: &str) -> Result<naga::Module, String> {
    let module =
        naga::front::wgsl::parse_str(source).map_err(|error| error.emit_to_string(source))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .map_err(|error| error.emit_to_string(source))?;

    if compute_entry_points(&module).is_empty() {
        return Err("error: program declares no @compute entry point".to_string());
    }
    Ok(module)
}

/// Names of the `@compute` entry points of a parsed program.
pub fn compute_entry_points(module: &naga::Module) -> Vec<String> {
    module
        .entry_points
        .iter()
        .filter(|entry_point| entry_point.stage == naga::ShaderStage::Compute)
        .map(|entry_point| entry_point.name.clone())
        .collect()
}
