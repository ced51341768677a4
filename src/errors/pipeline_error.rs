//! Errors raised by the layer executor and the inference pipeline.

use thiserror::Error;

use super::{BackendError, NetworkError};
use crate::kernels::KernelId;

/// Errors for a single inference call or for pipeline construction.
///
/// Every error raised after setup carries the layer index (1-based) and the stage that
/// failed, so the offending launch can be identified from the message alone.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Layer {layer} {stage}: {source}")]
    Stage {
        layer: usize,
        stage: KernelId,
        #[source]
        source: BackendError,
    },

    #[error(
        "Layer {layer} {stage}: buffer '{buffer}' is bound for {expected} elements but is declared with {actual}"
    )]
    ShapeMismatch {
        layer: usize,
        stage: KernelId,
        buffer: String,
        expected: usize,
        actual: usize,
    },

    #[error("Layer {layer} {stage}: output buffer '{buffer}' aliases one of its operands")]
    AliasedOperands {
        layer: usize,
        stage: KernelId,
        buffer: String,
    },

    #[error("Layer {layer} was bound to a buffer with an unknown slot id {id}")]
    UnknownSlot { layer: usize, id: usize },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
