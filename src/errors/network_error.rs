//! Errors raised while loading or validating a network definition.

use thiserror::Error;

/// Errors for malformed network definitions.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Expected {expected} layers, got {actual}")]
    LayerCountMismatch { expected: usize, actual: usize },

    #[error(
        "Layer {layer} must map {expected_input} -> {expected_output} values, got {input_width} -> {output_width}"
    )]
    TopologyMismatch {
        layer: usize,
        expected_input: usize,
        expected_output: usize,
        input_width: usize,
        output_width: usize,
    },

    #[error(
        "The weights of layer {layer} must hold output_width * input_width = {expected} values, got {actual}"
    )]
    WeightsSizeMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("The bias of layer {layer} must hold {expected} values, got {actual}")]
    BiasSizeMismatch {
        layer: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Layer {layer} contains a non-finite parameter")]
    NonFiniteParameter { layer: usize },

    #[error("Failed to read network definition '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse network definition '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

pub type NetworkResult<T> = std::result::Result<T, NetworkError>;
