//! Network definition: the three dense layers' shapes and constant parameters.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::{NetworkError, NetworkResult};
use crate::tensor::BufferId;

/// `(input_width, output_width)` of every layer, in execution order.
pub const TOPOLOGY: [(usize, usize); 3] = [(1, 16), (16, 16), (16, 1)];

/// Width of the widest layer; bounds the scratch slots.
pub const MAX_LAYER_WIDTH: usize = 16;

/// Kernel launches in one forward pass: three per activated layer, two for the last.
pub const LAUNCHES_PER_PASS: usize = 3 * (TOPOLOGY.len() - 1) + 2;

/// Constant parameters of one dense layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDefinition {
    pub input_width: usize,
    pub output_width: usize,
    /// Row-major `output_width x input_width` matrix.
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LayerDefinition {
    pub fn new(input_width: usize, output_width: usize, weights: Vec<f32>, bias: Vec<f32>) -> Self {
        Self {
            input_width,
            output_width,
            weights,
            bias,
        }
    }

    /// Dense transform of `input`, optionally rectified, in kernel evaluation order.
    pub fn forward(&self, input: &[f32], apply_activation: bool) -> Vec<f32> {
        self.weights
            .chunks_exact(self.input_width)
            .zip(&self.bias)
            .map(|(row, bias)| {
                let dot = row
                    .iter()
                    .zip(input)
                    .fold(0.0f32, |acc, (w, x)| acc + w * x);
                let value = dot + bias;
                if apply_activation { value.max(0.0) } else { value }
            })
            .collect()
    }
}

/// The full network as loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub layers: Vec<LayerDefinition>,
}

impl NetworkDefinition {
    /// Builds and validates a definition.
    pub fn new(layers: Vec<LayerDefinition>) -> NetworkResult<Self> {
        let network = Self { layers };
        network.validate()?;
        Ok(network)
    }

    pub fn from_json_str(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Reads and validates a network file.
    pub fn from_json_file(path: &Path) -> NetworkResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| NetworkError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let network = Self::from_json_str(&content).map_err(|e| NetworkError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        network.validate()?;
        info!(
            "Loaded network from '{}' ({} parameters)",
            path.display(),
            network.parameter_count()
        );
        Ok(network)
    }

    /// Checks the layer count, every layer's widths against [`TOPOLOGY`] and every
    /// parameter array's length.
    pub fn validate(&self) -> NetworkResult<()> {
        if self.layers.len() != TOPOLOGY.len() {
            return Err(NetworkError::LayerCountMismatch {
                expected: TOPOLOGY.len(),
                actual: self.layers.len(),
            });
        }

        for (index, (layer, &(input_width, output_width))) in
            self.layers.iter().zip(TOPOLOGY.iter()).enumerate()
        {
            let number = index + 1;
            if layer.input_width != input_width || layer.output_width != output_width {
                return Err(NetworkError::TopologyMismatch {
                    layer: number,
                    expected_input: input_width,
                    expected_output: output_width,
                    input_width: layer.input_width,
                    output_width: layer.output_width,
                });
            }
            if layer.weights.len() != input_width * output_width {
                return Err(NetworkError::WeightsSizeMismatch {
                    layer: number,
                    expected: input_width * output_width,
                    actual: layer.weights.len(),
                });
            }
            if layer.bias.len() != output_width {
                return Err(NetworkError::BiasSizeMismatch {
                    layer: number,
                    expected: output_width,
                    actual: layer.bias.len(),
                });
            }
            if !layer
                .weights
                .iter()
                .chain(&layer.bias)
                .all(|value| value.is_finite())
            {
                return Err(NetworkError::NonFiniteParameter { layer: number });
            }
        }
        Ok(())
    }

    /// Whether layer `index` (0-based) is followed by the rectifier.
    pub fn applies_activation(&self, index: usize) -> bool {
        index + 1 < self.layers.len()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.weights.len() + layer.bias.len())
            .sum()
    }

    /// Every layer's output for input `x`, computed on the host.
    pub fn reference_layer_outputs(&self, x: f32) -> Vec<Vec<f32>> {
        let mut outputs: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len());
        let mut current = vec![x];
        for (index, layer) in self.layers.iter().enumerate() {
            current = layer.forward(&current, self.applies_activation(index));
            outputs.push(current.clone());
        }
        outputs
    }

    /// Host-side scalar forward pass.
    pub fn reference_forward(&self, x: f32) -> f32 {
        self.reference_layer_outputs(x)
            .last()
            .and_then(|output| output.first().copied())
            .unwrap_or(f32::NAN)
    }
}

/// A layer bound to its device-resident parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    /// 1-based position in the network, used in reports and errors.
    pub index: usize,
    pub input_width: usize,
    pub output_width: usize,
    pub weights: BufferId,
    pub bias: BufferId,
    pub apply_activation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(input_width: usize, output_width: usize, weight: f32) -> LayerDefinition {
        LayerDefinition::new(
            input_width,
            output_width,
            vec![weight; input_width * output_width],
            vec![0.0; output_width],
        )
    }

    fn uniform_network() -> NetworkDefinition {
        NetworkDefinition {
            layers: vec![layer(1, 16, 1.0), layer(16, 16, 0.5), layer(16, 1, -1.0)],
        }
    }

    #[test]
    fn test_valid_network_passes() {
        let network = uniform_network();
        assert!(network.validate().is_ok());
        assert_eq!(network.parameter_count(), 16 + 16 + 256 + 16 + 16 + 1);
        assert!(network.applies_activation(0));
        assert!(network.applies_activation(1));
        assert!(!network.applies_activation(2));
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let mut network = uniform_network();
        network.layers[1] = layer(16, 8, 1.0);
        assert!(matches!(
            network.validate(),
            Err(NetworkError::TopologyMismatch {
                layer: 2,
                expected_output: 16,
                output_width: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_short_bias_is_rejected() {
        let mut network = uniform_network();
        network.layers[0].bias.pop();
        assert!(matches!(
            network.validate(),
            Err(NetworkError::BiasSizeMismatch {
                layer: 1,
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn test_nan_parameter_is_rejected() {
        let mut network = uniform_network();
        network.layers[2].weights[3] = f32::NAN;
        assert!(matches!(
            network.validate(),
            Err(NetworkError::NonFiniteParameter { layer: 3 })
        ));
    }

    #[test]
    fn test_reference_forward_rectifies_hidden_layers() {
        // Layer 3 negates the sum of 16 hidden units; negative inputs are cut by layer 1.
        let network = uniform_network();
        assert_eq!(network.reference_forward(-2.0), 0.0);
        assert_eq!(network.reference_forward(1.0), -128.0);
    }
}
