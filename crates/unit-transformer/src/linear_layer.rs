//! Linear projections.
//!
//! Weights are stored in `[OutFeatures, InFeatures]` layout, the same layout
//! safetensors/PyTorch checkpoints use, and applied as `y = x W^T + b`.

use ndarray::{Array1, Array2, Array3, ArrayView2};
use rand::Rng;

use crate::error::{Result, TransformerError};
use crate::utils::init::{xavier_uniform, zeros_bias};
use crate::utils::linear_algebra::{matmul_2d_transposed, matmul_3d_2d_transposed};

/// A linear transformation layer (y = xW^T + b).
#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new_f32(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight: weight.as_standard_layout().to_owned(),
            bias,
        }
    }

    /// Xavier-uniform weight with a zero bias.
    pub fn xavier<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self::new_f32(
            xavier_uniform(out_features, in_features, rng),
            Some(zeros_bias(out_features)),
        )
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    /// Computes X @ W^T + b for `input[rows, in]`.
    #[inline]
    pub fn matmul(&self, input: &ArrayView2<f32>) -> Array2<f32> {
        let mut result = matmul_2d_transposed(input, &self.weight.view());
        if let Some(bias) = &self.bias {
            result += bias;
        }
        result
    }

    /// Applies the layer along the last axis of a 3D tensor.
    pub fn forward_3d(&self, input: &Array3<f32>) -> Result<Array3<f32>> {
        let features = input.shape()[2];
        if features != self.in_features() {
            return Err(TransformerError::shape(format!(
                "linear layer expects {} input features, got {}",
                self.in_features(),
                features
            )));
        }
        let mut result = matmul_3d_2d_transposed(input, &self.weight);
        if let Some(bias) = &self.bias {
            result += bias;
        }
        Ok(result)
    }
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weight: Array2<f32>) -> Self {
        LinearLayer::new_f32(weight, None)
    }
}

/// Maps between two model widths: identity when they agree, learned otherwise.
#[derive(Debug, Clone)]
pub enum Projection {
    Identity,
    Linear(LinearLayer),
}

impl Projection {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        if in_features == out_features {
            Projection::Identity
        } else {
            Projection::Linear(LinearLayer::xavier(in_features, out_features, rng))
        }
    }

    pub fn forward(&self, input: Array3<f32>) -> Result<Array3<f32>> {
        match self {
            Projection::Identity => Ok(input),
            Projection::Linear(layer) => layer.forward_3d(&input),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Projection::Identity)
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            Projection::Identity => 0,
            Projection::Linear(layer) => layer.num_parameters(),
        }
    }
}
