//! Layer normalization implementation

use ndarray::{Array1, Array2, Array3, Axis};

pub const DEFAULT_EPS: f32 = 1e-5;

/// Layer normalization over the last (channel) axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Unit scale, zero shift.
    pub fn identity_init(dim: usize) -> Self {
        Self::new(Array1::ones(dim), Array1::zeros(dim), DEFAULT_EPS)
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Apply layer norm to a 3D tensor.
    #[inline]
    pub fn forward_3d(&self, hidden: &Array3<f32>) -> Array3<f32> {
        let (d0, d1, _) = hidden.dim();
        let mean = hidden
            .mean_axis(Axis(2))
            .unwrap_or_else(|| Array2::zeros((d0, d1)));
        let variance = hidden.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let inv_std = variance
            .mapv(|v| 1.0 / (v + self.eps).sqrt())
            .insert_axis(Axis(2));

        let normalized = (hidden - &mean_expanded) * &inv_std;
        normalized * &self.weight + &self.bias
    }
}
