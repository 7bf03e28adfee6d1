//! Activation functions and softmax operations.

use std::fmt;
use std::str::FromStr;

use libm::{erff, expf};
use ndarray::{s, Array3, Array4, Axis, Zip, parallel::prelude::*};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransformerError};

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;

/// Supported feed-forward activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
    Glu,
}

impl Activation {
    pub const VALID_NAMES: [&'static str; 3] = ["relu", "gelu", "glu"];

    /// Width multiplier the layer feeding this activation must produce.
    ///
    /// GLU consumes two halves of its input, so the expansion layer doubles.
    pub fn input_width_factor(&self) -> usize {
        match self {
            Activation::Glu => 2,
            Activation::Relu | Activation::Gelu => 1,
        }
    }
}

impl FromStr for Activation {
    type Err = TransformerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "glu" => Ok(Activation::Glu),
            _ => Err(TransformerError::UnknownActivation {
                name: s.to_string(),
                valid: Activation::VALID_NAMES.join("/"),
            }),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Relu => write!(f, "relu"),
            Activation::Gelu => write!(f, "gelu"),
            Activation::Glu => write!(f, "glu"),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Relu
    }
}

/// Exact (erf based) GELU.
#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + expf(-x))
}

/// Applies `activation` along the last axis of a 3D array.
///
/// Relu and gelu are elementwise and keep the shape. Glu splits the last axis
/// into halves `a | b` and returns `a * sigmoid(b)`, halving the width.
pub fn apply_activation(mut arr: Array3<f32>, activation: Activation) -> Result<Array3<f32>> {
    let use_parallel = arr.len() >= PARALLEL_THRESHOLD;
    match (activation, use_parallel) {
        (Activation::Relu, true) => arr.par_mapv_inplace(relu_scalar),
        (Activation::Relu, false) => arr.mapv_inplace(relu_scalar),
        (Activation::Gelu, true) => arr.par_mapv_inplace(gelu_scalar),
        (Activation::Gelu, false) => arr.mapv_inplace(gelu_scalar),
        (Activation::Glu, _) => return glu(&arr),
    }
    Ok(arr)
}

fn glu(arr: &Array3<f32>) -> Result<Array3<f32>> {
    let width = arr.len_of(Axis(2));
    if width % 2 != 0 {
        return Err(TransformerError::shape(format!(
            "glu needs an even last dimension, got {}",
            width
        )));
    }
    let half = width / 2;
    let a = arr.slice(s![.., .., ..half]);
    let b = arr.slice(s![.., .., half..]);
    Ok(Zip::from(&a).and(&b).map_collect(|&a, &b| a * sigmoid_scalar(b)))
}

/// Applies softmax in-place to a slice.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

/// Applies softmax along the last axis of a 4D array.
pub fn softmax_4d_inplace(scores: &mut Array4<f32>) {
    scores
        .lanes_mut(Axis(3))
        .into_iter()
        .for_each(|mut row| match row.as_slice_mut() {
            Some(slice) => softmax_inplace(slice),
            None => {
                let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                row.mapv_inplace(|x| (x - max).exp());
                let sum = row.sum();
                if sum > 0.0 {
                    row /= sum;
                }
            }
        });
}
