//! Parameter initialization.

use ndarray::{Array1, Array2};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;

/// Xavier/Glorot uniform init for a `[fan_out, fan_in]` weight.
pub fn xavier_uniform<R: Rng + ?Sized>(fan_out: usize, fan_in: usize, rng: &mut R) -> Array2<f32> {
    let bound = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    Array2::random_using((fan_out, fan_in), Uniform::new_inclusive(-bound, bound), rng)
}

/// Standard normal init, used for embedding tables.
pub fn standard_normal<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    // N(0, 1) has valid parameters
    let normal = Normal::new(0.0f32, 1.0).expect("unit normal");
    Array2::random_using((rows, cols), normal, rng)
}

pub fn zeros_bias(len: usize) -> Array1<f32> {
    Array1::zeros(len)
}
