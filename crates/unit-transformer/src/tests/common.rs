// Shared fixtures for the scenario tests.
#![allow(dead_code)]

use ndarray::{Array2, Array3, Array4};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TransformerConfig;
use crate::fusion::{ImageInput, TextInput};

pub const DIM: usize = 8;
pub const HEADS: usize = 2;

/// Two-layer encoder and decoder at width 8 with one registered pair.
pub fn small_config() -> TransformerConfig {
    TransformerConfig::default()
        .with_hidden_dims(DIM, DIM)
        .with_heads(HEADS)
        .with_layers(2, 2)
        .with_dim_feedforward(16)
        .with_task("detection", "coco", 5)
}

/// Random image features; the bottom-right pixel of every batch entry is padding.
pub fn image_input(batch: usize, channels: usize, h: usize, w: usize, seed: u64) -> ImageInput {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    ImageInput {
        src: Array4::random_using((batch, channels, h, w), normal, &mut rng),
        mask: Array3::from_shape_fn((batch, h, w), |(_, y, x)| y == h - 1 && x == w - 1),
        pos: Array4::random_using((batch, channels, h, w), normal, &mut rng),
    }
}

/// Random text features; positions at or past `valid_len` are padding.
pub fn text_input(batch: usize, len: usize, channels: usize, valid_len: usize, seed: u64) -> TextInput {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    TextInput {
        src: Array3::random_using((batch, len, channels), normal, &mut rng),
        mask: Array2::from_shape_fn((batch, len), |(_, l)| if l < valid_len { 1.0 } else { 0.0 }),
        pos: Array2::random_using((len, channels), normal, &mut rng),
    }
}

pub fn queries(num_queries: usize, channels: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::random_using((num_queries, channels), Normal::new(0.0, 1.0).unwrap(), &mut rng)
}

pub fn max_abs_diff<D: ndarray::Dimension>(a: &ndarray::Array<f32, D>, b: &ndarray::Array<f32, D>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
