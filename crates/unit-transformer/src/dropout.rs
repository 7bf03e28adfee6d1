//! Dropout and the training/inference switch.

use ndarray::{Array, Dimension};
use rand::{Rng, RngCore};

/// Controls stochastic layers for a single forward call.
///
/// Randomness is never owned by the model: training callers lend an RNG.
pub enum RunMode<'a> {
    Inference,
    Training(&'a mut dyn RngCore),
}

impl<'a> RunMode<'a> {
    pub fn training(rng: &'a mut dyn RngCore) -> Self {
        RunMode::Training(rng)
    }

    pub fn is_training(&self) -> bool {
        matches!(self, RunMode::Training(_))
    }
}

impl Default for RunMode<'_> {
    fn default() -> Self {
        RunMode::Inference
    }
}

/// Inverted dropout: kept activations are scaled by `1 / (1 - p)`.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn forward<D: Dimension>(&self, mut x: Array<f32, D>, mode: &mut RunMode<'_>) -> Array<f32, D> {
        let rng: &mut dyn RngCore = match mode {
            RunMode::Inference => return x,
            RunMode::Training(rng) => &mut **rng,
        };
        if self.p <= 0.0 {
            return x;
        }
        if self.p >= 1.0 {
            x.fill(0.0);
            return x;
        }
        let p = self.p;
        let scale = 1.0 / (1.0 - p);
        x.mapv_inplace(|v| if rng.gen::<f32>() < p { 0.0 } else { v * scale });
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_inference_is_identity() {
        let dropout = Dropout::new(0.5);
        let x = Array2::from_elem((4, 4), 1.0f32);
        let out = dropout.forward(x.clone(), &mut RunMode::Inference);
        assert_eq!(out, x);
    }

    #[test]
    fn test_training_zeroes_and_rescales() {
        let dropout = Dropout::new(0.5);
        let mut rng = StdRng::seed_from_u64(11);
        let mut mode = RunMode::training(&mut rng);
        assert!(mode.is_training());

        let out = dropout.forward(Array2::from_elem((32, 32), 1.0f32), &mut mode);
        assert!(out.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        let dropped = out.iter().filter(|&&v| v == 0.0).count();
        assert!(dropped > 0 && dropped < out.len());
    }

    #[test]
    fn test_zero_probability_keeps_values_in_training() {
        let dropout = Dropout::new(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let x = Array2::from_elem((3, 3), 0.7f32);
        let out = dropout.forward(x.clone(), &mut RunMode::training(&mut rng));
        assert_eq!(out, x);
    }
}
