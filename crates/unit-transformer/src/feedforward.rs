//! Position-wise feed-forward sublayer.

use ndarray::Array3;
use rand::Rng;

use crate::activations::{apply_activation, Activation};
use crate::dropout::{Dropout, RunMode};
use crate::error::{Result, TransformerError};
use crate::linear_layer::LinearLayer;

/// `linear2(dropout(activation(linear1(x))))`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub linear1: LinearLayer,
    pub linear2: LinearLayer,
    pub activation: Activation,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(linear1: LinearLayer, linear2: LinearLayer, activation: Activation, dropout: f32) -> Result<Self> {
        let activated = linear1.out_features() / activation.input_width_factor();
        if linear1.out_features() % activation.input_width_factor() != 0
            || activated != linear2.in_features()
            || linear1.in_features() != linear2.out_features()
        {
            return Err(TransformerError::shape(format!(
                "feed-forward layers [{} -> {}] and [{} -> {}] do not chain through {}",
                linear1.in_features(),
                linear1.out_features(),
                linear2.in_features(),
                linear2.out_features(),
                activation
            )));
        }
        Ok(Self {
            linear1,
            linear2,
            activation,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn init<R: Rng + ?Sized>(
        d_model: usize,
        dim_feedforward: usize,
        activation: Activation,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        let expanded = dim_feedforward * activation.input_width_factor();
        Self::new(
            LinearLayer::xavier(d_model, expanded, rng),
            LinearLayer::xavier(dim_feedforward, d_model, rng),
            activation,
            dropout,
        )
    }

    pub fn num_parameters(&self) -> usize {
        self.linear1.num_parameters() + self.linear2.num_parameters()
    }

    pub fn forward(&self, hidden: &Array3<f32>, mode: &mut RunMode<'_>) -> Result<Array3<f32>> {
        let intermediate = apply_activation(self.linear1.forward_3d(hidden)?, self.activation)?;
        let intermediate = self.dropout.forward(intermediate, mode);
        self.linear2.forward_3d(&intermediate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array1, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_shape_preserved_for_every_activation() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = Array3::<f32>::ones((3, 2, 8));
        for act in [Activation::Relu, Activation::Gelu, Activation::Glu] {
            let ffn = FeedForward::init(8, 16, act, 0.1, &mut rng).unwrap();
            let out = ffn.forward(&x, &mut RunMode::Inference).unwrap();
            assert_eq!(out.shape(), &[3, 2, 8], "activation {}", act);
        }
    }

    #[test]
    fn test_glu_doubles_expansion() {
        let mut rng = StdRng::seed_from_u64(1);
        let ffn = FeedForward::init(4, 6, Activation::Glu, 0.0, &mut rng).unwrap();
        assert_eq!(ffn.linear1.out_features(), 12);
        assert_eq!(ffn.linear2.in_features(), 6);
    }

    #[test]
    fn test_relu_known_values() {
        // fc1 = [[1, 0], [0, -1]], fc2 = identity
        let fc1 = LinearLayer::new_f32(arr2(&[[1.0, 0.0], [0.0, -1.0]]), Some(Array1::zeros(2)));
        let fc2 = LinearLayer::new_f32(arr2(&[[1.0, 0.0], [0.0, 1.0]]), None);
        let ffn = FeedForward::new(fc1, fc2, Activation::Relu, 0.0).unwrap();

        let x = Array3::from_shape_vec((1, 1, 2), vec![2.0, 3.0]).unwrap();
        let out = ffn.forward(&x, &mut RunMode::Inference).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[2.0, 0.0]);
    }

    #[test]
    fn test_mismatched_layers_rejected() {
        let fc1 = LinearLayer::from(Array2::<f32>::zeros((4, 2)));
        let fc2 = LinearLayer::from(Array2::<f32>::zeros((2, 3)));
        assert!(FeedForward::new(fc1, fc2, Activation::Relu, 0.0).is_err());
    }
}
