use ndarray::{Array3, ArrayView2};
use rand::Rng;

use crate::activations::Activation;
use crate::config::NormPlacement;
use crate::dropout::RunMode;
use crate::encoder::encoder_layer::EncoderLayer;
use crate::error::Result;
use crate::normalization::LayerNorm;
use crate::utils::shape::{ensure_mask_matches, ensure_pos_matches};

/// Stack of independently parameterized encoder layers.
///
/// The final norm only exists for pre-norm stacks, where the last residual
/// add would otherwise leave the output unnormalized.
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    layers: Vec<EncoderLayer>,
    norm: Option<LayerNorm>,
}

impl TransformerEncoder {
    pub fn new(layers: Vec<EncoderLayer>, norm: Option<LayerNorm>) -> Self {
        Self { layers, norm }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init<R: Rng + ?Sized>(
        num_layers: usize,
        d_model: usize,
        nheads: usize,
        dim_feedforward: usize,
        dropout: f32,
        activation: Activation,
        norm_placement: NormPlacement,
        rng: &mut R,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layers.push(EncoderLayer::init(
                d_model,
                nheads,
                dim_feedforward,
                dropout,
                activation,
                norm_placement,
                rng,
            )?);
        }
        let norm = norm_placement
            .is_prenorm()
            .then(|| LayerNorm::identity_init(d_model));
        log::debug!(
            "Built {}-layer encoder (d_model={}, heads={}, norm={}, final_norm={})",
            num_layers,
            d_model,
            nheads,
            norm_placement,
            norm.is_some()
        );
        Ok(Self::new(layers, norm))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn has_final_norm(&self) -> bool {
        self.norm.is_some()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(EncoderLayer::num_parameters).sum::<usize>()
            + self.norm.as_ref().map_or(0, LayerNorm::num_parameters)
    }

    /// Runs every layer in order on `[seq, batch, d_model]`.
    pub fn forward(
        &self,
        src: Array3<f32>,
        key_padding_mask: Option<&ArrayView2<bool>>,
        pos: Option<&Array3<f32>>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        ensure_pos_matches("encoder", &src, pos)?;
        ensure_mask_matches("encoder", &src, key_padding_mask)?;

        let mut hidden = src;
        for layer in &self.layers {
            hidden = layer.forward(hidden, key_padding_mask, pos, mode)?;
        }
        if let Some(norm) = &self.norm {
            hidden = norm.forward_3d(&hidden);
        }
        Ok(hidden)
    }
}
