use ndarray::{stack, Array3, Array4, Axis};
use rand::Rng;

use crate::activations::Activation;
use crate::config::NormPlacement;
use crate::decoder::decoder_layer::{DecoderContext, DecoderLayer};
use crate::dropout::RunMode;
use crate::error::{Result, TransformerError};
use crate::normalization::LayerNorm;
use crate::utils::shape::{ensure_mask_matches, ensure_pos_matches};

/// Stack of decoder layers sharing one final normalization.
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
    return_intermediate: bool,
}

impl TransformerDecoder {
    pub fn new(layers: Vec<DecoderLayer>, norm: LayerNorm, return_intermediate: bool) -> Self {
        Self {
            layers,
            norm,
            return_intermediate,
        }
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
        return_intermediate: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|_| {
                DecoderLayer::init(
                    d_model,
                    nheads,
                    dim_feedforward,
                    dropout,
                    activation,
                    norm_placement,
                    &mut *rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(layers, LayerNorm::identity_init(d_model), return_intermediate))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn return_intermediate(&self) -> bool {
        self.return_intermediate
    }

    pub fn hidden_size(&self) -> usize {
        self.norm.dim()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(DecoderLayer::num_parameters).sum::<usize>() + self.norm.num_parameters()
    }

    /// Runs every layer over `tgt` and returns `[layers_or_1, queries, batch, d_model]`.
    ///
    /// With intermediate return the leading axis holds one normalized entry per
    /// layer, the last one being the final output. Otherwise it holds only the
    /// final output. A decoder without layers returns the normalized target.
    pub fn forward(
        &self,
        tgt: Array3<f32>,
        ctx: &DecoderContext<'_>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array4<f32>> {
        let (_, batch, d_model) = tgt.dim();
        if d_model != self.hidden_size() {
            return Err(TransformerError::shape(format!(
                "decoder target has {} channels, expected {}",
                d_model,
                self.hidden_size()
            )));
        }
        if ctx.memory.shape()[1] != batch || ctx.memory.shape()[2] != d_model {
            return Err(TransformerError::shape(format!(
                "decoder memory {:?} does not pair with target {:?}",
                ctx.memory.shape(),
                tgt.shape()
            )));
        }
        ensure_pos_matches("decoder query", &tgt, ctx.query_pos)?;
        ensure_pos_matches("decoder memory", ctx.memory, ctx.pos)?;
        ensure_mask_matches("decoder memory", ctx.memory, ctx.memory_key_padding_mask)?;

        let mut output = tgt;
        let mut intermediate: Vec<Array3<f32>> = Vec::new();
        for layer in &self.layers {
            output = layer.forward(output, ctx, mode)?;
            if self.return_intermediate {
                intermediate.push(self.norm.forward_3d(&output));
            }
        }

        let output = self.norm.forward_3d(&output);
        if self.return_intermediate {
            intermediate.pop();
        }
        intermediate.push(output);

        let views: Vec<_> = intermediate.iter().map(|a| a.view()).collect();
        Ok(stack(Axis(0), &views)?)
    }
}
