use std::time::Instant;

use ndarray::{Array3, ArrayView2};
use rand::Rng;

use crate::activations::Activation;
use crate::attention::MultiHeadAttention;
use crate::config::NormPlacement;
use crate::dropout::{Dropout, RunMode};
use crate::error::Result;
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;
use crate::utils::tensor_ops::{add_inplace, with_pos_embed};

/// Query self-attention, cross-attention into memory, then feed-forward.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    // Self-Attention Components
    pub self_attn: MultiHeadAttention,
    pub self_attn_layer_norm: LayerNorm,
    // Cross-Attention Components
    pub cross_attn: MultiHeadAttention,
    pub cross_attn_layer_norm: LayerNorm,
    // Feed-Forward Components
    pub feedforward: FeedForward,
    pub ffn_layer_norm: LayerNorm,
    dropout1: Dropout,
    dropout2: Dropout,
    dropout3: Dropout,
    norm_placement: NormPlacement,
}

/// Per-call inputs shared by every decoder layer.
#[derive(Clone, Copy)]
pub struct DecoderContext<'a> {
    /// `[seq, batch, d_model]`
    pub memory: &'a Array3<f32>,
    /// `[batch, seq]`, `true` = padding
    pub memory_key_padding_mask: Option<&'a ArrayView2<'a, bool>>,
    /// Positional embedding for `memory`.
    pub pos: Option<&'a Array3<f32>>,
    /// Positional embedding for the target, `[queries, batch, d_model]`.
    pub query_pos: Option<&'a Array3<f32>>,
}

impl DecoderLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_attn: MultiHeadAttention,
        self_attn_layer_norm: LayerNorm,
        cross_attn: MultiHeadAttention,
        cross_attn_layer_norm: LayerNorm,
        feedforward: FeedForward,
        ffn_layer_norm: LayerNorm,
        dropout: f32,
        norm_placement: NormPlacement,
    ) -> Self {
        Self {
            self_attn,
            self_attn_layer_norm,
            cross_attn,
            cross_attn_layer_norm,
            feedforward,
            ffn_layer_norm,
            dropout1: Dropout::new(dropout),
            dropout2: Dropout::new(dropout),
            dropout3: Dropout::new(dropout),
            norm_placement,
        }
    }

    pub fn init<R: Rng + ?Sized>(
        d_model: usize,
        nheads: usize,
        dim_feedforward: usize,
        dropout: f32,
        activation: Activation,
        norm_placement: NormPlacement,
        rng: &mut R,
    ) -> Result<Self> {
        let self_attn = MultiHeadAttention::init(d_model, nheads, dropout, rng)?;
        let cross_attn = MultiHeadAttention::init(d_model, nheads, dropout, rng)?;
        let feedforward = FeedForward::init(d_model, dim_feedforward, activation, dropout, rng)?;
        Ok(Self::new(
            self_attn,
            LayerNorm::identity_init(d_model),
            cross_attn,
            LayerNorm::identity_init(d_model),
            feedforward,
            LayerNorm::identity_init(d_model),
            dropout,
            norm_placement,
        ))
    }

    pub fn num_parameters(&self) -> usize {
        self.self_attn.num_parameters()
            + self.self_attn_layer_norm.num_parameters()
            + self.cross_attn.num_parameters()
            + self.cross_attn_layer_norm.num_parameters()
            + self.feedforward.num_parameters()
            + self.ffn_layer_norm.num_parameters()
    }

    /// Forward pass with the configured norm order
    ///
    /// # Arguments
    /// * `tgt` - `[queries, batch, d_model]`
    /// * `ctx` - memory, its mask and positions, and the query positions
    pub fn forward(
        &self,
        tgt: Array3<f32>,
        ctx: &DecoderContext<'_>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        let start = Instant::now();
        let out = match self.norm_placement {
            NormPlacement::Pre => self.forward_prenorm(tgt, ctx, mode)?,
            NormPlacement::Post => self.forward_postnorm(tgt, ctx, mode)?,
        };
        log::trace!(
            "[DecoderLayer] {} {:?} over memory {:?} took {:?}",
            self.norm_placement,
            out.shape(),
            ctx.memory.shape(),
            start.elapsed()
        );
        Ok(out)
    }

    fn forward_prenorm(
        &self,
        mut tgt: Array3<f32>,
        ctx: &DecoderContext<'_>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        // 1. Self Attention
        let normed = self.self_attn_layer_norm.forward_3d(&tgt);
        let qk = with_pos_embed(&normed, ctx.query_pos);
        let attn_out = self.self_attn.forward(&qk, &qk, &normed, None, mode)?;
        add_inplace(&mut tgt, &self.dropout1.forward(attn_out, mode));

        // 2. Cross Attention
        let normed = self.cross_attn_layer_norm.forward_3d(&tgt);
        let cross_out = self.cross_attention(&normed, ctx, mode)?;
        add_inplace(&mut tgt, &self.dropout2.forward(cross_out, mode));

        // 3. FFN
        let normed = self.ffn_layer_norm.forward_3d(&tgt);
        let ffn_out = self.feedforward.forward(&normed, mode)?;
        add_inplace(&mut tgt, &self.dropout3.forward(ffn_out, mode));
        Ok(tgt)
    }

    fn forward_postnorm(
        &self,
        mut tgt: Array3<f32>,
        ctx: &DecoderContext<'_>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        // 1. Self Attention
        let qk = with_pos_embed(&tgt, ctx.query_pos);
        let attn_out = self.self_attn.forward(&qk, &qk, &tgt, None, mode)?;
        add_inplace(&mut tgt, &self.dropout1.forward(attn_out, mode));
        let mut hidden = self.self_attn_layer_norm.forward_3d(&tgt);

        // 2. Cross Attention
        let cross_out = self.cross_attention(&hidden, ctx, mode)?;
        add_inplace(&mut hidden, &self.dropout2.forward(cross_out, mode));
        let mut hidden = self.cross_attn_layer_norm.forward_3d(&hidden);

        // 3. FFN
        let ffn_out = self.feedforward.forward(&hidden, mode)?;
        add_inplace(&mut hidden, &self.dropout3.forward(ffn_out, mode));
        Ok(self.ffn_layer_norm.forward_3d(&hidden))
    }

    fn cross_attention(
        &self,
        hidden: &Array3<f32>,
        ctx: &DecoderContext<'_>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        let query = with_pos_embed(hidden, ctx.query_pos);
        let key = with_pos_embed(ctx.memory, ctx.pos);
        self.cross_attn
            .forward(&query, &key, ctx.memory, ctx.memory_key_padding_mask, mode)
    }
}
