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

/// Self-attention block followed by a feed-forward block.
///
/// Positional embeddings are added to queries and keys only; values see the raw
/// stream.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    pub self_attn: MultiHeadAttention,
    pub self_attn_layer_norm: LayerNorm,
    pub feedforward: FeedForward,
    pub ffn_layer_norm: LayerNorm,
    dropout1: Dropout,
    dropout2: Dropout,
    norm_placement: NormPlacement,
}

impl EncoderLayer {
    pub fn new(
        self_attn: MultiHeadAttention,
        self_attn_layer_norm: LayerNorm,
        feedforward: FeedForward,
        ffn_layer_norm: LayerNorm,
        dropout: f32,
        norm_placement: NormPlacement,
    ) -> Self {
        Self {
            self_attn,
            self_attn_layer_norm,
            feedforward,
            ffn_layer_norm,
            dropout1: Dropout::new(dropout),
            dropout2: Dropout::new(dropout),
            norm_placement,
        }
    }

    /// Fresh layer with Xavier weights and identity norms.
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
        let feedforward = FeedForward::init(d_model, dim_feedforward, activation, dropout, rng)?;
        Ok(Self::new(
            self_attn,
            LayerNorm::identity_init(d_model),
            feedforward,
            LayerNorm::identity_init(d_model),
            dropout,
            norm_placement,
        ))
    }

    pub fn norm_placement(&self) -> NormPlacement {
        self.norm_placement
    }

    pub fn num_parameters(&self) -> usize {
        self.self_attn.num_parameters()
            + self.self_attn_layer_norm.num_parameters()
            + self.feedforward.num_parameters()
            + self.ffn_layer_norm.num_parameters()
    }

    /// Forward pass with the configured norm order
    ///
    /// # Arguments
    /// * `src` - `[seq, batch, d_model]`
    /// * `key_padding_mask` - `[batch, seq]`, `true` = padding
    /// * `pos` - positional embedding with the same shape as `src`
    pub fn forward(
        &self,
        src: Array3<f32>,
        key_padding_mask: Option<&ArrayView2<bool>>,
        pos: Option<&Array3<f32>>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        let start = Instant::now();
        let out = match self.norm_placement {
            NormPlacement::Pre => self.forward_prenorm(src, key_padding_mask, pos, mode)?,
            NormPlacement::Post => self.forward_postnorm(src, key_padding_mask, pos, mode)?,
        };
        let (s, b, d) = out.dim();
        log::trace!(
            "[EncoderLayer] {} [{}, {}, {}] took {:?}",
            self.norm_placement,
            s,
            b,
            d,
            start.elapsed()
        );
        Ok(out)
    }

    /// Pre-norm: LN → Sublayer → Residual
    ///
    /// ```text
    /// x ──┬── LN ──► Attention ──┬──► + ──┬── LN ──► FFN ──┬──► + ──► out
    ///     └─────────────────────►┘        └────────────────►┘
    /// ```
    fn forward_prenorm(
        &self,
        mut src: Array3<f32>,
        key_padding_mask: Option<&ArrayView2<bool>>,
        pos: Option<&Array3<f32>>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        let normed = self.self_attn_layer_norm.forward_3d(&src);
        let qk = with_pos_embed(&normed, pos);
        let attn_out = self
            .self_attn
            .forward(&qk, &qk, &normed, key_padding_mask, mode)?;
        add_inplace(&mut src, &self.dropout1.forward(attn_out, mode));

        let normed = self.ffn_layer_norm.forward_3d(&src);
        let ffn_out = self.feedforward.forward(&normed, mode)?;
        add_inplace(&mut src, &self.dropout2.forward(ffn_out, mode));
        Ok(src)
    }

    /// Post-norm: Sublayer → Residual → LN
    ///
    /// ```text
    /// x ──┬──► Attention ──┬──► + ──► LN ──┬──► FFN ──┬──► + ──► LN ──► out
    ///     └────────────────►┘              └──────────►┘
    /// ```
    fn forward_postnorm(
        &self,
        mut src: Array3<f32>,
        key_padding_mask: Option<&ArrayView2<bool>>,
        pos: Option<&Array3<f32>>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        let qk = with_pos_embed(&src, pos);
        let attn_out = self
            .self_attn
            .forward(&qk, &qk, &src, key_padding_mask, mode)?;
        add_inplace(&mut src, &self.dropout1.forward(attn_out, mode));
        let mut hidden = self.self_attn_layer_norm.forward_3d(&src);

        let ffn_out = self.feedforward.forward(&hidden, mode)?;
        add_inplace(&mut hidden, &self.dropout2.forward(ffn_out, mode));
        Ok(self.ffn_layer_norm.forward_3d(&hidden))
    }
}
