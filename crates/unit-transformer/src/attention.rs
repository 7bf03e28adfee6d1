//! Multi-head attention over sequence-first tensors.

use ndarray::{Array3, Array4, ArrayView2};
use rand::Rng;

use crate::activations::softmax_4d_inplace;
use crate::dropout::{Dropout, RunMode};
use crate::error::{Result, TransformerError};
use crate::linear_layer::LinearLayer;
use crate::utils::linear_algebra::matmul_4d;
use crate::utils::masks::apply_key_padding_mask;

/// Multi-head scaled dot-product attention.
///
/// Inputs and outputs are `[seq, batch, embed]`. Query/key/value are given
/// separately so callers control where positional embeddings are added.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
    pub out_proj: LinearLayer,

    pub num_heads: usize,
    pub head_dim: usize,
    pub scale_factor: f32,
    dropout: Dropout,
}

impl MultiHeadAttention {
    /// Pure constructor: takes pre-built projections.
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        q: LinearLayer,
        k: LinearLayer,
        v: LinearLayer,
        o: LinearLayer,
        dropout: f32,
    ) -> Result<Self> {
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(TransformerError::config(format!(
                "hidden size {} is not divisible by {} heads",
                hidden_size, num_heads
            )));
        }
        for (name, layer) in [("q", &q), ("k", &k), ("v", &v), ("out", &o)] {
            if layer.in_features() != hidden_size || layer.out_features() != hidden_size {
                return Err(TransformerError::shape(format!(
                    "{} projection is [{}, {}], expected [{}, {}]",
                    name,
                    layer.out_features(),
                    layer.in_features(),
                    hidden_size,
                    hidden_size
                )));
            }
        }
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj: q,
            k_proj: k,
            v_proj: v,
            out_proj: o,
            num_heads,
            head_dim,
            scale_factor: 1.0 / (head_dim as f32).sqrt(),
            dropout: Dropout::new(dropout),
        })
    }

    /// Xavier-initialized projections with zero biases.
    pub fn init<R: Rng + ?Sized>(hidden_size: usize, num_heads: usize, dropout: f32, rng: &mut R) -> Result<Self> {
        Self::new(
            hidden_size,
            num_heads,
            LinearLayer::xavier(hidden_size, hidden_size, rng),
            LinearLayer::xavier(hidden_size, hidden_size, rng),
            LinearLayer::xavier(hidden_size, hidden_size, rng),
            LinearLayer::xavier(hidden_size, hidden_size, rng),
            dropout,
        )
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn num_parameters(&self) -> usize {
        self.q_proj.num_parameters()
            + self.k_proj.num_parameters()
            + self.v_proj.num_parameters()
            + self.out_proj.num_parameters()
    }

    /// # Arguments
    /// * `query` - `[seq_q, batch, hidden]`
    /// * `key` - `[seq_k, batch, hidden]`
    /// * `value` - `[seq_k, batch, hidden]`
    /// * `key_padding_mask` - `[batch, seq_k]`, `true` = ignore that key
    pub fn forward(
        &self,
        query: &Array3<f32>,
        key: &Array3<f32>,
        value: &Array3<f32>,
        key_padding_mask: Option<&ArrayView2<bool>>,
        mode: &mut RunMode<'_>,
    ) -> Result<Array3<f32>> {
        let (seq_q, batch, hidden) = query.dim();
        let (_, batch_k, _) = key.dim();
        if key.shape() != value.shape() {
            return Err(TransformerError::shape(format!(
                "attention key {:?} and value {:?} differ",
                key.shape(),
                value.shape()
            )));
        }
        if batch_k != batch {
            return Err(TransformerError::shape(format!(
                "attention query batch {} != key batch {}",
                batch, batch_k
            )));
        }
        if hidden != self.hidden_size() {
            return Err(TransformerError::shape(format!(
                "attention query has {} channels, expected {}",
                hidden,
                self.hidden_size()
            )));
        }

        // 1. Project, split heads
        let q_heads = self.split_heads(self.q_proj.forward_3d(query)?, [1, 2, 0, 3])?;
        // K transposed to [B, H, D, S] for Q @ K
        let k_heads_t = self.split_heads(self.k_proj.forward_3d(key)?, [1, 2, 3, 0])?;
        let v_heads = self.split_heads(self.v_proj.forward_3d(value)?, [1, 2, 0, 3])?;

        // 2. Scores
        let mut scores = matmul_4d(&q_heads, &k_heads_t);
        scores.mapv_inplace(|x| x * self.scale_factor);

        if let Some(mask) = key_padding_mask {
            apply_key_padding_mask(&mut scores, mask)?;
        }

        softmax_4d_inplace(&mut scores);
        let weights = self.dropout.forward(scores, mode);

        // 3. Context [B, H, Sq, D] -> [Sq, B, H * D]
        let context = matmul_4d(&weights, &v_heads)
            .permuted_axes([2, 0, 1, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((seq_q, batch, hidden))?;

        self.out_proj.forward_3d(&context)
    }

    /// `[S, B, hidden]` -> `[S, B, H, D]` -> permuted by `axes`.
    fn split_heads(&self, projected: Array3<f32>, axes: [usize; 4]) -> Result<Array4<f32>> {
        let (seq, batch, _) = projected.dim();
        Ok(projected
            .into_shape_with_order((seq, batch, self.num_heads, self.head_dim))?
            .permuted_axes(axes)
            .as_standard_layout()
            .into_owned())
    }
}
