//! Transformer configuration types

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{Result, TransformerError};

/// Capacity of the task embedding tables.
pub const MAX_TASK_NUM: usize = 256;

/// Where layer normalization sits relative to each sublayer's residual add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormPlacement {
    /// Sublayer → residual add → LN (DETR, BERT)
    #[default]
    Post,
    /// LN → sublayer → residual add (GPT-2, T5)
    Pre,
}

impl NormPlacement {
    pub fn is_prenorm(&self) -> bool {
        matches!(self, NormPlacement::Pre)
    }
}

impl fmt::Display for NormPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormPlacement::Post => write!(f, "post"),
            NormPlacement::Pre => write!(f, "pre"),
        }
    }
}

/// Construction-time configuration. Immutable once the model is built.
///
/// `num_queries` enumerates every `(task, dataset)` pair that gets a decoder,
/// along with the size of the query set that pair is driven with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    pub encoder_hidden_dim: usize,
    pub decoder_hidden_dim: usize,
    pub nheads: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub dim_feedforward: usize,
    pub dropout: f32,
    /// One of `relu`, `gelu`, `glu`; checked when the model is built.
    pub activation: String,
    pub norm_placement: NormPlacement,
    pub return_intermediate_dec: bool,
    pub pass_pos_and_query: bool,
    pub share_decoders: bool,
    pub use_task_embedding_in_encoder: bool,
    pub use_task_embedding_in_decoder: bool,
    pub residual_in_encoder: bool,
    pub num_queries: BTreeMap<String, BTreeMap<String, usize>>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            encoder_hidden_dim: 512,
            decoder_hidden_dim: 512,
            nheads: 8,
            enc_layers: 6,
            dec_layers: 6,
            dim_feedforward: 2048,
            dropout: 0.1,
            activation: "relu".to_string(),
            norm_placement: NormPlacement::Post,
            return_intermediate_dec: true,
            pass_pos_and_query: true,
            share_decoders: false,
            use_task_embedding_in_encoder: false,
            use_task_embedding_in_decoder: false,
            residual_in_encoder: false,
            num_queries: BTreeMap::new(),
        }
    }
}

impl TransformerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Resolve the activation name, failing on anything outside relu/gelu/glu.
    pub fn activation(&self) -> Result<Activation> {
        self.activation.parse()
    }

    /// Check every invariant the builders rely on.
    pub fn validate(&self) -> Result<()> {
        self.activation()?;
        if self.nheads == 0 {
            return Err(TransformerError::config("nheads must be positive"));
        }
        for (name, dim) in [
            ("encoder_hidden_dim", self.encoder_hidden_dim),
            ("decoder_hidden_dim", self.decoder_hidden_dim),
        ] {
            if dim == 0 || dim % self.nheads != 0 {
                return Err(TransformerError::config(format!(
                    "{} = {} must be a positive multiple of nheads = {}",
                    name, dim, self.nheads
                )));
            }
        }
        if self.dim_feedforward == 0 {
            return Err(TransformerError::config("dim_feedforward must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TransformerError::config(format!(
                "dropout = {} must be in [0, 1)",
                self.dropout
            )));
        }
        if self.num_queries.values().all(|datasets| datasets.is_empty()) {
            return Err(TransformerError::config(
                "num_queries must register at least one (task, dataset) pair",
            ));
        }
        Ok(())
    }

    /// Register a `(task, dataset)` pair driven by `num_queries` queries.
    pub fn with_task(mut self, task: &str, dataset: &str, num_queries: usize) -> Self {
        self.num_queries
            .entry(task.to_string())
            .or_default()
            .insert(dataset.to_string(), num_queries);
        self
    }

    pub fn with_hidden_dims(mut self, encoder: usize, decoder: usize) -> Self {
        self.encoder_hidden_dim = encoder;
        self.decoder_hidden_dim = decoder;
        self
    }

    pub fn with_heads(mut self, nheads: usize) -> Self {
        self.nheads = nheads;
        self
    }

    pub fn with_layers(mut self, encoder: usize, decoder: usize) -> Self {
        self.enc_layers = encoder;
        self.dec_layers = decoder;
        self
    }

    pub fn with_dim_feedforward(mut self, dim: usize) -> Self {
        self.dim_feedforward = dim;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_activation(mut self, activation: &str) -> Self {
        self.activation = activation.to_string();
        self
    }

    pub fn with_norm_placement(mut self, placement: NormPlacement) -> Self {
        self.norm_placement = placement;
        self
    }

    pub fn with_return_intermediate(mut self, enabled: bool) -> Self {
        self.return_intermediate_dec = enabled;
        self
    }

    pub fn with_pass_pos_and_query(mut self, enabled: bool) -> Self {
        self.pass_pos_and_query = enabled;
        self
    }

    pub fn with_shared_decoders(mut self, shared: bool) -> Self {
        self.share_decoders = shared;
        self
    }

    pub fn with_task_embedding(mut self, in_encoder: bool, in_decoder: bool) -> Self {
        self.use_task_embedding_in_encoder = in_encoder;
        self.use_task_embedding_in_decoder = in_decoder;
        self
    }

    pub fn with_residual_in_encoder(mut self, enabled: bool) -> Self {
        self.residual_in_encoder = enabled;
        self
    }
}

impl fmt::Display for TransformerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: usize = self.num_queries.values().map(|d| d.len()).sum();
        write!(
            f,
            "TransformerConfig {{ d_enc: {}, d_dec: {}, heads: {}, layers: {}/{}, ffn: {}, act: {}, norm: {}, decoders: {} ({}) }}",
            self.encoder_hidden_dim,
            self.decoder_hidden_dim,
            self.nheads,
            self.enc_layers,
            self.dec_layers,
            self.dim_feedforward,
            self.activation,
            self.norm_placement,
            pairs,
            if self.share_decoders { "shared" } else { "independent" },
        )
    }
}
