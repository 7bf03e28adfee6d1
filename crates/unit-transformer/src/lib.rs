//! Multi-task, multi-modal encoder/decoder transformer core
//!
//! A shared encoder over image features, optional text features appended to the
//! encoder memory, and one decoder per `(task, dataset)` pair, each driven by a
//! learned query set. Task embeddings can be prepended on either side.

pub mod activations;
pub mod attention;
pub mod config;
pub mod decoder;
pub mod dropout;
pub mod encoder;
pub mod error;
pub mod feedforward;
pub mod fusion;
pub mod linear_layer;
pub mod normalization;
pub mod registry;
pub mod task_embedding;
pub mod transformer;
pub mod utils;

// Re-export commonly used items
pub use crate::{
    activations::Activation,
    attention::MultiHeadAttention,
    config::{NormPlacement, TransformerConfig, MAX_TASK_NUM},
    decoder::{DecoderLayer, TransformerDecoder},
    dropout::RunMode,
    encoder::{EncoderLayer, TransformerEncoder},
    error::{Result, TransformerError},
    feedforward::FeedForward,
    fusion::{ImageInput, SequenceStream, TextInput},
    registry::{DecoderHandle, DecoderRegistry},
    task_embedding::{TaskEmbeddingInjector, TaskEmbeddingTable},
    transformer::{Transformer, TransformerInput, TransformerOutput},
};

#[cfg(test)]
pub mod tests;
