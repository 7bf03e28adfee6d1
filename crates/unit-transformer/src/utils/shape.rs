//! Shape checks shared by the layers and the orchestrator.

use ndarray::{Array3, ArrayView2};

use crate::error::{Result, TransformerError};

/// Fails unless the last axis of a `[seq, batch, channels]` tensor is `expected`.
pub fn ensure_channels(name: &str, tensor: &Array3<f32>, expected: usize) -> Result<()> {
    let channels = tensor.shape()[2];
    if channels != expected {
        return Err(TransformerError::shape(format!(
            "{} has {} channels, model dimension is {}",
            name, channels, expected
        )));
    }
    Ok(())
}

/// Fails unless an optional positional embedding matches its content exactly.
pub fn ensure_pos_matches(name: &str, content: &Array3<f32>, pos: Option<&Array3<f32>>) -> Result<()> {
    match pos {
        Some(p) if p.shape() != content.shape() => Err(TransformerError::shape(format!(
            "{} positional embedding is {:?}, content is {:?}",
            name,
            p.shape(),
            content.shape()
        ))),
        _ => Ok(()),
    }
}

/// Fails unless a `[batch, seq]` padding mask pairs with a `[seq, batch, _]` tensor.
pub fn ensure_mask_matches(name: &str, content: &Array3<f32>, mask: Option<&ArrayView2<bool>>) -> Result<()> {
    let (seq, batch, _) = content.dim();
    match mask {
        Some(m) if m.dim() != (batch, seq) => Err(TransformerError::shape(format!(
            "{} padding mask is {:?}, expected [{}, {}] (batch, sequence length)",
            name,
            m.shape(),
            batch,
            seq
        ))),
        _ => Ok(()),
    }
}
