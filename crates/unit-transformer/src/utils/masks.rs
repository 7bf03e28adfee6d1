use ndarray::{Array2, Array3, Array4, ArrayView2, Axis, Zip};

use crate::error::{Result, TransformerError};

pub const MASK_VALUE: f32 = -1e9;

/// Apply a key padding mask to attention scores.
///
/// Masks positions where `mask[batch, key_pos]` is `true` (padding).
pub fn apply_key_padding_mask(scores: &mut Array4<f32>, mask: &ArrayView2<bool>) -> Result<()> {
    let (batch_size, _, _, seq_k) = scores.dim();

    if mask.dim() != (batch_size, seq_k) {
        return Err(TransformerError::shape(format!(
            "key padding mask is {:?}, expected [{}, {}] (batch, key length)",
            mask.shape(),
            batch_size,
            seq_k
        )));
    }

    Zip::from(scores.outer_iter_mut())
        .and(mask.outer_iter())
        .for_each(|mut batch_scores, key_mask| {
            for mut row in batch_scores.lanes_mut(Axis(2)) {
                Zip::from(&mut row).and(&key_mask).for_each(|s, &pad| {
                    if pad {
                        *s = MASK_VALUE;
                    }
                });
            }
        });

    Ok(())
}

/// Flatten a spatial padding mask `[batch, h, w]` into `[batch, h * w]`.
pub fn flatten_spatial_mask(mask: &Array3<bool>) -> Result<Array2<bool>> {
    let (batch, h, w) = mask.dim();
    Ok(mask
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, h * w))?)
}

/// Derive a padding mask from an attention mask.
///
/// Positions holding `valid_value` are real tokens; everything else is padding.
pub fn padding_mask_from_attention_mask(attention_mask: &Array2<f32>, valid_value: f32) -> Array2<bool> {
    attention_mask.mapv(|v| v != valid_value)
}

/// Create a mask with no padding.
pub fn create_empty_padding_mask(batch_size: usize, seq_len: usize) -> Array2<bool> {
    Array2::from_elem((batch_size, seq_len), false)
}
