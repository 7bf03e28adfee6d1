//! Small tensor helpers for sequence-first `[seq, batch, channels]` tensors.

use ndarray::{concatenate, s, Array2, Array3, ArrayView1, Axis, Zip};
use rayon::prelude::*;

use crate::error::Result;

/// Parallel in-place addition: a += b
pub fn add_inplace(a: &mut Array3<f32>, b: &Array3<f32>) {
    if a.shape() == b.shape() {
        if let (Some(a_slice), Some(b_slice)) = (a.as_slice_mut(), b.as_slice()) {
            a_slice
                .par_iter_mut()
                .zip(b_slice.par_iter())
                .for_each(|(x, y)| *x += *y);
            return;
        }
    }
    Zip::from(a).and(b).for_each(|x, &y| *x += y);
}

/// `tensor + pos`, or a copy of `tensor` when there is no positional embedding.
pub fn with_pos_embed(tensor: &Array3<f32>, pos: Option<&Array3<f32>>) -> Array3<f32> {
    match pos {
        Some(p) => tensor + p,
        None => tensor.clone(),
    }
}

/// Broadcast a `[seq, channels]` sequence across a batch: `[seq, batch, channels]`.
pub fn repeat_over_batch(seq: &Array2<f32>, batch: usize) -> Array3<f32> {
    let (len, channels) = seq.dim();
    let mut out = Array3::zeros((len, batch, channels));
    for mut column in out.axis_iter_mut(Axis(1)) {
        column.assign(seq);
    }
    out
}

/// A single `[1, batch, channels]` slot holding `vector` for every batch entry.
pub fn prefix_slot(vector: &ArrayView1<f32>, batch: usize) -> Array3<f32> {
    let mut out = Array3::zeros((1, batch, vector.len()));
    for mut row in out.index_axis_mut(Axis(0), 0).outer_iter_mut() {
        row.assign(vector);
    }
    out
}

/// Concatenate along the sequence axis (axis 0).
pub fn concat_sequences(parts: &[Array3<f32>]) -> Result<Array3<f32>> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Concatenate `[batch, seq]` masks along the sequence axis (axis 1).
pub fn concat_masks(parts: &[Array2<bool>]) -> Result<Array2<bool>> {
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(1), &views)?)
}

/// Drop the first `count` sequence positions.
pub fn strip_sequence_prefix(tensor: Array3<f32>, count: usize) -> Array3<f32> {
    if count == 0 {
        return tensor;
    }
    tensor.slice(s![count.., .., ..]).to_owned()
}

/// Drop the first `count` sequence positions of a `[batch, seq]` mask.
pub fn strip_mask_prefix(mask: Array2<bool>, count: usize) -> Array2<bool> {
    if count == 0 {
        return mask;
    }
    mask.slice(s![.., count..]).to_owned()
}
