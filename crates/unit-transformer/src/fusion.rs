//! Conversion of image and text inputs into one sequence-first memory stream.

use ndarray::{Array2, Array3, Array4};

use crate::error::{Result, TransformerError};
use crate::utils::masks::{flatten_spatial_mask, padding_mask_from_attention_mask};
use crate::utils::tensor_ops::{concat_masks, concat_sequences, repeat_over_batch};

/// Attention-mask value that marks a real text token.
pub const TEXT_TOKEN_VALUE: f32 = 1.0;

/// Image feature map with its padding mask and positional encoding.
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// `[batch, channels, h, w]`
    pub src: Array4<f32>,
    /// `[batch, h, w]`, `true` = padding
    pub mask: Array3<bool>,
    /// `[batch, channels, h, w]`
    pub pos: Array4<f32>,
}

/// Text features from an upstream text encoder, already at the decoder width.
#[derive(Debug, Clone)]
pub struct TextInput {
    /// `[batch, len, channels]`
    pub src: Array3<f32>,
    /// `[batch, len]` attention mask, `1.0` = real token
    pub mask: Array2<f32>,
    /// `[len, channels]`, shared by every batch entry
    pub pos: Array2<f32>,
}

/// A sequence-first stream: content, optional positions, and padding mask.
#[derive(Debug, Clone)]
pub struct SequenceStream {
    /// `[seq, batch, channels]`
    pub memory: Array3<f32>,
    /// Same shape as `memory`.
    pub pos: Option<Array3<f32>>,
    /// `[batch, seq]`, `true` = padding
    pub mask: Array2<bool>,
}

impl SequenceStream {
    pub fn seq_len(&self) -> usize {
        self.memory.dim().0
    }

    pub fn batch_size(&self) -> usize {
        self.memory.dim().1
    }

    pub fn channels(&self) -> usize {
        self.memory.dim().2
    }
}

/// `[batch, channels, h, w]` → `[h * w, batch, channels]`
fn flatten_feature_map(map: &Array4<f32>) -> Result<Array3<f32>> {
    let (batch, channels, h, w) = map.dim();
    let flat = map
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, channels, h * w))?;
    Ok(flat.permuted_axes([2, 0, 1]).as_standard_layout().into_owned())
}

impl ImageInput {
    pub fn batch_size(&self) -> usize {
        self.src.dim().0
    }

    pub fn spatial_dims(&self) -> (usize, usize) {
        let (_, _, h, w) = self.src.dim();
        (h, w)
    }

    /// Flatten the spatial grid into a sequence, row-major over `(h, w)`.
    pub fn flatten(&self) -> Result<SequenceStream> {
        let (batch, _, h, w) = self.src.dim();
        if self.pos.shape() != self.src.shape() {
            return Err(TransformerError::shape(format!(
                "image positional encoding is {:?}, features are {:?}",
                self.pos.shape(),
                self.src.shape()
            )));
        }
        if self.mask.dim() != (batch, h, w) {
            return Err(TransformerError::shape(format!(
                "image mask is {:?}, expected [{}, {}, {}]",
                self.mask.shape(),
                batch,
                h,
                w
            )));
        }
        Ok(SequenceStream {
            memory: flatten_feature_map(&self.src)?,
            pos: Some(flatten_feature_map(&self.pos)?),
            mask: flatten_spatial_mask(&self.mask)?,
        })
    }
}

impl TextInput {
    pub fn batch_size(&self) -> usize {
        self.src.dim().0
    }

    /// Permute to sequence-first and broadcast the positions over the batch.
    pub fn to_stream(&self) -> Result<SequenceStream> {
        let (batch, len, channels) = self.src.dim();
        if self.mask.dim() != (batch, len) {
            return Err(TransformerError::shape(format!(
                "text mask is {:?}, expected [{}, {}]",
                self.mask.shape(),
                batch,
                len
            )));
        }
        if self.pos.dim() != (len, channels) {
            return Err(TransformerError::shape(format!(
                "text positional encoding is {:?}, expected [{}, {}]",
                self.pos.shape(),
                len,
                channels
            )));
        }
        Ok(SequenceStream {
            memory: self.src.view().permuted_axes([1, 0, 2]).as_standard_layout().into_owned(),
            pos: Some(repeat_over_batch(&self.pos, batch)),
            mask: padding_mask_from_attention_mask(&self.mask, TEXT_TOKEN_VALUE),
        })
    }
}

/// Concatenate streams along the sequence axis in the order given.
///
/// At least one stream is required. Positions are kept only when every stream
/// carries them.
pub fn fuse_streams(streams: Vec<SequenceStream>) -> Result<SequenceStream> {
    let Some(first) = streams.first() else {
        return Err(TransformerError::MissingModality);
    };
    let (batch, channels) = (first.batch_size(), first.channels());
    if let Some(bad) = streams
        .iter()
        .find(|s| s.batch_size() != batch || s.channels() != channels)
    {
        return Err(TransformerError::shape(format!(
            "cannot fuse stream {:?} with stream {:?}",
            bad.memory.shape(),
            first.memory.shape()
        )));
    }
    if streams.len() == 1 {
        return streams.into_iter().next().ok_or(TransformerError::MissingModality);
    }

    let with_pos = streams.iter().filter(|s| s.pos.is_some()).count();
    if with_pos != 0 && with_pos != streams.len() {
        return Err(TransformerError::shape(
            "either every fused stream carries positions or none does",
        ));
    }

    let mut memories = Vec::with_capacity(streams.len());
    let mut positions = Vec::with_capacity(with_pos);
    let mut masks = Vec::with_capacity(streams.len());
    for stream in streams {
        memories.push(stream.memory);
        positions.extend(stream.pos);
        masks.push(stream.mask);
    }
    let pos = if positions.is_empty() {
        None
    } else {
        Some(concat_sequences(&positions)?)
    };
    Ok(SequenceStream {
        memory: concat_sequences(&memories)?,
        pos,
        mask: concat_masks(&masks)?,
    })
}
