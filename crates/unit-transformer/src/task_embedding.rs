//! Learned per-task vectors prepended to the encoder input and the decoder queries.

use ndarray::{Array2, Array3, ArrayView1};
use rand::Rng;

use crate::config::MAX_TASK_NUM;
use crate::error::{Result, TransformerError};
use crate::utils::init::standard_normal;
use crate::utils::masks::create_empty_padding_mask;
use crate::utils::tensor_ops::{concat_masks, concat_sequences, prefix_slot};

/// Fixed-capacity `[MAX_TASK_NUM, d_model]` embedding table.
#[derive(Debug, Clone)]
pub struct TaskEmbeddingTable {
    pub weight: Array2<f32>,
}

impl TaskEmbeddingTable {
    pub fn new(weight: Array2<f32>) -> Result<Self> {
        if weight.nrows() != MAX_TASK_NUM {
            return Err(TransformerError::shape(format!(
                "task embedding table has {} rows, expected {}",
                weight.nrows(),
                MAX_TASK_NUM
            )));
        }
        Ok(Self { weight })
    }

    /// N(0, 1) initialized table.
    pub fn init<R: Rng + ?Sized>(d_model: usize, rng: &mut R) -> Self {
        Self {
            weight: standard_normal(MAX_TASK_NUM, d_model, rng),
        }
    }

    pub fn dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len()
    }

    pub fn lookup(&self, task_idx: usize) -> Result<ArrayView1<'_, f32>> {
        if task_idx >= self.weight.nrows() {
            return Err(TransformerError::TaskIndexOutOfRange {
                index: task_idx,
                capacity: self.weight.nrows(),
            });
        }
        Ok(self.weight.row(task_idx))
    }

    /// `[1, batch, d_model]` slot holding this task's vector.
    fn slot(&self, task_idx: Option<usize>, batch: usize) -> Result<Array3<f32>> {
        let task_idx = task_idx.ok_or(TransformerError::MissingTaskIndex)?;
        Ok(prefix_slot(&self.lookup(task_idx)?, batch))
    }
}

/// Encoder input stream as it flows into the prefix injection.
#[derive(Debug, Clone)]
pub struct EncoderInputs {
    /// `[seq, batch, d_model]`
    pub src: Array3<f32>,
    /// `[batch, seq]`, `true` = padding
    pub mask: Array2<bool>,
    pub pos: Option<Array3<f32>>,
}

/// Encoder-side and decoder-side task embedding toggles.
///
/// A disabled side is the identity and contributes no prefix.
#[derive(Debug, Clone, Default)]
pub struct TaskEmbeddingInjector {
    encoder: Option<TaskEmbeddingTable>,
    decoder: Option<TaskEmbeddingTable>,
}

impl TaskEmbeddingInjector {
    pub fn new(encoder: Option<TaskEmbeddingTable>, decoder: Option<TaskEmbeddingTable>) -> Self {
        Self { encoder, decoder }
    }

    pub fn init<R: Rng + ?Sized>(
        encoder_dim: Option<usize>,
        decoder_dim: Option<usize>,
        rng: &mut R,
    ) -> Self {
        let encoder = encoder_dim.map(|d| TaskEmbeddingTable::init(d, rng));
        let decoder = decoder_dim.map(|d| TaskEmbeddingTable::init(d, rng));
        Self { encoder, decoder }
    }

    pub fn encoder_table(&self) -> Option<&TaskEmbeddingTable> {
        self.encoder.as_ref()
    }

    pub fn decoder_table(&self) -> Option<&TaskEmbeddingTable> {
        self.decoder.as_ref()
    }

    /// Positions the encoder prefix occupies at the front of the sequence.
    pub fn encoder_prefix_len(&self) -> usize {
        usize::from(self.encoder.is_some())
    }

    /// Positions the decoder prefix occupies at the front of the queries.
    pub fn decoder_prefix_len(&self) -> usize {
        usize::from(self.decoder.is_some())
    }

    /// Fails early when an enabled side has nothing to look up.
    pub fn check_task_index(&self, task_idx: Option<usize>) -> Result<()> {
        for table in [&self.encoder, &self.decoder].into_iter().flatten() {
            let idx = task_idx.ok_or(TransformerError::MissingTaskIndex)?;
            table.lookup(idx)?;
        }
        Ok(())
    }

    pub fn num_parameters(&self) -> usize {
        self.encoder.as_ref().map_or(0, TaskEmbeddingTable::num_parameters)
            + self.decoder.as_ref().map_or(0, TaskEmbeddingTable::num_parameters)
    }

    /// Prepend the task vector to the encoder input, a non-padding mask entry,
    /// and a zero positional slot.
    pub fn prefix_encoder_inputs(&self, inputs: EncoderInputs, task_idx: Option<usize>) -> Result<EncoderInputs> {
        let Some(table) = &self.encoder else {
            return Ok(inputs);
        };
        let (_, batch, channels) = inputs.src.dim();
        let src = concat_sequences(&[table.slot(task_idx, batch)?, inputs.src])?;
        let mask = concat_masks(&[create_empty_padding_mask(batch, 1), inputs.mask])?;
        let pos = match inputs.pos {
            Some(pos) => Some(concat_sequences(&[Array3::zeros((1, batch, channels)), pos])?),
            None => None,
        };
        Ok(EncoderInputs { src, mask, pos })
    }

    /// Prepend the task vector to a `[queries, batch, d_model]` query sequence.
    pub fn prefix_queries(&self, queries: Array3<f32>, task_idx: Option<usize>) -> Result<Array3<f32>> {
        let Some(table) = &self.decoder else {
            return Ok(queries);
        };
        let batch = queries.dim().1;
        concat_sequences(&[table.slot(task_idx, batch)?, queries])
    }
}
