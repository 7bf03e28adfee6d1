//! Multi-task encoder/decoder orchestration.

use ndarray::{s, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TransformerConfig;
use crate::decoder::{DecoderContext, TransformerDecoder};
use crate::dropout::RunMode;
use crate::encoder::TransformerEncoder;
use crate::error::{Result, TransformerError};
use crate::fusion::{fuse_streams, ImageInput, SequenceStream, TextInput};
use crate::linear_layer::Projection;
use crate::registry::DecoderRegistry;
use crate::task_embedding::{EncoderInputs, TaskEmbeddingInjector};
use crate::utils::shape::ensure_channels;
use crate::utils::tensor_ops::{add_inplace, repeat_over_batch, strip_mask_prefix, strip_sequence_prefix};

/// Scale applied to image positions when they are folded into the content.
const POS_IN_SOURCE_SCALE: f32 = 0.1;

/// Everything one forward call needs.
#[derive(Debug, Clone, Copy)]
pub struct TransformerInput<'a> {
    pub image: Option<&'a ImageInput>,
    pub text: Option<&'a TextInput>,
    /// `[num_queries, decoder_hidden_dim]`
    pub query_embed: &'a Array2<f32>,
    pub task: &'a str,
    pub dataset: &'a str,
    pub task_idx: Option<usize>,
}

impl<'a> TransformerInput<'a> {
    pub fn new(query_embed: &'a Array2<f32>, task: &'a str, dataset: &'a str) -> Self {
        Self {
            image: None,
            text: None,
            query_embed,
            task,
            dataset,
            task_idx: None,
        }
    }

    pub fn with_image(mut self, image: &'a ImageInput) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_text(mut self, text: &'a TextInput) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_task_idx(mut self, task_idx: usize) -> Self {
        self.task_idx = Some(task_idx);
        self
    }

    fn batch_size(&self) -> Result<usize> {
        match (self.image, self.text) {
            (Some(img), Some(txt)) if img.batch_size() != txt.batch_size() => {
                Err(TransformerError::shape(format!(
                    "image batch {} != text batch {}",
                    img.batch_size(),
                    txt.batch_size()
                )))
            }
            (Some(img), _) => Ok(img.batch_size()),
            (None, Some(txt)) => Ok(txt.batch_size()),
            (None, None) => Err(TransformerError::MissingModality),
        }
    }
}

/// Result of a forward call.
#[derive(Debug, Clone)]
pub struct TransformerOutput {
    /// `[layers_or_1, batch, num_queries, decoder_hidden_dim]`
    pub hidden_states: Array4<f32>,
    /// `[batch, decoder_hidden_dim, seq]`, image positions first
    pub memory: Array3<f32>,
    /// Spatial size of the image part of `memory`, if an image was given.
    pub image_hw: Option<(usize, usize)>,
}

impl TransformerOutput {
    /// Image part of the memory as `[batch, decoder_hidden_dim, h, w]`.
    pub fn image_memory(&self) -> Result<Option<Array4<f32>>> {
        let Some((h, w)) = self.image_hw else {
            return Ok(None);
        };
        let (batch, channels, _) = self.memory.dim();
        let image = self.memory.slice(s![.., .., ..h * w]).to_owned();
        Ok(Some(image.into_shape_with_order((batch, channels, h, w))?))
    }

    /// Output of the last decoder layer, `[batch, num_queries, decoder_hidden_dim]`.
    pub fn last_hidden_state(&self) -> Array3<f32> {
        let last = self.hidden_states.dim().0 - 1;
        self.hidden_states.slice(s![last, .., .., ..]).to_owned()
    }
}

/// Shared encoder with per-`(task, dataset)` decoders.
///
/// Only the image stream runs through the encoder. Text arrives already at the
/// decoder width and joins the memory after the image positions.
#[derive(Debug, Clone)]
pub struct Transformer {
    config: TransformerConfig,
    encoder: TransformerEncoder,
    enc2dec_proj: Projection,
    pos_embed_proj: Projection,
    task_embeddings: TaskEmbeddingInjector,
    decoders: DecoderRegistry,
}

impl Transformer {
    pub fn new<R: Rng + ?Sized>(config: TransformerConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let activation = config.activation()?;

        let encoder = TransformerEncoder::init(
            config.enc_layers,
            config.encoder_hidden_dim,
            config.nheads,
            config.dim_feedforward,
            config.dropout,
            activation,
            config.norm_placement,
            rng,
        )?;
        let enc2dec_proj = Projection::new(config.encoder_hidden_dim, config.decoder_hidden_dim, rng);
        let pos_embed_proj = Projection::new(config.encoder_hidden_dim, config.decoder_hidden_dim, rng);

        let decoders = DecoderRegistry::build(&config.num_queries, config.share_decoders, || {
            TransformerDecoder::init(
                config.dec_layers,
                config.decoder_hidden_dim,
                config.nheads,
                config.dim_feedforward,
                config.dropout,
                activation,
                config.norm_placement,
                config.return_intermediate_dec,
                &mut *rng,
            )
        })?;

        let task_embeddings = TaskEmbeddingInjector::init(
            config
                .use_task_embedding_in_encoder
                .then_some(config.encoder_hidden_dim),
            config
                .use_task_embedding_in_decoder
                .then_some(config.decoder_hidden_dim),
            rng,
        );

        let model = Self {
            config,
            encoder,
            enc2dec_proj,
            pos_embed_proj,
            task_embeddings,
            decoders,
        };
        log::info!(
            "Built transformer: {} ({} parameters)",
            model.config,
            model.num_parameters()
        );
        Ok(model)
    }

    /// Deterministic construction from a seed.
    pub fn from_seed(config: TransformerConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(config, &mut rng)
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn encoder(&self) -> &TransformerEncoder {
        &self.encoder
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    pub fn task_embeddings(&self) -> &TaskEmbeddingInjector {
        &self.task_embeddings
    }

    pub fn num_parameters(&self) -> usize {
        self.encoder.num_parameters()
            + self.enc2dec_proj.num_parameters()
            + self.pos_embed_proj.num_parameters()
            + self.task_embeddings.num_parameters()
            + self.decoders.num_parameters()
    }

    pub fn forward(&self, input: TransformerInput<'_>, mode: &mut RunMode<'_>) -> Result<TransformerOutput> {
        let batch = input.batch_size()?;
        if input.text.is_some() && !self.config.pass_pos_and_query {
            return Err(TransformerError::NotImplemented(
                "text input requires pass_pos_and_query".to_string(),
            ));
        }
        self.task_embeddings.check_task_index(input.task_idx)?;

        let decoder = self.decoders.get(input.task, input.dataset)?;
        let expected_queries = self.decoders.num_queries(input.task, input.dataset)?;
        let (num_queries, query_dim) = input.query_embed.dim();
        if num_queries != expected_queries || query_dim != self.config.decoder_hidden_dim {
            return Err(TransformerError::shape(format!(
                "query set for {}/{} is [{}, {}], expected [{}, {}]",
                input.task,
                input.dataset,
                num_queries,
                query_dim,
                expected_queries,
                self.config.decoder_hidden_dim
            )));
        }

        // [Q, B, D], with the decoder task slot in front
        let queries = self
            .task_embeddings
            .prefix_queries(repeat_over_batch(input.query_embed, batch), input.task_idx)?;
        let (tgt, query_pos) = if self.config.pass_pos_and_query {
            (Array3::zeros(queries.raw_dim()), Some(queries))
        } else {
            (queries, None)
        };

        let mut streams = Vec::with_capacity(2);
        let mut image_hw = None;
        if let Some(image) = input.image {
            streams.push(self.encode_image(image, input.task_idx, mode)?);
            image_hw = Some(image.spatial_dims());
        }
        if let Some(text) = input.text {
            let stream = text.to_stream()?;
            ensure_channels("text input", &stream.memory, self.config.decoder_hidden_dim)?;
            streams.push(stream);
        }
        let fused = fuse_streams(streams)?;
        log::debug!(
            "Fused memory {:?} for {}/{}",
            fused.memory.shape(),
            input.task,
            input.dataset
        );

        let mask_view = fused.mask.view();
        let ctx = DecoderContext {
            memory: &fused.memory,
            memory_key_padding_mask: Some(&mask_view),
            pos: fused.pos.as_ref(),
            query_pos: query_pos.as_ref(),
        };
        let hs = decoder.forward(tgt, &ctx, mode)?;

        // [L, Q, B, D] -> [L, B, Q, D], task slot dropped
        let prefix = self.task_embeddings.decoder_prefix_len();
        let hidden_states = hs
            .permuted_axes([0, 2, 1, 3])
            .slice(s![.., .., prefix.., ..])
            .as_standard_layout()
            .into_owned();
        let memory = fused
            .memory
            .permuted_axes([1, 2, 0])
            .as_standard_layout()
            .into_owned();
        log::debug!(
            "Decoder output {:?}, memory {:?}",
            hidden_states.shape(),
            memory.shape()
        );

        Ok(TransformerOutput {
            hidden_states,
            memory,
            image_hw,
        })
    }

    /// Flatten, encode and project the image stream to the decoder width.
    fn encode_image(
        &self,
        image: &ImageInput,
        task_idx: Option<usize>,
        mode: &mut RunMode<'_>,
    ) -> Result<SequenceStream> {
        let stream = image.flatten()?;
        ensure_channels("image input", &stream.memory, self.config.encoder_hidden_dim)?;

        let mut inputs = EncoderInputs {
            src: stream.memory,
            mask: stream.mask,
            pos: stream.pos,
        };
        if !self.config.pass_pos_and_query {
            if let Some(pos) = inputs.pos.take() {
                inputs.src.scaled_add(POS_IN_SOURCE_SCALE, &pos);
            }
        }

        let inputs = self.task_embeddings.prefix_encoder_inputs(inputs, task_idx)?;
        let residual = self.config.residual_in_encoder.then(|| inputs.src.clone());
        let memory = self.encoder.forward(
            inputs.src,
            Some(&inputs.mask.view()),
            inputs.pos.as_ref(),
            mode,
        )?;

        let prefix = self.task_embeddings.encoder_prefix_len();
        let mut memory = strip_sequence_prefix(memory, prefix);
        let mask = strip_mask_prefix(inputs.mask, prefix);
        let pos = inputs.pos.map(|p| strip_sequence_prefix(p, prefix));
        if let Some(src) = residual {
            add_inplace(&mut memory, &strip_sequence_prefix(src, prefix));
        }
        log::debug!("Encoded image stream {:?}", memory.shape());

        Ok(SequenceStream {
            memory: self.enc2dec_proj.forward(memory)?,
            pos: pos.map(|p| self.pos_embed_proj.forward(p)).transpose()?,
            mask,
        })
    }
}
