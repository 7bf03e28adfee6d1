use anyhow::Result;
use approx::assert_relative_eq;
use ndarray::{s, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::common::*;
use crate::config::{NormPlacement, TransformerConfig, MAX_TASK_NUM};
use crate::dropout::RunMode;
use crate::error::TransformerError;
use crate::transformer::{Transformer, TransformerInput, TransformerOutput};

fn run_image(model: &Transformer, batch: usize, h: usize, w: usize, task_idx: Option<usize>) -> Result<TransformerOutput> {
    let img = image_input(batch, model.config().encoder_hidden_dim, h, w, 1);
    let q = queries(5, model.config().decoder_hidden_dim, 2);
    let mut input = TransformerInput::new(&q, "detection", "coco").with_image(&img);
    input.task_idx = task_idx;
    Ok(model.forward(input, &mut RunMode::Inference)?)
}

#[test]
fn test_image_only_shared_decoder_shapes() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_shared_decoders(true), 0)?;
    let out = run_image(&model, 2, 3, 4, None)?;

    assert_eq!(out.hidden_states.shape(), &[2, 2, 5, DIM]);
    assert_eq!(out.memory.shape(), &[2, DIM, 12]);
    let map = out.image_memory()?.expect("image was given");
    assert_eq!(map.shape(), &[2, DIM, 3, 4]);
    Ok(())
}

#[test]
fn test_without_intermediate_returns_single_layer() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_return_intermediate(false), 0)?;
    let out = run_image(&model, 2, 2, 2, None)?;
    assert_eq!(out.hidden_states.shape(), &[1, 2, 5, DIM]);

    let stacked = Transformer::from_seed(small_config(), 0)?;
    let all = run_image(&stacked, 2, 2, 2, None)?;
    assert_eq!(all.last_hidden_state(), out.last_hidden_state());
    Ok(())
}

#[test]
fn test_encoder_task_embedding_is_stripped_from_memory() -> Result<()> {
    let plain = Transformer::from_seed(small_config(), 3)?;
    let with_task = Transformer::from_seed(small_config().with_task_embedding(true, false), 3)?;
    assert_eq!(with_task.task_embeddings().encoder_prefix_len(), 1);

    let a = run_image(&plain, 2, 2, 3, None)?;
    let b = run_image(&with_task, 2, 2, 3, Some(4))?;
    assert_eq!(a.memory.shape(), b.memory.shape());
    assert_eq!(b.memory.shape(), &[2, DIM, 6]);
    assert!(max_abs_diff(&a.memory, &b.memory) > 1e-4);
    Ok(())
}

#[test]
fn test_decoder_task_embedding_is_stripped_from_hidden_states() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_task_embedding(false, true), 3)?;
    let out = run_image(&model, 1, 2, 2, Some(MAX_TASK_NUM - 1))?;
    assert_eq!(out.hidden_states.shape(), &[2, 1, 5, DIM]);
    Ok(())
}

#[test]
fn test_task_index_is_validated() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_task_embedding(true, true), 3)?;
    assert!(matches!(
        run_image(&model, 1, 2, 2, None).unwrap_err().downcast_ref::<TransformerError>(),
        Some(TransformerError::MissingTaskIndex)
    ));
    assert!(matches!(
        run_image(&model, 1, 2, 2, Some(MAX_TASK_NUM)).unwrap_err().downcast_ref::<TransformerError>(),
        Some(TransformerError::TaskIndexOutOfRange { .. })
    ));
    Ok(())
}

#[test]
fn test_image_and_text_fuse_in_order() -> Result<()> {
    let model = Transformer::from_seed(small_config(), 5)?;
    let img = image_input(2, DIM, 2, 3, 1);
    let txt = text_input(2, 4, DIM, 3, 7);
    let q = queries(5, DIM, 2);

    let out = model.forward(
        TransformerInput::new(&q, "detection", "coco")
            .with_image(&img)
            .with_text(&txt),
        &mut RunMode::Inference,
    )?;

    assert_eq!(out.memory.shape(), &[2, DIM, 6 + 4]);
    // text bypasses the encoder and lands after the image positions
    for b in 0..2 {
        for l in 0..4 {
            for c in 0..DIM {
                assert_eq!(out.memory[[b, c, 6 + l]], txt.src[[b, l, c]]);
            }
        }
    }
    assert_eq!(out.image_memory()?.map(|m| m.dim()), Some((2, DIM, 2, 3)));
    Ok(())
}

#[test]
fn test_padding_in_either_stream_is_ignored() -> Result<()> {
    let model = Transformer::from_seed(small_config(), 5)?;
    let q = queries(5, DIM, 2);
    let img = image_input(1, DIM, 2, 2, 1);
    let txt = text_input(1, 3, DIM, 2, 7);
    let base = model.forward(
        TransformerInput::new(&q, "detection", "coco")
            .with_image(&img)
            .with_text(&txt),
        &mut RunMode::Inference,
    )?;

    // perturb the padded pixel and the padded token
    let mut img2 = img.clone();
    img2.src.slice_mut(s![.., .., 1, 1]).fill(25.0);
    let mut txt2 = txt.clone();
    txt2.src.slice_mut(s![.., 2, ..]).fill(-25.0);
    let perturbed = model.forward(
        TransformerInput::new(&q, "detection", "coco")
            .with_image(&img2)
            .with_text(&txt2),
        &mut RunMode::Inference,
    )?;

    assert!(max_abs_diff(&base.hidden_states, &perturbed.hidden_states) < 1e-4);

    // a real token does matter
    let mut txt3 = txt.clone();
    txt3.src.slice_mut(s![.., 0, ..]).fill(3.0);
    let changed = model.forward(
        TransformerInput::new(&q, "detection", "coco")
            .with_image(&img)
            .with_text(&txt3),
        &mut RunMode::Inference,
    )?;
    assert!(max_abs_diff(&base.hidden_states, &changed.hidden_states) > 1e-4);
    Ok(())
}

#[test]
fn test_text_only_skips_encoder() -> Result<()> {
    let model = Transformer::from_seed(small_config(), 5)?;
    let txt = text_input(3, 4, DIM, 4, 7);
    let q = queries(5, DIM, 2);
    let out = model.forward(
        TransformerInput::new(&q, "detection", "coco").with_text(&txt),
        &mut RunMode::Inference,
    )?;
    assert_eq!(out.hidden_states.shape(), &[2, 3, 5, DIM]);
    assert_eq!(out.memory.shape(), &[3, DIM, 4]);
    assert!(out.image_memory()?.is_none());
    Ok(())
}

#[test]
fn test_unknown_pair_fails() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_shared_decoders(true), 0)?;
    let img = image_input(1, DIM, 2, 2, 1);
    let q = queries(5, DIM, 2);
    let err = model
        .forward(
            TransformerInput::new(&q, "detection", "vg").with_image(&img),
            &mut RunMode::Inference,
        )
        .unwrap_err();
    assert!(matches!(err, TransformerError::UnknownDecoder { .. }));
    Ok(())
}

#[test]
fn test_shared_decoders_are_bit_identical() -> Result<()> {
    let config = small_config()
        .with_task("vl", "vqa2", 5)
        .with_task("detection", "vg", 5);
    let img = image_input(2, DIM, 2, 2, 1);
    let q = queries(5, DIM, 2);
    let forward = |model: &Transformer, task: &str, dataset: &str| {
        model.forward(
            TransformerInput::new(&q, task, dataset).with_image(&img),
            &mut RunMode::Inference,
        )
    };

    let shared = Transformer::from_seed(config.clone().with_shared_decoders(true), 9)?;
    let a = forward(&shared, "detection", "coco")?;
    let b = forward(&shared, "detection", "vg")?;
    let c = forward(&shared, "vl", "vqa2")?;
    assert_eq!(a.hidden_states, b.hidden_states);
    assert_eq!(a.hidden_states, c.hidden_states);

    let independent = Transformer::from_seed(config.with_shared_decoders(false), 9)?;
    let a = forward(&independent, "detection", "coco")?;
    let b = forward(&independent, "vl", "vqa2")?;
    assert!(max_abs_diff(&a.hidden_states, &b.hidden_states) > 1e-4);
    assert!(independent.num_parameters() > shared.num_parameters());
    Ok(())
}

#[test]
fn test_text_without_pass_pos_and_query_is_not_implemented() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_pass_pos_and_query(false), 0)?;
    let txt = text_input(1, 3, DIM, 3, 7);
    let q = queries(5, DIM, 2);
    let err = model
        .forward(
            TransformerInput::new(&q, "detection", "coco").with_text(&txt),
            &mut RunMode::Inference,
        )
        .unwrap_err();
    assert!(matches!(err, TransformerError::NotImplemented(_)));
    Ok(())
}

#[test]
fn test_image_without_pass_pos_and_query() -> Result<()> {
    let passing = Transformer::from_seed(small_config(), 2)?;
    let folded = Transformer::from_seed(small_config().with_pass_pos_and_query(false), 2)?;
    let a = run_image(&passing, 2, 2, 3, None)?;
    let b = run_image(&folded, 2, 2, 3, None)?;
    assert_eq!(a.hidden_states.shape(), b.hidden_states.shape());
    assert!(max_abs_diff(&a.hidden_states, &b.hidden_states) > 1e-4);
    Ok(())
}

#[test]
fn test_missing_modality() -> Result<()> {
    let model = Transformer::from_seed(small_config(), 0)?;
    let q = queries(5, DIM, 2);
    let err = model
        .forward(TransformerInput::new(&q, "detection", "coco"), &mut RunMode::Inference)
        .unwrap_err();
    assert!(matches!(err, TransformerError::MissingModality));
    Ok(())
}

#[test]
fn test_residual_in_encoder_changes_memory() -> Result<()> {
    let plain = Transformer::from_seed(small_config(), 4)?;
    let residual = Transformer::from_seed(small_config().with_residual_in_encoder(true), 4)?;
    let a = run_image(&plain, 1, 2, 2, None)?;
    let b = run_image(&residual, 1, 2, 2, None)?;

    // identical weights, so the difference is exactly the flattened image input
    let img = image_input(1, DIM, 2, 2, 1);
    let src = img.src.into_shape_with_order((1, DIM, 4))?;
    let diff = &b.memory - &a.memory;
    for (d, x) in diff.iter().zip(src.iter()) {
        assert_relative_eq!(*d, *x, epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn test_projection_between_widths() -> Result<()> {
    let config = TransformerConfig::default()
        .with_hidden_dims(8, 4)
        .with_heads(2)
        .with_layers(1, 1)
        .with_dim_feedforward(16)
        .with_task("detection", "coco", 5);
    let model = Transformer::from_seed(config, 0)?;
    let img = image_input(2, 8, 2, 2, 1);
    let txt = text_input(2, 3, 4, 3, 2);
    let q = queries(5, 4, 3);
    let out = model.forward(
        TransformerInput::new(&q, "detection", "coco")
            .with_image(&img)
            .with_text(&txt),
        &mut RunMode::Inference,
    )?;
    assert_eq!(out.hidden_states.shape(), &[1, 2, 5, 4]);
    assert_eq!(out.memory.shape(), &[2, 4, 7]);
    Ok(())
}

#[test]
fn test_prenorm_model_differs_from_postnorm() -> Result<()> {
    let post = Transformer::from_seed(small_config(), 6)?;
    let pre = Transformer::from_seed(small_config().with_norm_placement(NormPlacement::Pre), 6)?;
    assert!(pre.encoder().has_final_norm());
    let a = run_image(&post, 2, 2, 2, None)?;
    let b = run_image(&pre, 2, 2, 2, None)?;
    assert_eq!(a.hidden_states.shape(), b.hidden_states.shape());
    assert!(max_abs_diff(&a.hidden_states, &b.hidden_states) > 1e-4);
    Ok(())
}

#[test]
fn test_training_dropout_is_reproducible_with_a_seeded_rng() -> Result<()> {
    let model = Transformer::from_seed(small_config().with_dropout(0.2), 8)?;
    let img = image_input(2, DIM, 2, 2, 1);
    let q = queries(5, DIM, 2);
    let run = |seed: u64| {
        let mut rng = StdRng::seed_from_u64(seed);
        model.forward(
            TransformerInput::new(&q, "detection", "coco").with_image(&img),
            &mut RunMode::training(&mut rng),
        )
    };
    let a = run(1)?;
    let b = run(1)?;
    let c = run(2)?;
    assert_eq!(a.hidden_states, b.hidden_states);
    assert!(max_abs_diff(&a.hidden_states, &c.hidden_states) > 1e-5);

    let eval = run_image(&model, 2, 2, 2, None)?;
    assert!(max_abs_diff(&eval.hidden_states, &a.hidden_states) > 1e-5);
    Ok(())
}

#[test]
fn test_batch_entries_are_independent() -> Result<()> {
    let model = Transformer::from_seed(small_config(), 1)?;
    let img = image_input(2, DIM, 2, 2, 1);
    let q = queries(5, DIM, 2);
    let both = model.forward(
        TransformerInput::new(&q, "detection", "coco").with_image(&img),
        &mut RunMode::Inference,
    )?;

    let mut single = img.clone();
    single.src = img.src.slice(s![1..2, .., .., ..]).to_owned();
    single.pos = img.pos.slice(s![1..2, .., .., ..]).to_owned();
    single.mask = img.mask.slice(s![1..2, .., ..]).to_owned();
    let one = model.forward(
        TransformerInput::new(&q, "detection", "coco").with_image(&single),
        &mut RunMode::Inference,
    )?;

    let expected: Array3<f32> = both.hidden_states.index_axis(Axis(1), 1).to_owned();
    let got: Array3<f32> = one.hidden_states.index_axis(Axis(1), 0).to_owned();
    assert!(max_abs_diff(&expected, &got) < 1e-4);
    Ok(())
}

#[test]
fn test_config_from_json_builds_model() -> Result<()> {
    let config = TransformerConfig::from_json_str(
        r#"{
            "encoder_hidden_dim": 8,
            "decoder_hidden_dim": 8,
            "nheads": 2,
            "enc_layers": 1,
            "dec_layers": 1,
            "dim_feedforward": 8,
            "activation": "glu",
            "num_queries": { "detection": { "coco": 5 } }
        }"#,
    )?;
    let model = Transformer::new(config, &mut StdRng::seed_from_u64(0))?;
    let out = run_image(&model, 1, 2, 2, None)?;
    assert_eq!(out.hidden_states.shape(), &[1, 1, 5, DIM]);
    Ok(())
}
