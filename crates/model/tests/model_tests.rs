use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use nmt_model::{
    build_source_mask, build_target_mask, ModelConfig, PooledContextModel, Seq2SeqInputs,
    Seq2SeqModel,
};

const PAD: u32 = 1;

fn build_config(dropout_p: Option<f32>) -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        hidden_dim: 8,
        dtype: DType::F32,
        device: Device::Cpu,
        dropout_p,
    }
}

fn run(model: &PooledContextModel, src: &Tensor, tgt: &Tensor) -> Result<Tensor> {
    let src_mask = build_source_mask(src, PAD)?;
    let tgt_mask = build_target_mask(tgt, PAD)?;
    let (batch, src_len) = src.dims2()?;
    let tgt_len = tgt.dim(1)?;
    let src_lengths = vec![src_len; batch];
    let tgt_lengths = vec![tgt_len; batch];
    let out = model.forward(&Seq2SeqInputs {
        src,
        tgt,
        src_mask: &src_mask,
        tgt_mask: &tgt_mask,
        src_lengths: &src_lengths,
        tgt_lengths: &tgt_lengths,
    })?;
    Ok(out)
}

#[test]
fn forward_produces_log_probabilities() -> Result<()> {
    let model = PooledContextModel::new(build_config(None))?;
    let src = Tensor::from_slice(&[2u32, 5, 6, 3, 2, 7, 3, 1], (2, 4), &Device::Cpu)?;
    let tgt = Tensor::from_slice(&[2u32, 8, 3, 2, 9, 3], (2, 3), &Device::Cpu)?;

    let out = run(&model, &src, &tgt)?;
    assert_eq!(out.dims(), &[2, 3, 16]);

    // Each row is a normalised distribution in log space.
    let sums = out.exp()?.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
    for total in sums {
        assert!((total - 1.0).abs() < 1e-4, "row sums to {total}");
    }
    Ok(())
}

#[test]
fn output_position_ignores_future_targets() -> Result<()> {
    let model = PooledContextModel::new(build_config(None))?;
    model.set_training(false);
    let src = Tensor::from_slice(&[2u32, 5, 6, 3], (1, 4), &Device::Cpu)?;
    let first = Tensor::from_slice(&[2u32, 8, 9, 3], (1, 4), &Device::Cpu)?;
    let second = Tensor::from_slice(&[2u32, 8, 12, 13], (1, 4), &Device::Cpu)?;

    let a = run(&model, &src, &first)?.narrow(1, 0, 2)?;
    let b = run(&model, &src, &second)?.narrow(1, 0, 2)?;

    let diff = (a - b)?.abs()?.max_keepdim(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(diff.iter().all(|d| *d < 1e-6));
    Ok(())
}

#[test]
fn source_padding_does_not_change_output() -> Result<()> {
    let model = PooledContextModel::new(build_config(None))?;
    model.set_training(false);
    let tgt = Tensor::from_slice(&[2u32, 8, 3], (1, 3), &Device::Cpu)?;
    let short = Tensor::from_slice(&[2u32, 5, 3], (1, 3), &Device::Cpu)?;
    let padded = Tensor::from_slice(&[2u32, 5, 3, 1, 1], (1, 5), &Device::Cpu)?;

    let a = run(&model, &short, &tgt)?;
    let b = run(&model, &padded, &tgt)?;
    let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn training_flag_round_trips() -> Result<()> {
    let model = PooledContextModel::new(build_config(Some(0.5)))?;
    assert!(model.is_training());
    model.set_training(false);
    assert!(!model.is_training());

    // Inference mode is deterministic even with dropout configured.
    let src = Tensor::from_slice(&[2u32, 5, 3], (1, 3), &Device::Cpu)?;
    let tgt = Tensor::from_slice(&[2u32, 6, 3], (1, 3), &Device::Cpu)?;
    let a = run(&model, &src, &tgt)?.flatten_all()?.to_vec1::<f32>()?;
    let b = run(&model, &src, &tgt)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn parameters_are_named_and_sorted() -> Result<()> {
    let model = PooledContextModel::new(build_config(None))?;
    let names: Vec<String> = model.parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        names,
        vec![
            "context_proj.bias",
            "context_proj.weight",
            "embedding.weight",
            "generator.bias",
            "generator.weight",
        ]
    );
    Ok(())
}

#[test]
fn mismatched_masks_are_rejected() -> Result<()> {
    let model = PooledContextModel::new(build_config(None))?;
    let src = Tensor::from_slice(&[2u32, 5, 3], (1, 3), &Device::Cpu)?;
    let tgt = Tensor::from_slice(&[2u32, 6, 3], (1, 3), &Device::Cpu)?;
    let src_mask = build_source_mask(&src, PAD)?;
    let wrong = build_source_mask(&tgt, PAD)?;
    let result = model.forward(&Seq2SeqInputs {
        src: &src,
        tgt: &tgt,
        src_mask: &src_mask,
        tgt_mask: &wrong,
        src_lengths: &[3],
        tgt_lengths: &[3],
    });
    assert!(result.is_err());
    Ok(())
}

#[test]
fn config_rejects_invalid_hyperparameters() {
    let mut config = build_config(Some(1.0));
    assert!(PooledContextModel::new(config.clone()).is_err());
    config.dropout_p = None;
    config.hidden_dim = 0;
    assert!(PooledContextModel::new(config.clone()).is_err());
    config.hidden_dim = 8;
    config.dtype = DType::U32;
    assert!(PooledContextModel::new(config).is_err());
}
