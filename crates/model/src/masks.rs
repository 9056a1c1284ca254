//! Builders for encoder and decoder attention masks.
//!
//! Masks use dtype [`MASK_DTYPE`] and hold `1` where attention is permitted
//! and `0` otherwise. Source masks are shaped `[batch, 1, src_len]` and target
//! masks `[batch, tgt_len, tgt_len]`, so both broadcast against per-query
//! score matrices.

use candle_core::{DType, Device, Error, Result, Tensor};

pub const MASK_DTYPE: DType = DType::U8;

/// Marks every non-padding source position as visible.
pub fn build_source_mask(src: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch, src_len) = src.dims2()?;
    let rows = token_rows(src)?;

    let mut data = vec![0u8; batch * src_len];
    for (b, row) in rows.iter().enumerate() {
        for (s, &token) in row.iter().enumerate() {
            if token != pad_id {
                data[b * src_len + s] = 1;
            }
        }
    }

    Tensor::from_vec(data, (batch, 1, src_len), src.device())
}

/// Lower-triangular mask shaped `[1, len, len]`: query `q` sees keys `0..=q`.
pub fn build_causal_mask(device: &Device, len: usize) -> Result<Tensor> {
    let mut data = vec![0u8; len * len];
    for q in 0..len {
        for k in 0..=q {
            data[q * len + k] = 1;
        }
    }
    Tensor::from_vec(data, (1, len, len), device)
}

/// Padding mask over key positions combined with the causal mask.
pub fn build_target_mask(tgt: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch, tgt_len) = tgt.dims2()?;
    let rows = token_rows(tgt)?;

    let mut data = vec![0u8; batch * tgt_len * tgt_len];
    for (b, row) in rows.iter().enumerate() {
        for q in 0..tgt_len {
            let row_start = (b * tgt_len + q) * tgt_len;
            for k in 0..=q {
                if row[k] != pad_id {
                    data[row_start + k] = 1;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, tgt_len, tgt_len), tgt.device())
}

fn token_rows(ids: &Tensor) -> Result<Vec<Vec<u32>>> {
    match ids.dtype() {
        DType::U32 => ids.to_vec2::<u32>(),
        DType::I64 | DType::U8 => ids.to_dtype(DType::U32)?.to_vec2::<u32>(),
        other => Err(Error::Msg(format!(
            "token ids must be an integer tensor (got {:?})",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_mask_hides_padding() -> Result<()> {
        let src = Tensor::from_vec(vec![2u32, 7, 3, 1, 2, 3, 1, 1], (2, 4), &Device::Cpu)?;
        let mask = build_source_mask(&src, 1)?;

        assert_eq!(mask.dims(), &[2, 1, 4]);
        assert_eq!(mask.dtype(), MASK_DTYPE);
        assert_eq!(
            mask.flatten_all()?.to_vec1::<u8>()?,
            vec![1, 1, 1, 0, 1, 1, 0, 0]
        );
        Ok(())
    }

    #[test]
    fn causal_mask_is_lower_triangular() -> Result<()> {
        let mask = build_causal_mask(&Device::Cpu, 3)?;
        assert_eq!(mask.dims(), &[1, 3, 3]);
        assert_eq!(
            mask.flatten_all()?.to_vec1::<u8>()?,
            vec![1, 0, 0, 1, 1, 0, 1, 1, 1]
        );
        Ok(())
    }

    #[test]
    fn target_mask_combines_padding_and_causality() -> Result<()> {
        // Second row is padded after two tokens.
        let tgt = Tensor::from_vec(vec![2u32, 5, 3, 2, 3, 1], (2, 3), &Device::Cpu)?;
        let mask = build_target_mask(&tgt, 1)?;
        assert_eq!(mask.dims(), &[2, 3, 3]);

        let values = mask.to_vec3::<u8>()?;
        assert_eq!(values[0], vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
        assert_eq!(values[1], vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 0]]);
        Ok(())
    }

    #[test]
    fn target_mask_matches_causal_mask_without_padding() -> Result<()> {
        let tgt = Tensor::from_vec(vec![2u32, 4, 5, 3], (1, 4), &Device::Cpu)?;
        let combined = build_target_mask(&tgt, 1)?.flatten_all()?.to_vec1::<u8>()?;
        let causal = build_causal_mask(&Device::Cpu, 4)?.flatten_all()?.to_vec1::<u8>()?;
        assert_eq!(combined, causal);
        Ok(())
    }

    #[test]
    fn rejects_float_ids() {
        let ids = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(build_source_mask(&ids, 1).is_err());
    }
}
