//! Padding-aware position ids.
//!
//! Non-padding tokens are numbered from `padding_idx + 1` in order of
//! appearance; padding tokens keep `padding_idx`:
//!
//! `position[b, i] = padding_idx + (nonpad_count(ids[b, ..=i]) + past_len) * is_nonpad(ids[b, i])`
//!
//! Row `padding_idx` of the position table therefore only ever serves padding.

use candle_core::{DType, Tensor};

use crate::errors::EmbeddingError;

/// Position ids for `input_ids` shaped `(batch, seq)`. The result is `I64`
/// with the same shape and device.
pub fn position_ids_from_input_ids(
    input_ids: &Tensor,
    padding_idx: usize,
    past_len: usize,
) -> Result<Tensor, EmbeddingError> {
    let (batch, seq) = input_ids.dims2().map_err(|_| {
        EmbeddingError::shape(format!(
            "input_ids must be shaped (batch, seq), got {:?}",
            input_ids.dims()
        ))
    })?;
    if !input_ids.dtype().is_int() {
        return Err(EmbeddingError::shape(format!(
            "input_ids expected integer dtype but received {:?}",
            input_ids.dtype()
        )));
    }

    let device = input_ids.device();
    let ids = input_ids.to_dtype(DType::I64)?;
    let padding = Tensor::full(padding_idx as i64, (batch, seq), device)?;
    // f32 counts are exact up to 2^24 tokens.
    let real = ids.ne(&padding)?.to_dtype(DType::F32)?;
    let positions = real
        .cumsum(1)?
        .affine(1.0, past_len as f64)?
        .mul(&real)?
        .affine(1.0, padding_idx as f64)?;
    Ok(positions.to_dtype(DType::I64)?)
}

/// Static range `[padding_idx + 1, padding_idx + 1 + seq)` for every row of
/// `inputs_embeds` shaped `(batch, seq, hidden)`. Padding cannot be detected
/// from embedding vectors, so every position is treated as a real token.
pub fn position_ids_from_embeds(
    inputs_embeds: &Tensor,
    padding_idx: usize,
) -> Result<Tensor, EmbeddingError> {
    let (batch, seq, _) = inputs_embeds.dims3().map_err(|_| {
        EmbeddingError::shape(format!(
            "inputs_embeds must be shaped (batch, seq, hidden), got {:?}",
            inputs_embeds.dims()
        ))
    })?;

    let start = padding_idx as i64 + 1;
    let range = Tensor::arange(start, start + seq as i64, inputs_embeds.device())?;
    Ok(range.unsqueeze(0)?.broadcast_as((batch, seq))?.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn padding_tokens_keep_padding_idx() -> candle_core::Result<()> {
        let ids = Tensor::new(&[[1i64, 1, 5, 6, 1]], &Device::Cpu)?;
        let positions = position_ids_from_input_ids(&ids, 1, 0).unwrap();
        assert_eq!(positions.dtype(), DType::I64);
        assert_eq!(positions.to_vec2::<i64>()?, vec![vec![1, 1, 2, 3, 1]]);
        Ok(())
    }

    #[test]
    fn counts_restart_per_row() -> candle_core::Result<()> {
        let ids = Tensor::new(&[[0u32, 9, 8, 1, 1], [0, 1, 7, 7, 7]], &Device::Cpu)?;
        let positions = position_ids_from_input_ids(&ids, 1, 0).unwrap();
        assert_eq!(
            positions.to_vec2::<i64>()?,
            vec![vec![2, 3, 4, 1, 1], vec![2, 1, 3, 4, 5]]
        );
        Ok(())
    }

    #[test]
    fn past_length_offsets_real_tokens_only() -> candle_core::Result<()> {
        let ids = Tensor::new(&[[4i64, 1, 4]], &Device::Cpu)?;
        let positions = position_ids_from_input_ids(&ids, 1, 3).unwrap();
        assert_eq!(positions.to_vec2::<i64>()?, vec![vec![5, 1, 6]]);
        Ok(())
    }

    #[test]
    fn rank_mismatch_is_reported() {
        let ids = Tensor::new(&[1i64, 2, 3], &Device::Cpu).unwrap();
        assert!(matches!(
            position_ids_from_input_ids(&ids, 1, 0),
            Err(EmbeddingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn embeds_use_static_range() -> candle_core::Result<()> {
        let embeds = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        let positions = position_ids_from_embeds(&embeds, 1).unwrap();
        assert_eq!(positions.to_vec2::<i64>()?, vec![vec![2, 3, 4], vec![2, 3, 4]]);
        Ok(())
    }
}
