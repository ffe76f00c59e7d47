//! Builders for padding masks used to drop padded keys.
//!
//! All padding masks share the dtype described in
//! [`super::MASK_DTYPE`](super::MASK_DTYPE).

use candle_core::{Device, Error, Result, Tensor};

use super::{MASK_DTYPE, MASK_VALUE};

/// Construct a `[batch, 1, 1, k_len]` padding mask from per-batch valid key
/// lengths. Lengths beyond `k_len` are clamped.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0f32; batch * k_len];

    for (b, &valid) in key_lengths.iter().enumerate() {
        let row = &mut data[b * k_len..(b + 1) * k_len];
        for slot in row.iter_mut().skip(valid.min(k_len)) {
            *slot = MASK_VALUE;
        }
    }

    Tensor::from_vec(data, (batch, 1, 1, k_len), device)
}

/// Extend a keep/discard mask into the additive form consumed by attention.
///
/// * rank 2 `[batch, k_len]` becomes `[batch, 1, 1, k_len]`
/// * rank 3 `[batch, q_len, k_len]` becomes `[batch, 1, q_len, k_len]`
/// * rank 4 is treated as already additive and returned unchanged
///
/// Ranks 2 and 3 hold `1` for positions to keep and `0` for positions to
/// drop, in any numeric dtype.
pub fn extended_attention_mask(mask: &Tensor) -> Result<Tensor> {
    let extended = match mask.dims() {
        &[batch, k_len] => mask.reshape((batch, 1, 1, k_len))?,
        &[batch, q_len, k_len] => mask.reshape((batch, 1, q_len, k_len))?,
        &[_, _, _, _] => return mask.to_dtype(MASK_DTYPE),
        dims => {
            return Err(Error::Msg(format!(
                "attention mask must be rank 2, 3 or 4, got shape {dims:?}"
            )))
        }
    };

    // (1 - keep) * MASK_VALUE
    extended
        .to_dtype(MASK_DTYPE)?
        .affine(-1.0, 1.0)?
        .affine(MASK_VALUE as f64, 0.0)
}
