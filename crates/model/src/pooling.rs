//! Sentence-level pooling over encoder outputs.

use candle_core::{DType, Tensor};

use crate::error::ModelError;

/// Averages `sequence_output` `(batch, seq, hidden)` over the positions where
/// `keep_mask` `(batch, seq)` is non-zero. Rows with no kept position pool to
/// zeros. The result has the dtype of `sequence_output`.
pub fn mean_pool(sequence_output: &Tensor, keep_mask: &Tensor) -> Result<Tensor, ModelError> {
    let (batch, seq, _) = sequence_output.dims3().map_err(|_| {
        ModelError::ShapeMismatch(format!(
            "mean_pool: sequence_output must be (batch, seq, hidden), got {:?}",
            sequence_output.dims()
        ))
    })?;
    if keep_mask.dims() != [batch, seq].as_slice() {
        return Err(ModelError::ShapeMismatch(format!(
            "mean_pool: keep_mask must be ({batch}, {seq}), got {:?}",
            keep_mask.dims()
        )));
    }

    let mask = keep_mask
        .to_dtype(DType::F32)?
        .ne(0f32)?
        .to_dtype(DType::F32)?
        .unsqueeze(2)?;
    let summed = sequence_output
        .to_dtype(DType::F32)?
        .broadcast_mul(&mask)?
        .sum(1)?;
    let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?;
    Ok(summed.broadcast_div(&counts)?.to_dtype(sequence_output.dtype())?)
}
