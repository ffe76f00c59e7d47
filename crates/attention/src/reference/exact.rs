//! Reference attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait:
//! `softmax(Q·Kᵀ / sqrt(head_dim) + mask) * head_mask · V`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, AttentionMasks, AttentionResult, Config};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

fn invalid(context: String) -> AttentionError {
    AttentionError::InvalidShape { context }
}

/// Each mask dim must be 1 or match the score dim it broadcasts against.
fn broadcastable(dims: &[usize], target: &[usize]) -> bool {
    dims.len() == target.len()
        && dims
            .iter()
            .zip(target)
            .all(|(&dim, &want)| dim == 1 || dim == want)
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: AttentionMasks<'_>,
        config: &Config,
    ) -> Result<AttentionResult, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dtype={:?} device={:?} dropout={:?}",
                q.dtype(),
                q.device().location(),
                config.dropout_p
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(invalid("q, k, v must reside on the same device".to_string()));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(invalid("q, k, v must share the same dtype".to_string()));
        }
        let compute = match dtype {
            DType::F16 | DType::BF16 | DType::F32 => DType::F32,
            DType::F64 => DType::F64,
            other => {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("{other:?}"),
                })
            }
        };

        let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| {
            invalid(format!(
                "q must have shape [batch, heads, seq_len, head_dim], got {:?}",
                q.dims()
            ))
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| {
            invalid(format!(
                "k must have shape [batch, heads, seq_len, head_dim], got {:?}",
                k.dims()
            ))
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| {
            invalid(format!(
                "v must have shape [batch, heads, seq_len, head_dim], got {:?}",
                v.dims()
            ))
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(invalid(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(invalid(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }

        let score_dims = [batch, heads, q_len, k_len];
        let merged = batch * heads;

        let q_view = q.to_dtype(compute)?.reshape((merged, q_len, head_dim))?;
        let k_view = k.to_dtype(compute)?.reshape((merged, k_len, head_dim))?;
        let v_view = v.to_dtype(compute)?.reshape((merged, k_len, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let mut scores = q_view
            .matmul(&k_view.transpose(1, 2)?)?
            .affine(scale, 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        if let Some(mask) = masks.attention {
            if !device.same_device(mask.device()) {
                return Err(invalid("mask must reside on the same device as q".to_string()));
            }
            let mask_dims = mask.dims();
            let key_aligned = mask_dims.last() == Some(&k_len);
            if !key_aligned || !broadcastable(mask_dims, &score_dims) {
                return Err(invalid(format!(
                    "mask shape {mask_dims:?} is not broadcastable to [{batch}, 1|{heads}, 1|{q_len}, {k_len}]"
                )));
            }
            scores = scores.broadcast_add(&mask.to_dtype(compute)?)?;
        }

        let mut probs = softmax_last_dim(&scores.contiguous()?)?;

        if let Some(head_mask) = masks.head {
            let head_mask = if head_mask.rank() == 1 {
                head_mask.reshape((1, head_mask.elem_count(), 1, 1))?
            } else {
                head_mask.clone()
            };
            if !broadcastable(head_mask.dims(), &score_dims) {
                return Err(invalid(format!(
                    "head mask shape {:?} is not broadcastable to {score_dims:?}",
                    head_mask.dims()
                )));
            }
            probs = probs.broadcast_mul(&head_mask.to_dtype(compute)?)?;
        }

        if let Some(p) = config.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(invalid(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            if p > 0.0 {
                probs = dropout(&probs, p)?;
            }
        }

        let context = probs
            .reshape((merged, q_len, k_len))?
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?
            .to_dtype(dtype)?;

        let probs = if config.output_attentions {
            Some(probs.to_dtype(dtype)?)
        } else {
            None
        };

        Ok(AttentionResult { context, probs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{padding_mask_from_lengths, MASK_VALUE};
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q: Vec<f32> = (0..64).map(|i| ((i * 7 % 13) as f32) * 0.1 - 0.6).collect();
        let k: Vec<f32> = (0..64).map(|i| ((i * 5 % 11) as f32) * 0.1 - 0.5).collect();
        let v: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        Ok((
            Tensor::from_vec(q, (1, 2, 4, 8), device)?,
            Tensor::from_vec(k, (1, 2, 4, 8), device)?,
            Tensor::from_vec(v, (1, 2, 4, 8), device)?,
        ))
    }

    fn with_probs() -> Config {
        Config {
            output_attentions: true,
            ..Config::default()
        }
    }

    /// Loop-based reference; `key_mask` is an additive `[batch, k_len]` mask.
    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        key_mask: Option<&[Vec<f32>]>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                for q_idx in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    for (k_idx, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        *slot = dot * scale + key_mask.map_or(0.0, |m| m[b][k_idx]);
                    }
                    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let weights: Vec<f32> = row.iter().map(|s| (s - max_val).exp()).collect();
                    let denom: f32 = weights.iter().sum();
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for (k_idx, weight) in weights.iter().enumerate() {
                            let vi = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            acc += weight / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = padding_mask_from_lengths(&device, &[3], 4)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::new(Some(&mask), None), &Config::default())
            .unwrap();
        assert!(output.probs.is_none());

        let key_mask = vec![vec![0.0, 0.0, 0.0, MASK_VALUE]];
        let expected = naive_attention(&q, &k, &v, Some(&key_mask))?;
        assert!(max_abs_diff(&output.context, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn probability_rows_sum_to_one() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let result = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::default(), &with_probs())
            .unwrap();
        let probs = result.probs.expect("probabilities requested");
        assert_eq!(probs.dims(), &[1, 2, 4, 4]);

        let sums = probs.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5), "{sums:?}");
        Ok(())
    }

    #[test]
    fn masked_key_receives_no_probability() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = Tensor::from_vec(vec![0f32, MASK_VALUE, 0.0, 0.0], (1, 1, 1, 4), &device)?;
        let probs = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::new(Some(&mask), None), &with_probs())
            .unwrap()
            .probs
            .expect("probabilities requested");

        let column = probs.narrow(3, 1, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(column.iter().all(|p| *p < 1e-12));
        Ok(())
    }

    #[test]
    fn identity_probabilities_return_values() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mut diagonal = vec![MASK_VALUE; 16];
        for i in 0..4 {
            diagonal[i * 4 + i] = 0.0;
        }
        let mask = Tensor::from_vec(diagonal, (1, 1, 4, 4), &device)?;
        let context = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::new(Some(&mask), None), &Config::default())
            .unwrap()
            .context;
        assert_eq!(
            context.flatten_all()?.to_vec1::<f32>()?,
            v.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn head_mask_silences_a_head() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let head_mask = Tensor::from_vec(vec![1f32, 0.0], 2, &device)?;
        let result = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::new(None, Some(&head_mask)), &with_probs())
            .unwrap();

        let silenced = result.context.narrow(1, 1, 1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(silenced, 0.0);
        let kept = result.context.narrow(1, 0, 1)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::default(), &Config::default())
            .unwrap()
            .context
            .narrow(1, 0, 1)?;
        assert!(max_abs_diff(&kept, &reference)? < 1e-7);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::default(), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let bad_heads = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let bad_keys = Tensor::zeros((1, 1, 1, 5), DType::F32, &device).unwrap();
        let bad_rank = Tensor::zeros((1, 4), DType::F32, &device).unwrap();
        for mask in [&bad_heads, &bad_keys, &bad_rank] {
            let err = ExactAttention::new()
                .attend(&q, &q, &q, AttentionMasks::new(Some(mask), None), &Config::default())
                .unwrap_err();
            assert!(matches!(err, AttentionError::InvalidShape { .. }));
        }
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::default(), &Config::default())
            .unwrap()
            .context;
        for dtype in [DType::BF16, DType::F16, DType::F64] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    AttentionMasks::default(),
                    &Config::default(),
                )
                .unwrap()
                .context;
            assert_eq!(out.dtype(), dtype);
            let max = max_abs_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {:?} diverged by {max}", dtype);
        }
        Ok(())
    }

    #[test]
    fn integer_inputs_are_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 2, 2), DType::I64, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &q, &q, AttentionMasks::default(), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention::new()
            .attend(&q, &k, &v, AttentionMasks::default(), &Config::default())
            .unwrap()
            .context
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }
}
