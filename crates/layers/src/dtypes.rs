//! Precision policy shared by every layer of the encoder.
//!
//! Checkpoints for the encoder are commonly distributed in `f16`/`bf16`. Those
//! parameters stay in their storage dtype while matmuls and activations run in
//! `f32`, and statistics such as LayerNorm mean/variance or the attention
//! softmax are always reduced in at least `f32`. [`PrecisionPolicy`] captures
//! the three dtypes so each layer casts consistently before a matmul, before a
//! reduction, and when handing its output to the next layer.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast during the phases of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match compute {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        assert_eq!(policy.storage(), DType::F16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);
    }

    #[test]
    fn full_precision_policy_is_uniform() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);

        let wide = PrecisionPolicy::from_parameter_dtype(DType::F64);
        assert_eq!(wide.compute(), DType::F64);
        assert_eq!(wide.reduction(), DType::F64);
    }

    #[test]
    fn cast_round_trip_preserves_values_within_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let storage = base.to_dtype(policy.storage())?;

        let compute = policy.cast_for_matmul(&storage)?;
        assert_eq!(compute.dtype(), policy.compute());

        let round_trip = policy.cast_to_storage(&compute)?;
        let original = base.to_vec1::<f32>()?;
        let restored = round_trip.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        for (orig, rest) in original.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= 2e-2);
        }
        Ok(())
    }
}
