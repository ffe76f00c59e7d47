//! Layer normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Normalisation happens
//! along the last axis while preserving the original layout:
//! `(x - mean) / sqrt(var + eps) * weight + bias`, with the biased variance.
//! Statistics are computed in [`PrecisionPolicy::reduction`] before the
//! output is cast back to storage.

use candle_core::{Error, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for a normalisation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether a learned scale and bias follow the normalisation.
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
            elementwise_affine: true,
        }
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// LayerNorm over the hidden axis with optional affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.elementwise_affine = true;
        Self::build(config, Some(weight), Some(bias))
    }

    /// Constructs a LayerNorm without affine parameters (scale = 1, bias = 0).
    pub fn without_affine(mut config: NormConfig) -> Result<Self> {
        config.elementwise_affine = false;
        Self::build(config, None, None)
    }

    /// Pulls `weight` and `bias` from `vb`, defaulting to ones and zeros for
    /// on-demand backends.
    pub fn load(config: NormConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(config.hidden_size, "bias", Init::Const(0.0))?;
        Self::new(weight, bias, config)
    }

    fn build(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm: hidden_size must be non-zero".into()));
        }
        if config.epsilon.is_nan() || config.epsilon <= 0.0 {
            return Err(Error::Msg(format!(
                "norm: epsilon must be positive, got {}",
                config.epsilon
            )));
        }
        for (name, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            if let Some(param) = param {
                checks::expect_shape(name, param, &[config.hidden_size])?;
                checks::expect_dtype_in(name, param, checks::FLOAT_DTYPES)?;
            }
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;

        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?;

        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(normalized.dtype())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
