//! Position-wise feed-forward block of an encoder layer.
//!
//! The block operates on hidden states shaped `(batch, seq, hidden)`.
//! [`Intermediate`] expands to `intermediate_size` and applies the configured
//! activation; [`FeedForwardOutput`] contracts back to `hidden_size` and runs
//! the post-norm residual step against the block input (the attention output
//! of the enclosing layer).

use std::{fmt, sync::Arc};

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearLayer},
    norm::NormConfig,
    residual::PostNormResidual,
};

/// Configuration shared by the feed-forward sub-layers.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    pub layer_norm_eps: f64,
    /// Dropout applied to the contracted branch in training mode.
    pub dropout_p: f32,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            layer_norm_eps: 1e-5,
            dropout_p: 0.0,
        }
    }
}

/// Expansion projection followed by the activation.
#[derive(Clone)]
pub struct Intermediate {
    dense: Linear,
    activation: Arc<dyn Activation>,
}

impl fmt::Debug for Intermediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intermediate")
            .field("dense", self.dense.config())
            .field("activation", &self.activation.kind())
            .finish()
    }
}

impl Intermediate {
    pub fn new(dense: Linear, activation: ActivationKind) -> Self {
        Self {
            dense,
            activation: builtin(activation),
        }
    }

    /// Loads `dense` from `vb`.
    pub fn load(config: &FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        let dense = Linear::load(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            vb.pp("dense"),
        )?;
        Ok(Self::new(dense, config.activation))
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.dense.forward(hidden, policy)?;
        self.activation.forward(&expanded, policy)
    }
}

/// Contraction projection followed by `LayerNorm(dropout(x) + residual)`.
#[derive(Debug, Clone)]
pub struct FeedForwardOutput {
    dense: Linear,
    residual: PostNormResidual,
}

impl FeedForwardOutput {
    pub fn new(dense: Linear, residual: PostNormResidual) -> Self {
        Self { dense, residual }
    }

    /// Loads `dense` and `LayerNorm` from `vb`.
    pub fn load(config: &FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        let dense = Linear::load(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            vb.pp("dense"),
        )?;
        let residual = PostNormResidual::load(
            NormConfig::new(config.hidden_size, config.layer_norm_eps),
            config.dropout_p,
            vb.pp("LayerNorm"),
        )?;
        Ok(Self::new(dense, residual))
    }

    pub fn set_training(&self, training: bool) {
        self.residual.set_training(training);
    }

    pub fn forward(
        &self,
        intermediate: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let contracted = self.dense.forward(intermediate, policy)?;
        self.residual.forward(&contracted, residual, policy)
    }
}

/// Full feed-forward block: intermediate expansion then output contraction.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    intermediate: Intermediate,
    output: FeedForwardOutput,
}

impl FeedForward {
    pub fn new(
        config: FeedForwardConfig,
        intermediate: Intermediate,
        output: FeedForwardOutput,
    ) -> Self {
        Self {
            config,
            intermediate,
            output,
        }
    }

    /// Loads the block from the `intermediate` and `output` scopes of a
    /// layer-level builder.
    pub fn load(config: FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        let intermediate = Intermediate::load(&config, vb.pp("intermediate"))?;
        let output = FeedForwardOutput::load(&config, vb.pp("output"))?;
        Ok(Self::new(config, intermediate, output))
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.output.set_training(training);
    }

    /// Runs the block; `hidden` doubles as the residual input of the output step.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.intermediate.forward(hidden, policy)?;
        self.output.forward(&expanded, hidden, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        norm::{LayerNorm, NormalizationLayer},
        residual::Dropout,
    };
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn output_shape_matches_input() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = FeedForwardConfig::new(8, 32, ActivationKind::Gelu);
        let block = FeedForward::load(config, vb)?;

        let hidden = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let out = block.forward(&hidden, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;
        assert_eq!(out.dims(), &[2, 3, 8]);
        Ok(())
    }

    #[test]
    fn zero_projection_reduces_to_normalised_residual() -> Result<()> {
        let device = Device::Cpu;
        let hidden_size = 4;
        let intermediate_size = 6;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let up = Linear::new(
            LinearConfig::new(hidden_size, intermediate_size),
            Tensor::randn(0f32, 1.0, (intermediate_size, hidden_size), &device)?,
            Some(Tensor::zeros(intermediate_size, DType::F32, &device)?),
        )?;
        let down = Linear::new(
            LinearConfig::new(intermediate_size, hidden_size),
            Tensor::zeros((hidden_size, intermediate_size), DType::F32, &device)?,
            Some(Tensor::zeros(hidden_size, DType::F32, &device)?),
        )?;
        let norm = LayerNorm::without_affine(NormConfig::new(hidden_size, 1e-5))?;
        let block = FeedForward::new(
            FeedForwardConfig::new(hidden_size, intermediate_size, ActivationKind::Gelu),
            Intermediate::new(up, ActivationKind::Gelu),
            FeedForwardOutput::new(down, PostNormResidual::new(norm.clone(), Dropout::new(0.0)?)),
        );

        let hidden = Tensor::from_vec(vec![1f32, -2., 0.5, 3.], (1, 1, 4), &device)?;
        let out = block.forward(&hidden, &policy)?;
        let expected = norm.forward(&hidden, &policy)?;
        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
