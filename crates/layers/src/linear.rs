//! Dense affine projections.
//!
//! Linear layers accept inputs shaped `(batch, seq, in_dim)` or
//! `(rows, in_dim)` and return the same leading layout with `out_dim`
//! features. Weights follow the `(out_dim, in_dim)` checkpoint convention so
//! the forward pass computes `x · Wᵀ + b`. Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is cast back with
//! [`PrecisionPolicy::cast_to_storage`].

use candle_core::{Error, Result, Tensor};
use candle_nn::{init, Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Pulls `weight` (and `bias` when configured) from `vb`.
    ///
    /// Backends that create variables on demand (such as a `VarMap`) sample
    /// the weight from a Kaiming normal distribution and zero the bias.
    pub fn load(config: LinearConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.output_dim, config.input_dim),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if config.bias {
            Some(vb.get_with_hints(config.output_dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, hidden_dim] => {
                if *hidden_dim != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "linear.input: expected last dim {} but received {}",
                        self.config.input_dim, hidden_dim
                    )))
                } else if *batch == 0 || *seq == 0 {
                    Err(Error::Msg("linear.input: batch/seq dimensions must be non-zero".into()))
                } else {
                    Ok(())
                }
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            [_, hidden_dim] => Err(Error::Msg(format!(
                "linear.input: expected last dim {} but received {}",
                self.config.input_dim, hidden_dim
            ))),
            dims => Err(Error::Msg(format!(
                "linear expects input shaped [B, T, H_in] or [T, H_in], got {:?}",
                dims
            ))),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let mut output = match input.dims() {
            [batch, seq, _] => {
                let (batch, seq) = (*batch, *seq);
                input
                    .reshape((batch * seq, self.config.input_dim))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}
