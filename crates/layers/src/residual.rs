//! Dropout hook and the post-norm residual step used throughout the encoder.
//!
//! Encoder sub-layers follow the post-norm layout: the transformed branch is
//! passed through dropout, added to the residual input, and only then
//! normalised, i.e. `LayerNorm(dropout(branch) + residual)`. Both inputs must
//! share the `(batch, seq, hidden)` shape. The addition happens in
//! [`PrecisionPolicy::compute`] so reduced-precision storage does not lose the
//! residual signal before normalisation.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{Error, Result, Tensor};
use candle_nn::{ops, VarBuilder};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormConfig, NormalizationLayer},
};

/// Dropout that is inert unless training mode is switched on.
///
/// Layers are built in evaluation mode, so inference is deterministic unless
/// a caller explicitly opts into training-mode dropout with
/// [`Dropout::set_training`].
pub struct Dropout {
    probability: f32,
    training: AtomicBool,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        Self {
            probability: self.probability,
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout hook in evaluation mode. `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self {
            probability,
            training: AtomicBool::new(false),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Enables or disables dropout.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Probability to apply right now, or `None` when dropout is inert.
    pub fn active_probability(&self) -> Option<f32> {
        (self.is_training() && self.probability > 0.0).then_some(self.probability)
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        match self.active_probability() {
            Some(p) => {
                log::trace!("dropout p={p} over {:?}", input.dims());
                ops::dropout(input, p)
            }
            None => Ok(input.clone()),
        }
    }
}

/// `LayerNorm(dropout(branch) + residual)`.
#[derive(Debug, Clone)]
pub struct PostNormResidual {
    dropout: Dropout,
    norm: LayerNorm,
}

impl PostNormResidual {
    pub fn new(norm: LayerNorm, dropout: Dropout) -> Self {
        Self { dropout, norm }
    }

    /// Loads the `LayerNorm` parameters from `vb`.
    pub fn load(config: NormConfig, dropout_p: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self::new(LayerNorm::load(config, vb)?, Dropout::new(dropout_p)?))
    }

    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Adds the residual before normalising: `norm(dropout(branch) + residual)`.
    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let hidden = self.norm.config().hidden_size;
        checks::expect_batch_seq_hidden("residual.input", residual, hidden)?;
        checks::expect_shape("residual.branch", branch, residual.dims())?;

        let branch = self.dropout.forward(branch)?;
        let summed = policy
            .cast_for_matmul(&branch)?
            .add(&policy.cast_for_matmul(residual)?)?;
        self.norm.forward(&summed, policy)
    }
}
