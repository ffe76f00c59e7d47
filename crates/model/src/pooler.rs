//! First-token pooler: `tanh(dense(hidden[:, 0]))`.

use std::{fmt, sync::Arc};

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{
    builtin, checks, Activation, ActivationKind, Linear, LinearConfig, LinearLayer,
    PrecisionPolicy,
};

use crate::{config::XlmRobertaConfig, error::ModelError};

#[derive(Clone)]
pub struct Pooler {
    dense: Linear,
    activation: Arc<dyn Activation>,
}

impl fmt::Debug for Pooler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooler")
            .field("dense", self.dense.config())
            .field("activation", &self.activation.kind())
            .finish()
    }
}

impl Pooler {
    pub fn new(dense: Linear) -> Self {
        Self {
            dense,
            activation: builtin(ActivationKind::Tanh),
        }
    }

    /// Loads `dense` from a `pooler` builder.
    pub fn load(config: &XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let dense = Linear::load(
            LinearConfig::new(config.hidden_size, config.hidden_size),
            vb.pp("dense"),
        )?;
        Ok(Self::new(dense))
    }

    /// `(batch, seq, hidden)` to `(batch, hidden)`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor, ModelError> {
        checks::expect_batch_seq_hidden("pooler.input", hidden, self.dense.config().input_dim)
            .map_err(|err| ModelError::ShapeMismatch(err.to_string()))?;
        let first = hidden.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let projected = self.dense.forward(&first, policy)?;
        Ok(self.activation.forward(&projected, policy)?)
    }
}
