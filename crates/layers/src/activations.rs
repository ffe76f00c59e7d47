//! Activation catalogue for encoder feed-forward stacks and the pooler.
//!
//! Activations return tensors with the same layout as their input. Each
//! implementation promotes inputs to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to the storage dtype.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the exact erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **GELU (tanh)** uses `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 x^3)))`.
//! * **SiLU** computes `x * sigmoid(x)`.
//! * **Tanh** is the saturating non-linearity applied by the pooler.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Exact erf-based GELU.
    Gelu,
    /// GELU with the tanh approximation.
    GeluTanh,
    Relu,
    /// SiLU, also known as swish.
    Silu,
    Tanh,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Built-in activation backed by Candle kernels.
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::GeluTanh => compute.gelu()?,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Silu => compute.silu()?,
            ActivationKind::Tanh => compute.tanh()?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
