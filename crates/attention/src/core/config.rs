//! Per-call options shared by all attention implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Probability for dropout applied to attention weights.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Return the attention probabilities alongside the context.
    pub output_attentions: bool,
}
