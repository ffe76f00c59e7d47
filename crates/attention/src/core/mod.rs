//! Core traits and types shared across attention implementations.
//!
//! Implementations are expected to operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the input
//! layout, and reductions should accumulate in `f32` regardless of the incoming
//! dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Optional masks applied while attending.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionMasks<'a> {
    /// Additive mask broadcastable to `[batch, n_heads, q_len, k_len]`.
    pub attention: Option<&'a Tensor>,
    /// Multiplicative per-head mask applied to the probabilities.
    pub head: Option<&'a Tensor>,
}

impl<'a> AttentionMasks<'a> {
    pub fn new(attention: Option<&'a Tensor>, head: Option<&'a Tensor>) -> Self {
        Self { attention, head }
    }
}

/// Context tensor plus the probabilities when they were requested.
#[derive(Debug, Clone)]
pub struct AttentionResult {
    /// `[batch, n_heads, q_len, head_dim]`, same dtype as `q`.
    pub context: Tensor,
    /// `[batch, n_heads, q_len, k_len]`, present when
    /// [`Config::output_attentions`] is set.
    pub probs: Option<Tensor>,
}

/// Unified interface for attention kernels.
///
/// * `q`, `k`, and `v` share the layout `[batch, n_heads, seq_len, head_dim]`.
/// * The attention mask must be rank 4 with dims `[1|batch, 1|n_heads, 1|q_len, k_len]`.
/// * The head mask is either `[n_heads]` or rank 4 with dims
///   `[1|batch, 1|n_heads, 1|q_len, 1|k_len]`.
/// * Scores are scaled by `1 / sqrt(head_dim)` before the mask is added.
/// * Dropout is controlled via [`Config::dropout_p`].
pub trait Attention: Send + Sync {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: AttentionMasks<'_>,
        config: &Config,
    ) -> Result<AttentionResult, AttentionError>;
}
