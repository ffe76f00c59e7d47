//! Building blocks for post-norm transformer encoder layers.
//!
//! Every component here operates on hidden states shaped
//! `(batch, seq, hidden)` (the pooler also feeds `(batch, hidden)` rows into
//! [`linear::Linear`]) and follows the precision rules in
//! [`dtypes::PrecisionPolicy`]. Parameters are immutable once constructed;
//! forward passes are pure apart from optional training-mode dropout.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::{builtin, Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearLayer};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardOutput, Intermediate};
pub use norm::{LayerNorm, NormConfig, NormalizationLayer};
pub use residual::{Dropout, PostNormResidual};
