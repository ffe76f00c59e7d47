//! Exact bidirectional multi-head attention for the encoder.
//!
//! The crate defines a portable API for computing scaled dot-product
//! attention over tensors with layout `[batch, n_heads, seq_len, head_dim]`.
//! The inputs `Q`, `K`, and `V` share the same layout and dtype (bf16, f16,
//! f32 or f64). Scores and the softmax are evaluated in at least `f32`, and
//! the context tensor matches the input dtype and shape.
//!
//! Masks are additive: `0.0` keeps a key, [`masks::MASK_VALUE`] suppresses
//! it through softmax saturation. Accepted mask shapes are documented on the
//! [`Attention`] trait. Dropout on the attention probabilities is optional and
//! controlled through [`Config`].

pub mod core;
pub mod masks;
pub mod reference;

pub use self::core::{Attention, AttentionError, AttentionMasks, AttentionResult, Config};
pub use reference::ExactAttention;
