//! Mask utilities shared by attention implementations.
//!
//! Masks produced here are additive `f32` tensors that broadcast against
//! attention scores shaped `[batch, num_heads, q_len, k_len]`. Values are
//! either `0.0` (keep) or [`MASK_VALUE`] (discard). `MASK_VALUE` is finite,
//! so a fully masked row softmaxes to a uniform distribution rather than NaN.

pub mod padding;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Additive value applied to discarded key positions.
pub const MASK_VALUE: f32 = f32::MIN;

pub use padding::{extended_attention_mask, padding_mask_from_lengths};
