//! Position id construction for learned absolute position embeddings.

pub mod ids;

pub use ids::{position_ids_from_embeds, position_ids_from_input_ids};
