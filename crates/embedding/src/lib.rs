//! Embedding crate
//!
//! Token lookups with range checking, padding-aware position ids and the
//! summed, normalised embedding layer that feeds the encoder.

pub mod embeddings;
pub mod errors;
pub mod positional;
pub mod table;

pub use embeddings::{EmbeddingInput, Embeddings, EmbeddingsConfig};
pub use errors::EmbeddingError;
pub use positional::{position_ids_from_embeds, position_ids_from_input_ids};
pub use table::EmbeddingTable;
