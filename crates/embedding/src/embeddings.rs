//! Summed word, position and token-type embeddings.
//!
//! `LayerNorm(word(ids) + token_type(types) + position(positions))` followed by
//! dropout. Either `input_ids` or precomputed `inputs_embeds` feed the word
//! term; token types default to zeros and positions default to the
//! padding-aware ids from [`crate::positional`].

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use layers::{checks, Dropout, LayerNorm, NormConfig, NormalizationLayer, PrecisionPolicy};

use crate::{
    errors::EmbeddingError,
    positional::{position_ids_from_embeds, position_ids_from_input_ids},
    table::EmbeddingTable,
};

/// Table sizes and regularisation for [`Embeddings`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingsConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    /// Token id treated as padding; doubles as the position padding index.
    pub pad_token_id: usize,
    pub layer_norm_eps: f64,
    pub hidden_dropout_prob: f32,
}

/// Inputs for one embedding pass. Exactly one of `input_ids` and
/// `inputs_embeds` must be set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingInput<'a> {
    pub input_ids: Option<&'a Tensor>,
    pub inputs_embeds: Option<&'a Tensor>,
    pub token_type_ids: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
    /// Number of tokens already processed before this call.
    pub past_len: usize,
}

impl<'a> EmbeddingInput<'a> {
    pub fn from_ids(input_ids: &'a Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Self::default()
        }
    }

    pub fn from_embeds(inputs_embeds: &'a Tensor) -> Self {
        Self {
            inputs_embeds: Some(inputs_embeds),
            ..Self::default()
        }
    }

    pub fn with_token_type_ids(mut self, token_type_ids: &'a Tensor) -> Self {
        self.token_type_ids = Some(token_type_ids);
        self
    }

    pub fn with_position_ids(mut self, position_ids: &'a Tensor) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    pub fn with_past_len(mut self, past_len: usize) -> Self {
        self.past_len = past_len;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Embeddings {
    config: EmbeddingsConfig,
    word: EmbeddingTable,
    position: EmbeddingTable,
    token_type: EmbeddingTable,
    norm: LayerNorm,
    dropout: Dropout,
    policy: PrecisionPolicy,
}

impl Embeddings {
    /// Assembles the layer from prebuilt tables. All tables must share
    /// `config.hidden_size` and the sizes given in `config`.
    pub fn new(
        config: EmbeddingsConfig,
        word: EmbeddingTable,
        position: EmbeddingTable,
        token_type: EmbeddingTable,
        norm: LayerNorm,
    ) -> Result<Self, EmbeddingError> {
        let expected = [
            (&word, config.vocab_size),
            (&position, config.max_position_embeddings),
            (&token_type, config.type_vocab_size),
        ];
        for (table, size) in expected {
            if table.size() != size || table.hidden_size() != config.hidden_size {
                return Err(EmbeddingError::shape(format!(
                    "{}: expected ({size}, {}), got ({}, {})",
                    table.name(),
                    config.hidden_size,
                    table.size(),
                    table.hidden_size()
                )));
            }
        }
        if norm.config().hidden_size != config.hidden_size {
            return Err(EmbeddingError::shape(format!(
                "LayerNorm: expected hidden size {}, got {}",
                config.hidden_size,
                norm.config().hidden_size
            )));
        }

        let dropout = Dropout::new(config.hidden_dropout_prob)?;
        let policy = PrecisionPolicy::from_parameter_dtype(word.weight().dtype());
        Ok(Self {
            config,
            word,
            position,
            token_type,
            norm,
            dropout,
            policy,
        })
    }

    /// Loads `word_embeddings`, `position_embeddings`, `token_type_embeddings`
    /// and `LayerNorm` from `vb`, which should point at the `embeddings` scope.
    pub fn load(config: EmbeddingsConfig, vb: VarBuilder) -> Result<Self, EmbeddingError> {
        let hidden = config.hidden_size;
        let word = EmbeddingTable::load(
            "word_embeddings",
            config.vocab_size,
            hidden,
            vb.pp("word_embeddings"),
        )?;
        let position = EmbeddingTable::load(
            "position_embeddings",
            config.max_position_embeddings,
            hidden,
            vb.pp("position_embeddings"),
        )?;
        let token_type = EmbeddingTable::load(
            "token_type_embeddings",
            config.type_vocab_size,
            hidden,
            vb.pp("token_type_embeddings"),
        )?;
        let norm = LayerNorm::load(
            NormConfig::new(hidden, config.layer_norm_eps),
            vb.pp("LayerNorm"),
        )?;
        Self::new(config, word, position, token_type, norm)
    }

    pub fn config(&self) -> &EmbeddingsConfig {
        &self.config
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn word_embeddings(&self) -> &EmbeddingTable {
        &self.word
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Returns `(batch, seq, hidden)` embeddings in the storage dtype.
    pub fn forward(&self, input: EmbeddingInput<'_>) -> Result<Tensor, EmbeddingError> {
        let (words, batch, seq) = match (input.input_ids, input.inputs_embeds) {
            (Some(ids), None) => {
                let (batch, seq) = ids.dims2().map_err(|_| {
                    EmbeddingError::shape(format!(
                        "input_ids must be shaped (batch, seq), got {:?}",
                        ids.dims()
                    ))
                })?;
                (self.word.lookup(ids)?, batch, seq)
            }
            (None, Some(embeds)) => {
                checks::expect_batch_seq_hidden("inputs_embeds", embeds, self.config.hidden_size)
                    .map_err(|err| EmbeddingError::shape(err.to_string()))?;
                let (batch, seq, _) = embeds.dims3()?;
                (embeds.clone(), batch, seq)
            }
            (Some(_), Some(_)) => {
                return Err(EmbeddingError::InvalidInput {
                    context: "specify either input_ids or inputs_embeds, not both".into(),
                })
            }
            (None, None) => {
                return Err(EmbeddingError::InvalidInput {
                    context: "one of input_ids or inputs_embeds is required".into(),
                })
            }
        };

        let padding_idx = self.config.pad_token_id;
        let position_ids = match (input.position_ids, input.input_ids) {
            (Some(explicit), _) => broadcast_position_ids(explicit, batch, seq)?,
            (None, Some(ids)) => position_ids_from_input_ids(ids, padding_idx, input.past_len)?,
            (None, None) => {
                log::debug!(
                    "embeddings: no input_ids, using static positions from {}",
                    padding_idx + 1
                );
                position_ids_from_embeds(&words, padding_idx)?
            }
        };
        let positions = self.position.lookup(&position_ids)?;

        let token_types = match input.token_type_ids {
            Some(types) => {
                expect_ids_shape("token_type_ids", types, batch, seq)?;
                self.token_type.lookup(types)?
            }
            None => {
                let zeros = Tensor::zeros((batch, seq), DType::I64, words.device())?;
                self.token_type.lookup(&zeros)?
            }
        };

        let policy = &self.policy;
        let summed = policy
            .cast_for_matmul(&words)?
            .add(&policy.cast_for_matmul(&token_types)?)?
            .add(&policy.cast_for_matmul(&positions)?)?;
        let normalized = self.norm.forward(&summed, policy)?;
        Ok(self.dropout.forward(&normalized)?)
    }
}

/// Explicit position ids are `(batch, seq)` or a single `(1, seq)` row shared
/// by the whole batch.
fn broadcast_position_ids(
    position_ids: &Tensor,
    batch: usize,
    seq: usize,
) -> Result<Tensor, EmbeddingError> {
    match position_ids.dims() {
        [b, s] if *b == batch && *s == seq => Ok(position_ids.clone()),
        [1, s] if *s == seq => Ok(position_ids.broadcast_as((batch, seq))?.contiguous()?),
        dims => Err(EmbeddingError::shape(format!(
            "position_ids: expected ({batch}, {seq}) or (1, {seq}), got {dims:?}"
        ))),
    }
}

fn expect_ids_shape(
    name: &str,
    ids: &Tensor,
    batch: usize,
    seq: usize,
) -> Result<(), EmbeddingError> {
    if ids.dims() != [batch, seq].as_slice() {
        return Err(EmbeddingError::shape(format!(
            "{name}: expected ({batch}, {seq}), got {:?}",
            ids.dims()
        )));
    }
    Ok(())
}
