//! Encoder hyper-parameters, readable from a HuggingFace `config.json`.

use std::{fs, path::Path};

use embedding::EmbeddingsConfig;
use layers::{ActivationKind, FeedForwardConfig};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Non-linearity named by `hidden_act`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenAct {
    Gelu,
    #[serde(alias = "gelu_pytorch_tanh", alias = "gelu_fast")]
    GeluNew,
    Relu,
    #[serde(alias = "swish")]
    Silu,
    Tanh,
}

impl From<HiddenAct> for ActivationKind {
    fn from(act: HiddenAct) -> Self {
        match act {
            HiddenAct::Gelu => ActivationKind::Gelu,
            HiddenAct::GeluNew => ActivationKind::GeluTanh,
            HiddenAct::Relu => ActivationKind::Relu,
            HiddenAct::Silu => ActivationKind::Silu,
            HiddenAct::Tanh => ActivationKind::Tanh,
        }
    }
}

/// Only `Absolute` is supported; the relative variants parse so that
/// [`XlmRobertaConfig::validate`] can reject them by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    Absolute,
    RelativeKey,
    RelativeKeyQuery,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

fn default_vocab_size() -> usize {
    46_166
}

fn default_true() -> bool {
    true
}

fn default_dropout() -> f32 {
    0.1
}

fn default_type_vocab_size() -> usize {
    1
}

fn default_pad_token_id() -> usize {
    1
}

fn default_hidden_act() -> HiddenAct {
    HiddenAct::Gelu
}

fn default_position_embedding_type() -> PositionEmbeddingType {
    PositionEmbeddingType::Absolute
}

/// Immutable configuration shared by every layer of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XlmRobertaConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_true")]
    pub add_pooling_layer: bool,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f32,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f32,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: HiddenAct,
    #[serde(default = "default_position_embedding_type")]
    pub position_embedding_type: PositionEmbeddingType,
}

impl XlmRobertaConfig {
    /// Builds a configuration from the required sizes; everything else takes
    /// its default.
    pub fn new(
        hidden_size: usize,
        num_hidden_layers: usize,
        intermediate_size: usize,
        num_attention_heads: usize,
        max_position_embeddings: usize,
    ) -> Self {
        Self {
            hidden_size,
            num_hidden_layers,
            intermediate_size,
            num_attention_heads,
            max_position_embeddings,
            layer_norm_eps: default_layer_norm_eps(),
            vocab_size: default_vocab_size(),
            add_pooling_layer: true,
            hidden_dropout_prob: default_dropout(),
            attention_probs_dropout_prob: default_dropout(),
            type_vocab_size: default_type_vocab_size(),
            pad_token_id: default_pad_token_id(),
            hidden_act: default_hidden_act(),
            position_embedding_type: default_position_embedding_type(),
        }
    }

    /// Parses and validates a `config.json` document. Unknown keys are ignored.
    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Width of one attention head.
    pub fn head_size(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    pub fn activation(&self) -> ActivationKind {
        self.hidden_act.into()
    }

    /// Validate structural invariants before any weight is allocated.
    pub fn validate(&self) -> Result<(), ModelError> {
        let required = [
            ("hidden_size", self.hidden_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("max_position_embeddings", self.max_position_embeddings),
            ("vocab_size", self.vocab_size),
            ("type_vocab_size", self.type_vocab_size),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelError::ShapeMismatch(format!(
                "hidden_size ({}) is not a multiple of num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attention_probs_dropout_prob", self.attention_probs_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }
        if self.pad_token_id >= self.max_position_embeddings {
            return Err(ModelError::InvalidConfig(format!(
                "pad_token_id ({}) must index the position table of size {}",
                self.pad_token_id, self.max_position_embeddings
            )));
        }
        if self.position_embedding_type != PositionEmbeddingType::Absolute {
            return Err(ModelError::InvalidConfig(format!(
                "position_embedding_type {:?} is not supported, only absolute",
                self.position_embedding_type
            )));
        }
        Ok(())
    }

    pub(crate) fn embeddings_config(&self) -> EmbeddingsConfig {
        EmbeddingsConfig {
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
            max_position_embeddings: self.max_position_embeddings,
            type_vocab_size: self.type_vocab_size,
            pad_token_id: self.pad_token_id,
            layer_norm_eps: self.layer_norm_eps,
            hidden_dropout_prob: self.hidden_dropout_prob,
        }
    }

    pub(crate) fn feed_forward_config(&self) -> FeedForwardConfig {
        let mut config =
            FeedForwardConfig::new(self.hidden_size, self.intermediate_size, self.activation());
        config.layer_norm_eps = self.layer_norm_eps;
        config.dropout_p = self.hidden_dropout_prob;
        config
    }
}
