//! Top-level encoder: embeddings, layer stack and optional pooler.

use attention::masks::extended_attention_mask;
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use embedding::{EmbeddingInput, Embeddings};
use layers::PrecisionPolicy;

use crate::{
    config::XlmRobertaConfig,
    encoder::{Encoder, EncoderOutput},
    error::ModelError,
    pooler::Pooler,
};

/// Inputs for one forward pass. Exactly one of `input_ids` and
/// `inputs_embeds` must be set; everything else is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelInput<'a> {
    /// `(batch, seq)` token ids.
    pub input_ids: Option<&'a Tensor>,
    /// `(batch, seq, hidden)` precomputed word embeddings.
    pub inputs_embeds: Option<&'a Tensor>,
    /// `(batch, seq)` or `(batch, q, k)` keep mask with `1` for real tokens,
    /// or a rank-4 additive mask used as is.
    pub attention_mask: Option<&'a Tensor>,
    pub token_type_ids: Option<&'a Tensor>,
    pub position_ids: Option<&'a Tensor>,
    /// `(heads,)` or `(layers, heads)` multiplicative mask; `0` disables a head.
    pub head_mask: Option<&'a Tensor>,
    pub past_len: usize,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

impl<'a> ModelInput<'a> {
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

    pub fn with_attention_mask(mut self, mask: &'a Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_token_type_ids(mut self, token_type_ids: &'a Tensor) -> Self {
        self.token_type_ids = Some(token_type_ids);
        self
    }

    pub fn with_position_ids(mut self, position_ids: &'a Tensor) -> Self {
        self.position_ids = Some(position_ids);
        self
    }

    pub fn with_head_mask(mut self, head_mask: &'a Tensor) -> Self {
        self.head_mask = Some(head_mask);
        self
    }

    pub fn with_past_len(mut self, past_len: usize) -> Self {
        self.past_len = past_len;
        self
    }

    pub fn output_attentions(mut self, enabled: bool) -> Self {
        self.output_attentions = enabled;
        self
    }

    pub fn output_hidden_states(mut self, enabled: bool) -> Self {
        self.output_hidden_states = enabled;
        self
    }
}

/// Named results of [`XlmRobertaModel::forward`].
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, seq, hidden)`.
    pub sequence_output: Tensor,
    /// `(batch, hidden)`, `None` when the model was built without a pooler.
    pub pooled_output: Option<Tensor>,
    /// Embedding output followed by every layer output, when requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Per-layer `(batch, heads, seq, seq)` probabilities, when requested.
    pub attentions: Option<Vec<Tensor>>,
}

#[derive(Debug)]
pub struct XlmRobertaModel {
    config: XlmRobertaConfig,
    embeddings: Embeddings,
    encoder: Encoder,
    pooler: Option<Pooler>,
    policy: PrecisionPolicy,
}

impl XlmRobertaModel {
    /// Assembles the model from prebuilt parts. `pooler` must be present
    /// exactly when `config.add_pooling_layer` is set.
    pub fn new(
        config: XlmRobertaConfig,
        embeddings: Embeddings,
        encoder: Encoder,
        pooler: Option<Pooler>,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        if encoder.layers().len() != config.num_hidden_layers {
            return Err(ModelError::InvalidConfig(format!(
                "encoder has {} layers but num_hidden_layers is {}",
                encoder.layers().len(),
                config.num_hidden_layers
            )));
        }
        if pooler.is_some() != config.add_pooling_layer {
            return Err(ModelError::InvalidConfig(format!(
                "add_pooling_layer is {} but pooler is {}",
                config.add_pooling_layer,
                if pooler.is_some() { "present" } else { "absent" }
            )));
        }

        let policy = *embeddings.policy();
        log::info!(
            "xlm-roberta: layers={} hidden={} heads={} pooler={} dtype={:?}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.add_pooling_layer,
            policy.storage()
        );
        Ok(Self {
            config,
            embeddings,
            encoder,
            pooler,
            policy,
        })
    }

    /// Loads `embeddings`, `encoder` and (if configured) `pooler` from `vb`
    /// using the HuggingFace parameter names.
    pub fn load(config: XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        config.validate()?;
        let embeddings = Embeddings::load(config.embeddings_config(), vb.pp("embeddings"))?;
        let encoder = Encoder::load(&config, vb.pp("encoder"))?;
        let pooler = if config.add_pooling_layer {
            Some(Pooler::load(&config, vb.pp("pooler"))?)
        } else {
            None
        };
        Self::new(config, embeddings, encoder, pooler)
    }

    pub fn config(&self) -> &XlmRobertaConfig {
        &self.config
    }

    pub fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Switches every dropout site between training and evaluation mode.
    /// Models start in evaluation mode.
    pub fn set_training(&self, training: bool) {
        self.embeddings.set_training(training);
        self.encoder.set_training(training);
    }

    pub fn forward(&self, input: ModelInput<'_>) -> Result<ModelOutput, ModelError> {
        let embedding_output = self.embeddings.forward(EmbeddingInput {
            input_ids: input.input_ids,
            inputs_embeds: input.inputs_embeds,
            token_type_ids: input.token_type_ids,
            position_ids: input.position_ids,
            past_len: input.past_len,
        })?;
        let (batch, seq, _) = embedding_output.dims3()?;
        log::debug!("xlm-roberta forward: batch={batch} seq={seq}");

        let attention_mask = input
            .attention_mask
            .map(|mask| self.prepare_attention_mask(mask, batch, seq))
            .transpose()?;
        let head_masks = input
            .head_mask
            .map(|mask| self.prepare_head_masks(mask))
            .transpose()?;

        let EncoderOutput {
            last_hidden_state,
            hidden_states,
            attentions,
        } = self.encoder.forward(
            &embedding_output,
            attention_mask.as_ref(),
            head_masks.as_deref(),
            input.output_hidden_states,
            input.output_attentions,
            &self.policy,
        )?;

        let pooled_output = self
            .pooler
            .as_ref()
            .map(|pooler| pooler.forward(&last_hidden_state, &self.policy))
            .transpose()?;

        Ok(ModelOutput {
            sequence_output: last_hidden_state,
            pooled_output,
            hidden_states,
            attentions,
        })
    }

    fn prepare_attention_mask(
        &self,
        mask: &Tensor,
        batch: usize,
        seq: usize,
    ) -> Result<Tensor, ModelError> {
        let leading_ok = match mask.dims() {
            [b, k] => *b == batch && *k == seq,
            [b, q, k] => *b == batch && *q == seq && *k == seq,
            [_, _, _, k] => *k == seq,
            _ => false,
        };
        if !leading_ok {
            return Err(ModelError::ShapeMismatch(format!(
                "attention_mask {:?} does not match batch {batch} and sequence {seq}",
                mask.dims()
            )));
        }
        if mask.rank() != 4 {
            log::debug!("extending {:?} keep mask to additive form", mask.dims());
        }
        extended_attention_mask(mask).map_err(|err| ModelError::ShapeMismatch(err.to_string()))
    }

    fn prepare_head_masks(&self, head_mask: &Tensor) -> Result<Vec<Tensor>, ModelError> {
        let layers = self.config.num_hidden_layers;
        let heads = self.config.num_attention_heads;
        let head_mask = head_mask.to_dtype(DType::F32)?;
        match head_mask.dims() {
            [h] if *h == heads => {
                let mask = head_mask.reshape((1, heads, 1, 1))?;
                Ok(vec![mask; layers])
            }
            [l, h] if *l == layers && *h == heads => (0..layers)
                .map(|layer| Ok(head_mask.get(layer)?.reshape((1, heads, 1, 1))?))
                .collect(),
            dims => Err(ModelError::ShapeMismatch(format!(
                "head_mask must be ({heads},) or ({layers}, {heads}), got {dims:?}"
            ))),
        }
    }
}
