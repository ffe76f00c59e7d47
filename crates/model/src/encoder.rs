//! Stack of encoder layers.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::PrecisionPolicy;

use crate::{config::XlmRobertaConfig, error::ModelError, layer::EncoderLayer};

/// Final hidden states plus the optional per-layer collections.
///
/// `hidden_states` starts with the encoder input and has `layers + 1`
/// entries; `attentions` has one entry per layer. Each is `None` unless
/// requested.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub last_hidden_state: Tensor,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
}

#[derive(Debug)]
pub struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(layers: Vec<EncoderLayer>) -> Self {
        Self { layers }
    }

    /// Loads `layer.0` through `layer.{num_hidden_layers - 1}` from an
    /// `encoder` builder.
    pub fn load(config: &XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let vb = vb.pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|index| EncoderLayer::load(config, vb.pp(index)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(layers))
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    pub fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    /// `head_masks`, when given, holds one mask per layer.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        head_masks: Option<&[Tensor]>,
        output_hidden_states: bool,
        output_attentions: bool,
        policy: &PrecisionPolicy,
    ) -> Result<EncoderOutput, ModelError> {
        if let Some(masks) = head_masks {
            if masks.len() != self.layers.len() {
                return Err(ModelError::ShapeMismatch(format!(
                    "expected {} head masks, got {}",
                    self.layers.len(),
                    masks.len()
                )));
            }
        }

        let mut all_hidden = output_hidden_states.then(|| vec![hidden.clone()]);
        let mut all_attentions = output_attentions.then(Vec::new);
        let mut hidden = hidden.clone();

        for (index, layer) in self.layers.iter().enumerate() {
            let head_mask = head_masks.map(|masks| &masks[index]);
            let output =
                layer.forward(&hidden, attention_mask, head_mask, output_attentions, policy)?;
            hidden = output.hidden;

            if let Some(states) = all_hidden.as_mut() {
                states.push(hidden.clone());
            }
            if let (Some(collected), Some(probs)) = (all_attentions.as_mut(), output.attention) {
                collected.push(probs);
            }
        }

        Ok(EncoderOutput {
            last_hidden_state: hidden,
            hidden_states: all_hidden,
            attentions: all_attentions,
        })
    }
}
