//! One post-norm encoder layer: attention block then feed-forward block.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{FeedForward, PrecisionPolicy};

use crate::{attention::AttentionBlock, config::XlmRobertaConfig, error::ModelError};

/// Hidden states leaving a layer plus its attention probabilities when requested.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub hidden: Tensor,
    pub attention: Option<Tensor>,
}

#[derive(Debug)]
pub struct EncoderLayer {
    attention: AttentionBlock,
    feed_forward: FeedForward,
}

impl EncoderLayer {
    pub fn new(attention: AttentionBlock, feed_forward: FeedForward) -> Self {
        Self {
            attention,
            feed_forward,
        }
    }

    /// Loads `attention`, `intermediate` and `output` from an
    /// `encoder.layer.{i}` builder.
    pub fn load(config: &XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let attention = AttentionBlock::load(config, vb.pp("attention"))?;
        let feed_forward = FeedForward::load(config.feed_forward_config(), vb)?;
        Ok(Self::new(attention, feed_forward))
    }

    pub fn attention(&self) -> &AttentionBlock {
        &self.attention
    }

    pub fn set_training(&self, training: bool) {
        self.attention.set_training(training);
        self.feed_forward.set_training(training);
    }

    /// The attention block output is both the feed-forward input and the
    /// residual of its output step.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
        policy: &PrecisionPolicy,
    ) -> Result<LayerOutput, ModelError> {
        let attended =
            self.attention
                .forward(hidden, attention_mask, head_mask, output_attentions, policy)?;
        let hidden = self.feed_forward.forward(&attended.context, policy)?;
        Ok(LayerOutput {
            hidden,
            attention: attended.probs,
        })
    }
}
