//! Multi-head self-attention and its post-norm output projection.

use attention::{
    Attention, AttentionMasks, AttentionResult, Config as AttentionConfig, ExactAttention,
};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{
    checks, Dropout, Linear, LinearConfig, LinearLayer, NormConfig, PostNormResidual,
    PrecisionPolicy,
};

use crate::{config::XlmRobertaConfig, error::ModelError};

/// Query/key/value projections feeding the exact attention kernel.
///
/// Channel range `[h * head_size, (h + 1) * head_size)` of each projection
/// belongs to head `h`.
#[derive(Debug)]
pub struct SelfAttention {
    num_heads: usize,
    head_size: usize,
    query: Linear,
    key: Linear,
    value: Linear,
    kernel: ExactAttention,
    probs_dropout: Dropout,
}

impl SelfAttention {
    pub fn new(
        config: &XlmRobertaConfig,
        query: Linear,
        key: Linear,
        value: Linear,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let hidden = config.hidden_size;
        for (name, proj) in [("query", &query), ("key", &key), ("value", &value)] {
            let cfg = proj.config();
            if cfg.input_dim != hidden || cfg.output_dim != hidden {
                return Err(ModelError::ShapeMismatch(format!(
                    "attention.self.{name}: expected ({hidden}, {hidden}), got ({}, {})",
                    cfg.output_dim, cfg.input_dim
                )));
            }
        }
        Ok(Self {
            num_heads: config.num_attention_heads,
            head_size: config.head_size(),
            query,
            key,
            value,
            kernel: ExactAttention::new(),
            probs_dropout: Dropout::new(config.attention_probs_dropout_prob)?,
        })
    }

    /// Loads `query`, `key` and `value` from an `attention.self` builder.
    pub fn load(config: &XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let projection = || LinearConfig::new(config.hidden_size, config.hidden_size);
        let query = Linear::load(projection(), vb.pp("query"))?;
        let key = Linear::load(projection(), vb.pp("key"))?;
        let value = Linear::load(projection(), vb.pp("value"))?;
        Self::new(config, query, key, value)
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn set_training(&self, training: bool) {
        self.probs_dropout.set_training(training);
    }

    /// `(batch, seq, hidden)` to `(batch, heads, seq, head_size)`.
    pub fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, ModelError> {
        let (batch, seq, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, seq, self.num_heads, self.head_size))?
            .permute((0, 2, 1, 3))?
            .contiguous()?)
    }

    /// Exact inverse of [`SelfAttention::split_heads`].
    pub fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor, ModelError> {
        let (batch, _, seq, _) = tensor.dims4()?;
        Ok(tensor
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, seq, self.num_heads * self.head_size))?)
    }

    /// Returns the merged context `(batch, seq, hidden)` and, when requested,
    /// the probabilities `(batch, heads, seq, seq)`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
        policy: &PrecisionPolicy,
    ) -> Result<AttentionResult, ModelError> {
        checks::expect_batch_seq_hidden(
            "attention.self.input",
            hidden,
            self.num_heads * self.head_size,
        )
        .map_err(|err| ModelError::ShapeMismatch(err.to_string()))?;

        let q = self.split_heads(&self.query.forward(hidden, policy)?)?;
        let k = self.split_heads(&self.key.forward(hidden, policy)?)?;
        let v = self.split_heads(&self.value.forward(hidden, policy)?)?;

        let config = AttentionConfig {
            dropout_p: self.probs_dropout.active_probability(),
            output_attentions,
        };
        let result = self.kernel.attend(
            &q,
            &k,
            &v,
            AttentionMasks::new(attention_mask, head_mask),
            &config,
        )?;

        Ok(AttentionResult {
            context: self.merge_heads(&result.context)?,
            probs: result.probs,
        })
    }
}

/// `LayerNorm(dropout(dense(context)) + input)`.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    dense: Linear,
    residual: PostNormResidual,
}

impl AttentionOutput {
    pub fn new(dense: Linear, residual: PostNormResidual) -> Self {
        Self { dense, residual }
    }

    /// Loads `dense` and `LayerNorm` from an `attention.output` builder.
    pub fn load(config: &XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let dense = Linear::load(
            LinearConfig::new(config.hidden_size, config.hidden_size),
            vb.pp("dense"),
        )?;
        let residual = PostNormResidual::load(
            NormConfig::new(config.hidden_size, config.layer_norm_eps),
            config.hidden_dropout_prob,
            vb.pp("LayerNorm"),
        )?;
        Ok(Self::new(dense, residual))
    }

    pub fn set_training(&self, training: bool) {
        self.residual.set_training(training);
    }

    pub fn forward(
        &self,
        context: &Tensor,
        input: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, ModelError> {
        let projected = self.dense.forward(context, policy)?;
        Ok(self.residual.forward(&projected, input, policy)?)
    }
}

/// Self-attention followed by its output step.
#[derive(Debug)]
pub struct AttentionBlock {
    self_attention: SelfAttention,
    output: AttentionOutput,
}

impl AttentionBlock {
    pub fn new(self_attention: SelfAttention, output: AttentionOutput) -> Self {
        Self {
            self_attention,
            output,
        }
    }

    /// Loads the `self` and `output` scopes of a layer's `attention` builder.
    pub fn load(config: &XlmRobertaConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let self_attention = SelfAttention::load(config, vb.pp("self"))?;
        let output = AttentionOutput::load(config, vb.pp("output"))?;
        Ok(Self::new(self_attention, output))
    }

    pub fn self_attention(&self) -> &SelfAttention {
        &self.self_attention
    }

    pub fn set_training(&self, training: bool) {
        self.self_attention.set_training(training);
        self.output.set_training(training);
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        head_mask: Option<&Tensor>,
        output_attentions: bool,
        policy: &PrecisionPolicy,
    ) -> Result<AttentionResult, ModelError> {
        let attended = self.self_attention.forward(
            hidden,
            attention_mask,
            head_mask,
            output_attentions,
            policy,
        )?;
        Ok(AttentionResult {
            context: self.output.forward(&attended.context, hidden, policy)?,
            probs: attended.probs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attention::masks::MASK_VALUE;
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;

    fn small_config() -> XlmRobertaConfig {
        let mut config = XlmRobertaConfig::new(8, 1, 16, 2, 16);
        config.vocab_size = 32;
        config
    }

    fn random_self_attention(config: &XlmRobertaConfig) -> SelfAttention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        SelfAttention::load(config, vb).unwrap()
    }

    fn identity(hidden: usize) -> Linear {
        let mut values = vec![0f32; hidden * hidden];
        for i in 0..hidden {
            values[i * hidden + i] = 1.0;
        }
        let weight = Tensor::from_vec(values, (hidden, hidden), &Device::Cpu).unwrap();
        let bias = Tensor::zeros(hidden, DType::F32, &Device::Cpu).unwrap();
        Linear::new(LinearConfig::new(hidden, hidden), weight, Some(bias)).unwrap()
    }

    #[test]
    fn split_then_merge_is_identity() -> candle_core::Result<()> {
        let config = small_config();
        let attention = random_self_attention(&config);
        let hidden = Tensor::arange(0f32, 48.0, &Device::Cpu)?.reshape((2, 3, 8))?;

        let split = attention.split_heads(&hidden).unwrap();
        assert_eq!(split.dims(), &[2, 2, 3, 4]);
        // Head 1 owns channels 4..8.
        assert_eq!(
            split.narrow(1, 1, 1)?.flatten_all()?.to_vec1::<f32>()?,
            hidden.narrow(2, 4, 4)?.flatten_all()?.to_vec1::<f32>()?
        );

        let merged = attention.merge_heads(&split).unwrap();
        assert_eq!(
            merged.flatten_all()?.to_vec1::<f32>()?,
            hidden.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn diagonal_mask_reproduces_values() -> candle_core::Result<()> {
        let config = small_config();
        let attention =
            SelfAttention::new(&config, identity(8), identity(8), identity(8)).unwrap();
        let hidden = Tensor::arange(0f32, 24.0, &Device::Cpu)?
            .affine(0.1, -1.0)?
            .reshape((1, 3, 8))?;
        let mut diagonal = vec![MASK_VALUE; 9];
        for i in 0..3 {
            diagonal[i * 3 + i] = 0.0;
        }
        let mask = Tensor::from_vec(diagonal, (1, 1, 3, 3), &Device::Cpu)?;

        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let result = attention
            .forward(&hidden, Some(&mask), None, false, &policy)
            .unwrap();
        let diff = result
            .context
            .sub(&hidden)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn probabilities_are_returned_on_request() -> candle_core::Result<()> {
        let config = small_config();
        let attention = random_self_attention(&config);
        let hidden = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let silent = attention.forward(&hidden, None, None, false, &policy).unwrap();
        assert!(silent.probs.is_none());
        assert_eq!(silent.context.dims(), &[2, 5, 8]);

        let probs = attention
            .forward(&hidden, None, None, true, &policy)
            .unwrap()
            .probs
            .expect("probabilities requested");
        assert_eq!(probs.dims(), &[2, 2, 5, 5]);
        let sums = probs.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn scores_scale_by_head_size() -> candle_core::Result<()> {
        // With identity projections the score for (i, j) is <x_i, x_j> / sqrt(head_size).
        let config = small_config();
        let attention =
            SelfAttention::new(&config, identity(8), identity(8), identity(8)).unwrap();
        let hidden = Tensor::new(
            &[[[1f32, 0., 0., 0., 0., 0., 0., 0.], [0., 0., 0., 0., 0., 0., 0., 0.]]],
            &Device::Cpu,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let probs = attention
            .forward(&hidden, None, None, true, &policy)
            .unwrap()
            .probs
            .expect("probabilities requested");

        // Head 0, query 0: logits [1/2, 0] with head_size 4.
        let row = probs.get(0)?.get(0)?.get(0)?.to_vec1::<f32>()?;
        let expected = 1.0 / (1.0 + (-0.5f32).exp());
        assert!((row[0] - expected).abs() < 1e-6, "{row:?}");
        Ok(())
    }

    #[test]
    fn mismatched_projection_is_rejected() {
        let config = small_config();
        let wide = Linear::new(
            LinearConfig::new(8, 16),
            Tensor::zeros((16, 8), DType::F32, &Device::Cpu).unwrap(),
            Some(Tensor::zeros(16, DType::F32, &Device::Cpu).unwrap()),
        )
        .unwrap();
        let err = SelfAttention::new(&config, wide, identity(8), identity(8)).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch(_)));
    }

    #[test]
    fn output_adds_residual_before_norm() -> candle_core::Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let output = AttentionOutput::load(&config, vb).unwrap();
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let context = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu)?;
        let input = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu)?;
        let out = output.forward(&context, &input, &policy).unwrap();

        let projected = output.dense.forward(&context, &policy)?;
        let expected = candle_nn::ops::layer_norm(
            &projected.add(&input)?,
            &Tensor::ones(8, DType::F32, &Device::Cpu)?,
            &Tensor::zeros(8, DType::F32, &Device::Cpu)?,
            1e-5,
        )?;
        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
