use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Vocabulary size shared by every GPT-2 checkpoint:
/// 50,000 BPE merges + 256 byte tokens + 1 `<|endoftext|>` token.
pub const GPT2_VOCAB_SIZE: i64 = 50257;
/// Context window shared by every GPT-2 checkpoint.
pub const GPT2_MAX_SEQ_LEN: i64 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Maximum context window size (max sequence length).
    pub max_seq_len: i64,
    /// Size of the vocabulary.
    pub vocab_size: i64,
    /// Number of transformer blocks.
    pub n_layer: i64,
    /// Number of attention heads.
    pub n_head: i64,
    /// Dimension of the token embeddings (and internal transformer states).
    pub n_embd: i64,
    /// Hidden width of the feed-forward block is `ffn_dim_multiplier * n_embd`
    /// when set, `4 * n_embd` otherwise.
    pub ffn_dim_multiplier: Option<f64>,
    /// Feed-forward hidden width is rounded up to a multiple of this.
    pub multiple_of: i64,
    /// LayerNorm epsilon value (for numerical stability).
    pub layer_norm_epsilon: f64,
    /// Scale of the attention projection init: std = alpha / sqrt(n_embd).
    pub attn_init_alpha: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelPreset::Gpt2.config()
    }
}

impl ModelConfig {
    pub fn head_size(&self) -> i64 {
        self.n_embd / self.n_head
    }

    pub fn ffn_hidden_dim(&self) -> i64 {
        match self.ffn_dim_multiplier {
            Some(multiplier) => {
                let hidden = (multiplier * self.n_embd as f64).ceil() as i64;
                (hidden + self.multiple_of - 1) / self.multiple_of * self.multiple_of
            }
            None => 4 * self.n_embd,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("max_seq_len", self.max_seq_len),
            ("vocab_size", self.vocab_size),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_embd", self.n_embd),
        ];
        for (name, value) in sizes {
            if value <= 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if let Some(multiplier) = self.ffn_dim_multiplier {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(ModelError::InvalidConfig(format!(
                    "ffn_dim_multiplier must be finite and positive, got {}",
                    multiplier
                )));
            }
            if self.multiple_of <= 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "multiple_of must be positive, got {}",
                    self.multiple_of
                )));
            }
        }
        Ok(())
    }

    /// Native parameter names and shapes, in the order the model creates them.
    /// Linear weights are `[out, in]`.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<i64>)> {
        let e = self.n_embd;
        let hidden = self.ffn_hidden_dim();
        let mut shapes = vec![
            ("transformer.wte.weight".to_string(), vec![self.vocab_size, e]),
            ("transformer.wpe.weight".to_string(), vec![self.max_seq_len, e]),
        ];
        for i in 0..self.n_layer {
            let p = format!("transformer.h.{}", i);
            shapes.extend([
                (format!("{}.ln_1.weight", p), vec![e]),
                (format!("{}.ln_1.bias", p), vec![e]),
                (format!("{}.attn.c_attn.weight", p), vec![3 * e, e]),
                (format!("{}.attn.c_attn.bias", p), vec![3 * e]),
                (format!("{}.attn.c_proj.weight", p), vec![e, e]),
                (format!("{}.attn.c_proj.bias", p), vec![e]),
                (format!("{}.ln_2.weight", p), vec![e]),
                (format!("{}.ln_2.bias", p), vec![e]),
                (format!("{}.mlp.c_fc.weight", p), vec![hidden, e]),
                (format!("{}.mlp.c_fc.bias", p), vec![hidden]),
                (format!("{}.mlp.c_proj.weight", p), vec![e, hidden]),
                (format!("{}.mlp.c_proj.bias", p), vec![e]),
            ]);
        }
        shapes.extend([
            ("transformer.ln_f.weight".to_string(), vec![e]),
            ("transformer.ln_f.bias".to_string(), vec![e]),
            ("lm_head.weight".to_string(), vec![self.vocab_size, e]),
        ]);
        shapes
    }

    pub fn num_parameters(&self) -> i64 {
        self.parameter_shapes()
            .iter()
            .map(|(_, shape)| shape.iter().product::<i64>())
            .sum()
    }
}

/// The four published GPT-2 checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPreset {
    Gpt2,
    Gpt2Medium,
    Gpt2Large,
    Gpt2Xl,
}

impl ModelPreset {
    pub const ALL: [ModelPreset; 4] = [
        ModelPreset::Gpt2,
        ModelPreset::Gpt2Medium,
        ModelPreset::Gpt2Large,
        ModelPreset::Gpt2Xl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelPreset::Gpt2 => "gpt2",
            ModelPreset::Gpt2Medium => "gpt2-medium",
            ModelPreset::Gpt2Large => "gpt2-large",
            ModelPreset::Gpt2Xl => "gpt2-xl",
        }
    }

    pub fn config(&self) -> ModelConfig {
        // (n_layer, n_head, n_embd)
        let (n_layer, n_head, n_embd) = match self {
            ModelPreset::Gpt2 => (12, 12, 768),        // 124M params
            ModelPreset::Gpt2Medium => (24, 16, 1024), // 350M params
            ModelPreset::Gpt2Large => (36, 20, 1280),  // 774M params
            ModelPreset::Gpt2Xl => (48, 25, 1600),     // 1558M params
        };
        ModelConfig {
            max_seq_len: GPT2_MAX_SEQ_LEN,
            vocab_size: GPT2_VOCAB_SIZE,
            n_layer,
            n_head,
            n_embd,
            ffn_dim_multiplier: None,
            multiple_of: 256,
            layer_norm_epsilon: 1e-5,
            attn_init_alpha: 0.5,
        }
    }
}

impl fmt::Display for ModelPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelPreset {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        ModelPreset::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| ModelError::UnknownPreset(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_gpt2_small() {
        let config = ModelConfig::default();
        assert_eq!(config, ModelPreset::Gpt2.config());
        assert_eq!(config.head_size(), 64);
        assert_eq!(config.ffn_hidden_dim(), 3072);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn presets_share_vocab_and_context() {
        for preset in ModelPreset::ALL {
            let config = preset.config();
            assert_eq!(config.vocab_size, 50257);
            assert_eq!(config.max_seq_len, 1024);
            assert!(config.validate().is_ok(), "{} should be valid", preset);
            assert_eq!(preset.as_str().parse::<ModelPreset>().unwrap(), preset);
        }
        assert_eq!(ModelPreset::Gpt2Xl.config().head_size(), 64);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let err = "gpt3".parse::<ModelPreset>().unwrap_err();
        assert!(matches!(err, ModelError::UnknownPreset(name) if name == "gpt3"));
    }

    #[test]
    fn embedding_width_must_divide_by_heads() {
        let config = ModelConfig {
            n_embd: 100,
            n_head: 12,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ModelError::InvalidConfig(_))));

        let config = ModelConfig {
            n_layer: 0,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn ffn_hidden_dim_rounds_up_to_multiple() {
        let config = ModelConfig {
            n_embd: 100,
            n_head: 4,
            ffn_dim_multiplier: Some(2.7),
            multiple_of: 64,
            ..ModelConfig::default()
        };
        // 270 rounded up to a multiple of 64
        assert_eq!(config.ffn_hidden_dim(), 320);
    }

    #[test]
    fn ffn_sizing_must_be_finite_and_positive() {
        for multiplier in [f64::INFINITY, f64::NAN, 0.0, -1.5] {
            let config = ModelConfig {
                ffn_dim_multiplier: Some(multiplier),
                ..ModelConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ModelError::InvalidConfig(_))),
                "multiplier {} accepted",
                multiplier
            );
        }

        let config = ModelConfig {
            ffn_dim_multiplier: Some(2.0),
            multiple_of: 0,
            ..ModelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn gpt2_parameter_count_with_untied_head() {
        let config = ModelPreset::Gpt2.config();
        // 124,439,808 for the tied checkpoint plus a separate 50257x768 head.
        assert_eq!(config.num_parameters(), 124_439_808 + 50257 * 768);
        assert_eq!(config.parameter_shapes().len(), 2 + 12 * 12 + 3);
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let config: ModelConfig = serde_yaml::from_str("n_layer: 2\nn_head: 2\nn_embd: 64\n").unwrap();
        assert_eq!(config.n_layer, 2);
        assert_eq!(config.n_embd, 64);
        assert_eq!(config.vocab_size, GPT2_VOCAB_SIZE);
        assert_eq!(config.max_seq_len, GPT2_MAX_SEQ_LEN);
    }
}
