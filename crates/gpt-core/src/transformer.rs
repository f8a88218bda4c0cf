use tch::{nn, Kind, Tensor};

use crate::attention::CausalSelfAttention;
use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

fn layer_norm(vs: nn::Path, config: &ModelConfig) -> nn::LayerNorm {
    let ln_config = nn::LayerNormConfig {
        eps: config.layer_norm_epsilon,
        ..Default::default()
    };
    nn::layer_norm(vs, vec![config.n_embd], ln_config)
}

/// FeedForward block (MLP)
pub struct FeedForward {
    c_fc: nn::Linear,
    c_proj: nn::Linear,
}

impl FeedForward {
    pub fn new(vs: &nn::Path, n_embd: i64, hidden_dim: i64) -> Self {
        let c_fc = nn::linear(vs / "c_fc", n_embd, hidden_dim, Default::default());
        let c_proj = nn::linear(vs / "c_proj", hidden_dim, n_embd, Default::default());

        Self { c_fc, c_proj }
    }

    /// The tanh approximation is what the GPT-2 checkpoints were trained with.
    pub fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.c_fc).gelu("tanh").apply(&self.c_proj)
    }
}

/// Transformer Block
pub struct Block {
    ln_1: nn::LayerNorm,
    attn: CausalSelfAttention,
    ln_2: nn::LayerNorm,
    mlp: FeedForward,
}

impl Block {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Result<Self> {
        let ln_1 = layer_norm(vs / "ln_1", config);
        let attn = CausalSelfAttention::new(&(vs / "attn"), config)?;
        let ln_2 = layer_norm(vs / "ln_2", config);
        let mlp = FeedForward::new(&(vs / "mlp"), config.n_embd, config.ffn_hidden_dim());

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x + self.attn.forward(&x.apply(&self.ln_1))?;
        let mlp_out = self.mlp.forward(&x.apply(&self.ln_2));
        Ok(x + mlp_out)
    }
}

/// Full GPT Model
///
/// The token embedding and the output head are separate matrices. GPT-2 ties
/// them; here they stay untied and the importer fills both.
pub struct Transformer {
    wte: nn::Embedding,
    wpe: nn::Embedding,
    blocks: Vec<Block>,
    ln_f: nn::LayerNorm,
    lm_head: nn::Linear,
    pub config: ModelConfig,
}

impl Transformer {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Result<Self> {
        config.validate()?;

        let t = vs / "transformer";
        let wte = nn::embedding(&t / "wte", config.vocab_size, config.n_embd, Default::default());
        let wpe = nn::embedding(&t / "wpe", config.max_seq_len, config.n_embd, Default::default());

        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&(&t / "h" / i), config))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = layer_norm(&t / "ln_f", config);
        let lm_head = nn::linear(
            vs / "lm_head",
            config.n_embd,
            config.vocab_size,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config: config.clone(),
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Token embeddings alone: [batch, seq_len] -> [batch, seq_len, n_embd]
    pub fn token_embeddings(&self, idx: &Tensor) -> Tensor {
        idx.apply(&self.wte)
    }

    /// Token plus position embeddings for positions `0..seq_len`.
    pub fn embed(&self, idx: &Tensor) -> Result<Tensor> {
        let (_b, t) = idx.size2()?;
        if t > self.config.max_seq_len {
            return Err(ModelError::SequenceTooLong {
                seq_len: t,
                max_seq_len: self.config.max_seq_len,
            });
        }

        let pos = Tensor::arange(t, (Kind::Int64, idx.device())); // (T)
        let pos_emb = pos.apply(&self.wpe); // (T, n_embd), broadcast over batch
        let tok_emb = idx.apply(&self.wte); // (B, T, n_embd)
        Ok(tok_emb + pos_emb)
    }

    /// Blocks, final norm and vocabulary projection over already-embedded
    /// activations: [batch, seq_len, n_embd] -> [batch, seq_len, vocab_size]
    pub fn forward_embeddings(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.shallow_clone();
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x.apply(&self.ln_f).apply(&self.lm_head))
    }

    /// Returns the logits and, when `targets` is given, the mean cross-entropy
    /// over every position of every sequence in the batch.
    pub fn forward(&self, idx: &Tensor, targets: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let x = self.embed(idx)?;
        let logits = self.forward_embeddings(&x)?;

        let loss = match targets {
            Some(targets) => Some(Self::loss(&logits, targets)?),
            None => None,
        };
        Ok((logits, loss))
    }

    fn loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (b, t, v) = logits.size3()?;
        if targets.size() != [b, t] {
            return Err(ModelError::TargetShape {
                expected: vec![b, t],
                found: targets.size(),
            });
        }

        // Reshape for loss: [B*T, V] vs [B*T]
        let logits_flat = logits.view([b * t, v]);
        let targets_flat = targets.view([b * t]);
        Ok(logits_flat.cross_entropy_for_logits(&targets_flat))
    }
}
