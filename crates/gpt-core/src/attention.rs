use tch::{nn, IndexOp, Kind, Tensor};

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

pub struct CausalSelfAttention {
    c_attn: nn::Linear,
    c_proj: nn::Linear,
    n_head: i64,
    n_embd: i64,
    max_seq_len: i64,
    // not really a 'bias', more of a mask; kept out of the VarStore
    bias: Tensor,
}

impl CausalSelfAttention {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let n_embd = config.n_embd;

        let stdev = config.attn_init_alpha / (n_embd as f64).sqrt();
        let linear_config = nn::LinearConfig {
            ws_init: nn::Init::Randn { mean: 0.0, stdev },
            ..Default::default()
        };

        let c_attn = nn::linear(vs / "c_attn", n_embd, 3 * n_embd, linear_config);
        let c_proj = nn::linear(vs / "c_proj", n_embd, n_embd, linear_config);

        // Causal mask
        let mask = Tensor::ones([config.max_seq_len, config.max_seq_len], (Kind::Bool, vs.device()))
            .tril(0)
            .reshape([1, 1, config.max_seq_len, config.max_seq_len]);

        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            n_embd,
            max_seq_len: config.max_seq_len,
            bias: mask,
        })
    }

    /// Attention probabilities: [batch, n_head, seq_len, seq_len].
    /// Row `i` holds the weights query `i` puts on each key; keys past `i` get 0.
    pub fn attention_probs(&self, x: &Tensor) -> Result<Tensor> {
        let (q, k, _v) = self.project_heads(x)?;
        Ok(self.causal_softmax(&q, &k))
    }

    /// x: [batch, seq_len, n_embd] -> [batch, seq_len, n_embd]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.size3()?;
        let (q, k, v) = self.project_heads(x)?;

        let att = self.causal_softmax(&q, &k);
        let y = att.matmul(&v); // (B, nh, T, T) x (B, nh, T, hs) -> (B, nh, T, hs)
        let y = y.transpose(1, 2).contiguous().view([b, t, c]);
        Ok(y.apply(&self.c_proj))
    }

    /// Splits the fused projection into per-head q, k, v of shape [B, nh, T, hs].
    fn project_heads(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, t, c) = x.size3()?;
        if t > self.max_seq_len {
            return Err(ModelError::SequenceTooLong {
                seq_len: t,
                max_seq_len: self.max_seq_len,
            });
        }
        if c != self.n_embd {
            return Err(ModelError::Torch(tch::TchError::Shape(format!(
                "expected embedding width {}, got {}",
                self.n_embd, c
            ))));
        }

        let qkv = x.apply(&self.c_attn);
        let chunks = qkv.chunk(3, -1);
        let head_size = c / self.n_head;

        let q = chunks[0].view([b, t, self.n_head, head_size]).transpose(1, 2);
        let k = chunks[1].view([b, t, self.n_head, head_size]).transpose(1, 2);
        let v = chunks[2].view([b, t, self.n_head, head_size]).transpose(1, 2);
        Ok((q, k, v))
    }

    fn causal_softmax(&self, q: &Tensor, k: &Tensor) -> Tensor {
        let t = q.size()[2];
        let head_size = q.size()[3];

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_size as f64).sqrt());
        // follows q, so the model keeps working after VarStore::set_device
        let mask = self.bias.i((.., .., ..t, ..t)).to_device(q.device());
        att.masked_fill(&mask.logical_not(), f64::NEG_INFINITY)
            .softmax(-1, Kind::Float)
    }
}
