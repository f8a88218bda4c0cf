pub mod dataset;
pub mod tokenizer;
pub mod train;

pub use dataset::CorpusBatcher;
pub use tokenizer::{load_tokenizer, TextTokenizer};
pub use train::{StepStats, Trainer};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub seq_len: usize,
    pub max_steps: usize,
    pub seed: i64,
    pub weight_decay: Option<f64>,
    /// Print a status line every `log_every` steps.
    pub log_every: usize,
    /// Save a checkpoint every `save_every` steps; never when unset.
    pub save_every: Option<usize>,
    pub checkpoint_dir: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            batch_size: 16,
            seq_len: 1024,
            max_steps: 50,
            seed: 1337,
            weight_decay: Some(0.01),
            log_every: 1,
            save_every: None,
            checkpoint_dir: "./checkpoints".to_string(),
        }
    }
}
