use anyhow::{ensure, Context, Result};
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tch::{nn, nn::OptimizerConfig, Device, Tensor};

use gpt_core::{ModelConfig, ModelPreset, Transformer};

use crate::dataset::CorpusBatcher;
use crate::TrainerConfig;

/// Timing and loss of one optimizer step.
#[derive(Debug, Clone, Serialize)]
pub struct StepStats {
    pub step: usize,
    pub loss: f64,
    pub elapsed_ms: f64,
    pub tokens_per_sec: f64,
}

pub struct Trainer {
    config: TrainerConfig,
    model: Transformer,
    optimizer: nn::Optimizer,
    device: Device,
    vs: nn::VarStore,
}

impl Trainer {
    /// Fresh model, seeded from `trainer_config.seed`.
    pub fn new(
        model_config: ModelConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> Result<Self> {
        tch::manual_seed(trainer_config.seed);
        let vs = nn::VarStore::new(device);
        let model = Transformer::new(&vs.root(), &model_config)?;
        Self::with_model(vs, model, trainer_config)
    }

    /// Starts from a published GPT-2 checkpoint on disk.
    pub fn from_pretrained<P: AsRef<Path>>(
        preset: ModelPreset,
        weights: P,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> Result<Self> {
        tch::manual_seed(trainer_config.seed);
        let (vs, model) = gpt_core::from_pretrained(preset, weights.as_ref(), device)
            .with_context(|| format!("Failed to import {} from {:?}", preset, weights.as_ref()))?;
        Self::with_model(vs, model, trainer_config)
    }

    /// `model` must have been built on `vs`.
    pub fn with_model(vs: nn::VarStore, model: Transformer, config: TrainerConfig) -> Result<Self> {
        ensure!(
            config.seq_len as i64 <= model.config.max_seq_len,
            "seq_len {} exceeds the model's max_seq_len {}",
            config.seq_len,
            model.config.max_seq_len
        );

        let optimizer = nn::AdamW {
            wd: config.weight_decay.unwrap_or(0.0),
            ..Default::default()
        }
        .build(&vs, config.learning_rate)?;

        Ok(Self {
            config,
            model,
            optimizer,
            device: vs.device(),
            vs,
        })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Overwrites the parameters with a checkpoint written by `save_checkpoint`.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.vs
            .load(path)
            .with_context(|| format!("Failed to resume from {:?}", path))?;
        info!("Resumed parameters from {:?}", path);
        Ok(())
    }

    /// One forward/backward/update on a single batch. Returns the loss.
    pub fn step(&mut self, input: &Tensor, target: &Tensor) -> Result<f64> {
        let (_logits, loss) = self.model.forward(input, Some(target))?;
        let loss = loss.context("Model returned no loss for a batch with targets")?;

        self.optimizer.backward_step(&loss);

        Ok(loss.double_value(&[]))
    }

    pub fn train(&mut self, batcher: &mut CorpusBatcher) -> Result<Vec<StepStats>> {
        info!("Starting training with configuration: {:?}", self.config);
        info!(
            "Model: {} layers, {} heads, {} embd, {} parameters",
            self.model.config.n_layer,
            self.model.config.n_head,
            self.model.config.n_embd,
            self.model.config.num_parameters()
        );

        let tokens_per_batch = batcher.tokens_per_batch() as f64;
        let log_every = self.config.log_every.max(1);
        let mut history = Vec::with_capacity(self.config.max_steps);

        for step in 0..self.config.max_steps {
            let st = Instant::now();
            let (input, target) = batcher.next_batch();
            let loss = self.step(&input, &target)?;
            self.synchronize();

            let et = st.elapsed().as_secs_f64();
            let stats = StepStats {
                step,
                loss,
                elapsed_ms: et * 1e3,
                tokens_per_sec: tokens_per_batch / et.max(f64::EPSILON),
            };
            if step % log_every == 0 {
                info!(
                    "step {}, loss: {:.6}, et: {:.2}ms, tok/sec: {:.2}",
                    stats.step, stats.loss, stats.elapsed_ms, stats.tokens_per_sec
                );
            }
            history.push(stats);

            if let Some(every) = self.config.save_every {
                if every > 0 && (step + 1) % every == 0 {
                    self.save_checkpoint(step)?;
                }
            }
        }

        Ok(history)
    }

    fn synchronize(&self) {
        if let Device::Cuda(index) = self.device {
            tch::Cuda::synchronize(index as i64);
        }
    }

    pub fn save_checkpoint(&self, step: usize) -> Result<PathBuf> {
        let dir = PathBuf::from(&self.config.checkpoint_dir);
        self.save_to(&dir, &format!("checkpoint_step_{:06}.safetensors", step))
    }

    /// Writes the parameters as `dir/filename` and the model config as
    /// `dir/config.json`.
    pub fn save_to(&self, dir: &Path, filename: &str) -> Result<PathBuf> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create checkpoint dir {:?}", dir))?;
        }

        let path = dir.join(filename);
        self.vs.save(&path)?;

        let config_path = dir.join("config.json");
        let config_json = serde_json::to_string_pretty(&self.model.config)?;
        std::fs::write(config_path, config_json)?;

        info!("Saved checkpoint and config to {:?}", path);
        Ok(path)
    }
}
