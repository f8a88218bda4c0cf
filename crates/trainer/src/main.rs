use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use tch::Device;

use gpt_core::{ModelConfig, ModelPreset};
use trainer::{load_tokenizer, CorpusBatcher, TextTokenizer, Trainer, TrainerConfig};

#[derive(Parser)]
#[command(author, version, about = "Train a GPT-2 style language model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on a text corpus
    Train {
        /// UTF-8 text file to train on
        #[arg(long, default_value = "data/input.txt")]
        corpus: PathBuf,

        /// Hugging Face tokenizer.json (GPT-2 BPE)
        #[arg(long, default_value = "data/tokenizer.json")]
        tokenizer: PathBuf,

        /// Model config (YAML); defaults apply when the file is missing
        #[arg(long, default_value = "configs/model_config.yaml")]
        model_config: PathBuf,

        /// Training config (YAML); defaults apply when the file is missing
        #[arg(long, default_value = "configs/training_config.yaml")]
        training_config: PathBuf,

        /// Use a GPT-2 preset architecture instead of the model config
        #[arg(long, value_parser = parse_preset)]
        preset: Option<ModelPreset>,

        /// Initialize from pretrained GPT-2 weights (requires --preset)
        #[arg(long, requires = "preset")]
        weights: Option<PathBuf>,

        /// Resume from a checkpoint written by a previous run
        #[arg(long, conflicts_with = "weights")]
        resume: Option<PathBuf>,

        #[arg(long)]
        steps: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        seq_len: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,
    },
    /// Import pretrained GPT-2 weights and save them as a native checkpoint
    Import {
        #[arg(long, value_parser = parse_preset)]
        preset: ModelPreset,

        /// GPT-2 safetensors file
        #[arg(long)]
        weights: PathBuf,

        #[arg(short, long, default_value = "checkpoints/pretrained")]
        output_dir: PathBuf,
    },
}

fn parse_preset(s: &str) -> std::result::Result<ModelPreset, String> {
    s.parse().map_err(|e: gpt_core::ModelError| e.to_string())
}

fn load_yaml_or_default<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    } else {
        info!("{:?} not found, using defaults", path);
        Ok(T::default())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let device = Device::cuda_if_available();
    info!("device: {:?}", device);

    match cli.command {
        Commands::Train {
            corpus,
            tokenizer,
            model_config,
            training_config,
            preset,
            weights,
            resume,
            steps,
            batch_size,
            seq_len,
            learning_rate,
        } => {
            let model_config: ModelConfig = match preset {
                Some(preset) => preset.config(),
                None => load_yaml_or_default(&model_config)?,
            };

            let mut trainer_config: TrainerConfig = load_yaml_or_default(&training_config)?;
            if let Some(steps) = steps {
                trainer_config.max_steps = steps;
            }
            if let Some(batch_size) = batch_size {
                trainer_config.batch_size = batch_size;
            }
            if let Some(seq_len) = seq_len {
                trainer_config.seq_len = seq_len;
            }
            if let Some(learning_rate) = learning_rate {
                trainer_config.learning_rate = learning_rate;
            }

            let tokenizer = load_tokenizer(&tokenizer)?;
            ensure!(
                TextTokenizer::vocab_size(&tokenizer) as i64 <= model_config.vocab_size,
                "tokenizer has {} tokens but the model vocabulary is {}",
                TextTokenizer::vocab_size(&tokenizer),
                model_config.vocab_size
            );

            let mut trainer = match (preset, weights) {
                (Some(preset), Some(weights)) => {
                    Trainer::from_pretrained(preset, weights, trainer_config.clone(), device)?
                }
                _ => Trainer::new(model_config, trainer_config.clone(), device)?,
            };
            if let Some(resume) = resume {
                trainer.resume(resume)?;
            }

            let mut batcher = CorpusBatcher::from_file(
                &corpus,
                &tokenizer,
                trainer_config.batch_size,
                trainer_config.seq_len,
                device,
            )?;

            let history = trainer.train(&mut batcher)?;
            if let Some(last) = history.last() {
                info!("Training complete! final loss: {:.6}", last.loss);
            }
        }
        Commands::Import {
            preset,
            weights,
            output_dir,
        } => {
            let trainer_config = TrainerConfig {
                seq_len: preset.config().max_seq_len as usize,
                ..TrainerConfig::default()
            };
            let trainer = Trainer::from_pretrained(preset, &weights, trainer_config, device)?;
            let path = trainer.save_to(&output_dir, "model.safetensors")?;
            info!("Wrote {} to {:?}", preset, path);
        }
    }

    Ok(())
}
