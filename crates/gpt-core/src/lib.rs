pub mod attention;
pub mod config;
pub mod error;
pub mod pretrained;
pub mod safetensors_util;
pub mod transformer;

pub use attention::CausalSelfAttention;
pub use config::{ModelConfig, ModelPreset};
pub use error::{ModelError, Result};
pub use pretrained::{from_checkpoint, from_pretrained, import_weights};
pub use transformer::{Block, FeedForward, Transformer};
