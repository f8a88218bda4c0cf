use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tch::{Kind, Tensor};

use crate::error::{ModelError, Result};

/// Reads every tensor of a safetensors file into host memory, keyed by name.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Tensor>> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut checkpoint = HashMap::new();
    for (name, view) in tensors.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        let kind = match view.dtype() {
            safetensors::Dtype::F64 => Kind::Double,
            safetensors::Dtype::F32 => Kind::Float,
            safetensors::Dtype::F16 => Kind::Half,
            safetensors::Dtype::BF16 => Kind::BFloat16,
            safetensors::Dtype::I64 => Kind::Int64,
            safetensors::Dtype::U8 => Kind::Uint8,
            safetensors::Dtype::BOOL => Kind::Bool,
            other => return Err(ModelError::UnsupportedDtype(format!("{:?} ({})", other, name))),
        };

        let tensor = Tensor::f_from_data_size(view.data(), &shape, kind)?;
        debug!("Read tensor: {} {:?}", name, shape);
        checkpoint.insert(name, tensor);
    }

    Ok(checkpoint)
}

/// Maps Hugging Face GPT-2 names onto this crate's layout.
///
/// `GPT2Model` files store the trunk without the `transformer.` prefix and carry
/// no `lm_head.weight`, since the head is tied to `wte`. The head is filled
/// from `wte` in that case.
pub fn normalize_hf_names(checkpoint: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    let mut normalized: HashMap<String, Tensor> = checkpoint
        .into_iter()
        .map(|(name, tensor)| {
            if name.starts_with("transformer.") || name.starts_with("lm_head.") {
                (name, tensor)
            } else {
                (format!("transformer.{}", name), tensor)
            }
        })
        .collect();

    if !normalized.contains_key("lm_head.weight") {
        if let Some(wte) = normalized.get("transformer.wte.weight") {
            let head = wte.shallow_clone();
            normalized.insert("lm_head.weight".to_string(), head);
        }
    }
    normalized
}
