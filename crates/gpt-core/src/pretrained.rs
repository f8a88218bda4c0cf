use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};
use tch::{nn, Device, Tensor};

use crate::config::{ModelConfig, ModelPreset};
use crate::error::{ModelError, Result};
use crate::safetensors_util::{load_checkpoint, normalize_hf_names};
use crate::transformer::Transformer;

/// OpenAI checkpoints store these as Conv1D weights (`[in, out]`), the
/// transpose of a Linear weight.
pub const TRANSPOSED_WEIGHTS: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

/// Buffers that may appear in a checkpoint but are not parameters.
const BUFFER_SUFFIXES: [&str; 2] = [".attn.bias", ".attn.masked_bias"];

fn is_buffer(name: &str) -> bool {
    BUFFER_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_transposed(name: &str) -> bool {
    TRANSPOSED_WEIGHTS.iter().any(|suffix| name.ends_with(suffix))
}

/// Copies `checkpoint` into the variables of `vs`.
///
/// Every name and shape is checked before the first copy; a mismatch returns
/// `CheckpointMismatch` and leaves the store untouched. Returns the number of
/// tensors copied.
pub fn import_weights(vs: &mut nn::VarStore, checkpoint: &HashMap<String, Tensor>) -> Result<usize> {
    let mut variables = vs.variables();

    let mut keys: Vec<&String> = checkpoint.keys().filter(|k| !is_buffer(k)).collect();
    keys.sort();

    if keys.len() != variables.len() {
        return Err(ModelError::CheckpointMismatch(format!(
            "mismatched keys: {} != {}",
            keys.len(),
            variables.len()
        )));
    }

    for name in &keys {
        let var = variables.get(name.as_str()).ok_or_else(|| {
            ModelError::CheckpointMismatch(format!("{} is not a parameter of the model", name))
        })?;
        let mut shape = checkpoint[name.as_str()].size();
        if is_transposed(name) {
            shape.reverse();
        }
        if shape != var.size() {
            return Err(ModelError::CheckpointMismatch(format!(
                "{}: checkpoint shape {:?} (as imported) != model shape {:?}",
                name,
                shape,
                var.size()
            )));
        }
    }

    tch::no_grad(|| -> Result<()> {
        for name in &keys {
            let source = &checkpoint[name.as_str()];
            let source = if is_transposed(name) {
                // special treatment for the Conv1D weights
                source.f_transpose(0, 1)?
            } else {
                source.shallow_clone()
            };
            if let Some(var) = variables.get_mut(name.as_str()) {
                let source = source.f_to_device(var.device())?.f_to_kind(var.kind())?;
                var.f_copy_(&source)?;
                debug!("Imported tensor: {}", name);
            }
        }
        Ok(())
    })?;

    Ok(keys.len())
}

/// Builds a model for `config` and fills it from a GPT-2 layout safetensors
/// file. The file is read before the model is allocated.
pub fn from_checkpoint<P: AsRef<Path>>(
    config: &ModelConfig,
    weights: P,
    device: Device,
) -> Result<(nn::VarStore, Transformer)> {
    let checkpoint = normalize_hf_names(load_checkpoint(weights)?);

    let mut vs = nn::VarStore::new(device);
    let model = Transformer::new(&vs.root(), config)?;
    let copied = import_weights(&mut vs, &checkpoint)?;
    info!("imported {} tensors ({} parameters)", copied, config.num_parameters());

    Ok((vs, model))
}

/// Loads one of the published GPT-2 checkpoints from a local file.
pub fn from_pretrained<P: AsRef<Path>>(
    preset: ModelPreset,
    weights: P,
    device: Device,
) -> Result<(nn::VarStore, Transformer)> {
    info!("loading weights from pretrained gpt: {}", preset);
    from_checkpoint(&preset.config(), weights, device)
}
