//! Readers for the single-file checkpoints produced by the merge tool.

use std::{fs::File, path::Path};

use candle_core::{pickle::PthTensors, safetensors::Load, Device};
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::{
    state_dict::{Checkpoint, WRAPPER_KEY},
    Error, Result,
};

/// Loads a merged checkpoint into host memory.
///
/// `.safetensors` files are flat; every other extension is read as a torch
/// zip archive, keeping a `model_state_dict` sub-dict when there is one.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let path = path.as_ref();
    let checkpoint = if path.extension().is_some_and(|ext| ext.eq("safetensors")) {
        load_safetensors(path)?
    } else {
        load_pth(path)?
    };
    info!(path = %path.display(), entries = checkpoint.len(), "loaded merged checkpoint");
    Ok(checkpoint)
}

fn load_safetensors(path: &Path) -> Result<Checkpoint> {
    let file = File::open(path).map_err(Error::io(path))?;
    let buffer = unsafe { MmapOptions::new().map(&file) }.map_err(Error::io(path))?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let tensors = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| Ok((name, view.load(&Device::Cpu)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(tensors.into_iter().collect())
}

fn load_pth(path: &Path) -> Result<Checkpoint> {
    let mut checkpoint = read_dict(&PthTensors::new(path, None)?)?;
    // candle only hands out a nested dict when asked for it by key
    match PthTensors::new(path, Some(WRAPPER_KEY)) {
        Ok(wrapped) => checkpoint.push_dict(WRAPPER_KEY, read_dict(&wrapped)?),
        Err(err) => debug!(%err, "no `{WRAPPER_KEY}` dict in checkpoint"),
    }
    Ok(checkpoint)
}

fn read_dict(pth: &PthTensors) -> Result<Checkpoint> {
    let mut names: Vec<_> = pth.tensor_infos().keys().cloned().collect();
    names.sort();
    let mut dict = Checkpoint::new();
    for name in names {
        if let Some(tensor) = pth.get(&name)? {
            dict.push_tensor(name, tensor);
        }
    }
    Ok(dict)
}
