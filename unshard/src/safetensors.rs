use std::{collections::HashMap, path::Path};

use candle_core::Tensor;
use safetensors::serialize_to_file;

use crate::Result;

/// Writes `entries` as a single `.safetensors` file tagged as torch weights.
pub fn save<'a, P, I, S>(path: P, entries: I) -> Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = (S, &'a Tensor)>,
    S: AsRef<str> + Ord + std::fmt::Display,
{
    let tensors = entries
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.contiguous()?)))
        .collect::<Result<Vec<_>>>()?;
    let metadata = HashMap::from([("format".to_owned(), "pt".to_owned())]);
    serialize_to_file(tensors, &Some(metadata), path.as_ref())?;
    Ok(())
}
