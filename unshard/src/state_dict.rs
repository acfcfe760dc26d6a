use std::collections::{btree_map::Entry, BTreeMap};

use candle_core::Tensor;
use tracing::debug;

use crate::{Error, Result};

/// Key under which training loops nest the model weights next to optimizer state.
pub const WRAPPER_KEY: &str = "model_state_dict";

/// Prefix added to every parameter name by data-parallel wrappers.
pub const DISTRIBUTED_PREFIX: &str = "module.";

pub type WeightMap = BTreeMap<String, Tensor>;

#[derive(Debug, Clone)]
pub enum CheckpointValue {
    Tensor(Tensor),
    Dict(Checkpoint),
}

/// The top-level object of a merged checkpoint, in file order.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint(Vec<(String, CheckpointValue)>);

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tensor(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.0.push((name.into(), CheckpointValue::Tensor(tensor)))
    }

    pub fn push_dict(&mut self, name: impl Into<String>, dict: Checkpoint) {
        self.0.push((name.into(), CheckpointValue::Dict(dict)))
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointValue> {
        self.0
            .iter()
            .find_map(|(key, value)| (key == name).then_some(value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CheckpointValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Picks the weights out of the checkpoint.
    ///
    /// A `model_state_dict` sub-dict wins over everything stored next to it;
    /// without one, the top-level tensors are the weights.
    pub fn into_state_dict(self) -> WeightMap {
        let mut entries = self.0;
        let position = entries.iter().position(|(key, value)| {
            key == WRAPPER_KEY && matches!(value, CheckpointValue::Dict(_))
        });
        if let Some(position) = position {
            if let (_, CheckpointValue::Dict(inner)) = entries.swap_remove(position) {
                entries = inner.0;
            }
        }
        entries
            .into_iter()
            .filter_map(|(key, value)| match value {
                CheckpointValue::Tensor(tensor) => Some((key, tensor)),
                CheckpointValue::Dict(dict) => {
                    debug!(key, entries = dict.len(), "skipping nested dict");
                    None
                }
            })
            .collect()
    }
}

impl FromIterator<(String, Tensor)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, tensor)| (key, CheckpointValue::Tensor(tensor)))
                .collect(),
        )
    }
}

/// Drops one leading `prefix` from every key that has it.
///
/// Fails rather than overwrite when a stripped key lands on an existing one.
pub fn strip_prefix(weights: WeightMap, prefix: &str) -> Result<WeightMap> {
    let mut cleaned = WeightMap::new();
    for (key, tensor) in weights {
        let new_key = key.strip_prefix(prefix).unwrap_or(&key).to_owned();
        match cleaned.entry(new_key) {
            Entry::Vacant(slot) => {
                slot.insert(tensor);
            }
            Entry::Occupied(slot) => {
                let key = slot.key().clone();
                return Err(Error::KeyCollision {
                    prefix: prefix.to_owned(),
                    first: key.clone(),
                    second: format!("{prefix}{key}"),
                    key,
                });
            }
        }
    }
    Ok(cleaned)
}
