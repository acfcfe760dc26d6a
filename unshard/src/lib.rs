//! Turning merged training checkpoints into loadable causal-LM weights.
//!
//! [`pth`] reads what a checkpoint-merge tool leaves behind, [`state_dict`]
//! unwraps and renames its keys, [`architecture`] matches them against the
//! model described by `config.json`, and [`torch`] / [`safetensors`](crate::safetensors) write
//! the result back out.

pub mod architecture;
pub mod error;
pub mod pth;
pub mod safetensors;
pub mod state_dict;
pub mod torch;

pub use error::{Error, Result};
