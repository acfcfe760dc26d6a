use std::{fs, path::PathBuf};

use eyre::{bail, WrapErr};
use tracing::{info, warn};
use unshard::{
    architecture::{LoadReport, ModelConfig, Skeleton},
    pth::load_checkpoint,
    state_dict::{strip_prefix, DISTRIBUTED_PREFIX},
};

use crate::paths::ensure_exists;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WeightFormat {
    /// `pytorch_model.bin`, a `torch.save` zip archive.
    #[default]
    Legacy,
    /// `model.safetensors`.
    Safetensors,
}

impl WeightFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Legacy => "pytorch_model.bin",
            Self::Safetensors => "model.safetensors",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub merged_file: PathBuf,
    pub config_file: PathBuf,
    pub output_dir: PathBuf,
    pub format: WeightFormat,
    /// Refuse to write weights when more than this fraction of parameters
    /// would be left at their defaults. `None` accepts any mismatch.
    pub max_mismatch_ratio: Option<f64>,
}

/// Parses a mismatch limit: a finite fraction in `[0, 1]`.
pub fn parse_mismatch_ratio(arg: &str) -> Result<f64, String> {
    let ratio: f64 = arg.parse().map_err(|err| format!("`{arg}` is not a number: {err}"))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("`{arg}` is not a fraction between 0 and 1"))
    }
}

/// Loads the merged checkpoint into the model described by the config and
/// writes weights plus config to the output directory.
pub fn convert(options: &ConvertOptions) -> eyre::Result<LoadReport> {
    let ConvertOptions {
        merged_file,
        config_file,
        output_dir,
        format,
        max_mismatch_ratio,
    } = options;
    info!("converting merged checkpoint to {}", format.file_name());
    if let Some(max) = max_mismatch_ratio {
        if !(0.0..=1.0).contains(max) {
            bail!("max mismatch ratio {max} is not a fraction between 0 and 1");
        }
    }
    ensure_exists(merged_file)?;
    ensure_exists(config_file)?;
    fs::create_dir_all(output_dir)
        .wrap_err_with(|| format!("failed to create {}", output_dir.display()))?;

    info!(config = %config_file.display(), "loading model config");
    let config = ModelConfig::from_file(config_file)?;
    let skeleton = Skeleton::from_config(&config)?;
    info!(
        class = skeleton.architecture().class_name(),
        params = skeleton.params().len(),
        "initialised model skeleton"
    );

    let checkpoint = load_checkpoint(merged_file)?;
    let weights = strip_prefix(checkpoint.into_state_dict(), DISTRIBUTED_PREFIX)?;
    info!(tensors = weights.len(), "cleaned weight names");

    let (state, report) = skeleton.load_state_dict(weights)?;
    if report.is_clean() {
        info!("all weights matched the model");
    } else {
        warn!(%report, "weights only partially matched the model");
        for name in &report.missing {
            warn!(%name, "missing from checkpoint");
        }
        for name in &report.unexpected {
            warn!(%name, "not part of the model");
        }
        for mismatch in &report.mismatched {
            warn!(
                name = %mismatch.name,
                expected = ?mismatch.expected,
                found = ?mismatch.found,
                "shape mismatch"
            );
        }
    }
    if let Some(max) = max_mismatch_ratio {
        let ratio = report.mismatch_ratio();
        if ratio > *max {
            bail!("{:.1}% of parameters did not load (limit {:.1}%): {report}", ratio * 100., max * 100.);
        }
    }

    let weights_path = output_dir.join(format.file_name());
    info!(path = %weights_path.display(), "saving weights");
    match format {
        WeightFormat::Legacy => unshard::torch::save_state_dict(
            &weights_path,
            state.iter().map(|(name, tensor)| (name.as_str(), tensor)),
        )?,
        WeightFormat::Safetensors => unshard::safetensors::save(
            &weights_path,
            state.iter().map(|(name, tensor)| (name.as_str(), tensor)),
        )?,
    }
    config.save(
        output_dir.join("config.json"),
        Skeleton::DTYPE,
        skeleton.architecture().class_name(),
    )?;
    info!(output_dir = %output_dir.display(), "conversion finished");
    Ok(report)
}
