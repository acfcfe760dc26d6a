use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use unshard_cli::{
    convert::{convert, parse_mismatch_ratio, ConvertOptions, WeightFormat},
    logging,
    merge::MergeTool,
    scratch::ScratchFile,
};

#[derive(Debug, Parser)]
#[command(name = "ds_to_bin")]
#[command(about = "Merges a sharded DeepSpeed checkpoint and converts it to Hugging Face weights", long_about = None)]
struct Args {
    /// Sharded checkpoint directory written during training
    #[arg(short = 'c', long, default_value = "saved_model/HLLM-0.pth/checkpoint")]
    checkpoint_dir: PathBuf,
    /// Script that merges the shards (DeepSpeed's `zero_to_fp32.py`)
    #[arg(short = 'z', long, default_value = "saved_model/HLLM-0.pth/zero_to_fp32.py")]
    merge_script: PathBuf,
    /// Interpreter used to run the merge script
    #[arg(long, default_value = "python3")]
    interpreter: String,
    /// `config.json` of the model the checkpoint was trained from
    #[arg(short = 'f', long, default_value = "pretrained_models/Qwen3-0.6B-FP8/config.json")]
    config: PathBuf,
    /// Directory that receives the weights and `config.json`
    #[arg(short = 'o', long, default_value = "pretrained_models/Qwen3-0.6B-FP8/inferred_model")]
    output_dir: PathBuf,
    /// Intermediate merged file, deleted on exit
    #[arg(short = 't', long, default_value = "./temp_merged_model.pt")]
    temp_file: PathBuf,
    /// Writes `model.safetensors` instead of `pytorch_model.bin`
    #[arg(long)]
    safe_serialization: bool,
    /// Fails when more than this fraction of parameters did not load (default: no limit)
    #[arg(long, value_parser = parse_mismatch_ratio)]
    max_mismatch_ratio: Option<f64>,
}

fn main() -> eyre::Result<()> {
    logging::init();
    let Args {
        checkpoint_dir,
        merge_script,
        interpreter,
        config,
        output_dir,
        temp_file,
        safe_serialization,
        max_mismatch_ratio,
    } = Args::parse();

    let scratch = ScratchFile::new(temp_file);
    MergeTool::new(interpreter, merge_script).run(&checkpoint_dir, scratch.path())?;
    let options = ConvertOptions {
        merged_file: scratch.path().to_owned(),
        config_file: config,
        output_dir,
        format: if safe_serialization {
            WeightFormat::Safetensors
        } else {
            WeightFormat::Legacy
        },
        max_mismatch_ratio,
    };
    convert(&options)?;
    drop(scratch);

    info!(output_dir = %options.output_dir.display(), "all done");
    Ok(())
}
