use clap::Parser;
use tracing::info;
use unshard_cli::{fetch::Snapshot, logging};

#[derive(Debug, Parser)]
#[command(name = "fetch_model")]
#[command(about = "Downloads a full, symlink-free copy of a Hugging Face model repository", long_about = None)]
struct Args {
    /// Repository id on the hub
    #[arg(short = 'm', long, default_value = "Qwen/Qwen3-1.7B-FP8")]
    model_id: String,
    /// Directory that receives the model files
    #[arg(short = 'o', long, default_value = "../pretrain_models/Qwen3-1.7B-FP8")]
    local_dir: std::path::PathBuf,
    /// Branch, tag or commit (defaults to `main`)
    #[arg(short = 'r', long)]
    revision: Option<String>,
    /// Access token (defaults to the token stored in the hub cache)
    #[arg(long)]
    token: Option<String>,
    /// Hub cache directory (defaults to `~/.cache/huggingface/hub`)
    #[arg(long)]
    cache_dir: Option<std::path::PathBuf>,
    /// Hides the download progress bars
    #[arg(long)]
    no_progress: bool,
}

fn main() -> eyre::Result<()> {
    logging::init();
    let Args {
        model_id,
        local_dir,
        revision,
        token,
        cache_dir,
        no_progress,
    } = Args::parse();
    let snapshot = Snapshot {
        revision,
        cache_dir,
        token,
        progress: !no_progress,
        ..Snapshot::new(model_id, local_dir)
    };
    let files = snapshot.download()?;
    info!(
        files = files.len(),
        local_dir = %snapshot.local_dir.display(),
        "model downloaded"
    );
    Ok(())
}
