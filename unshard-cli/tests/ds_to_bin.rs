#![cfg(unix)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use candle_core::{pickle::PthTensors, Device, Tensor};
use equator::assert;
use unshard::state_dict::{Checkpoint, WRAPPER_KEY};

const TINY_QWEN3: &str = r#"{
    "architectures": ["Qwen3ForCausalLM"],
    "model_type": "qwen3",
    "vocab_size": 8,
    "hidden_size": 4,
    "intermediate_size": 8,
    "num_hidden_layers": 1,
    "num_attention_heads": 2,
    "num_key_value_heads": 1,
    "head_dim": 2,
    "tie_word_embeddings": true
}"#;

struct Workspace {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_owned();
        fs::create_dir(root.join("checkpoint")).unwrap();
        fs::write(root.join("checkpoint").join("zero_pp_rank_0_mp_rank_00_model_states.pt"), b"").unwrap();
        fs::write(root.join("config.json"), TINY_QWEN3).unwrap();
        Self { _dir: dir, root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn merge_script(&self, body: &str) -> PathBuf {
        let path = self.path("zero_to_fp32.sh");
        fs::write(&path, body).unwrap();
        path
    }

    fn run(&self, merge_script: &Path, checkpoint_dir: &Path) -> Output {
        Command::new(env!("CARGO_BIN_EXE_ds_to_bin"))
            .arg("--checkpoint-dir")
            .arg(checkpoint_dir)
            .arg("--merge-script")
            .arg(merge_script)
            .args(["--interpreter", "sh"])
            .arg("--config")
            .arg(self.path("config.json"))
            .arg("--output-dir")
            .arg(self.path("inferred_model"))
            .arg("--temp-file")
            .arg(self.path("temp_merged_model.pt"))
            .output()
            .unwrap()
    }
}

#[test]
fn merges_converts_and_cleans_up() {
    let ws = Workspace::new();
    let fixture = ws.path("fixture.pt");
    let norm = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu).unwrap();
    let bias = Tensor::new(&[9f32, 9.], &Device::Cpu).unwrap();
    let mut inner = Checkpoint::new();
    inner.push_tensor("module.model.norm.weight", norm);
    inner.push_tensor("module.layer1.weight", Tensor::ones(2, candle_core::DType::F32, &Device::Cpu).unwrap());
    inner.push_tensor("layer2.bias", bias);
    let mut checkpoint = Checkpoint::new();
    checkpoint.push_dict(WRAPPER_KEY, inner);
    unshard::torch::save_checkpoint(&fixture, &checkpoint).unwrap();
    let script = ws.merge_script(&format!("cp '{}' \"$2\"\n", fixture.display()));

    let output = ws.run(&script, &ws.path("checkpoint"));
    assert!(output.status.code() == Some(0));
    assert!(!ws.path("temp_merged_model.pt").exists());

    let weights = ws.path("inferred_model").join("pytorch_model.bin");
    let pth = PthTensors::new(&weights, None).unwrap();
    let read = pth.get("model.norm.weight").unwrap().unwrap();
    assert!(read.to_vec1::<f32>().unwrap() == vec![1., 2., 3., 4.]);
    assert!(pth.get("model.layers.0.self_attn.k_norm.weight").unwrap().is_some());
    assert!(pth.get("layer1.weight").unwrap().is_none());
    assert!(pth.get("layer2.bias").unwrap().is_none());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("layer1.weight"));
    assert!(stdout.contains("layer2.bias"));
}

#[test]
fn failing_merge_exits_with_one_and_prints_stderr() {
    let ws = Workspace::new();
    let script = ws.merge_script("echo 'shard mismatch' >&2\nexit 2\n");

    let output = ws.run(&script, &ws.path("checkpoint"));
    assert!(output.status.code() == Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("shard mismatch"));
    assert!(!ws.path("inferred_model").join("pytorch_model.bin").exists());
}

#[test]
fn missing_checkpoint_dir_exits_before_merging() {
    let ws = Workspace::new();
    let marker = ws.path("merge_ran");
    let script = ws.merge_script(&format!("touch '{}'\n", marker.display()));

    let output = ws.run(&script, &ws.path("no_such_checkpoint"));
    assert!(output.status.code() == Some(1));
    assert!(!marker.exists());
    assert!(!ws.path("inferred_model").exists());
}

#[test]
fn temp_file_is_removed_when_convert_fails() {
    let ws = Workspace::new();
    let script = ws.merge_script("printf 'not a zip archive' > \"$2\"\n");

    let output = ws.run(&script, &ws.path("checkpoint"));
    assert!(output.status.code() == Some(1));
    assert!(!ws.path("temp_merged_model.pt").exists());
}

#[test]
fn merge_without_output_fails_in_convert() {
    let ws = Workspace::new();
    let script = ws.merge_script("exit 0\n");

    let output = ws.run(&script, &ws.path("checkpoint"));
    assert!(output.status.code() == Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("temp_merged_model.pt"));
}

#[test]
fn invalid_config_exits_with_one() {
    let ws = Workspace::new();
    fs::write(
        ws.path("config.json"),
        TINY_QWEN3.replace("\"num_attention_heads\": 2", "\"num_attention_heads\": 0"),
    )
    .unwrap();
    let fixture = ws.path("fixture.pt");
    let norm = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu).unwrap();
    let checkpoint: Checkpoint = [("model.norm.weight".to_owned(), norm)].into_iter().collect();
    unshard::torch::save_checkpoint(&fixture, &checkpoint).unwrap();
    let script = ws.merge_script(&format!("cp '{}' \"$2\"\n", fixture.display()));

    let output = ws.run(&script, &ws.path("checkpoint"));
    assert!(output.status.code() == Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("num_attention_heads"));
    assert!(!ws.path("temp_merged_model.pt").exists());
}
