//! Causal-LM parameter layouts derived from a Hugging Face `config.json`.
//!
//! A [`Skeleton`] is the model "instantiated from config": every parameter it
//! owns, in module order, with the shape the config implies and the value it
//! would be initialised to. Defaults are only materialised for parameters the
//! checkpoint fails to supply.

use std::{fs, path::Path};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{state_dict::WeightMap, Error, Result};

fn default_initializer_range() -> f64 {
    0.02
}

#[derive(Debug, Clone, Deserialize)]
struct Fields {
    model_type: String,
    vocab_size: usize,
    hidden_size: usize,
    intermediate_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    #[serde(default)]
    num_key_value_heads: Option<usize>,
    #[serde(default)]
    head_dim: Option<usize>,
    #[serde(default)]
    tie_word_embeddings: bool,
    #[serde(default)]
    attention_bias: bool,
    #[serde(default)]
    mlp_bias: bool,
    #[serde(default = "default_initializer_range")]
    initializer_range: f64,
}

/// A parsed `config.json`. The raw object is kept so that it can be written
/// back with every field the file had.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    raw: Value,
    fields: Fields,
}

impl ModelConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(Error::io(path))?;
        Self::from_json(&text).map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let raw: Value = serde_json::from_str(text)?;
        let fields = Fields::deserialize(&raw)?;
        Ok(Self { raw, fields })
    }

    pub fn model_type(&self) -> &str {
        &self.fields.model_type
    }

    pub fn num_hidden_layers(&self) -> usize {
        self.fields.num_hidden_layers
    }

    /// `head_dim`, or `hidden_size / num_attention_heads` when the config
    /// leaves it out.
    pub fn head_dim(&self) -> Result<usize> {
        match self.fields.head_dim {
            Some(head_dim) => Ok(head_dim),
            None => self
                .fields
                .hidden_size
                .checked_div(self.fields.num_attention_heads)
                .ok_or_else(|| Error::InvalidConfig("num_attention_heads is 0".to_owned())),
        }
    }

    pub fn num_key_value_heads(&self) -> usize {
        self.fields
            .num_key_value_heads
            .unwrap_or(self.fields.num_attention_heads)
    }

    /// Writes the config next to saved weights, stamped with their dtype.
    pub fn save<P: AsRef<Path>>(&self, path: P, dtype: DType, class_name: &str) -> Result<()> {
        let path = path.as_ref();
        let mut raw = self.raw.clone();
        if let Some(object) = raw.as_object_mut() {
            object.insert("torch_dtype".to_owned(), torch_dtype(dtype).into());
            object
                .entry("architectures")
                .or_insert_with(|| Value::from(vec![class_name]));
        }
        let text = serde_json::to_string_pretty(&raw).map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, text + "\n").map_err(Error::io(path))
    }
}

fn torch_dtype(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F64 => "float64",
        DType::I64 => "int64",
        DType::U8 => "uint8",
        _ => "float32",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Llama,
    Mistral,
    Qwen2,
    Qwen3,
}

impl Architecture {
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        Ok(match model_type {
            "llama" => Self::Llama,
            "mistral" => Self::Mistral,
            "qwen2" => Self::Qwen2,
            "qwen3" => Self::Qwen3,
            other => return Err(Error::UnsupportedArchitecture(other.to_owned())),
        })
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Self::Llama => "LlamaForCausalLM",
            Self::Mistral => "MistralForCausalLM",
            Self::Qwen2 => "Qwen2ForCausalLM",
            Self::Qwen3 => "Qwen3ForCausalLM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Normal(f64),
    Zeros,
    Ones,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

impl ParamSpec {
    fn materialize(&self, dtype: DType) -> Result<Tensor> {
        let device = Device::Cpu;
        let shape = self.shape.as_slice();
        Ok(match self.init {
            Init::Normal(std) => Tensor::randn(0f32, std as f32, shape, &device)?.to_dtype(dtype)?,
            Init::Zeros => Tensor::zeros(shape, dtype, &device)?,
            Init::Ones => Tensor::ones(shape, dtype, &device)?,
        })
    }
}

#[derive(Default)]
struct Params(Vec<ParamSpec>);

impl Params {
    fn push(&mut self, name: String, shape: Vec<usize>, init: Init) {
        self.0.push(ParamSpec { name, shape, init })
    }

    fn linear(&mut self, prefix: &str, out_dim: usize, in_dim: usize, bias: bool, init: Init) {
        self.push(format!("{prefix}.weight"), vec![out_dim, in_dim], init);
        if bias {
            self.push(format!("{prefix}.bias"), vec![out_dim], Init::Zeros);
        }
    }

    fn norm(&mut self, prefix: &str, dim: usize) {
        self.push(format!("{prefix}.weight"), vec![dim], Init::Ones);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

/// What a non-strict load matched, skipped and left at its default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<ShapeMismatch>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    /// Fraction of model parameters left at their default values.
    pub fn mismatch_ratio(&self) -> f64 {
        let defaulted = self.missing.len() + self.mismatched.len();
        let total = self.loaded + defaulted;
        if total == 0 {
            0.0
        } else {
            defaulted as f64 / total as f64
        }
    }
}

impl core::fmt::Display for LoadReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} loaded, {} missing, {} unexpected, {} shape mismatches",
            self.loaded,
            self.missing.len(),
            self.unexpected.len(),
            self.mismatched.len(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Skeleton {
    architecture: Architecture,
    params: Vec<ParamSpec>,
}

impl Skeleton {
    /// Parameters are kept in `float32`, the dtype `from_config` models start in.
    pub const DTYPE: DType = DType::F32;

    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let architecture = Architecture::from_model_type(config.model_type())?;
        let Fields {
            vocab_size,
            hidden_size: hidden,
            intermediate_size: inter,
            num_hidden_layers,
            num_attention_heads,
            tie_word_embeddings,
            attention_bias,
            mlp_bias,
            initializer_range,
            ..
        } = config.fields;
        if num_attention_heads == 0 {
            return Err(Error::InvalidConfig("num_attention_heads is 0".to_owned()));
        }
        let num_key_value_heads = config.num_key_value_heads();
        if num_key_value_heads == 0 {
            return Err(Error::InvalidConfig("num_key_value_heads is 0".to_owned()));
        }
        let head_dim = config.head_dim()?;
        let q_dim = num_attention_heads * head_dim;
        let kv_dim = num_key_value_heads * head_dim;

        let (qkv_bias, o_bias, mlp_bias, qk_norm) = match architecture {
            Architecture::Llama => (attention_bias, attention_bias, mlp_bias, false),
            Architecture::Mistral => (false, false, false, false),
            Architecture::Qwen2 => (true, false, false, false),
            Architecture::Qwen3 => (attention_bias, attention_bias, false, true),
        };

        let normal = Init::Normal(initializer_range);
        let mut params = Params::default();
        params.linear("model.embed_tokens", vocab_size, hidden, false, normal);
        for layer in 0..num_hidden_layers {
            let attn = format!("model.layers.{layer}.self_attn");
            params.linear(&format!("{attn}.q_proj"), q_dim, hidden, qkv_bias, normal);
            params.linear(&format!("{attn}.k_proj"), kv_dim, hidden, qkv_bias, normal);
            params.linear(&format!("{attn}.v_proj"), kv_dim, hidden, qkv_bias, normal);
            params.linear(&format!("{attn}.o_proj"), hidden, q_dim, o_bias, normal);
            if qk_norm {
                params.norm(&format!("{attn}.q_norm"), head_dim);
                params.norm(&format!("{attn}.k_norm"), head_dim);
            }
            let mlp = format!("model.layers.{layer}.mlp");
            params.linear(&format!("{mlp}.gate_proj"), inter, hidden, mlp_bias, normal);
            params.linear(&format!("{mlp}.up_proj"), inter, hidden, mlp_bias, normal);
            params.linear(&format!("{mlp}.down_proj"), hidden, inter, mlp_bias, normal);
            params.norm(&format!("model.layers.{layer}.input_layernorm"), hidden);
            params.norm(&format!("model.layers.{layer}.post_attention_layernorm"), hidden);
        }
        params.norm("model.norm", hidden);
        if !tie_word_embeddings {
            params.linear("lm_head", vocab_size, hidden, false, normal);
        }
        let Params(params) = params;
        debug!(
            class = architecture.class_name(),
            params = params.len(),
            "built model skeleton"
        );
        Ok(Self {
            architecture,
            params,
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Non-strict load: matching names with matching shapes are taken from
    /// `weights`, everything else keeps its default and ends up in the report.
    pub fn load_state_dict(&self, mut weights: WeightMap) -> Result<(Vec<(String, Tensor)>, LoadReport)> {
        let mut report = LoadReport::default();
        let mut state = Vec::with_capacity(self.params.len());
        for spec in &self.params {
            let tensor = match weights.remove(&spec.name) {
                Some(tensor) if tensor.dims() == spec.shape.as_slice() => {
                    report.loaded += 1;
                    tensor.to_dtype(Self::DTYPE)?
                }
                Some(tensor) => {
                    report.mismatched.push(ShapeMismatch {
                        name: spec.name.clone(),
                        expected: spec.shape.clone(),
                        found: tensor.dims().to_vec(),
                    });
                    spec.materialize(Self::DTYPE)?
                }
                None => {
                    report.missing.push(spec.name.clone());
                    spec.materialize(Self::DTYPE)?
                }
            };
            state.push((spec.name.clone(), tensor));
        }
        report.unexpected = weights.into_keys().collect();
        Ok((state, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use equator::assert;

    const TINY_QWEN3: &str = r#"{
        "architectures": ["Qwen3ForCausalLM"],
        "model_type": "qwen3",
        "vocab_size": 16,
        "hidden_size": 8,
        "intermediate_size": 12,
        "num_hidden_layers": 2,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "head_dim": 4,
        "tie_word_embeddings": true,
        "rope_theta": 1000000,
        "torch_dtype": "bfloat16"
    }"#;

    const TINY_LLAMA: &str = r#"{
        "model_type": "llama",
        "vocab_size": 10,
        "hidden_size": 4,
        "intermediate_size": 6,
        "num_hidden_layers": 1,
        "num_attention_heads": 2
    }"#;

    fn names(skeleton: &Skeleton) -> Vec<&str> {
        skeleton.params().iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn qwen3_layout_follows_module_order() {
        let config = ModelConfig::from_json(TINY_QWEN3).unwrap();
        let skeleton = Skeleton::from_config(&config).unwrap();
        assert!(skeleton.architecture() == Architecture::Qwen3);
        let names = names(&skeleton);
        assert!(names.len() == 1 + 2 * 11 + 1);
        assert!(&names[..6] == &[
            "model.embed_tokens.weight",
            "model.layers.0.self_attn.q_proj.weight",
            "model.layers.0.self_attn.k_proj.weight",
            "model.layers.0.self_attn.v_proj.weight",
            "model.layers.0.self_attn.o_proj.weight",
            "model.layers.0.self_attn.q_norm.weight",
        ]);
        assert!(!names.contains(&"lm_head.weight"));
        let k_proj = &skeleton.params()[2];
        assert!(k_proj.shape == [4, 8]);
        let o_proj = &skeleton.params()[4];
        assert!(o_proj.shape == [8, 8]);
    }

    #[test]
    fn llama_defaults_fill_in_heads_and_lm_head() {
        let config = ModelConfig::from_json(TINY_LLAMA).unwrap();
        assert!(config.head_dim().unwrap() == 2);
        assert!(config.num_key_value_heads() == 2);
        let skeleton = Skeleton::from_config(&config).unwrap();
        let last = skeleton.params().last().unwrap();
        assert!(last.name == "lm_head.weight");
        assert!(last.shape == [10, 4]);
        assert!(last.init == Init::Normal(0.02));
    }

    #[test]
    fn qwen2_has_qkv_biases_only() {
        let config = ModelConfig::from_json(&TINY_LLAMA.replace("llama", "qwen2")).unwrap();
        let skeleton = Skeleton::from_config(&config).unwrap();
        let names = names(&skeleton);
        assert!(names.contains(&"model.layers.0.self_attn.q_proj.bias"));
        assert!(names.contains(&"model.layers.0.self_attn.v_proj.bias"));
        assert!(!names.contains(&"model.layers.0.self_attn.o_proj.bias"));
    }

    #[test]
    fn zero_attention_heads_is_a_config_error() {
        let config = ModelConfig::from_json(
            &TINY_LLAMA.replace("\"num_attention_heads\": 2", "\"num_attention_heads\": 0"),
        )
        .unwrap();
        assert!(matches!(config.head_dim(), Err(Error::InvalidConfig(_))));
        let err = Skeleton::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("num_attention_heads")));

        // an explicit head_dim does not make zero heads valid
        let config = ModelConfig::from_json(
            &TINY_QWEN3.replace("\"num_attention_heads\": 2", "\"num_attention_heads\": 0"),
        )
        .unwrap();
        assert!(config.head_dim().unwrap() == 4);
        assert!(matches!(Skeleton::from_config(&config), Err(Error::InvalidConfig(_))));

        let config = ModelConfig::from_json(
            &TINY_QWEN3.replace("\"num_key_value_heads\": 1", "\"num_key_value_heads\": 0"),
        )
        .unwrap();
        let err = Skeleton::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("num_key_value_heads")));
    }

    #[test]
    fn unknown_model_type_is_rejected() {
        let config = ModelConfig::from_json(&TINY_LLAMA.replace("llama", "gpt_neox")).unwrap();
        let err = Skeleton::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(ref t) if t == "gpt_neox"));
    }

    #[test]
    fn non_strict_load_reports_every_kind_of_mismatch() {
        let config = ModelConfig::from_json(TINY_LLAMA).unwrap();
        let skeleton = Skeleton::from_config(&config).unwrap();
        let device = Device::Cpu;
        let mut weights = WeightMap::new();
        let norm = Tensor::new(&[1.5f64, 2.5, 3.5, 4.5], &device).unwrap();
        weights.insert("model.norm.weight".to_owned(), norm);
        weights.insert(
            "lm_head.weight".to_owned(),
            Tensor::zeros((3, 3), DType::F32, &device).unwrap(),
        );
        weights.insert(
            "layer1.weight".to_owned(),
            Tensor::zeros(2, DType::F32, &device).unwrap(),
        );

        let (state, report) = skeleton.load_state_dict(weights).unwrap();
        assert!(state.len() == skeleton.params().len());
        assert!(report.loaded == 1);
        assert!(report.unexpected == ["layer1.weight"]);
        assert!(report.mismatched.len() == 1);
        assert!(report.mismatched[0].found == [3, 3]);
        assert!(report.missing.len() == skeleton.params().len() - 2);
        assert!(!report.is_clean());
        assert!(report.mismatch_ratio() > 0.8);

        let (_, norm) = state.iter().find(|(n, _)| n == "model.norm.weight").unwrap();
        assert!(norm.dtype() == DType::F32);
        assert!(norm.to_vec1::<f32>().unwrap() == vec![1.5, 2.5, 3.5, 4.5]);
        let (_, head) = state.last().unwrap();
        assert!(head.dims() == [10, 4]);
        let (_, input_norm) = state
            .iter()
            .find(|(n, _)| n == "model.layers.0.input_layernorm.weight")
            .unwrap();
        assert!(input_norm.to_vec1::<f32>().unwrap() == vec![1.0; 4]);
    }

    #[test]
    fn saved_config_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ModelConfig::from_json(TINY_QWEN3).unwrap();
        config.save(&path, DType::F32, "Qwen3ForCausalLM").unwrap();
        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved["torch_dtype"] == "float32");
        assert!(saved["rope_theta"] == 1000000);
        assert!(saved["architectures"][0] == "Qwen3ForCausalLM");

        let config = ModelConfig::from_json(TINY_LLAMA).unwrap();
        config.save(&path, DType::F32, "LlamaForCausalLM").unwrap();
        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved["architectures"][0] == "LlamaForCausalLM");
    }
}
