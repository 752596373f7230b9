use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tracing::debug;

use crate::error::{InvocationError, Result};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SHARD_INDEX_FILE: &str = "model.safetensors.index.json";

/// Files making up a model directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// `config.json`
    pub config: PathBuf,
    /// `tokenizer.json`
    pub tokenizer: PathBuf,
    /// Safetensors files, in load order
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

impl ModelFiles {
    /// Locate config, tokenizer and safetensors weights under `root`.
    ///
    /// Sharded checkpoints are read through their index file; otherwise every
    /// `*.safetensors` file in the directory is used.
    pub fn resolve(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(InvocationError::model(format!(
                "Model path {} is not a directory",
                root.display()
            )));
        }

        let config = required_file(root, CONFIG_FILE)?;
        let tokenizer = required_file(root, TOKENIZER_FILE)?;

        let index_path = root.join(SHARD_INDEX_FILE);
        let weights = if index_path.is_file() {
            let raw = std::fs::read(&index_path).map_err(|e| {
                InvocationError::model_with_source(
                    format!("Failed to read {}", index_path.display()),
                    e,
                )
            })?;
            let index: ShardIndex = serde_json::from_slice(&raw).map_err(|e| {
                InvocationError::model_with_source(
                    format!("Failed to parse {}", index_path.display()),
                    e,
                )
            })?;

            index
                .weight_map
                .into_values()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|file| root.join(file))
                .collect()
        } else {
            let entries = std::fs::read_dir(root).map_err(|e| {
                InvocationError::model_with_source(format!("Failed to list {}", root.display()), e)
            })?;

            let mut weights: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
                .collect();
            weights.sort();
            weights
        };

        debug!(
            root = %root.display(),
            shards = weights.len(),
            "Resolved model files"
        );

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

fn required_file(root: &Path, name: &str) -> Result<PathBuf> {
    let path = root.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(InvocationError::model(format!(
            "Model directory {} has no {}",
            root.display(),
            name
        )))
    }
}

/// Build a variable builder over the weight files.
///
/// With `use_mmap` the files are memory-mapped; otherwise every tensor is read into
/// memory up front.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
    use_mmap: bool,
) -> Result<VarBuilder<'static>> {
    if paths.is_empty() {
        return Err(InvocationError::model("Model directory has no safetensors weights"));
    }

    if use_mmap {
        // SAFETY: the weight files must not change while they are mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
        return Ok(vb);
    }

    let mut tensors = HashMap::new();
    for path in paths {
        tensors.extend(candle_core::safetensors::load(path, device)?);
    }
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}
