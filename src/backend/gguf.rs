use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;
use tracing::info;

use crate::cache::{CacheEntries, PositionCache};
use crate::error::{KernelError, Result};

use super::{HfChatTokenizer, LanguageModel, LoadedModel, ModelLoader, TokenizerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Llama,
    Qwen2,
}

impl ModelArch {
    fn from_metadata(content: &gguf_file::Content) -> Option<Self> {
        let arch = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())?;
        match arch.as_str() {
            "llama" => Some(Self::Llama),
            "qwen2" => Some(Self::Qwen2),
            _ => None,
        }
    }

    fn from_filename(path: &Path) -> Option<Self> {
        let lowered = path.file_stem()?.to_str()?.to_lowercase();
        if lowered.contains("llama") {
            Some(Self::Llama)
        } else if lowered.contains("qwen") {
            Some(Self::Qwen2)
        } else {
            None
        }
    }

    fn metadata_prefix(self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Qwen2 => "qwen2",
        }
    }
}

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    pub fn forward(&mut self, input_tensor: &Tensor, position: usize) -> Result<Tensor> {
        match self {
            Self::Llama(model) => Ok(model.forward(input_tensor, position)?),
            Self::Qwen2(model) => Ok(model.forward(input_tensor, position)?),
        }
    }
}

/// Quantized weights plus the layer count needed to build matching caches.
pub struct GgufModel {
    runtime: Mutex<RuntimeModel>,
    arch: ModelArch,
    block_count: usize,
    device: Device,
}

impl GgufModel {
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut file = fs::File::open(path).map_err(|e| KernelError::load(path, e))?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| KernelError::load(path, e))?;

        let arch = ModelArch::from_metadata(&content)
            .or_else(|| ModelArch::from_filename(path))
            .ok_or_else(|| KernelError::load(path, "unsupported or unknown model architecture"))?;

        let block_key = format!("{}.block_count", arch.metadata_prefix());
        let block_count = content
            .metadata
            .get(&block_key)
            .and_then(|v| v.to_u32().ok())
            .ok_or_else(|| KernelError::load(path, format!("missing metadata '{}'", block_key)))?
            as usize;

        let runtime = match arch {
            ModelArch::Llama => {
                let model = quantized_llama::ModelWeights::from_gguf(content, &mut file, device)
                    .map_err(|e| KernelError::load(path, e))?;
                RuntimeModel::Llama(model)
            }
            ModelArch::Qwen2 => {
                match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                    Ok(model) => RuntimeModel::Qwen2(model),
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            return Err(KernelError::load(
                                path,
                                "missing 'output_norm.weight'; the GGUF is likely an incomplete split shard. Use a full single-file GGUF.",
                            ));
                        }
                        return Err(KernelError::load(path, msg));
                    }
                }
            }
        };

        Ok(Self {
            runtime: Mutex::new(runtime),
            arch,
            block_count,
            device: device.clone(),
        })
    }

    pub fn arch(&self) -> ModelArch {
        self.arch
    }
}

impl LanguageModel for GgufModel {
    fn make_cache(&self) -> CacheEntries {
        PositionCache::layers(self.block_count, false)
    }

    fn forward(&self, tokens: &[u32], position: usize) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let logits = runtime.forward(&input, position)?;
        Ok(logits.squeeze(0)?)
    }
}

/// Loads quantized GGUF checkpoints with candle and their Hugging Face tokenizer.
pub struct GgufModelLoader {
    device: Device,
    tokenizer_repo: Option<String>,
}

impl GgufModelLoader {
    pub fn new(device: Device, tokenizer_repo: Option<String>) -> Self {
        Self {
            device,
            tokenizer_repo,
        }
    }
}

impl ModelLoader for GgufModelLoader {
    fn load(
        &self,
        path: &Path,
        adapter_path: Option<&Path>,
        tokenizer_config: &TokenizerConfig,
    ) -> Result<LoadedModel> {
        if let Some(adapter) = adapter_path {
            return Err(KernelError::load(
                adapter,
                "adapters are not supported for quantized GGUF weights",
            ));
        }

        let started = Instant::now();
        let weights_path = resolve_weights_file(path)?;
        info!(path = %weights_path.display(), "loading model weights");

        let model = GgufModel::load(&weights_path, &self.device)?;
        let tokenizer = HfChatTokenizer::load_for_model(
            &weights_path,
            tokenizer_config,
            self.tokenizer_repo.as_deref(),
        )?;

        info!(
            path = %weights_path.display(),
            arch = ?model.arch(),
            layers = model.block_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model ready"
        );

        Ok(LoadedModel {
            model: Arc::new(model),
            tokenizer: Box::new(tokenizer),
        })
    }
}

// A directory must contain exactly one `.gguf` file.
fn resolve_weights_file(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        return Ok(path.to_path_buf());
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.extension().and_then(|e| e.to_str()) == Some("gguf") {
            found.push(entry_path);
        }
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(KernelError::load(path, "no .gguf file in model directory")),
        n => Err(KernelError::load(
            path,
            format!("{} .gguf files in model directory, pass one explicitly", n),
        )),
    }
}
