mod gguf;
mod paths;
mod tokenizer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Tensor;

use crate::cache::CacheEntries;
use crate::error::Result;

pub use gguf::{GgufModelLoader, ModelArch};
pub use paths::WorkspacePathValidator;
pub use tokenizer::{HfChatTokenizer, TokenizerMetadata, CHATML_TEMPLATE};

/// Tokenizer options derived from static server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizerConfig {
    pub trust_remote_code: bool,
    pub chat_template: Option<String>,
}

pub trait LanguageModel: Send + Sync {
    /// Fresh, empty per-layer state for this model.
    fn make_cache(&self) -> CacheEntries;

    /// Runs `tokens` starting at `position` and returns last-position logits.
    fn forward(&self, tokens: &[u32], position: usize) -> Result<Tensor>;
}

pub trait ChatTokenizer: Send + Sync {
    fn vocab_size(&self) -> usize;
    fn chat_template(&self) -> Option<&str>;
    fn default_chat_template(&self) -> &str;
    fn set_chat_template(&mut self, template: String);
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn eos_token_ids(&self) -> &[u32];

    fn bos_token(&self) -> Option<&str> {
        None
    }

    fn eos_token(&self) -> Option<&str> {
        None
    }
}

pub struct LoadedModel {
    pub model: Arc<dyn LanguageModel>,
    pub tokenizer: Box<dyn ChatTokenizer>,
}

pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        adapter_path: Option<&Path>,
        tokenizer_config: &TokenizerConfig,
    ) -> Result<LoadedModel>;
}

pub trait PathValidator: Send + Sync {
    /// Resolves a client-supplied model location, failing with `InvalidPath`.
    fn validate(&self, path: &str) -> Result<PathBuf>;
}
