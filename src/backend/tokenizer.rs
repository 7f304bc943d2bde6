use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{KernelError, Result};

use super::{ChatTokenizer, TokenizerConfig};

/// Built-in fallback used when a model ships without a chat template.
pub const CHATML_TEMPLATE: &str = r#"{% for message in messages %}{{ '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}"#;

const STOP_TOKENS: &[&str] = &[
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|endoftext|>",
    "</s>",
];

pub struct HfChatTokenizer {
    inner: Tokenizer,
    chat_template: Option<String>,
    bos_token: Option<String>,
    eos_token: Option<String>,
    eos_token_ids: Vec<u32>,
}

impl HfChatTokenizer {
    pub fn new(inner: Tokenizer, metadata: TokenizerMetadata) -> Self {
        let mut eos_token_ids: Vec<u32> = STOP_TOKENS
            .iter()
            .filter_map(|tok| inner.token_to_id(tok))
            .collect();
        if let Some(id) = metadata.eos_token.as_deref().and_then(|t| inner.token_to_id(t)) {
            if !eos_token_ids.contains(&id) {
                eos_token_ids.push(id);
            }
        }

        Self {
            inner,
            chat_template: metadata.chat_template,
            bos_token: metadata.bos_token,
            eos_token: metadata.eos_token,
            eos_token_ids,
        }
    }

    /// Loads `tokenizer.json` (and `tokenizer_config.json` when present) for `model_path`.
    pub fn load_for_model(
        model_path: &Path,
        config: &TokenizerConfig,
        remote_repo: Option<&str>,
    ) -> Result<Self> {
        let tokenizer_path = match resolve_tokenizer_path(model_path) {
            Some(path) => path,
            None => fetch_remote_tokenizer(model_path, config, remote_repo)?,
        };
        debug!(path = %tokenizer_path.display(), "loading tokenizer");

        let inner = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| KernelError::load(&tokenizer_path, e))?;

        let mut metadata = tokenizer_path
            .parent()
            .map(|dir| dir.join("tokenizer_config.json"))
            .filter(|p| p.exists())
            .map(|p| TokenizerMetadata::from_file(&p))
            .transpose()?
            .unwrap_or_default();

        if let Some(template) = &config.chat_template {
            metadata.chat_template = Some(template.clone());
        }

        Ok(Self::new(inner, metadata))
    }
}

impl ChatTokenizer for HfChatTokenizer {
    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }

    fn default_chat_template(&self) -> &str {
        CHATML_TEMPLATE
    }

    fn set_chat_template(&mut self, template: String) {
        self.chat_template = Some(template);
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| KernelError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| KernelError::Tokenizer(e.to_string()))
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_deref()
    }

    fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }
}

/// The subset of `tokenizer_config.json` the server cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizerMetadata {
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
}

impl TokenizerMetadata {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| KernelError::load(path, e))?;
        Ok(Self::from_json(&value))
    }

    pub fn from_json(value: &Value) -> Self {
        Self {
            chat_template: value.get("chat_template").and_then(template_from_json),
            bos_token: value.get("bos_token").and_then(special_token_from_json),
            eos_token: value.get("eos_token").and_then(special_token_from_json),
        }
    }
}

// Either a plain string or a list of named templates.
fn template_from_json(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let named = |name: &str| {
                items.iter().find(|item| item.get("name").and_then(Value::as_str) == Some(name))
            };
            named("default")
                .or_else(|| items.first())
                .and_then(|item| item.get("template"))
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        _ => None,
    }
}

fn special_token_from_json(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn resolve_tokenizer_path(model_path: &Path) -> Option<PathBuf> {
    let dir = if model_path.is_dir() {
        model_path
    } else {
        model_path.parent().unwrap_or(Path::new("."))
    };

    let local_tok_path = dir.join("tokenizer.json");
    if local_tok_path.exists() {
        return Some(local_tok_path);
    }

    let parent_tok_path = dir.parent().map(|p| p.join("tokenizer.json"));
    parent_tok_path.filter(|p| p.exists())
}

fn fetch_remote_tokenizer(
    model_path: &Path,
    config: &TokenizerConfig,
    remote_repo: Option<&str>,
) -> Result<PathBuf> {
    let repo = match (config.trust_remote_code, remote_repo) {
        (true, Some(repo)) => repo,
        _ => {
            return Err(KernelError::load(
                model_path,
                "tokenizer.json not found next to the model (remote fetch disabled)",
            ))
        }
    };

    info!(repo, "tokenizer.json not found locally, fetching from the hub");
    let api = hf_hub::api::sync::Api::new().map_err(|e| KernelError::load(model_path, e))?;
    api.model(repo.to_string())
        .get("tokenizer.json")
        .map_err(|e| KernelError::load(model_path, e))
}
