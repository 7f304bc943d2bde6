use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::backend::TokenizerConfig;
use crate::error::{KernelError, Result};
use crate::logging::LogFormat;
use crate::prompting::GenerationConfig;
use crate::registry::RegistrySettings;

/// Static server configuration, read once at startup.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Weights used for requests asking for `default_model`.
    pub model: Option<PathBuf>,
    pub adapter_path: Option<PathBuf>,
    pub draft_model: Option<PathBuf>,
    pub trust_remote_code: bool,
    /// Empty means "use the tokenizer's own template".
    pub chat_template: String,
    pub use_default_chat_template: bool,
    pub temp: f64,
    pub top_p: f64,
    /// 0 disables top-k.
    pub top_k: usize,
    /// 0 disables min-p filtering.
    pub min_p: f64,
    pub max_tokens: usize,
    pub seed: Option<u64>,
    pub chat_template_args: Map<String, Value>,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Client-supplied model paths must resolve inside this directory.
    pub models_root: PathBuf,
    /// Hub repository to fetch `tokenizer.json` from when it is missing locally.
    pub tokenizer_repo: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            model: None,
            adapter_path: None,
            draft_model: None,
            trust_remote_code: false,
            chat_template: String::new(),
            use_default_chat_template: false,
            temp: 0.0,
            top_p: 1.0,
            top_k: 0,
            min_p: 0.0,
            max_tokens: 512,
            seed: None,
            chat_template_args: Map::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            models_root: PathBuf::from("."),
            tokenizer_repo: None,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)
            .map_err(|e| KernelError::Configuration(format!("invalid config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            KernelError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temp) {
            return Err(KernelError::Configuration(
                "temp must be in [0.0, 2.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(KernelError::Configuration(
                "top_p must be in [0.0, 1.0]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(KernelError::Configuration(
                "min_p must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(KernelError::Configuration(
                "max_tokens must be > 0".to_string(),
            ));
        }
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(KernelError::Configuration(format!(
                "unknown log_level '{}'",
                other
            ))),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tokenizer_config(&self) -> TokenizerConfig {
        TokenizerConfig {
            trust_remote_code: self.trust_remote_code,
            chat_template: Some(self.chat_template.clone()).filter(|t| !t.is_empty()),
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            default_model: self.model.clone(),
            default_adapter: self.adapter_path.clone(),
            default_draft_model: self.draft_model.clone(),
            tokenizer: self.tokenizer_config(),
            use_default_chat_template: self.use_default_chat_template,
        }
    }

    /// Generation defaults; `seed` falls back to OS randomness.
    pub fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temp,
            top_p: self.top_p,
            top_k: self.top_k,
            min_p: self.min_p,
            seed: self.seed.unwrap_or_else(random_seed),
            max_tokens: self.max_tokens,
        }
    }
}

fn random_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => 299_792_458,
    }
}
