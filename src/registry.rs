use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::{
    ChatTokenizer, LanguageModel, LoadedModel, ModelLoader, PathValidator, TokenizerConfig,
};
use crate::error::{KernelError, Result};

/// Sentinel selecting the model (or draft model) configured at startup.
pub const DEFAULT_MODEL: &str = "default_model";

/// Identity of a loaded model set, exactly as requested by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model: String,
    pub adapter: Option<String>,
    pub draft: Option<String>,
}

impl ModelKey {
    pub fn new(model: impl Into<String>, adapter: Option<String>, draft: Option<String>) -> Self {
        Self {
            model: model.into(),
            adapter,
            draft,
        }
    }

    pub fn default_model() -> Self {
        Self::new(DEFAULT_MODEL, None, None)
    }
}

impl Default for ModelKey {
    fn default() -> Self {
        Self::default_model()
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model={} adapter={} draft={}",
            self.model,
            self.adapter.as_deref().unwrap_or("-"),
            self.draft.as_deref().unwrap_or("-")
        )
    }
}

static NEXT_LOAD_ID: AtomicU64 = AtomicU64::new(1);

/// One complete load. Replaced wholesale, never mutated after construction.
/// Handles built for the same key still get distinct `load_id`s.
pub struct ModelHandle {
    key: ModelKey,
    load_id: u64,
    model: Arc<dyn LanguageModel>,
    tokenizer: Box<dyn ChatTokenizer>,
    draft_model: Option<Arc<dyn LanguageModel>>,
}

impl ModelHandle {
    pub fn new(
        key: ModelKey,
        model: Arc<dyn LanguageModel>,
        tokenizer: Box<dyn ChatTokenizer>,
        draft_model: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            key,
            load_id: NEXT_LOAD_ID.fetch_add(1, Ordering::Relaxed),
            model,
            tokenizer,
            draft_model,
        }
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn tokenizer(&self) -> &dyn ChatTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn draft_model(&self) -> Option<&Arc<dyn LanguageModel>> {
        self.draft_model.as_ref()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("key", &self.key)
            .field("load_id", &self.load_id)
            .field("has_draft", &self.draft_model.is_some())
            .finish()
    }
}

/// Startup configuration the registry resolves sentinels against.
#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub default_model: Option<PathBuf>,
    pub default_adapter: Option<PathBuf>,
    pub default_draft_model: Option<PathBuf>,
    pub tokenizer: TokenizerConfig,
    pub use_default_chat_template: bool,
}

/// Lazily loads and hot-swaps the single active model set.
///
/// The whole of [`ModelRegistry::ensure_loaded`] runs under one mutex owned by
/// the registry, so loads are fully serialized and readers only ever see a
/// complete [`ModelHandle`].
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    validator: Arc<dyn PathValidator>,
    settings: RegistrySettings,
    current: Mutex<Option<Arc<ModelHandle>>>,
}

impl ModelRegistry {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        validator: Arc<dyn PathValidator>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            loader,
            validator,
            settings,
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<ModelHandle>> {
        self.lock_current().clone()
    }

    pub fn model_key(&self) -> Option<ModelKey> {
        self.lock_current().as_ref().map(|h| h.key.clone())
    }

    pub fn ensure_loaded(&self, key: &ModelKey) -> Result<Arc<ModelHandle>> {
        let mut current = self.lock_current();

        if let Some(handle) = current.as_ref() {
            if handle.key == *key {
                return Ok(Arc::clone(handle));
            }
        }

        // Configuration problems are reported before anything is unloaded.
        let default_target = if key.model == DEFAULT_MODEL {
            let path = self.settings.default_model.clone().ok_or_else(|| {
                KernelError::Configuration(
                    "a model path has to be configured at startup or given in the request"
                        .to_string(),
                )
            })?;
            Some(path)
        } else {
            None
        };

        if let Some(previous) = current.take() {
            info!(previous = %previous.key, requested = %key, "unloading model");
        }

        let started = Instant::now();
        let tokenizer_config = self.settings.tokenizer.clone();

        let LoadedModel {
            model,
            mut tokenizer,
        } = match default_target {
            Some(path) => {
                let adapter = key
                    .adapter
                    .as_deref()
                    .map(PathBuf::from)
                    .or_else(|| self.settings.default_adapter.clone());
                self.loader
                    .load(&path, adapter.as_deref(), &tokenizer_config)?
            }
            None => {
                let path = self.validator.validate(&key.model)?;
                let adapter = key.adapter.as_deref().map(Path::new);
                self.loader.load(&path, adapter, &tokenizer_config)?
            }
        };

        if self.settings.use_default_chat_template && tokenizer.chat_template().is_none() {
            let fallback = tokenizer.default_chat_template().to_string();
            debug!("tokenizer has no chat template, using its default");
            tokenizer.set_chat_template(fallback);
        }

        let draft_model = self.load_draft(key, tokenizer.as_ref())?;

        let handle = Arc::new(ModelHandle::new(
            key.clone(),
            model,
            tokenizer,
            draft_model,
        ));
        *current = Some(Arc::clone(&handle));

        info!(
            key = %key,
            draft = handle.draft_model.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(handle)
    }

    fn load_draft(
        &self,
        key: &ModelKey,
        tokenizer: &dyn ChatTokenizer,
    ) -> Result<Option<Arc<dyn LanguageModel>>> {
        let path = match key.draft.as_deref() {
            None => return Ok(None),
            Some(DEFAULT_MODEL) => match &self.settings.default_draft_model {
                Some(path) => path.clone(),
                None => return Ok(None),
            },
            Some(explicit) => self.validator.validate(explicit)?,
        };

        let draft_config = TokenizerConfig {
            trust_remote_code: self.settings.tokenizer.trust_remote_code,
            chat_template: None,
        };
        let draft = self.loader.load(&path, None, &draft_config)?;

        if draft.tokenizer.vocab_size() != tokenizer.vocab_size() {
            warn!(
                draft_vocab = draft.tokenizer.vocab_size(),
                model_vocab = tokenizer.vocab_size(),
                "draft model tokenizer does not match model tokenizer, speculative decoding may not work as expected"
            );
        }

        Ok(Some(draft.model))
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Arc<ModelHandle>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use candle_core::{Device, Tensor};

    use crate::backend::{
        ChatTokenizer, LanguageModel, LoadedModel, ModelLoader, PathValidator, TokenizerConfig,
    };
    use crate::cache::{CacheEntries, PositionCache};
    use crate::error::{KernelError, Result};

    pub struct FakeModel {
        pub layers: usize,
        pub trimmable: bool,
        pub caches_built: AtomicUsize,
    }

    impl FakeModel {
        pub fn new(layers: usize, trimmable: bool) -> Self {
            Self {
                layers,
                trimmable,
                caches_built: AtomicUsize::new(0),
            }
        }
    }

    impl LanguageModel for FakeModel {
        fn make_cache(&self) -> CacheEntries {
            self.caches_built.fetch_add(1, Ordering::SeqCst);
            PositionCache::layers(self.layers, self.trimmable)
        }

        // Always favours the token after the last one seen.
        fn forward(&self, tokens: &[u32], _position: usize) -> Result<Tensor> {
            let vocab = 16usize;
            let next = tokens.last().map(|t| (*t as usize + 1) % vocab).unwrap_or(0);
            let logits: Vec<f32> = (0..vocab)
                .map(|i| if i == next { 10.0 } else { 0.0 })
                .collect();
            Ok(Tensor::new(logits.as_slice(), &Device::Cpu)?)
        }
    }

    pub struct FakeTokenizer {
        pub vocab: usize,
        pub template: Option<String>,
        pub eos: Vec<u32>,
    }

    impl FakeTokenizer {
        pub fn new(vocab: usize) -> Self {
            Self {
                vocab,
                template: None,
                eos: vec![0],
            }
        }
    }

    impl ChatTokenizer for FakeTokenizer {
        fn vocab_size(&self) -> usize {
            self.vocab
        }

        fn chat_template(&self) -> Option<&str> {
            self.template.as_deref()
        }

        fn default_chat_template(&self) -> &str {
            "{% for m in messages %}<{{ m.role }}>{{ m.content }}{% endfor %}"
        }

        fn set_chat_template(&mut self, template: String) {
            self.template = Some(template);
        }

        // One token per byte, shifted so that 0 stays reserved for EOS.
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(|b| u32::from(b) % 15 + 1).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|id| format!("<{}>", id)).collect())
        }

        fn eos_token_ids(&self) -> &[u32] {
            &self.eos
        }
    }

    /// Counts loads per path; vocab sizes and failures are configurable.
    #[derive(Default)]
    pub struct CountingLoader {
        pub loads: Mutex<Vec<PathBuf>>,
        pub vocab_by_path: HashMap<PathBuf, usize>,
        pub fail_paths: Vec<PathBuf>,
        pub configs: Mutex<Vec<TokenizerConfig>>,
        pub adapters: Mutex<Vec<Option<PathBuf>>>,
        pub trimmable: bool,
    }

    impl CountingLoader {
        pub fn load_count(&self) -> usize {
            self.loads.lock().expect("loads lock").len()
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(
            &self,
            path: &Path,
            adapter_path: Option<&Path>,
            tokenizer_config: &TokenizerConfig,
        ) -> Result<LoadedModel> {
            self.loads.lock().expect("loads lock").push(path.to_path_buf());
            self.configs
                .lock()
                .expect("configs lock")
                .push(tokenizer_config.clone());
            self.adapters
                .lock()
                .expect("adapters lock")
                .push(adapter_path.map(Path::to_path_buf));

            if self.fail_paths.iter().any(|p| p == path) {
                return Err(KernelError::load(path, "corrupt weights"));
            }

            let vocab = self.vocab_by_path.get(path).copied().unwrap_or(32);
            let mut tokenizer = FakeTokenizer::new(vocab);
            tokenizer.template = tokenizer_config.chat_template.clone();
            Ok(LoadedModel {
                model: Arc::new(FakeModel::new(2, self.trimmable)),
                tokenizer: Box::new(tokenizer),
            })
        }
    }

    /// Accepts anything not listed in `rejected`.
    #[derive(Default)]
    pub struct AllowListValidator {
        pub rejected: Vec<String>,
        pub calls: AtomicUsize,
    }

    impl PathValidator for AllowListValidator {
        fn validate(&self, path: &str) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rejected.iter().any(|r| r == path) {
                return Err(KernelError::invalid_path(path, "rejected by test validator"));
            }
            Ok(PathBuf::from(path))
        }
    }
}
