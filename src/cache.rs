mod layer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::error::{KernelError, Result};
use crate::registry::{ModelHandle, ModelKey};

pub use layer::{can_trim_prompt_cache, trim_prompt_cache, CacheEntries, LayerCache, PositionCache};

/// Token history and per-layer state, kept in lockstep.
struct TokenCacheState {
    model_key: Option<ModelKey>,
    load_id: Option<u64>,
    tokens: Vec<u32>,
    entries: CacheEntries,
    primary_layers: usize,
    epoch: u64,
    stats: CacheStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resets: u64,
    pub extends: u64,
    pub trims: u64,
    pub trim_fallbacks: u64,
    pub invariant_violations: u64,
    pub reused_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub model_key: Option<ModelKey>,
    pub tokens: usize,
    pub layers: usize,
    pub stats: CacheStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reset,
    Extended,
    Trimmed { removed: usize },
}

/// What the engine still has to fold in, plus the layers to fold it into.
pub struct ReconciledPrompt {
    pub suffix: Vec<u32>,
    pub reused: usize,
    pub outcome: ReconcileOutcome,
    entries: CacheEntries,
    primary_layers: usize,
    epoch: u64,
}

impl ReconciledPrompt {
    pub fn entries(&self) -> &[Arc<dyn LayerCache>] {
        &self.entries
    }

    pub fn primary(&self) -> &[Arc<dyn LayerCache>] {
        &self.entries[..self.primary_layers]
    }

    pub fn draft(&self) -> &[Arc<dyn LayerCache>] {
        &self.entries[self.primary_layers..]
    }

    /// Position the suffix starts at.
    pub fn position(&self) -> usize {
        self.reused
    }
}

pub fn common_prefix_len(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// The single process-wide prompt cache.
///
/// The mutex lives as long as the cache itself; every connection reaches the
/// state only through these lock-guarded methods.
pub struct PromptCache {
    state: Mutex<TokenCacheState>,
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TokenCacheState {
                model_key: None,
                load_id: None,
                tokens: Vec::new(),
                entries: Vec::new(),
                primary_layers: 0,
                epoch: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Reconciles the shared cache against `prompt` for the model in `handle`
    /// and returns the suffix the engine must still process.
    pub fn reconcile(&self, handle: &ModelHandle, prompt: &[u32]) -> Result<ReconciledPrompt> {
        if prompt.is_empty() {
            return Err(KernelError::EmptyPrompt);
        }

        let mut state = self.lock_state();
        let cache_len = state.tokens.len();
        let prompt_len = prompt.len();

        // Leave at least one token for the engine to process.
        let prefix_len = common_prefix_len(&state.tokens, prompt).min(prompt_len - 1);
        // A reload under the same key starts from empty model state.
        let model_changed = state.model_key.as_ref() != Some(handle.key())
            || state.load_id != Some(handle.load_id());

        let outcome = if model_changed || prefix_len == 0 {
            debug!(
                cache_len,
                prompt_len,
                model_changed,
                "resetting prompt cache"
            );
            reset(&mut state, handle, prompt);
            ReconcileOutcome::Reset
        } else if prefix_len == cache_len {
            debug!(cache_len, prompt_len, "cache is a prefix of the prompt");
            state.tokens.extend_from_slice(&prompt[prefix_len..]);
            state.stats.extends += 1;
            ReconcileOutcome::Extended
        } else if prefix_len < cache_len {
            let removed = cache_len - prefix_len;
            if can_trim_prompt_cache(&state.entries) {
                debug!(prefix_len, cache_len, removed, "trimming prompt cache");
                trim_prompt_cache(&state.entries, removed);
                state.tokens.truncate(prefix_len);
                state.tokens.extend_from_slice(&prompt[prefix_len..]);
                state.stats.trims += 1;
                ReconcileOutcome::Trimmed { removed }
            } else {
                debug!(prefix_len, cache_len, "cache cannot be trimmed, resetting");
                state.stats.trim_fallbacks += 1;
                reset(&mut state, handle, prompt);
                ReconcileOutcome::Reset
            }
        } else {
            error!(
                prefix_len,
                cache_len, "unexpected cache state: common prefix longer than cache, resetting"
            );
            state.stats.invariant_violations += 1;
            reset(&mut state, handle, prompt);
            ReconcileOutcome::Reset
        };

        let reused = match outcome {
            ReconcileOutcome::Reset => 0,
            _ => prefix_len,
        };
        state.stats.reused_tokens += reused as u64;
        state.epoch += 1;

        let suffix = prompt[reused..].to_vec();
        debug!(tokens = suffix.len(), "returning tokens for processing");

        Ok(ReconciledPrompt {
            suffix,
            reused,
            outcome,
            entries: state.entries.clone(),
            primary_layers: state.primary_layers,
            epoch: state.epoch,
        })
    }

    /// Appends tokens the engine folded in after `reconciled` (e.g. generated
    /// tokens). Skipped when another reconcile has taken the cache since.
    pub fn commit(&self, reconciled: &ReconciledPrompt, folded: &[u32]) -> bool {
        let mut state = self.lock_state();
        if state.epoch != reconciled.epoch {
            debug!(
                expected = reconciled.epoch,
                actual = state.epoch,
                "cache changed hands during generation, not recording generated tokens"
            );
            return false;
        }
        state.tokens.extend_from_slice(folded);
        true
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.lock_state();
        CacheSnapshot {
            model_key: state.model_key.clone(),
            tokens: state.tokens.len(),
            layers: state.entries.len(),
            stats: state.stats,
        }
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.lock_state().tokens.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenCacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reset(state: &mut TokenCacheState, handle: &ModelHandle, prompt: &[u32]) {
    let mut entries = handle.model().make_cache();
    let primary_layers = entries.len();
    if let Some(draft) = handle.draft_model() {
        entries.extend(draft.make_cache());
    }

    state.model_key = Some(handle.key().clone());
    state.load_id = Some(handle.load_id());
    state.entries = entries;
    state.primary_layers = primary_layers;
    state.tokens = prompt.to_vec();
    state.stats.resets += 1;
}
