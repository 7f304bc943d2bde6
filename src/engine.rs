use std::sync::Arc;

use candle_core::{DType, Tensor};
use candle_transformers::generation::LogitsProcessor;
use tracing::debug;

use crate::backend::LanguageModel;
use crate::cache::{LayerCache, ReconciledPrompt};
use crate::error::Result;
use crate::prompting::GenerationConfig;
use crate::registry::ModelHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens: Vec<u32>,
    /// How many of `tokens` were fed back through the model.
    pub folded: usize,
    pub finish: FinishReason,
}

impl Generation {
    pub fn folded_tokens(&self) -> &[u32] {
        &self.tokens[..self.folded]
    }
}

/// Folds a reconciled prompt into the cache and produces a completion.
pub trait InferenceEngine: Send + Sync {
    fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &ReconciledPrompt,
        params: &GenerationConfig,
    ) -> Result<Generation>;
}

/// Plain autoregressive sampling over candle models.
///
/// A draft model, when loaded, is fed the same tokens so its layers stay at
/// the same position as the primary model's.
#[derive(Debug, Default)]
pub struct CandleEngine;

impl CandleEngine {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceEngine for CandleEngine {
    fn generate(
        &self,
        handle: &ModelHandle,
        prompt: &ReconciledPrompt,
        params: &GenerationConfig,
    ) -> Result<Generation> {
        let tokenizer = handle.tokenizer();
        let eos = tokenizer.eos_token_ids();
        let mut logits_processor = LogitsProcessor::from_sampling(params.seed, params.sampling());

        let mut position = prompt.position();
        let mut tokens: Vec<u32> = Vec::new();
        let mut folded = 0;
        let mut input = prompt.suffix.clone();

        debug!(
            position,
            prefill = input.len(),
            max_tokens = params.max_tokens,
            "starting generation"
        );

        let finish = loop {
            let logits = prefill(handle.model(), prompt.primary(), &input, position)?;
            if let Some(draft) = handle.draft_model() {
                prefill(draft, prompt.draft(), &input, position)?;
            }
            position += input.len();
            if !tokens.is_empty() {
                folded += 1;
            }

            let logits = apply_min_p(&logits.to_dtype(DType::F32)?, params)?;
            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);

            if eos.contains(&next_token) {
                break FinishReason::Stop;
            }
            if tokens.len() >= params.max_tokens {
                break FinishReason::Length;
            }
            input = vec![next_token];
        };

        let visible: Vec<u32> = tokens
            .iter()
            .copied()
            .filter(|t| !eos.contains(t))
            .collect();
        let text = tokenizer.decode(&visible)?;

        debug!(generated = tokens.len(), folded, ?finish, "generation finished");
        Ok(Generation {
            text,
            tokens,
            folded,
            finish,
        })
    }
}

/// Masks every token whose probability at the sampling temperature is below
/// `min_p` times the most likely token's. Greedy decoding is left untouched.
fn apply_min_p(logits: &Tensor, params: &GenerationConfig) -> Result<Tensor> {
    if params.min_p <= 0.0 || params.temperature <= 0.0 {
        return Ok(logits.clone());
    }
    let mut values = logits.to_vec1::<f32>()?;
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    // p_i / p_max = exp((l_i - l_max) / T)
    let floor = (f64::from(max) + params.temperature * params.min_p.ln()) as f32;
    for value in values.iter_mut().filter(|v| **v < floor) {
        *value = f32::NEG_INFINITY;
    }
    Ok(Tensor::from_vec(values, logits.shape(), logits.device())?)
}

// Batched only from position 0; later chunks go one token at a time.
fn prefill(
    model: &Arc<dyn LanguageModel>,
    layers: &[Arc<dyn LayerCache>],
    input: &[u32],
    position: usize,
) -> Result<Tensor> {
    let logits = if position == 0 {
        model.forward(input, position)?
    } else {
        let mut last = None;
        for (i, token) in input.iter().enumerate() {
            last = Some(model.forward(std::slice::from_ref(token), position + i)?);
        }
        match last {
            Some(logits) => logits,
            None => model.forward(input, position)?,
        }
    };

    for layer in layers {
        layer.advance(input.len());
    }
    Ok(logits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PromptCache;
    use candle_core::Device;
    use crate::registry::testing::{FakeModel, FakeTokenizer};
    use crate::registry::ModelKey;

    fn fake_handle(eos: Vec<u32>, draft: bool) -> ModelHandle {
        let mut tokenizer = FakeTokenizer::new(16);
        tokenizer.eos = eos;
        let draft_model: Option<Arc<dyn LanguageModel>> = if draft {
            Some(Arc::new(FakeModel::new(1, true)))
        } else {
            None
        };
        ModelHandle::new(
            ModelKey::new("fake", None, None),
            Arc::new(FakeModel::new(2, true)),
            Box::new(tokenizer),
            draft_model,
        )
    }

    #[test]
    fn greedy_generation_stops_at_max_tokens() {
        let handle = fake_handle(vec![0], false);
        let cache = PromptCache::new();
        let prompt = cache.reconcile(&handle, &[3, 4]).expect("reconcile");

        let params = GenerationConfig {
            max_tokens: 3,
            ..GenerationConfig::default()
        };
        let gen = CandleEngine::new()
            .generate(&handle, &prompt, &params)
            .expect("generate");

        assert_eq!(gen.tokens, vec![5, 6, 7]);
        assert_eq!(gen.finish, FinishReason::Length);
        assert_eq!(gen.folded_tokens(), &[5, 6]);
        assert_eq!(gen.text, "<5><6><7>");
        // prompt (2) + folded generated tokens (2)
        assert!(prompt.entries().iter().all(|layer| layer.offset() == 4));
    }

    #[test]
    fn eos_ends_generation_and_is_not_decoded() {
        let handle = fake_handle(vec![6], false);
        let cache = PromptCache::new();
        let prompt = cache.reconcile(&handle, &[4]).expect("reconcile");

        let gen = CandleEngine::new()
            .generate(&handle, &prompt, &GenerationConfig::default())
            .expect("generate");

        assert_eq!(gen.tokens, vec![5, 6]);
        assert_eq!(gen.finish, FinishReason::Stop);
        assert_eq!(gen.text, "<5>");
    }

    #[test]
    fn min_p_masks_tokens_below_the_threshold() {
        let logits = Tensor::new(&[10f32, 9.0, 0.0, 5.0], &Device::Cpu).expect("logits");
        let params = GenerationConfig {
            temperature: 1.0,
            min_p: 0.1,
            ..GenerationConfig::default()
        };

        let masked = apply_min_p(&logits, &params)
            .expect("min_p")
            .to_vec1::<f32>()
            .expect("values");
        // exp(-1) stays above 0.1, exp(-5) and exp(-10) do not.
        assert_eq!(masked[0], 10.0);
        assert_eq!(masked[1], 9.0);
        assert_eq!(masked[2], f32::NEG_INFINITY);
        assert_eq!(masked[3], f32::NEG_INFINITY);

        let greedy = GenerationConfig {
            min_p: 0.1,
            ..GenerationConfig::default()
        };
        let untouched = apply_min_p(&logits, &greedy)
            .expect("greedy")
            .to_vec1::<f32>()
            .expect("values");
        assert_eq!(untouched, vec![10.0, 9.0, 0.0, 5.0]);
    }

    #[test]
    fn min_p_keeps_unlikely_tokens_out_of_sampling() {
        let handle = fake_handle(vec![0], false);
        let cache = PromptCache::new();

        for seed in 0..32 {
            let prompt = cache.reconcile(&handle, &[4]).expect("reconcile");
            let params = GenerationConfig {
                temperature: 2.0,
                min_p: 0.05,
                seed,
                max_tokens: 4,
                ..GenerationConfig::default()
            };
            let gen = CandleEngine::new()
                .generate(&handle, &prompt, &params)
                .expect("generate");
            assert_eq!(gen.tokens, vec![5, 6, 7, 8], "seed {}", seed);
        }
    }

    #[test]
    fn draft_layers_advance_with_primary() {
        let handle = fake_handle(vec![0], true);
        let cache = PromptCache::new();
        let prompt = cache.reconcile(&handle, &[1, 2, 3]).expect("reconcile");

        let params = GenerationConfig {
            max_tokens: 2,
            ..GenerationConfig::default()
        };
        CandleEngine::new()
            .generate(&handle, &prompt, &params)
            .expect("generate");

        assert_eq!(prompt.draft().len(), 1);
        assert_eq!(prompt.draft()[0].offset(), prompt.primary()[0].offset());
        assert_eq!(prompt.primary()[0].offset(), 4);
    }
}
