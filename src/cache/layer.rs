use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-layer attention state owned by the engine.
///
/// Entries are shared between the prompt cache and whichever engine call is
/// currently folding tokens into them, so every method takes `&self`.
pub trait LayerCache: Send + Sync {
    /// Number of token positions folded into this layer.
    fn offset(&self) -> usize;

    fn is_trimmable(&self) -> bool;

    /// Drops up to `n` trailing positions, returning how many were removed.
    fn trim(&self, n: usize) -> usize;

    /// Records that `n` more positions were written by the engine.
    fn advance(&self, n: usize);
}

pub type CacheEntries = Vec<Arc<dyn LayerCache>>;

pub fn can_trim_prompt_cache(entries: &[Arc<dyn LayerCache>]) -> bool {
    entries.iter().all(|layer| layer.is_trimmable())
}

/// Trims every layer by `n`, returning the count removed from the first layer.
pub fn trim_prompt_cache(entries: &[Arc<dyn LayerCache>], n: usize) -> usize {
    if !can_trim_prompt_cache(entries) {
        return 0;
    }
    let mut first = None;
    for layer in entries {
        let removed = layer.trim(n);
        first.get_or_insert(removed);
    }
    first.unwrap_or(0)
}

/// Position counter for backends that keep their key/value tensors internally.
///
/// Quantized GGUF weights only rebuild their attention state when a forward
/// pass starts again at position 0, so those entries are created untrimmable.
#[derive(Debug)]
pub struct PositionCache {
    offset: AtomicUsize,
    trimmable: bool,
}

impl PositionCache {
    pub fn new(trimmable: bool) -> Self {
        Self {
            offset: AtomicUsize::new(0),
            trimmable,
        }
    }

    pub fn layers(count: usize, trimmable: bool) -> CacheEntries {
        (0..count)
            .map(|_| Arc::new(Self::new(trimmable)) as Arc<dyn LayerCache>)
            .collect()
    }
}

impl LayerCache for PositionCache {
    fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    fn is_trimmable(&self) -> bool {
        self.trimmable
    }

    fn trim(&self, n: usize) -> usize {
        if !self.trimmable {
            return 0;
        }
        let mut removed = 0;
        let _ = self
            .offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                removed = n.min(current);
                Some(current - removed)
            });
        removed
    }

    fn advance(&self, n: usize) {
        self.offset.fetch_add(n, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_is_clamped_to_offset() {
        let layer = PositionCache::new(true);
        layer.advance(4);
        assert_eq!(layer.trim(10), 4);
        assert_eq!(layer.offset(), 0);
    }

    #[test]
    fn untrimmable_layers_block_the_whole_set() {
        let mut entries = PositionCache::layers(2, true);
        entries.extend(PositionCache::layers(1, false));
        for layer in &entries {
            layer.advance(5);
        }

        assert!(!can_trim_prompt_cache(&entries));
        assert_eq!(trim_prompt_cache(&entries, 3), 0);
        assert!(entries.iter().all(|layer| layer.offset() == 5));
    }

    #[test]
    fn trim_applies_to_every_layer() {
        let entries = PositionCache::layers(3, true);
        for layer in &entries {
            layer.advance(5);
        }

        assert_eq!(trim_prompt_cache(&entries, 3), 3);
        assert!(entries.iter().all(|layer| layer.offset() == 2));
    }

    #[test]
    fn trim_reports_first_layer_but_trims_the_rest() {
        let entries = PositionCache::layers(3, true);
        entries[0].advance(2);
        entries[1].advance(6);
        entries[2].advance(6);

        assert_eq!(trim_prompt_cache(&entries, 4), 2);
        assert_eq!(entries[0].offset(), 0);
        assert_eq!(entries[1].offset(), 2);
        assert_eq!(entries[2].offset(), 2);
    }
}
