use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide request counters reported by `STATUS`.
#[derive(Debug)]
pub struct CommandMetrics {
    started: Instant,
    total_commands: AtomicU64,
    total_errors: AtomicU64,
    total_generations: AtomicU64,
    generated_tokens: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_s: u64,
    pub total_commands: u64,
    pub total_errors: u64,
    pub total_generations: u64,
    pub generated_tokens: u64,
}

impl Default for CommandMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            total_commands: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_generations: AtomicU64::new(0),
            generated_tokens: AtomicU64::new(0),
        }
    }
}

impl CommandMetrics {
    pub fn record_command(&self, success: bool) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_generation(&self, tokens: usize) {
        self.total_generations.fetch_add(1, Ordering::Relaxed);
        self.generated_tokens
            .fetch_add(tokens as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_s: self.started.elapsed().as_secs(),
            total_commands: self.total_commands.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_generations: self.total_generations.load(Ordering::Relaxed),
            generated_tokens: self.generated_tokens.load(Ordering::Relaxed),
        }
    }
}
