//! Prompt-cache reuse and hot-swappable model loading for a local LLM server.
//!
//! Connections are served one thread each ([`dispatcher`]). All of them share a
//! single [`registry::ModelRegistry`] and a single [`cache::PromptCache`], so a
//! follow-up request that extends the previous prompt only pays for its suffix.

pub mod backend;
pub mod cache;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod logging;
pub mod prompting;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use cache::{PromptCache, ReconcileOutcome, ReconciledPrompt};
pub use commands::KernelState;
pub use config::ServerConfig;
pub use dispatcher::ConnectionDispatcher;
pub use error::{KernelError, Result};
pub use registry::{ModelHandle, ModelKey, ModelRegistry};
