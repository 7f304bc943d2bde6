use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use candle_core::Device;
use tracing::info;

use prompt_cache_kernel::backend::{GgufModelLoader, WorkspacePathValidator};
use prompt_cache_kernel::engine::CandleEngine;
use prompt_cache_kernel::{
    logging, ConnectionDispatcher, KernelState, ModelRegistry, PromptCache, ServerConfig,
};

fn config_path() -> Option<PathBuf> {
    env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| env::var_os("KERNEL_CONFIG").map(PathBuf::from))
}

fn main() -> anyhow::Result<()> {
    let config = match config_path() {
        Some(path) => ServerConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    logging::init(&config.log_level, config.log_format);

    let loader = GgufModelLoader::new(Device::Cpu, config.tokenizer_repo.clone());
    let validator = WorkspacePathValidator::new(config.models_root.clone());
    let registry = ModelRegistry::new(
        Arc::new(loader),
        Arc::new(validator),
        config.registry_settings(),
    );

    let kernel = Arc::new(KernelState::new(
        Arc::new(registry),
        Arc::new(PromptCache::new()),
        Arc::new(CandleEngine::new()),
        config.generation_config(),
        config.chat_template_args.clone(),
    ));

    info!(
        model = ?config.model,
        draft = ?config.draft_model,
        models_root = %config.models_root.display(),
        "prompt cache kernel starting"
    );

    let dispatcher = ConnectionDispatcher::bind(config.bind_addr(), kernel)
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    dispatcher.serve().context("accept loop failed")?;
    Ok(())
}
