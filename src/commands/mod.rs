mod metrics;
mod parsing;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cache::PromptCache;
use crate::engine::InferenceEngine;
use crate::error::{KernelError, Result};
use crate::prompting::{render_chat, ChatMessage, GenerationConfig};
use crate::protocol::{self, CommandHeader, OpCode};
use crate::registry::{ModelKey, ModelRegistry};

pub use self::metrics::{CommandMetrics, MetricsSnapshot};
use self::parsing::{default_request_key, parse_generation_payload, parse_load_payload};

/// Process-wide objects every connection thread works against.
pub struct KernelState {
    pub registry: Arc<ModelRegistry>,
    pub cache: Arc<PromptCache>,
    pub engine: Arc<dyn InferenceEngine>,
    /// Defaults each new connection starts from.
    pub generation: GenerationConfig,
    pub chat_template_args: Map<String, Value>,
    pub metrics: CommandMetrics,
}

impl KernelState {
    pub fn new(
        registry: Arc<ModelRegistry>,
        cache: Arc<PromptCache>,
        engine: Arc<dyn InferenceEngine>,
        generation: GenerationConfig,
        chat_template_args: Map<String, Value>,
    ) -> Self {
        Self {
            registry,
            cache,
            engine,
            generation,
            chat_template_args,
            metrics: CommandMetrics::default(),
        }
    }
}

/// Per-connection request state.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: usize,
    pub requested: ModelKey,
    pub generation: GenerationConfig,
}

impl Session {
    pub fn new(client_id: usize, generation: GenerationConfig) -> Self {
        Self {
            client_id,
            requested: default_request_key(),
            generation,
        }
    }
}

enum PromptInput {
    Text(String),
    Chat(String),
    Tokens(Vec<u32>),
}

pub fn execute_command(
    kernel: &KernelState,
    session: &mut Session,
    header: CommandHeader,
    payload: Vec<u8>,
) -> Vec<u8> {
    let client_id = session.client_id;
    debug!(client_id, agent = %header.agent_id, opcode = ?header.opcode, "command received");

    let response = match header.opcode {
        OpCode::Ping => protocol::response_ok_code("PING", "PONG"),
        OpCode::Load => {
            let text = String::from_utf8_lossy(&payload);
            match parse_load_payload(&text) {
                Ok(key) => match kernel.registry.ensure_loaded(&key) {
                    Ok(handle) => {
                        session.requested = key;
                        protocol::response_ok_code("LOAD", &handle.key().to_string())
                    }
                    Err(e) => error_response(client_id, &e),
                },
                Err(e) => protocol::response_err_code("LOAD_INVALID", &e),
            }
        }
        OpCode::Exec => match String::from_utf8(payload) {
            Ok(text) => run_prompt(kernel, session, PromptInput::Text(text)),
            Err(_) => protocol::response_err_code("EXEC_INVALID", "EXEC payload must be UTF-8"),
        },
        OpCode::Chat => match String::from_utf8(payload) {
            Ok(text) => run_prompt(kernel, session, PromptInput::Chat(text)),
            Err(_) => protocol::response_err_code("CHAT_INVALID", "CHAT payload must be UTF-8"),
        },
        OpCode::Tokens => match protocol::decode_token_ids(&payload) {
            Ok(ids) => run_prompt(kernel, session, PromptInput::Tokens(ids)),
            Err(e) => protocol::response_err_code("TOKENS_INVALID", &e),
        },
        OpCode::SetGen => {
            let text = String::from_utf8_lossy(&payload);
            match parse_generation_payload(text.trim(), session.generation) {
                Ok(cfg) => {
                    session.generation = cfg;
                    protocol::response_ok_code(
                        "SET_GEN",
                        &format!(
                            "temperature={} top_p={} top_k={} min_p={} seed={} max_tokens={}",
                            cfg.temperature,
                            cfg.top_p,
                            cfg.top_k,
                            cfg.min_p,
                            cfg.seed,
                            cfg.max_tokens
                        ),
                    )
                }
                Err(e) => protocol::response_err_code("SET_GEN_INVALID", &e),
            }
        }
        OpCode::Status => status_response(kernel, session),
    };

    kernel.metrics.record_command(response.starts_with(b"+OK") || response.starts_with(b"DATA"));
    response
}

fn run_prompt(kernel: &KernelState, session: &Session, input: PromptInput) -> Vec<u8> {
    match generate(kernel, session, input) {
        Ok(response) => response,
        Err(e) => error_response(session.client_id, &e),
    }
}

fn generate(kernel: &KernelState, session: &Session, input: PromptInput) -> Result<Vec<u8>> {
    let handle = kernel.registry.ensure_loaded(&session.requested)?;
    let tokenizer = handle.tokenizer();

    let prompt = match input {
        PromptInput::Text(text) => tokenizer.encode(&text)?,
        PromptInput::Chat(message) => {
            let rendered = render_chat(
                tokenizer,
                &[ChatMessage {
                    role: "user",
                    content: &message,
                }],
                &kernel.chat_template_args,
            )?;
            tokenizer.encode(&rendered)?
        }
        PromptInput::Tokens(ids) => ids,
    };

    let reconciled = kernel.cache.reconcile(&handle, &prompt)?;
    let generation = kernel
        .engine
        .generate(&handle, &reconciled, &session.generation)?;
    kernel.cache.commit(&reconciled, generation.folded_tokens());
    kernel.metrics.record_generation(generation.tokens.len());

    info!(
        client_id = session.client_id,
        prompt_len = prompt.len(),
        reused = reconciled.reused,
        generated = generation.tokens.len(),
        finish = ?generation.finish,
        "generation complete"
    );

    let mut response = protocol::response_data(generation.text.as_bytes());
    response.extend(protocol::response_ok_code(
        "EXEC",
        &format!(
            "processed={} reused={} generated={}",
            reconciled.suffix.len(),
            reconciled.reused,
            generation.tokens.len()
        ),
    ));
    Ok(response)
}

fn status_response(kernel: &KernelState, session: &Session) -> Vec<u8> {
    let cache = kernel.cache.snapshot();
    let m = kernel.metrics.snapshot();
    let loaded = kernel
        .registry
        .model_key()
        .map(|key| key.model)
        .unwrap_or_else(|| "-".to_string());
    let cfg = session.generation;

    protocol::response_ok_code(
        "STATUS",
        &format!(
            "uptime_s={} total_commands={} total_errors={} total_generations={} generated_tokens={} loaded_model={} requested_model={} cache_tokens={} cache_layers={} resets={} extends={} trims={} trim_fallbacks={} invariant_violations={} reused_tokens={} generation=temperature:{} top_p:{} top_k:{} min_p:{} seed:{} max_tokens:{}",
            m.uptime_s,
            m.total_commands,
            m.total_errors,
            m.total_generations,
            m.generated_tokens,
            loaded,
            session.requested.model,
            cache.tokens,
            cache.layers,
            cache.stats.resets,
            cache.stats.extends,
            cache.stats.trims,
            cache.stats.trim_fallbacks,
            cache.stats.invariant_violations,
            cache.stats.reused_tokens,
            cfg.temperature,
            cfg.top_p,
            cfg.top_k,
            cfg.min_p,
            cfg.seed,
            cfg.max_tokens,
        ),
    )
}

fn error_response(client_id: usize, err: &KernelError) -> Vec<u8> {
    warn!(client_id, code = err.code(), error = %err, "request failed");
    protocol::response_err_code(err.code(), &err.to_string())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::CandleEngine;
    use crate::registry::testing::{AllowListValidator, CountingLoader};
    use crate::registry::{RegistrySettings, DEFAULT_MODEL};

    fn kernel_with(loader: Arc<CountingLoader>, validator: Arc<AllowListValidator>) -> KernelState {
        let settings = RegistrySettings {
            default_model: Some(PathBuf::from("models/default.gguf")),
            ..RegistrySettings::default()
        };
        let registry = Arc::new(ModelRegistry::new(loader, validator, settings));
        let generation = GenerationConfig {
            max_tokens: 2,
            ..GenerationConfig::default()
        };
        KernelState::new(
            registry,
            Arc::new(PromptCache::new()),
            Arc::new(CandleEngine::new()),
            generation,
            Map::new(),
        )
    }

    fn kernel() -> KernelState {
        kernel_with(
            Arc::new(CountingLoader::default()),
            Arc::new(AllowListValidator::default()),
        )
    }

    fn header(line: &str) -> CommandHeader {
        CommandHeader::parse(line).expect("header")
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).expect("utf8 response")
    }

    #[test]
    fn ping_and_status_without_model() {
        let kernel = kernel();
        let mut session = Session::new(1, kernel.generation);

        let pong = execute_command(&kernel, &mut session, header("PING"), Vec::new());
        assert_eq!(text(pong), "+OK PING PONG\r\n");

        let status = text(execute_command(&kernel, &mut session, header("STATUS"), Vec::new()));
        assert!(status.starts_with("+OK STATUS "));
        assert!(status.contains("loaded_model=-"));
        assert!(status.contains("cache_tokens=0"));
        assert!(status.contains("total_commands=1"));
    }

    #[test]
    fn exec_reuses_the_shared_prefix() {
        let kernel = kernel();
        let mut session = Session::new(1, kernel.generation);

        let first = text(execute_command(
            &kernel,
            &mut session,
            header("EXEC a 4"),
            b"abcd".to_vec(),
        ));
        assert!(first.starts_with("DATA raw "));
        assert!(first.ends_with("+OK EXEC processed=4 reused=0 generated=2\r\n"));

        // prompt (4) plus the one folded generated token are now cached
        assert_eq!(kernel.cache.tokens().len(), 5);

        // 'e' encodes to the token generated above, so it is reused too.
        let second = text(execute_command(
            &kernel,
            &mut session,
            header("EXEC a 6"),
            b"abcdef".to_vec(),
        ));
        assert!(second.ends_with("+OK EXEC processed=1 reused=5 generated=2\r\n"));
    }

    #[test]
    fn tokens_command_runs_raw_ids() {
        let kernel = kernel();
        let mut session = Session::new(7, kernel.generation);
        let payload = protocol::encode_token_ids(&[3, 4]);

        let response = text(execute_command(&kernel, &mut session, header("TOKENS t 8"), payload));
        // fake model predicts last + 1
        assert_eq!(
            response,
            "DATA raw 6\r\n<5><6>+OK EXEC processed=2 reused=0 generated=2\r\n"
        );

        let bad = text(execute_command(&kernel, &mut session, header("TOKENS t 3"), vec![1, 2, 3]));
        assert!(bad.starts_with("-ERR TOKENS_INVALID"));
    }

    #[test]
    fn chat_renders_the_template_before_tokenizing() {
        let kernel = kernel();
        let mut session = Session::new(1, kernel.generation);

        let response = text(execute_command(&kernel, &mut session, header("CHAT c 2"), b"hi".to_vec()));
        // "<user>hi" is 8 bytes, one token each
        assert!(response.ends_with("+OK EXEC processed=8 reused=0 generated=2\r\n"));
    }

    #[test]
    fn empty_prompt_is_reported_not_fatal() {
        let kernel = kernel();
        let mut session = Session::new(1, kernel.generation);

        let response = text(execute_command(&kernel, &mut session, header("EXEC"), Vec::new()));
        assert!(response.starts_with("-ERR EMPTY_PROMPT"));

        let status = text(execute_command(&kernel, &mut session, header("STATUS"), Vec::new()));
        assert!(status.contains("total_errors=1"));
    }

    #[test]
    fn load_switches_the_session_model() {
        let loader = Arc::new(CountingLoader::default());
        let validator = Arc::new(AllowListValidator {
            rejected: vec!["../etc/passwd".to_string()],
            ..AllowListValidator::default()
        });
        let kernel = kernel_with(Arc::clone(&loader), Arc::clone(&validator));
        let mut session = Session::new(1, kernel.generation);

        let payload = b"model=models/other.gguf;draft=none".to_vec();
        let ok = text(execute_command(&kernel, &mut session, header("LOAD l 34"), payload));
        assert_eq!(ok, "+OK LOAD model=models/other.gguf adapter=- draft=-\r\n");
        assert_eq!(session.requested.model, "models/other.gguf");
        assert_eq!(loader.load_count(), 1);

        // Same key again: no reload.
        let exec = text(execute_command(&kernel, &mut session, header("EXEC e 2"), b"hi".to_vec()));
        assert!(exec.contains("+OK EXEC"));
        assert_eq!(loader.load_count(), 1);

        let rejected = text(execute_command(
            &kernel,
            &mut session,
            header("LOAD l 19"),
            b"model=../etc/passwd".to_vec(),
        ));
        assert!(rejected.starts_with("-ERR INVALID_PATH"));
        assert_eq!(session.requested.model, "models/other.gguf");
        assert!(validator.calls.load(Ordering::SeqCst) >= 2);
        assert!(kernel.registry.current().is_none());
    }

    #[test]
    fn set_gen_is_per_session() {
        let kernel = kernel();
        let mut first = Session::new(1, kernel.generation);
        let second = Session::new(2, kernel.generation);

        let ok = text(execute_command(
            &kernel,
            &mut first,
            header("SET_GEN s 12"),
            b"max_tokens=1".to_vec(),
        ));
        assert!(ok.starts_with("+OK SET_GEN"));
        assert_eq!(first.generation.max_tokens, 1);
        assert_eq!(second.generation.max_tokens, 2);
        assert_eq!(first.requested.model, DEFAULT_MODEL);
    }
}
