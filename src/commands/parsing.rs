use crate::prompting::GenerationConfig;
use crate::registry::{ModelKey, DEFAULT_MODEL};

/// Key a connection asks for before it sends `LOAD`.
pub(crate) fn default_request_key() -> ModelKey {
    ModelKey::new(DEFAULT_MODEL, None, Some(DEFAULT_MODEL.to_string()))
}

/// Parses `model=<path>;adapter=<path>;draft=<path>`. Every key is optional; a
/// payload without `=` is taken as the model path alone.
pub(crate) fn parse_load_payload(payload: &str) -> Result<ModelKey, String> {
    let mut key = default_request_key();
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(key);
    }
    if !payload.contains('=') {
        key.model = payload.to_string();
        return Ok(key);
    }

    for pair in payload.split(';') {
        let item = pair.trim();
        if item.is_empty() {
            continue;
        }

        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| format!("Invalid item '{}'. Expected key=value", item))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("Empty value for LOAD key '{}'.", name.trim()));
        }

        match name.trim().to_lowercase().as_str() {
            "model" => key.model = value.to_string(),
            "adapter" | "adapter_path" => key.adapter = Some(value.to_string()),
            "draft" | "draft_model" => {
                key.draft = if value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            other => return Err(format!("Unknown LOAD key '{}'.", other)),
        }
    }

    Ok(key)
}

pub(crate) fn parse_generation_payload(
    payload: &str,
    base: GenerationConfig,
) -> Result<GenerationConfig, String> {
    if payload.is_empty() {
        return Err("SET_GEN payload is empty. Use key=value pairs.".to_string());
    }

    let mut cfg = base;

    for pair in payload.split([',', ';']) {
        let item = pair.trim();
        if item.is_empty() {
            continue;
        }

        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| format!("Invalid item '{}'. Expected key=value", item))?;
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "temperature" | "temp" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid temperature '{}'.", value))?;
                if !(0.0..=2.0).contains(&parsed) {
                    return Err("temperature must be in [0.0, 2.0]".to_string());
                }
                cfg.temperature = parsed;
            }
            "top_p" | "topp" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid top_p '{}'.", value))?;
                if !(0.0..=1.0).contains(&parsed) {
                    return Err("top_p must be in [0.0, 1.0]".to_string());
                }
                cfg.top_p = parsed;
            }
            "min_p" | "minp" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| format!("Invalid min_p '{}'.", value))?;
                if !(0.0..=1.0).contains(&parsed) {
                    return Err("min_p must be in [0.0, 1.0]".to_string());
                }
                cfg.min_p = parsed;
            }
            "top_k" | "topk" => {
                cfg.top_k = value
                    .parse()
                    .map_err(|_| format!("Invalid top_k '{}'.", value))?;
            }
            "seed" => {
                cfg.seed = value
                    .parse()
                    .map_err(|_| format!("Invalid seed '{}'.", value))?;
            }
            "max_tokens" | "max_new_tokens" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid max_tokens '{}'.", value))?;
                if parsed == 0 {
                    return Err("max_tokens must be > 0".to_string());
                }
                cfg.max_tokens = parsed;
            }
            _ => return Err(format!("Unknown SET_GEN key '{}'.", key)),
        }
    }

    Ok(cfg)
}
