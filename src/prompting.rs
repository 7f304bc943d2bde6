use candle_transformers::generation::Sampling;
use minijinja::{context, Environment};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::backend::ChatTokenizer;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    /// Drops tokens less likely than `min_p` times the top token. 0 disables.
    pub min_p: f64,
    pub seed: u64,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            top_k: 0,
            min_p: 0.0,
            seed: 299_792_458,
            max_tokens: 512,
        }
    }
}

impl GenerationConfig {
    pub fn sampling(&self) -> Sampling {
        let temperature = self.temperature;
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let use_top_p = self.top_p > 0.0 && self.top_p < 1.0;
        match (self.top_k, use_top_p) {
            (0, false) => Sampling::All { temperature },
            (0, true) => Sampling::TopP {
                p: self.top_p,
                temperature,
            },
            (k, false) => Sampling::TopK { k, temperature },
            (k, true) => Sampling::TopKThenTopP {
                k,
                p: self.top_p,
                temperature,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a str,
}

/// Renders `messages` with the tokenizer's chat template, or its built-in
/// default when the model ships none. `extra` is merged into the template
/// context (e.g. `enable_thinking`).
pub fn render_chat(
    tokenizer: &dyn ChatTokenizer,
    messages: &[ChatMessage<'_>],
    extra: &Map<String, Value>,
) -> Result<String> {
    let source = tokenizer
        .chat_template()
        .unwrap_or_else(|| tokenizer.default_chat_template());

    let mut env = Environment::new();
    env.add_template("chat", source)?;
    let template = env.get_template("chat")?;

    let rendered = template.render(context! {
        messages => messages,
        add_generation_prompt => true,
        bos_token => tokenizer.bos_token().unwrap_or(""),
        eos_token => tokenizer.eos_token().unwrap_or(""),
        ..minijinja::Value::from_serialize(extra)
    })?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::FakeTokenizer;

    #[test]
    fn zero_temperature_is_greedy() {
        let cfg = GenerationConfig::default();
        assert!(matches!(cfg.sampling(), Sampling::ArgMax));
    }

    #[test]
    fn top_k_and_top_p_combine() {
        let cfg = GenerationConfig {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            ..GenerationConfig::default()
        };
        assert!(matches!(
            cfg.sampling(),
            Sampling::TopKThenTopP { k: 40, .. }
        ));
    }

    #[test]
    fn falls_back_to_default_template() {
        let tok = FakeTokenizer::new(16);
        let rendered = render_chat(
            &tok,
            &[ChatMessage {
                role: "user",
                content: "hello",
            }],
            &Map::new(),
        )
        .expect("render");
        assert_eq!(rendered, "<user>hello");
    }

    #[test]
    fn extra_args_reach_the_template() {
        let mut tok = FakeTokenizer::new(16);
        tok.template = Some(
            "{% if enable_thinking %}think{% else %}plain{% endif %}:{{ messages[0].content }}"
                .to_string(),
        );
        let mut extra = Map::new();
        extra.insert("enable_thinking".to_string(), Value::Bool(false));

        let rendered = render_chat(
            &tok,
            &[ChatMessage {
                role: "user",
                content: "hi",
            }],
            &extra,
        )
        .expect("render");
        assert_eq!(rendered, "plain:hi");
    }
}
