use crate::engine::{EngineConfig, PromptConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default model (optional)
    pub model: Option<String>,

    /// Provider identifier: "openai" or "stub".
    pub provider: Option<String>,

    /// API key; the CONVERSE_API_KEY env var takes precedence.
    pub api_key: Option<String>,

    /// Override the API base URL (e.g. a proxy).
    pub api_base: Option<String>,

    /// Classifier endpoint for predict turns.
    pub predict_url: Option<String>,

    // Sampling preferences.
    pub role: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,

    // Prompt shaping.
    pub max_tokens: Option<u32>,
    pub result_count: Option<u32>,
    pub logprobs: Option<u32>,
    pub templates: Option<Vec<String>>,
    pub template: Option<usize>,
    pub conversational: Option<bool>,

    /// Capture prompt/completion training pairs alongside the session log.
    pub train: Option<bool>,

    /// Where session snapshots land; defaults under the state dir.
    pub transcript_dir: Option<PathBuf>,
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }

    pub fn engine_config(&self, model_override: Option<&str>) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            model: model_override
                .map(str::to_string)
                .or_else(|| self.model.clone())
                .unwrap_or(defaults.model),
            role: self.role.clone().unwrap_or(defaults.role),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            presence_penalty: self.presence_penalty.unwrap_or(defaults.presence_penalty),
            frequency_penalty: self.frequency_penalty.unwrap_or(defaults.frequency_penalty),
        }
    }

    pub fn prompt_config(&self) -> PromptConfig {
        let defaults = PromptConfig::default();
        PromptConfig {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            result_count: self.result_count.unwrap_or(defaults.result_count),
            logprobs: self.logprobs.unwrap_or(defaults.logprobs),
            templates: self.templates.clone().unwrap_or_default(),
            template: self.template.unwrap_or(0),
            conversational: self.conversational.unwrap_or(false),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none() {
        let got = Config::load_optional("/nonexistent/converse-config.toml").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn overrides_fold_into_engine_config() {
        let cfg: Config = toml::from_str(
            r#"
            model = "text-davinci-003"
            temperature = 0.2
            conversational = true
            templates = ["Q: "]
            "#,
        )
        .unwrap();

        let engine = cfg.engine_config(None);
        assert_eq!(engine.model, "text-davinci-003");
        assert!((engine.temperature - 0.2).abs() < f32::EPSILON);

        let engine = cfg.engine_config(Some("gpt-4"));
        assert_eq!(engine.model, "gpt-4");

        let prompt = cfg.prompt_config();
        assert!(prompt.conversational);
        assert_eq!(prompt.templates, vec!["Q: "]);
    }
}
