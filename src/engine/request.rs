use super::error::EngineError;
use super::result::PredictOutcome;
use serde::{Deserialize, Serialize};

/// Which provider surface a turn talks to. Decided once when the request is
/// built, never re-derived from display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnKind {
    Completion,
    Chat,
    Edit,
    Embedding,
    Predict,
}

impl TurnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnKind::Completion => "completion",
            TurnKind::Chat => "chat",
            TurnKind::Edit => "edit",
            TurnKind::Embedding => "embedding",
            TurnKind::Predict => "predict",
        }
    }
}

impl std::str::FromStr for TurnKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completion" => Ok(TurnKind::Completion),
            "chat" => Ok(TurnKind::Chat),
            "edit" => Ok(TurnKind::Edit),
            "embedding" => Ok(TurnKind::Embedding),
            "predict" => Ok(TurnKind::Predict),
            other => anyhow::bail!("unknown turn kind: {other}"),
        }
    }
}

/// Provider-facing sampling preferences. Immutable per turn: the builder
/// clones these into the request, so later preference edits never reach an
/// in-flight turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: String,
    pub role: String,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            role: "user".to_string(),
            temperature: 1.0,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Prompt-side state for the conversation: the ordered input segments, the
/// running transcript, and per-turn shaping knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Ordered input segments; the last entry is the latest user text.
    pub inputs: Vec<String>,
    /// Instruction segments, only consulted for edit turns.
    pub instructions: Vec<String>,
    pub max_tokens: u32,
    pub result_count: u32,
    pub logprobs: u32,
    /// Accumulated response transcript, turn boundaries included.
    pub content: String,
    /// Prompt templates; `template` selects the active prefix.
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub template: usize,
    /// Thread the cached prior response into the next prompt.
    #[serde(default)]
    pub conversational: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            instructions: Vec::new(),
            max_tokens: 256,
            result_count: 1,
            logprobs: 0,
            content: String::new(),
            templates: Vec::new(),
            template: 0,
            conversational: false,
        }
    }
}

impl PromptConfig {
    fn template_prefix(&self) -> &str {
        self.templates
            .get(self.template)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Classifier-turn state: the document under classification plus the last
/// classifier output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictConfig {
    pub input: String,
    pub result: PredictOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// One normalized provider request. Each variant carries exactly the fields
/// its kind needs; no variant aliases live configuration.
#[derive(Debug, Clone)]
pub enum Request {
    Completion {
        model: String,
        prompt: String,
        max_tokens: u32,
        n: u32,
        logprobs: u32,
        temperature: f32,
        top_p: f32,
        presence_penalty: f32,
        frequency_penalty: f32,
    },
    Chat {
        model: String,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        n: u32,
        temperature: f32,
        top_p: f32,
        presence_penalty: f32,
        frequency_penalty: f32,
    },
    Edit {
        model: String,
        input: String,
        instruction: String,
        n: u32,
        temperature: f32,
        top_p: f32,
    },
    Embedding {
        model: String,
        input: Vec<String>,
    },
    Predict {
        document: String,
    },
}

impl Request {
    pub fn kind(&self) -> TurnKind {
        match self {
            Request::Completion { .. } => TurnKind::Completion,
            Request::Chat { .. } => TurnKind::Chat,
            Request::Edit { .. } => TurnKind::Edit,
            Request::Embedding { .. } => TurnKind::Embedding,
            Request::Predict { .. } => TurnKind::Predict,
        }
    }
}

/// Assemble a normalized request for one turn from the current configuration
/// and the cached prior response. All configuration is copied in.
pub fn build_request(
    kind: TurnKind,
    engine: &EngineConfig,
    prompt: &PromptConfig,
    predict: &PredictConfig,
    cached_prior: &str,
) -> Result<Request, EngineError> {
    let latest = prompt.inputs.last().map(String::as_str).unwrap_or("");

    match kind {
        TurnKind::Completion => {
            let text = compose_prompt(prompt, cached_prior, latest);
            Ok(Request::Completion {
                model: engine.model.clone(),
                prompt: text,
                max_tokens: prompt.max_tokens,
                n: prompt.result_count,
                logprobs: prompt.logprobs,
                temperature: engine.temperature,
                top_p: engine.top_p,
                presence_penalty: engine.presence_penalty,
                frequency_penalty: engine.frequency_penalty,
            })
        }
        TurnKind::Chat => {
            let text = compose_prompt(prompt, cached_prior, latest);
            Ok(Request::Chat {
                model: engine.model.clone(),
                messages: vec![ChatMessage {
                    role: engine.role.clone(),
                    content: text,
                }],
                max_tokens: prompt.max_tokens,
                n: prompt.result_count,
                temperature: engine.temperature,
                top_p: engine.top_p,
                presence_penalty: engine.presence_penalty,
                frequency_penalty: engine.frequency_penalty,
            })
        }
        TurnKind::Edit => {
            if cached_prior.is_empty() {
                return Err(EngineError::MissingEditContext);
            }
            let instruction = prompt
                .instructions
                .last()
                .cloned()
                .unwrap_or_else(|| latest.to_string());
            Ok(Request::Edit {
                model: engine.model.clone(),
                input: cached_prior.to_string(),
                instruction,
                n: prompt.result_count,
                temperature: engine.temperature,
                top_p: engine.top_p,
            })
        }
        TurnKind::Embedding => Ok(Request::Embedding {
            model: engine.model.clone(),
            input: prompt.inputs.clone(),
        }),
        // The latest input is the document under classification; the stored
        // predict input only backfills when the caller passed nothing new.
        TurnKind::Predict => Ok(Request::Predict {
            document: if latest.is_empty() {
                predict.input.clone()
            } else {
                latest.to_string()
            },
        }),
    }
}

/// Template prefix, then (when conversational) the cached prior response as
/// context, then the latest input. An empty template yields the input text
/// unchanged.
fn compose_prompt(prompt: &PromptConfig, cached_prior: &str, latest: &str) -> String {
    let mut out = String::new();
    out.push_str(prompt.template_prefix());
    if prompt.conversational && !cached_prior.is_empty() {
        out.push_str(cached_prior);
        out.push('\n');
    }
    out.push_str(latest);
    out
}
