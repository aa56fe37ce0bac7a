use super::error::EngineError;
use super::request::TurnKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Per-token detail attached to a text choice. Arrays grow in lockstep by
/// append during streaming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogProbs {
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub token_logprobs: Vec<f64>,
    #[serde(default)]
    pub text_offset: Vec<u32>,
}

impl LogProbs {
    pub fn extend_from(&mut self, other: &LogProbs) {
        self.tokens.extend(other.tokens.iter().cloned());
        self.token_logprobs.extend(other.token_logprobs.iter().copied());
        self.text_offset.extend(other.text_offset.iter().copied());
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextChoice {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub logprobs: Option<LogProbs>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageBody {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: ChatMessageBody,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<TextChoice>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Usage,
}

/// The edit endpoint assigns no id; the ledger keys the session from the
/// surrounding conversation instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditResult {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub choices: Vec<TextChoice>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingVector {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub data: Vec<EmbeddingVector>,
    #[serde(default)]
    pub usage: Usage,
}

/// Classifier output for predict turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictOutcome {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub score: f64,
}

/// One canonical result per turn. Exactly one variant exists by
/// construction; "more than one populated" is unrepresentable here and is
/// rejected at wire-decode time instead.
#[derive(Debug, Clone, Serialize)]
pub enum TurnResult {
    Completion(CompletionResult),
    Chat(ChatResult),
    Edit(EditResult),
    Embedding(EmbeddingResult),
    Predict(PredictOutcome),
}

impl TurnResult {
    pub fn kind(&self) -> TurnKind {
        match self {
            TurnResult::Completion(_) => TurnKind::Completion,
            TurnResult::Chat(_) => TurnKind::Chat,
            TurnResult::Edit(_) => TurnKind::Edit,
            TurnResult::Embedding(_) => TurnKind::Embedding,
            TurnResult::Predict(_) => TurnKind::Predict,
        }
    }

    /// Provider-assigned identifier, empty for kinds without one.
    pub fn id(&self) -> &str {
        match self {
            TurnResult::Completion(r) => &r.id,
            TurnResult::Chat(r) => &r.id,
            TurnResult::Edit(_) => "",
            TurnResult::Embedding(r) => &r.id,
            TurnResult::Predict(r) => &r.id,
        }
    }

    pub fn usage(&self) -> &Usage {
        match self {
            TurnResult::Completion(r) => &r.usage,
            TurnResult::Chat(r) => &r.usage,
            TurnResult::Edit(r) => &r.usage,
            TurnResult::Embedding(r) => &r.usage,
            TurnResult::Predict(_) => {
                static EMPTY: Usage = Usage {
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 0,
                };
                &EMPTY
            }
        }
    }

    /// The chosen completions of the turn, one entry per choice, in choice
    /// order. Embeddings and predictions render a short textual form.
    pub fn chosen_texts(&self) -> Vec<String> {
        match self {
            TurnResult::Completion(r) => r.choices.iter().map(|c| c.text.clone()).collect(),
            TurnResult::Chat(r) => r.choices.iter().map(|c| c.message.content.clone()).collect(),
            TurnResult::Edit(r) => r.choices.iter().map(|c| c.text.clone()).collect(),
            TurnResult::Embedding(r) => r
                .data
                .iter()
                .map(|d| format!("[embedding {} ({} dims)]", d.index, d.embedding.len()))
                .collect(),
            TurnResult::Predict(r) => vec![format!("{} ({:.3})", r.label, r.score)],
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        match self {
            TurnResult::Completion(r) => r
                .choices
                .first()
                .and_then(|c| c.finish_reason.as_deref()),
            TurnResult::Chat(r) => r
                .choices
                .first()
                .and_then(|c| c.finish_reason.as_deref()),
            _ => None,
        }
    }
}

/// One streamed fragment. The header fields repeat on every fragment; only
/// the first occurrence is authoritative.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<DeltaChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeltaChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub delta: Option<ChatFragment>,
    #[serde(default)]
    pub logprobs: Option<LogProbs>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatFragment {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl DeltaChoice {
    /// The text carried by this fragment, regardless of completion or chat
    /// framing.
    pub fn fragment_text(&self) -> &str {
        if let Some(t) = &self.text {
            return t;
        }
        self.delta
            .as_ref()
            .and_then(|d| d.content.as_deref())
            .unwrap_or("")
    }
}

/// Raw non-streaming reply before it commits to a single shape. The
/// provider's endpoints each populate one family of fields; a reply that
/// populates more than one is malformed and rejected.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub data: Vec<EmbeddingVector>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message: Option<ChatMessageBody>,
    #[serde(default)]
    pub logprobs: Option<LogProbs>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl WireEnvelope {
    /// Commit the envelope to the one shape the request asked for. Signals
    /// `AmbiguousResponseShape` when the reply populates more than one
    /// family of kind-specific fields.
    pub fn into_result(self, kind: TurnKind) -> Result<TurnResult, EngineError> {
        let populated = [
            !self.choices.is_empty(),
            !self.data.is_empty(),
            self.label.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if populated > 1 {
            return Err(EngineError::AmbiguousResponseShape);
        }

        match kind {
            TurnKind::Completion => Ok(TurnResult::Completion(CompletionResult {
                id: self.id,
                object: self.object,
                created: self.created,
                model: self.model,
                choices: self
                    .choices
                    .into_iter()
                    .map(|c| TextChoice {
                        text: c.text.unwrap_or_default(),
                        index: c.index,
                        logprobs: c.logprobs,
                        finish_reason: c.finish_reason,
                    })
                    .collect(),
                usage: self.usage,
            })),
            TurnKind::Chat => Ok(TurnResult::Chat(ChatResult {
                id: self.id,
                object: self.object,
                created: self.created,
                model: self.model,
                choices: self
                    .choices
                    .into_iter()
                    .map(|c| ChatChoice {
                        index: c.index,
                        message: c.message.unwrap_or_default(),
                        finish_reason: c.finish_reason,
                    })
                    .collect(),
                usage: self.usage,
            })),
            TurnKind::Edit => Ok(TurnResult::Edit(EditResult {
                object: self.object,
                created: self.created,
                choices: self
                    .choices
                    .into_iter()
                    .map(|c| TextChoice {
                        text: c.text.unwrap_or_default(),
                        index: c.index,
                        logprobs: None,
                        finish_reason: None,
                    })
                    .collect(),
                usage: self.usage,
            })),
            TurnKind::Embedding => Ok(TurnResult::Embedding(EmbeddingResult {
                id: self.id,
                object: self.object,
                model: self.model,
                data: self.data,
                usage: self.usage,
            })),
            TurnKind::Predict => Ok(TurnResult::Predict(PredictOutcome {
                id: self.id,
                label: self.label.unwrap_or_default(),
                score: self.score.unwrap_or_default(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_commits_to_the_requested_shape() {
        let env: WireEnvelope = serde_json::from_str(
            r#"{"id":"cmpl-1","object":"text_completion","created":1,
                "model":"m","choices":[{"text":"hi","index":0}],
                "usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
        )
        .unwrap();
        let res = env.into_result(TurnKind::Completion).unwrap();
        assert_eq!(res.id(), "cmpl-1");
        assert_eq!(res.chosen_texts(), vec!["hi"]);
        assert_eq!(res.usage().total_tokens, 2);
    }

    #[test]
    fn envelope_with_two_shapes_is_rejected() {
        let env: WireEnvelope = serde_json::from_str(
            r#"{"id":"x","choices":[{"text":"hi","index":0}],
                "data":[{"object":"embedding","index":0,"embedding":[0.1]}]}"#,
        )
        .unwrap();
        let err = env.into_result(TurnKind::Completion).unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousResponseShape));
    }

    #[test]
    fn chat_envelope_yields_message_content() {
        let env: WireEnvelope = serde_json::from_str(
            r#"{"id":"chat-1","object":"chat.completion","created":2,"model":"m",
                "choices":[{"index":0,
                            "message":{"role":"assistant","content":"hello"},
                            "finish_reason":"stop"}]}"#,
        )
        .unwrap();
        let res = env.into_result(TurnKind::Chat).unwrap();
        assert_eq!(res.chosen_texts(), vec!["hello"]);
        assert_eq!(res.finish_reason(), Some("stop"));
    }

    #[test]
    fn delta_fragment_text_covers_both_framings() {
        let completion: Delta = serde_json::from_str(
            r#"{"id":"a","choices":[{"index":0,"text":"frag"}]}"#,
        )
        .unwrap();
        assert_eq!(completion.choices[0].fragment_text(), "frag");

        let chat: Delta = serde_json::from_str(
            r#"{"id":"b","choices":[{"index":0,"delta":{"content":"frag"}}]}"#,
        )
        .unwrap();
        assert_eq!(chat.choices[0].fragment_text(), "frag");
    }
}
