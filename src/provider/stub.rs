use super::{DeltaStream, Transport, TransportFuture};
use crate::engine::error::EngineError;
use crate::engine::request::{Request, TurnKind};
use crate::engine::result::{
    ChatChoice, ChatFragment, ChatMessageBody, ChatResult, CompletionResult, Delta, DeltaChoice,
    EditResult, EmbeddingResult, EmbeddingVector, PredictOutcome, TextChoice, TurnResult, Usage,
};
use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Scripted in-process transport: drips configured fragments with short
/// delays, optionally failing after a set number of them. Used by tests and
/// by the `stub` provider name for offline runs.
#[derive(Debug, Default, Clone)]
pub struct StubTransport {
    fragments: Vec<String>,
    fail_after: Option<usize>,
    edit_text: Option<String>,
    predict: Option<(String, f64)>,
}

impl StubTransport {
    pub const STREAM_ID: &'static str = "stub-0001";

    pub fn with_fragments(parts: &[&str]) -> Self {
        Self {
            fragments: parts.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Deliver `k` fragments, then fail the stream.
    pub fn failing_after(mut self, k: usize) -> Self {
        self.fail_after = Some(k);
        self
    }

    pub fn editing_to(mut self, text: &str) -> Self {
        self.edit_text = Some(text.to_string());
        self
    }

    pub fn predicting(mut self, label: &str, score: f64) -> Self {
        self.predict = Some((label.to_string(), score));
        self
    }

    fn full_text(&self) -> String {
        self.fragments.concat()
    }
}

impl Transport for StubTransport {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn send(&self, req: Request) -> TransportFuture<TurnResult> {
        let this = self.clone();
        Box::pin(async move {
            if this.fail_after.is_some() {
                return Err(EngineError::Transport(anyhow!("stub transport failure")));
            }
            let result = match &req {
                Request::Completion { .. } => TurnResult::Completion(CompletionResult {
                    id: Self::STREAM_ID.to_string(),
                    object: "text_completion".to_string(),
                    created: 1,
                    model: "stub".to_string(),
                    choices: vec![TextChoice {
                        text: this.full_text(),
                        index: 0,
                        logprobs: None,
                        finish_reason: Some("stop".to_string()),
                    }],
                    usage: Usage::default(),
                }),
                Request::Chat { .. } => TurnResult::Chat(ChatResult {
                    id: Self::STREAM_ID.to_string(),
                    object: "chat.completion".to_string(),
                    created: 1,
                    model: "stub".to_string(),
                    choices: vec![ChatChoice {
                        index: 0,
                        message: ChatMessageBody {
                            role: "assistant".to_string(),
                            content: this.full_text(),
                        },
                        finish_reason: Some("stop".to_string()),
                    }],
                    usage: Usage::default(),
                }),
                Request::Edit { .. } => TurnResult::Edit(EditResult {
                    object: "edit".to_string(),
                    created: 1,
                    choices: vec![TextChoice {
                        text: this.edit_text.clone().unwrap_or_else(|| this.full_text()),
                        index: 0,
                        logprobs: None,
                        finish_reason: None,
                    }],
                    usage: Usage::default(),
                }),
                Request::Embedding { input, .. } => TurnResult::Embedding(EmbeddingResult {
                    id: Self::STREAM_ID.to_string(),
                    object: "list".to_string(),
                    model: "stub".to_string(),
                    data: input
                        .iter()
                        .enumerate()
                        .map(|(i, _)| EmbeddingVector {
                            object: "embedding".to_string(),
                            index: i as u32,
                            embedding: vec![0.0; 4],
                        })
                        .collect(),
                    usage: Usage::default(),
                }),
                Request::Predict { .. } => {
                    let (label, score) = this
                        .predict
                        .clone()
                        .unwrap_or_else(|| ("neutral".to_string(), 0.5));
                    TurnResult::Predict(PredictOutcome {
                        id: Self::STREAM_ID.to_string(),
                        label,
                        score,
                    })
                }
            };
            Ok(result)
        })
    }

    fn send_stream(&self, req: Request) -> TransportFuture<DeltaStream> {
        let this = self.clone();
        Box::pin(async move {
            let chat = req.kind() == TurnKind::Chat;
            let (tx, rx) = mpsc::channel::<Result<Delta, EngineError>>(32);

            tokio::spawn(async move {
                for (i, part) in this.fragments.iter().enumerate() {
                    if this.fail_after == Some(i) {
                        let _ = tx
                            .send(Err(EngineError::Transport(anyhow!(
                                "stub transport failure after {i} fragments"
                            ))))
                            .await;
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    if tx.send(Ok(fragment_delta(part, chat))).await.is_err() {
                        return;
                    }
                }
                if this.fail_after == Some(this.fragments.len()) {
                    let _ = tx
                        .send(Err(EngineError::Transport(anyhow!(
                            "stub transport failure at end of script"
                        ))))
                        .await;
                }
            });

            let stream = ReceiverStream::new(rx).map(|x| x);
            Ok(Box::pin(stream) as DeltaStream)
        })
    }
}

fn fragment_delta(text: &str, chat: bool) -> Delta {
    let choice = if chat {
        DeltaChoice {
            index: 0,
            text: None,
            delta: Some(ChatFragment {
                role: Some("assistant".to_string()),
                content: Some(text.to_string()),
            }),
            logprobs: None,
            finish_reason: None,
        }
    } else {
        DeltaChoice {
            index: 0,
            text: Some(text.to_string()),
            delta: None,
            logprobs: None,
            finish_reason: None,
        }
    };
    Delta {
        id: StubTransport::STREAM_ID.to_string(),
        object: if chat {
            "chat.completion.chunk".to_string()
        } else {
            "text_completion".to_string()
        },
        created: 1,
        model: "stub".to_string(),
        choices: vec![choice],
    }
}
