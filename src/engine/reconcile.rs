use super::error::EngineError;
use super::request::{Request, TurnKind};
use super::result::{
    ChatChoice, ChatMessageBody, ChatResult, CompletionResult, Delta, LogProbs, TextChoice,
    TurnResult,
};
use crate::provider::Transport;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

/// Appended once per turn to delimit turns in any concatenated log view.
pub const TURN_BOUNDARY: &str = "\n\n###\n\n";

/// Outcome of reconciling one turn. `error` is set when the transport failed
/// partway; the result then holds everything received before the failure.
#[derive(Debug)]
pub struct Reconciled {
    pub result: TurnResult,
    pub error: Option<EngineError>,
    /// The turn's contribution to the transcript projection, boundary
    /// sentinel included.
    pub transcript: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingFirstChunk,
    Accumulating,
    Finalized,
}

/// Hand-off between the producer task and the reconciler. Delivery of an
/// item and end-of-stream are distinct signals.
enum StreamSignal {
    Item(Delta),
    Done,
    Failed(EngineError),
}

/// Turn-local accumulation buffer. Owned by the reconciler alone; the
/// producer task never sees it.
struct Accumulator {
    phase: Phase,
    kind: TurnKind,
    id: String,
    object: String,
    created: u64,
    model: String,
    text: String,
    logprobs: LogProbs,
    finish_reason: Option<String>,
}

impl Accumulator {
    fn new(kind: TurnKind) -> Self {
        Self {
            phase: Phase::Idle,
            kind,
            id: String::new(),
            object: String::new(),
            created: 0,
            model: String::new(),
            text: String::new(),
            logprobs: LogProbs::default(),
            finish_reason: None,
        }
    }

    /// Fold one fragment in, in arrival order. The first fragment fixes the
    /// kind-invariant header; later fragments only append.
    fn absorb(&mut self, delta: &Delta) {
        if self.phase == Phase::AwaitingFirstChunk {
            self.id = delta.id.clone();
            self.object = delta.object.clone();
            self.created = delta.created;
            self.model = delta.model.clone();
            self.phase = Phase::Accumulating;
        }
        for choice in delta.choices.iter().filter(|c| c.index == 0) {
            self.text.push_str(choice.fragment_text());
            if let Some(lp) = &choice.logprobs {
                self.logprobs.extend_from(lp);
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason.clone();
            }
        }
    }

    fn finalize(mut self) -> TurnResult {
        self.phase = Phase::Finalized;
        let logprobs = if self.logprobs.tokens.is_empty() {
            None
        } else {
            Some(self.logprobs)
        };
        match self.kind {
            TurnKind::Chat => TurnResult::Chat(ChatResult {
                id: self.id,
                object: self.object,
                created: self.created,
                model: self.model,
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessageBody {
                        role: "assistant".to_string(),
                        content: self.text,
                    },
                    finish_reason: self.finish_reason,
                }],
                usage: Default::default(),
            }),
            _ => TurnResult::Completion(CompletionResult {
                id: self.id,
                object: self.object,
                created: self.created,
                model: self.model,
                choices: vec![TextChoice {
                    text: self.text,
                    index: 0,
                    logprobs,
                    finish_reason: self.finish_reason,
                }],
                usage: Default::default(),
            }),
        }
    }
}

/// Consume a single response or a delta stream and produce one canonical
/// result for the turn. `on_delta` is invoked per fragment for live display.
///
/// A transport failure mid-stream still finalizes: the partial content is
/// kept in the result and the error is surfaced alongside it, never instead
/// of it.
pub async fn reconcile(
    transport: &(dyn Transport + Send + Sync),
    req: Request,
    streaming: bool,
    on_delta: &mut dyn FnMut(&str),
) -> Result<Reconciled, EngineError> {
    let kind = req.kind();
    let streamable = matches!(kind, TurnKind::Completion | TurnKind::Chat);

    if !(streaming && streamable) {
        return reconcile_single(transport, req, on_delta).await;
    }

    let mut acc = Accumulator::new(kind);
    acc.phase = Phase::AwaitingFirstChunk;

    // Capacity-1 hand-off: at most one fragment outstanding between the
    // producer task and this loop.
    let (tx, mut rx) = mpsc::channel::<StreamSignal>(1);

    match transport.send_stream(req).await {
        Ok(mut stream) => {
            tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    let signal = match item {
                        Ok(delta) => StreamSignal::Item(delta),
                        Err(e) => {
                            let _ = tx.send(StreamSignal::Failed(e)).await;
                            return;
                        }
                    };
                    if tx.send(signal).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(StreamSignal::Done).await;
            });
        }
        Err(e) => {
            // Nothing received; finalize empty and surface the failure so
            // the turn is still recorded.
            tracing::warn!(error = %e, "stream failed to start");
            return Ok(finalized(acc, Some(e)));
        }
    }

    let error = loop {
        match rx.recv().await {
            Some(StreamSignal::Item(delta)) => {
                for choice in delta.choices.iter().filter(|c| c.index == 0) {
                    let text = choice.fragment_text();
                    if !text.is_empty() {
                        on_delta(text);
                    }
                }
                acc.absorb(&delta);
            }
            Some(StreamSignal::Done) => break None,
            Some(StreamSignal::Failed(e)) => {
                tracing::warn!(error = %e, "transport failed mid-stream, keeping partial content");
                break Some(e);
            }
            // Producer dropped without a Done; treat as end of stream.
            None => break None,
        }
    };

    Ok(finalized(acc, error))
}

async fn reconcile_single(
    transport: &(dyn Transport + Send + Sync),
    req: Request,
    on_delta: &mut dyn FnMut(&str),
) -> Result<Reconciled, EngineError> {
    match transport.send(req).await {
        Ok(result) => {
            let texts = result.chosen_texts();
            for t in &texts {
                if !t.is_empty() {
                    on_delta(t);
                }
            }
            let transcript = transcript_for(&texts);
            Ok(Reconciled {
                result,
                error: None,
                transcript,
            })
        }
        // Errors here (invariant violations included) abort the turn
        // unrecorded; there is no partial content to keep.
        Err(e) => Err(e),
    }
}

fn finalized(acc: Accumulator, error: Option<EngineError>) -> Reconciled {
    let result = acc.finalize();
    let transcript = transcript_for(&result.chosen_texts());
    Reconciled {
        result,
        error,
        transcript,
    }
}

fn transcript_for(texts: &[String]) -> String {
    let mut out = String::new();
    for t in texts {
        out.push_str(t);
    }
    out.push_str(TURN_BOUNDARY);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::{build_request, EngineConfig, PredictConfig, PromptConfig};
    use crate::provider::stub::StubTransport;

    fn completion_request(input: &str) -> Request {
        let engine = EngineConfig::default();
        let mut prompt = PromptConfig::default();
        prompt.inputs.push(input.to_string());
        build_request(
            TurnKind::Completion,
            &engine,
            &prompt,
            &PredictConfig::default(),
            "",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ordered_fragments_concatenate() {
        let transport = StubTransport::with_fragments(&["Hel", "lo", " world"]);
        let mut seen = String::new();
        let rec = reconcile(&transport, completion_request("hi"), true, &mut |t| {
            seen.push_str(t)
        })
        .await
        .unwrap();

        assert!(rec.error.is_none());
        assert_eq!(rec.result.chosen_texts(), vec!["Hello world"]);
        assert_eq!(seen, "Hello world");
        assert_eq!(rec.transcript, format!("Hello world{TURN_BOUNDARY}"));
    }

    #[tokio::test]
    async fn first_fragment_fixes_the_header() {
        let transport = StubTransport::with_fragments(&["a", "b"]);
        let rec = reconcile(&transport, completion_request("hi"), true, &mut |_| {})
            .await
            .unwrap();
        // StubTransport stamps every fragment with the same id; the result
        // carries it exactly once.
        assert_eq!(rec.result.id(), StubTransport::STREAM_ID);
    }

    #[tokio::test]
    async fn partial_stream_is_kept_on_failure() {
        let transport = StubTransport::with_fragments(&["Foo", "Bar"]).failing_after(1);
        let rec = reconcile(&transport, completion_request("hi"), true, &mut |_| {})
            .await
            .unwrap();

        assert!(matches!(rec.error, Some(EngineError::Transport(_))));
        assert_eq!(rec.result.chosen_texts(), vec!["Foo"]);
    }

    #[tokio::test]
    async fn failure_before_first_fragment_still_finalizes() {
        let transport = StubTransport::with_fragments(&["never"]).failing_after(0);
        let rec = reconcile(&transport, completion_request("hi"), true, &mut |_| {})
            .await
            .unwrap();

        assert!(rec.error.is_some());
        assert_eq!(rec.result.chosen_texts(), vec![""]);
    }

    #[tokio::test]
    async fn streaming_and_single_shot_agree() {
        let fragments = ["To be, ", "or not ", "to be"];
        let streamed = reconcile(
            &StubTransport::with_fragments(&fragments),
            completion_request("hamlet"),
            true,
            &mut |_| {},
        )
        .await
        .unwrap();

        let single = reconcile(
            &StubTransport::with_fragments(&fragments),
            completion_request("hamlet"),
            false,
            &mut |_| {},
        )
        .await
        .unwrap();

        assert_eq!(streamed.result.chosen_texts(), single.result.chosen_texts());
        assert_eq!(streamed.transcript, single.transcript);
    }

    #[tokio::test]
    async fn chat_stream_reconciles_to_one_message() {
        let transport = StubTransport::with_fragments(&["Hi ", "there"]);
        let engine = EngineConfig::default();
        let mut prompt = PromptConfig::default();
        prompt.inputs.push("hello".to_string());
        let req = build_request(
            TurnKind::Chat,
            &engine,
            &prompt,
            &PredictConfig::default(),
            "",
        )
        .unwrap();

        let rec = reconcile(&transport, req, true, &mut |_| {}).await.unwrap();
        match &rec.result {
            TurnResult::Chat(r) => {
                assert_eq!(r.choices.len(), 1);
                assert_eq!(r.choices[0].message.content, "Hi there");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
