pub mod budget;
pub mod error;
pub mod ledger;
pub mod reconcile;
pub mod request;
pub mod result;

pub use error::EngineError;
pub use request::{EngineConfig, PredictConfig, PromptConfig, TurnKind};
pub use result::TurnResult;

use crate::provider::Transport;
use budget::TokenBudget;
use ledger::{Ledger, SnapshotStore};
use result::Usage;

/// Structured per-turn metadata for presentation.
#[derive(Debug, Clone)]
pub struct TurnMeta {
    pub kind: TurnKind,
    pub usage: Usage,
    pub finish_reason: Option<String>,
    pub choice_indices: Vec<u32>,
}

/// The session context: every piece of conversational state, owned in one
/// place and passed into the components that need it. Callers must serialize
/// turns; `is_loading` is exposed for that, not re-validated internally.
pub struct SessionEngine {
    engine: EngineConfig,
    prompt: PromptConfig,
    predict: PredictConfig,
    /// Latest reconciled response text, threaded into conversational and
    /// edit turns.
    cached_prior: String,
    base_max_tokens: u32,
    is_loading: bool,
    is_new_session: bool,
    budget: TokenBudget,
    ledger: Ledger,
    last_result: Option<TurnResult>,
}

impl SessionEngine {
    pub fn new(
        engine: EngineConfig,
        prompt: PromptConfig,
        store: Box<dyn SnapshotStore>,
        capture_training: bool,
    ) -> Self {
        let base_max_tokens = prompt.max_tokens;
        Self {
            engine,
            prompt,
            predict: PredictConfig::default(),
            cached_prior: String::new(),
            base_max_tokens,
            is_loading: false,
            is_new_session: true,
            budget: TokenBudget::new(),
            ledger: Ledger::new(store, capture_training),
            last_result: None,
        }
    }

    /// Run one turn end to end: grow the budget, build the request, reconcile
    /// the response, record the event, update the transcript.
    ///
    /// A transport failure mid-stream records the partial turn and still
    /// returns the error, so the caller can show a retry prompt without
    /// losing what arrived. On every exit path the loading flag is cleared.
    pub async fn run_turn(
        &mut self,
        transport: &(dyn Transport + Send + Sync),
        kind: TurnKind,
        input: &str,
        streaming: bool,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<&TurnResult, EngineError> {
        if self.is_loading {
            tracing::debug!("run_turn entered while a turn is in flight; callers must serialize turns");
        }
        self.is_loading = true;

        // First turn of a conversation clears any leftover state.
        if self.is_new_session {
            self.ledger.reset_for_new_conversation();
            self.budget.reset();
            self.is_new_session = false;
        }

        self.prompt.inputs.push(input.to_string());
        self.prompt.max_tokens = self.budget.grow(&self.prompt.inputs, self.base_max_tokens);
        if kind == TurnKind::Predict {
            self.predict.input = input.to_string();
        }

        let req = match request::build_request(
            kind,
            &self.engine,
            &self.prompt,
            &self.predict,
            &self.cached_prior,
        ) {
            Ok(req) => req,
            Err(e) => {
                // Unrecorded abort: the input must not linger in the config.
                self.prompt.inputs.pop();
                self.is_loading = false;
                return Err(e);
            }
        };

        let reconciled = match reconcile::reconcile(transport, req, streaming, on_delta).await {
            Ok(r) => r,
            Err(e) => {
                self.prompt.inputs.pop();
                self.is_loading = false;
                if matches!(e, EngineError::AmbiguousResponseShape) {
                    tracing::error!(kind = kind.as_str(), "invariant violation: {e}; turn aborted unrecorded");
                } else {
                    tracing::warn!(kind = kind.as_str(), error = %e, "turn failed");
                }
                return Err(e);
            }
        };

        self.prompt.content.push_str(&reconciled.transcript);

        match (&reconciled.result, kind) {
            (TurnResult::Predict(outcome), _) => {
                self.predict.result = outcome.clone();
            }
            (_, TurnKind::Embedding) => {}
            (result, _) => {
                if let Some(first) = result.chosen_texts().into_iter().next() {
                    self.cached_prior = first;
                }
            }
        }

        self.ledger.append_turn(
            kind,
            self.engine.clone(),
            self.prompt.clone(),
            self.predict.clone(),
            &reconciled.result,
        );

        self.is_loading = false;
        let stored = self.last_result.insert(reconciled.result);
        match reconciled.error {
            Some(e) => Err(e),
            None => Ok(stored),
        }
    }

    /// Explicit new-conversation boundary: the Pool, transcript, cached
    /// content, and budget all reset together.
    pub fn new_conversation(&mut self) {
        self.ledger.reset_for_new_conversation();
        self.prompt.inputs.clear();
        self.prompt.instructions.clear();
        self.prompt.content.clear();
        self.prompt.max_tokens = self.base_max_tokens;
        self.predict = PredictConfig::default();
        self.cached_prior.clear();
        self.budget.reset();
        self.last_result = None;
        self.is_new_session = true;
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn last_result(&self) -> Option<&TurnResult> {
        self.last_result.as_ref()
    }

    /// Plain-text rendering of accumulated content, turn boundaries marked.
    pub fn transcript(&self) -> &str {
        &self.prompt.content
    }

    pub fn last_turn_meta(&self) -> Option<TurnMeta> {
        let result = self.last_result.as_ref()?;
        let choice_indices = match result {
            TurnResult::Completion(r) => r.choices.iter().map(|c| c.index).collect(),
            TurnResult::Chat(r) => r.choices.iter().map(|c| c.index).collect(),
            TurnResult::Edit(r) => r.choices.iter().map(|c| c.index).collect(),
            TurnResult::Embedding(r) => r.data.iter().map(|d| d.index).collect(),
            TurnResult::Predict(_) => Vec::new(),
        };
        Some(TurnMeta {
            kind: result.kind(),
            usage: result.usage().clone(),
            finish_reason: result.finish_reason().map(str::to_string),
            choice_indices,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn set_model(&mut self, model: &str) {
        self.engine.model = model.to_string();
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Push an instruction segment for the next edit turn.
    pub fn push_instruction(&mut self, instruction: &str) {
        self.prompt.instructions.push(instruction.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::Request;
    use crate::engine::result::PredictOutcome;
    use crate::provider::stub::StubTransport;
    use crate::provider::{DeltaStream, TransportFuture};
    use ledger::{Session, TrainingSession};
    use std::sync::{Arc, Mutex};

    struct NullStore {
        writes: Arc<Mutex<usize>>,
    }

    impl SnapshotStore for NullStore {
        fn append_session(&self, _session: &Session) -> anyhow::Result<()> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        fn append_training(&self, _session: &TrainingSession) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Classifier that remembers every document it was asked to label.
    struct ClassifierTransport {
        documents: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for ClassifierTransport {
        fn name(&self) -> &'static str {
            "classifier"
        }

        fn send(&self, req: Request) -> TransportFuture<TurnResult> {
            let documents = self.documents.clone();
            Box::pin(async move {
                if let Request::Predict { document } = &req {
                    documents.lock().unwrap().push(document.clone());
                }
                Ok(TurnResult::Predict(PredictOutcome {
                    id: "pred-1".to_string(),
                    label: "positive".to_string(),
                    score: 0.9,
                }))
            })
        }

        fn send_stream(&self, _req: Request) -> TransportFuture<DeltaStream> {
            Box::pin(async {
                Err::<DeltaStream, EngineError>(EngineError::Transport(anyhow::anyhow!(
                    "classifier does not stream"
                )))
            })
        }
    }

    fn engine_with(capture_training: bool) -> (SessionEngine, Arc<Mutex<usize>>) {
        let writes = Arc::new(Mutex::new(0));
        let store = NullStore {
            writes: writes.clone(),
        };
        (
            SessionEngine::new(
                EngineConfig::default(),
                PromptConfig::default(),
                Box::new(store),
                capture_training,
            ),
            writes,
        )
    }

    #[tokio::test]
    async fn streamed_turn_records_exactly_one_event() {
        let (mut engine, writes) = engine_with(false);
        let transport = StubTransport::with_fragments(&["Hel", "lo", " world"]);

        let result = engine
            .run_turn(&transport, TurnKind::Completion, "hi", true, &mut |_| {})
            .await
            .unwrap();
        assert_eq!(result.chosen_texts(), vec!["Hello world"]);

        assert_eq!(engine.ledger().pool().events.len(), 1);
        assert_eq!(engine.ledger().pool().sessions.len(), 1);
        assert_eq!(*writes.lock().unwrap(), 1);
        assert!(!engine.is_loading());
        assert!(engine
            .transcript()
            .starts_with("Hello world\n\n###\n\n"));
    }

    #[tokio::test]
    async fn transport_failure_still_records_partial_turn() {
        let (mut engine, _) = engine_with(false);
        let transport = StubTransport::with_fragments(&["Foo", "Bar"]).failing_after(1);

        let err = engine
            .run_turn(&transport, TurnKind::Completion, "hi", true, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));

        assert_eq!(engine.ledger().pool().events.len(), 1);
        let recorded = engine.last_result().unwrap();
        assert_eq!(recorded.chosen_texts(), vec!["Foo"]);
        assert!(!engine.is_loading());
    }

    #[tokio::test]
    async fn edit_without_prior_turn_is_rejected_before_transport() {
        let (mut engine, writes) = engine_with(false);
        let transport = StubTransport::with_fragments(&["unused"]);

        let err = engine
            .run_turn(&transport, TurnKind::Edit, "make it rhyme", true, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingEditContext));
        assert_eq!(engine.ledger().pool().events.len(), 0);
        assert_eq!(*writes.lock().unwrap(), 0);
        assert!(!engine.is_loading());
    }

    #[tokio::test]
    async fn session_id_stays_stable_until_new_conversation() {
        let (mut engine, _) = engine_with(false);
        let transport = StubTransport::with_fragments(&["ok"]);

        for input in ["one", "two", "three"] {
            engine
                .run_turn(&transport, TurnKind::Completion, input, true, &mut |_| {})
                .await
                .unwrap();
        }
        let id = engine.ledger().current_session().unwrap().id.clone();
        assert_eq!(engine.ledger().current_session().unwrap().events.len(), 3);

        engine.new_conversation();
        assert!(engine.ledger().pool().events.is_empty());
        assert!(engine.ledger().pool().sessions.is_empty());
        assert!(engine.transcript().is_empty());

        engine
            .run_turn(&transport, TurnKind::Completion, "fresh", true, &mut |_| {})
            .await
            .unwrap();
        // Same stub id is fine here; the point is the pool restarted.
        assert_eq!(engine.ledger().current_session().unwrap().id, id);
        assert_eq!(engine.ledger().pool().events.len(), 1);
    }

    #[tokio::test]
    async fn edit_turn_rewrites_cached_content() {
        let (mut engine, _) = engine_with(false);
        let first = StubTransport::with_fragments(&["roses are red"]);
        engine
            .run_turn(&first, TurnKind::Completion, "write a line", true, &mut |_| {})
            .await
            .unwrap();

        let editor = StubTransport::with_fragments(&[]).editing_to("violets are blue");
        engine.push_instruction("swap the flowers");
        let result = engine
            .run_turn(&editor, TurnKind::Edit, "", false, &mut |_| {})
            .await
            .unwrap();
        assert_eq!(result.chosen_texts(), vec!["violets are blue"]);
        assert_eq!(engine.ledger().pool().events.len(), 2);
    }

    #[tokio::test]
    async fn predict_turn_populates_classifier_state() {
        let (mut engine, _) = engine_with(false);
        let transport = StubTransport::with_fragments(&[]).predicting("positive", 0.98);

        let result = engine
            .run_turn(&transport, TurnKind::Predict, "great movie", false, &mut |_| {})
            .await
            .unwrap();
        match result {
            TurnResult::Predict(p) => {
                assert_eq!(p.label, "positive");
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let event = &engine.ledger().pool().events[0].event;
        assert_eq!(event.predict.input, "great movie");
        assert_eq!(event.predict.result.label, "positive");
    }

    #[tokio::test]
    async fn each_predict_turn_classifies_its_own_document() {
        let (mut engine, _) = engine_with(false);
        let documents = Arc::new(Mutex::new(Vec::new()));
        let transport = ClassifierTransport {
            documents: documents.clone(),
        };

        for doc in ["first document", "second document"] {
            engine
                .run_turn(&transport, TurnKind::Predict, doc, false, &mut |_| {})
                .await
                .unwrap();
        }

        assert_eq!(
            *documents.lock().unwrap(),
            vec!["first document", "second document"]
        );
        let events = &engine.ledger().pool().events;
        assert_eq!(events[0].event.predict.input, "first document");
        assert_eq!(events[1].event.predict.input, "second document");
    }

    #[tokio::test]
    async fn provider_id_is_adopted_after_a_failed_opening_turn() {
        let (mut engine, _) = engine_with(false);
        let failing = StubTransport::with_fragments(&["never"]).failing_after(0);
        let err = engine
            .run_turn(&failing, TurnKind::Completion, "hi", true, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert_eq!(engine.ledger().current_session().unwrap().id, "local");

        let working = StubTransport::with_fragments(&["ok"]);
        engine
            .run_turn(&working, TurnKind::Completion, "again", true, &mut |_| {})
            .await
            .unwrap();

        let session = engine.ledger().current_session().unwrap();
        assert_eq!(session.id, StubTransport::STREAM_ID);
        assert_eq!(session.events.len(), 2);
        assert_eq!(engine.ledger().pool().sessions.len(), 1);
    }

    #[tokio::test]
    async fn aborted_turn_leaves_no_input_behind() {
        let (mut engine, _) = engine_with(false);
        let transport = StubTransport::with_fragments(&["unused"]);

        let err = engine
            .run_turn(&transport, TurnKind::Edit, "make it rhyme", true, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingEditContext));

        engine
            .run_turn(&transport, TurnKind::Embedding, "hello", false, &mut |_| {})
            .await
            .unwrap();

        // The rejected edit's input is gone from both the embedded segments
        // and the recorded snapshot.
        match engine.last_result().unwrap() {
            TurnResult::Embedding(r) => assert_eq!(r.data.len(), 1),
            other => panic!("wrong variant: {other:?}"),
        }
        let event = &engine.ledger().pool().events[0].event;
        assert_eq!(event.body.inputs, vec!["hello"]);
    }

    #[tokio::test]
    async fn meta_projection_reports_usage_and_choices() {
        let (mut engine, _) = engine_with(false);
        let transport = StubTransport::with_fragments(&["done"]);
        engine
            .run_turn(&transport, TurnKind::Completion, "hi", false, &mut |_| {})
            .await
            .unwrap();

        let meta = engine.last_turn_meta().unwrap();
        assert_eq!(meta.kind, TurnKind::Completion);
        assert_eq!(meta.choice_indices, vec![0]);
    }

    #[tokio::test]
    async fn training_capture_follows_configuration() {
        let (mut engine, _) = engine_with(true);
        let transport = StubTransport::with_fragments(&["answer"]);
        engine
            .run_turn(&transport, TurnKind::Completion, "question", true, &mut |_| {})
            .await
            .unwrap();

        let pool = engine.ledger().pool();
        assert_eq!(pool.training_events.len(), 1);
        assert_eq!(pool.training_events[0].event.prompt, "question");
        assert_eq!(pool.training_events[0].event.completion, "answer");
    }
}
