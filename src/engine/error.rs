use thiserror::Error;

/// Per-turn failure conditions.
///
/// The first three are recoverable: the engine absorbs them, clears its
/// loading state, and leaves the caller in a retry-ready position.
/// `AmbiguousResponseShape` is an invariant violation; the turn is aborted
/// without being recorded.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Required session context (identity/credentials) is absent before the
    /// turn starts. Fatal to the turn, never to the process.
    #[error("missing session context: {0}")]
    ContextMissing(String),

    /// Network or provider failure. Any partial stream content received
    /// before the failure is preserved and recorded.
    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    /// The provider returned a body we could not decode.
    #[error("failed to decode provider response: {0}")]
    Decode(#[source] anyhow::Error),

    /// More than one response shape populated in a single provider reply.
    /// Should never occur from a well-formed transport.
    #[error("provider reply matches more than one response shape")]
    AmbiguousResponseShape,

    /// An edit turn was requested before any prior turn produced content
    /// to edit. Signaled before any network call.
    #[error("no prior content available to edit")]
    MissingEditContext,
}

impl EngineError {
    /// Whether the caller may simply retry the turn after fixing the cause.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ContextMissing(_)
                | EngineError::Transport(_)
                | EngineError::Decode(_)
                | EngineError::MissingEditContext
        )
    }
}
