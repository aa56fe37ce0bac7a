use super::request::{EngineConfig, PredictConfig, PromptConfig, TurnKind};
use super::result::TurnResult;
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One completed turn: a timestamped snapshot of the configuration that
/// produced it. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub properties: EngineConfig,
    pub body: PromptConfig,
    pub predict: PredictConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimedEvent {
    /// Wall-clock epoch milliseconds, as a string in the persisted schema.
    pub timestamp: String,
    pub event: Event,
}

/// An ordered run of turns sharing one provider-assigned identifier.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "session")]
    pub events: Vec<TimedEvent>,
}

/// The training projection of an event: prompt/completion only, engine
/// metadata stripped.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingEvent {
    pub prompt: String,
    pub completion: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimedTrainingEvent {
    pub timestamp: String,
    pub event: TrainingEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSession {
    pub id: String,
    #[serde(rename = "session")]
    pub events: Vec<TimedTrainingEvent>,
}

/// In-memory aggregate for the current conversation only. Append-only while
/// the conversation runs; truncated wholly at the new-conversation boundary.
#[derive(Debug, Default)]
pub struct Pool {
    pub events: Vec<TimedEvent>,
    pub sessions: Vec<Session>,
    pub training_events: Vec<TimedTrainingEvent>,
    pub training_sessions: Vec<TrainingSession>,
}

/// Append-only persistence for session snapshots. No read-back or indexing.
pub trait SnapshotStore: Send {
    fn append_session(&self, session: &Session) -> anyhow::Result<()>;
    fn append_training(&self, session: &TrainingSession) -> anyhow::Result<()>;
}

/// Flat-file store: one timestamp-named JSON file per snapshot under a
/// configurable directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_json(&self, name: &str, value: &impl Serialize) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create transcript directory: {}", self.dir.display()))?;

        let path = self.dir.join(name);
        let tmp = tmp_path(&path);
        let bytes = serde_json::to_vec_pretty(value).context("failed to serialize snapshot")?;
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write temp snapshot: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move snapshot into place: {}", path.display()))?;
        Ok(())
    }
}

impl SnapshotStore for FileStore {
    fn append_session(&self, session: &Session) -> anyhow::Result<()> {
        self.write_json(&format!("session-{}.json", now_millis()), session)
    }

    fn append_training(&self, session: &TrainingSession) -> anyhow::Result<()> {
        self.write_json(&format!("training-{}.json", now_millis()), session)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    p.set_file_name(format!(".{file}.tmp"));
    p
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Session id used until a provider assigns one, e.g. when a conversation
/// opens with a turn that failed before any response arrived. Replaced by
/// the first real provider id.
const FALLBACK_SESSION_ID: &str = "local";

/// The append-only session ledger. Exclusively owns the Pool.
pub struct Ledger {
    pool: Pool,
    capture_training: bool,
    store: Box<dyn SnapshotStore>,
}

impl Ledger {
    pub fn new(store: Box<dyn SnapshotStore>, capture_training: bool) -> Self {
        Self {
            pool: Pool::default(),
            capture_training,
            store,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.pool.sessions.last()
    }

    /// Record one completed turn: one Event, one Session entry, at most one
    /// TrainingEvent, then a snapshot write of the just-appended session.
    ///
    /// Persistence failures are reported but never roll back the Pool; a
    /// turn kept in memory and not yet flushed beats a lost turn.
    pub fn append_turn(
        &mut self,
        kind: TurnKind,
        engine: EngineConfig,
        prompt: PromptConfig,
        predict: PredictConfig,
        result: &TurnResult,
    ) -> TimedEvent {
        let timestamp = now_millis().to_string();
        let chosen = result.chosen_texts();

        let timed = TimedEvent {
            timestamp: timestamp.clone(),
            event: Event {
                properties: engine,
                body: prompt,
                predict,
            },
        };

        let incoming = result.id();
        match self.pool.sessions.last_mut() {
            None => {
                self.pool.sessions.push(Session {
                    id: if incoming.is_empty() {
                        FALLBACK_SESSION_ID.to_string()
                    } else {
                        incoming.to_string()
                    },
                    events: Vec::new(),
                });
            }
            Some(session) => {
                // A conversation opened by a failed turn carries the
                // fallback id until the first real provider id arrives.
                if session.id == FALLBACK_SESSION_ID && !incoming.is_empty() {
                    session.id = incoming.to_string();
                }
            }
        }
        if let Some(session) = self.pool.sessions.last_mut() {
            session.events.push(timed.clone());
        }
        let session_id = self
            .pool
            .sessions
            .last()
            .map(|s| s.id.clone())
            .unwrap_or_else(|| FALLBACK_SESSION_ID.to_string());

        if self.capture_training {
            let training = TimedTrainingEvent {
                timestamp,
                event: TrainingEvent {
                    prompt: timed
                        .event
                        .body
                        .inputs
                        .last()
                        .cloned()
                        .unwrap_or_default(),
                    completion: chosen.concat(),
                },
            };
            if self.pool.training_sessions.is_empty() {
                self.pool.training_sessions.push(TrainingSession {
                    id: session_id,
                    events: Vec::new(),
                });
            }
            if let Some(training_session) = self.pool.training_sessions.last_mut() {
                // Track the session's id adoption.
                if training_session.id == FALLBACK_SESSION_ID {
                    if let Some(session) = self.pool.sessions.last() {
                        training_session.id = session.id.clone();
                    }
                }
                training_session.events.push(training.clone());
            }
            self.pool.training_events.push(training);
        }

        // Snapshot the just-appended session, not the whole pool, so the
        // on-disk log stays eventually consistent with memory.
        if let Some(snapshot) = self.pool.sessions.last() {
            if let Err(e) = self.store.append_session(snapshot) {
                tracing::warn!(error = %e, kind = kind.as_str(), "failed to persist session snapshot");
            }
        }
        if self.capture_training {
            if let Some(snapshot) = self.pool.training_sessions.last() {
                if let Err(e) = self.store.append_training(snapshot) {
                    tracing::warn!(error = %e, "failed to persist training snapshot");
                }
            }
        }

        self.pool.events.push(timed.clone());
        timed
    }

    /// Conversation boundary: truncate the Pool to empty, never partially.
    pub fn reset_for_new_conversation(&mut self) {
        self.pool = Pool::default();
    }
}
