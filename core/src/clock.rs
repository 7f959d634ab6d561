//! Wall-clock and identifier sources.
//!
//! Timestamps and prompt ids come from here so tests can pin both.

use chrono::DateTime;
use chrono::Utc;
use uuid::Uuid;

/// Supplies the timestamps stamped onto history entries and checkpoints.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Separator between the session id and the per-session prompt counter.
const PROMPT_ID_SEPARATOR: &str = "########";

/// Produces fresh prompt ids of the form `{session_id}########{count}`.
///
/// Recovery continuations derive their ids from the parent prompt instead;
/// see the recovery planner.
#[derive(Debug, Clone)]
pub struct PromptIdSource {
    session_id: String,
    prompt_count: u64,
}

impl PromptIdSource {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt_count: 0,
        }
    }

    /// A source keyed by a freshly generated session id.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn next_prompt_id(&mut self) -> String {
        self.prompt_count += 1;
        format!(
            "{}{PROMPT_ID_SEPARATOR}{}",
            self.session_id, self.prompt_count
        )
    }

    /// Fresh id for a client-initiated tool call.
    pub fn next_call_id(&self) -> String {
        format!("client-{}", Uuid::new_v4())
    }
}
