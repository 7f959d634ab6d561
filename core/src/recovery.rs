//! Recovery planning: failure categories, derived prompt ids, and the
//! corrective prompts injected back into the model.
//!
//! Everything here is pure; the controller owns the attempt counters and the
//! single pending-recovery slot.

use chrono::DateTime;
use chrono::Utc;
use skiff_protocol::FinishReason;

/// Failure category behind a queued recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// The stream stalled repeatedly (`Retry` events exhausted).
    Stall,
    /// The client's loop detector tripped.
    Loop,
    /// The provider exhausted its own retry budget.
    Provider,
    TokenLimit,
    TurnLimit,
    TurnBudget,
    /// The model stopped early with a non-benign finish reason.
    Finish(FinishReason),
}

impl RecoveryKind {
    fn slug(self) -> &'static str {
        match self {
            Self::Stall => "stall",
            Self::Loop => "loop",
            Self::Provider => "provider",
            Self::TokenLimit => "token-limit",
            Self::TurnLimit => "turn-limit",
            Self::TurnBudget => "turn-budget",
            Self::Finish(_) => "finish",
        }
    }

    /// Prompt id for the recovery turn. Stall recoveries resume the parent
    /// prompt itself; every other category derives a child id.
    pub fn prompt_id(self, parent_prompt_id: &str, attempt: u32) -> String {
        match self {
            Self::Stall => parent_prompt_id.to_string(),
            _ => format!("{parent_prompt_id}-{}-recovery-{attempt}", self.slug()),
        }
    }
}

/// The single queued recovery, consumed exactly once at turn teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecovery {
    pub prompt_id: String,
    pub query_text: String,
    pub timestamp: DateTime<Utc>,
    pub is_continuation: bool,
    pub skip_loop_reset: bool,
    pub skip_provider_reset: bool,
    pub skip_limit_reset: bool,
    pub skip_finish_reset: bool,
}

impl PendingRecovery {
    pub fn new(
        kind: RecoveryKind,
        parent_prompt_id: &str,
        attempt: u32,
        query_text: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut recovery = Self {
            prompt_id: kind.prompt_id(parent_prompt_id, attempt),
            query_text,
            timestamp,
            is_continuation: false,
            skip_loop_reset: false,
            skip_provider_reset: false,
            skip_limit_reset: false,
            skip_finish_reset: false,
        };
        match kind {
            RecoveryKind::Stall => {
                // Stalls resume the in-flight prompt; nothing is reset anyway.
                recovery.is_continuation = true;
            }
            RecoveryKind::Loop => {
                recovery.skip_loop_reset = true;
            }
            RecoveryKind::Provider => {
                recovery.skip_loop_reset = true;
                recovery.skip_provider_reset = true;
            }
            RecoveryKind::TokenLimit | RecoveryKind::TurnLimit | RecoveryKind::TurnBudget => {
                recovery.skip_loop_reset = true;
                recovery.skip_provider_reset = true;
                recovery.skip_limit_reset = true;
                recovery.skip_finish_reset = true;
            }
            RecoveryKind::Finish(_) => {
                recovery.skip_finish_reset = true;
            }
        }
        recovery
    }
}

/// Formats a count with thousands separators, e.g. `128,000`.
pub(crate) fn format_count(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let offset = digits.len() % 3;
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - offset) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn with_snapshot(body: String, snapshot: &str) -> String {
    if snapshot.is_empty() {
        body
    } else {
        format!("{body}\n\nContext before the failure:\n{snapshot}")
    }
}

pub(crate) fn stall_prompt(snapshot: &str) -> String {
    with_snapshot(
        "Streaming stalled before your previous response completed. Resume from the last \
         successful step without repeating work that already finished."
            .to_string(),
        snapshot,
    )
}

pub(crate) fn loop_prompt(snapshot: &str) -> String {
    with_snapshot(
        "A potential tool loop was detected: the same calls kept repeating without progress. \
         Step back, reassess the goal, and continue with a different approach instead of \
         reissuing the same tool calls."
            .to_string(),
        snapshot,
    )
}

pub(crate) fn provider_prompt(
    attempts: u32,
    error_codes: &[String],
    last_error: &str,
    snapshot: &str,
) -> String {
    let codes = if error_codes.is_empty() {
        "unknown".to_string()
    } else {
        error_codes.join(", ")
    };
    with_snapshot(
        format!(
            "The provider connection failed after {attempts} attempts (error codes: {codes}; \
             last error: {last_error}). The connection has been reset. Pick up from the last \
             successful step."
        ),
        snapshot,
    )
}

pub(crate) fn token_limit_prompt(current_tokens: u64, limit: u64, snapshot: &str) -> String {
    with_snapshot(
        format!(
            "The session token limit was exceeded ({} / {} tokens). Summarize the progress so \
             far, keep further replies short, and finish the remaining work in small steps.",
            format_count(current_tokens),
            format_count(limit)
        ),
        snapshot,
    )
}

pub(crate) fn turn_limit_prompt(max_turns: Option<u32>, snapshot: &str) -> String {
    let ceiling = max_turns
        .map(|turns| format!(" of {turns} turns"))
        .unwrap_or_default();
    with_snapshot(
        format!(
            "The session reached its turn limit{ceiling}. Consolidate what has been \
             accomplished and complete the task with as few additional turns as possible."
        ),
        snapshot,
    )
}

pub(crate) fn turn_budget_prompt(limit: Option<u64>, snapshot: &str) -> String {
    let ceiling = limit
        .map(|tokens| format!(" ({} tokens)", format_count(tokens)))
        .unwrap_or_default();
    with_snapshot(
        format!(
            "The per-turn budget{ceiling} was exhausted. Wrap up the current step concisely \
             and defer anything non-essential."
        ),
        snapshot,
    )
}

pub(crate) fn finish_prompt(reason: FinishReason, snapshot: &str) -> String {
    let guidance = match reason {
        FinishReason::MaxTokens => {
            "Your previous reply was cut off at the token limit. Resume from the last complete \
             point, keep outputs shorter, and split long replies across messages."
        }
        FinishReason::MalformedFunctionCall => {
            "Your previous tool call was malformed. Audit the arguments of the last call, \
             correct them to match the tool schema exactly, and retry."
        }
        FinishReason::Safety
        | FinishReason::ProhibitedContent
        | FinishReason::Blocklist
        | FinishReason::ImageSafety => {
            "Your previous reply was blocked. Reframe the response, avoid the blocked terms or \
             content, and offer a compliant alternative."
        }
        FinishReason::Recitation => {
            "Your previous reply was flagged for recitation. Summarize in original wording and \
             keep any quoted excerpts short."
        }
        _ => {
            "Your previous reply ended unexpectedly. State what blocked you and adjust the \
             strategy before continuing."
        }
    };
    with_snapshot(
        format!(
            "The model stopped early (finish reason: {}). {guidance}",
            reason.as_str()
        ),
        snapshot,
    )
}
