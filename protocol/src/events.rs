//! Typed events produced by the model client's response stream.
//!
//! The wire shape of the upstream endpoint is opaque to the controller; the
//! client decodes it into this union. Events carry either data (content
//! chunks, tool-call requests) or control signals (retry, loop-detected,
//! finish reasons, budget exhaustion).

use serde::Deserialize;
use serde::Serialize;

use crate::tools::ToolCallRequest;

/// Reason the model reported for ending its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    FinishReasonUnspecified,
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Language,
    Blocklist,
    ProhibitedContent,
    Spii,
    Other,
    MalformedFunctionCall,
    ImageSafety,
    UnexpectedToolCall,
}

impl FinishReason {
    /// Reasons that cut the reply short and warrant a corrective follow-up.
    /// `Stop` and friends are benign.
    pub fn is_early_termination(self) -> bool {
        matches!(
            self,
            Self::MaxTokens
                | Self::MalformedFunctionCall
                | Self::Safety
                | Self::ProhibitedContent
                | Self::Recitation
                | Self::Blocklist
                | Self::ImageSafety
                | Self::Other
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinishReasonUnspecified => "FINISH_REASON_UNSPECIFIED",
            Self::Stop => "STOP",
            Self::MaxTokens => "MAX_TOKENS",
            Self::Safety => "SAFETY",
            Self::Recitation => "RECITATION",
            Self::Language => "LANGUAGE",
            Self::Blocklist => "BLOCKLIST",
            Self::ProhibitedContent => "PROHIBITED_CONTENT",
            Self::Spii => "SPII",
            Self::Other => "OTHER",
            Self::MalformedFunctionCall => "MALFORMED_FUNCTION_CALL",
            Self::ImageSafety => "IMAGE_SAFETY",
            Self::UnexpectedToolCall => "UNEXPECTED_TOOL_CALL",
        }
    }
}

/// One event from the model client's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Model thought summary; surfaced as transient state, never history.
    Thought { summary: String },
    /// A chunk of assistant text.
    Content { value: String },
    ToolCallRequest(ToolCallRequest),
    /// The user aborted the request out-of-band.
    UserCancelled,
    /// Non-fatal model-side error surfaced inside the stream.
    Error {
        error: Option<String>,
        message: String,
    },
    /// The client compressed its conversation buffer mid-turn.
    ChatCompressed {
        original_token_count: Option<u64>,
        new_token_count: Option<u64>,
    },
    /// The session hit its configured turn ceiling.
    MaxSessionTurns,
    SessionTokenLimitExceeded {
        current_tokens: u64,
        limit: u64,
        message: Option<String>,
    },
    TurnBudgetExceeded { limit: Option<u64> },
    Finished { reason: FinishReason },
    /// The client's loop detector tripped; handling is deferred until the
    /// stream drains.
    LoopDetected,
    /// The stream stalled and the client is about to reissue the request.
    Retry,
    /// Owned by the tool scheduler; the controller ignores these.
    ToolCallConfirmation { call_id: String },
    ToolCallResponse { call_id: String },
}
