//! Static configuration for the turn controller.
//!
//! Recovery ceilings are fixed at construction; nothing in the controller
//! reads the environment at runtime.

use serde::Deserialize;
use serde::Serialize;

/// How tool calls that mutate the workspace are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Mutating tools wait for user confirmation.
    #[default]
    Default,
    /// Every tool runs without confirmation.
    Yolo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Consecutive stream stalls tolerated before self-recovery kicks in.
    pub stream_retry_limit: u32,
    /// Self-recoveries after stream stalls, per user turn.
    pub auto_recovery_max_attempts: u32,
    /// Recoveries after the loop detector trips, per user turn.
    pub loop_recovery_max_attempts: u32,
    /// Recoveries after provider retry exhaustion, per user turn.
    pub provider_recovery_max_attempts: u32,
    /// Shared budget across the three limit-exceeded signals, per user turn.
    pub limit_recovery_max_attempts: u32,
    /// Recoveries after early-termination finish reasons, per user turn.
    pub finish_recovery_max_attempts: u32,
    /// Session-wide turn ceiling reported by the model client, if any.
    pub max_session_turns: Option<u32>,
    pub session_token_limit: Option<u64>,
    pub checkpointing_enabled: bool,
    pub approval_mode: ApprovalMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stream_retry_limit: 3,
            auto_recovery_max_attempts: 1,
            loop_recovery_max_attempts: 1,
            provider_recovery_max_attempts: 1,
            limit_recovery_max_attempts: 1,
            finish_recovery_max_attempts: 1,
            max_session_turns: None,
            session_token_limit: None,
            checkpointing_enabled: false,
            approval_mode: ApprovalMode::Default,
        }
    }
}
