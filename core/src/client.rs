//! Contract between the turn controller and the model client.
//!
//! The endpoint itself lives outside this crate; the controller only sees the
//! typed event stream and a handful of chat-state operations.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use skiff_protocol::ClientMessage;
use skiff_protocol::Part;
use skiff_protocol::QueryPayload;
use skiff_protocol::StreamEvent;

/// Items yielded while a turn streams.
pub type EventStream = BoxStream<'static, Result<StreamEvent, TurnError>>;

/// Failures surfaced by the model client at the turn boundary.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The client's own retry loop gave up; drives provider recovery.
    #[error("provider retries exhausted after {attempts} attempts: {last_error}")]
    ProviderRetryExhausted {
        attempts: u32,
        error_codes: Vec<String>,
        last_error: String,
    },
    /// Credentials rejected; handled by the auth callback, never recovered.
    #[error("authentication required")]
    Unauthorized,
    /// Produced by cancellation; swallowed without a history entry.
    #[error("turn aborted")]
    Aborted,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Streams model output and owns the provider-side conversation buffer.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Starts one streaming request. Aborting `cancel` stops event
    /// production; it does not touch running tools.
    async fn stream(
        &self,
        payload: QueryPayload,
        prompt_id: &str,
        cancel: CancellationToken,
    ) -> Result<EventStream, TurnError>;

    /// Best-effort reset of provider-side chat state after a provider
    /// failure.
    async fn reset_chat(&self) -> Result<()>;

    /// Records a synthetic user-role message in the conversation buffer.
    /// Used when an entire tool batch was cancelled and nothing is forwarded.
    fn inject_synthetic_user_message(&self, parts: Vec<Part>);

    /// Snapshot of the conversation buffer, embedded into checkpoints.
    fn client_history(&self) -> Vec<ClientMessage>;
}

/// Human-readable rendering for the scrollback.
pub fn format_api_error(error: &TurnError) -> String {
    match error {
        TurnError::ProviderRetryExhausted {
            attempts,
            error_codes,
            last_error,
        } => {
            let codes = if error_codes.is_empty() {
                "unknown".to_string()
            } else {
                error_codes.join(", ")
            };
            format!(
                "Provider request failed after {attempts} attempts (error codes: {codes}): {last_error}"
            )
        }
        TurnError::Unauthorized => "Authentication required. Please sign in again.".to_string(),
        TurnError::Aborted => "Request aborted.".to_string(),
        TurnError::Other(err) => format!("Model request failed: {err:#}"),
    }
}
