//! Turn orchestration for an interactive coding assistant.
//!
//! The controller in this crate drives one conversational turn against an
//! OpenAI-compatible streaming endpoint: it submits the user prompt, consumes
//! the typed event stream, dispatches tool calls, feeds tool results back,
//! and recovers automatically from stalls, tool loops, provider outages,
//! budget exhaustion, and early-termination finish reasons.

mod checkpoint;
mod client;
mod clock;
mod config;
mod controller;
mod history;
mod markdown;
mod metrics;
mod recovery;
mod scheduler;
mod snapshot;


pub use checkpoint::CheckpointWriter;
pub use checkpoint::GitSnapshot;
pub use client::EventStream;
pub use client::ModelClient;
pub use client::TurnError;
pub use client::format_api_error;
pub use clock::Clock;
pub use clock::PromptIdSource;
pub use clock::SystemClock;
pub use config::ApprovalMode;
pub use config::ControllerConfig;
pub use controller::CommandHost;
pub use controller::ControllerDeps;
pub use controller::ControllerEvent;
pub use controller::ControllerEventSender;
pub use controller::ControllerSnapshot;
pub use controller::MemoryHost;
pub use controller::NoopCommandHost;
pub use controller::NoopMemoryHost;
pub use controller::SlashOutcome;
pub use controller::StreamingState;
pub use controller::SubmitOptions;
pub use controller::TurnControllerHandle;
pub use controller::TurnCounters;
pub use controller::start_turn_controller;
pub use history::HistoryEntry;
pub use history::HistoryRecord;
pub use history::HistoryStore;
pub use history::Pending;
pub use history::ToolGroupCall;
pub use markdown::last_safe_split_point;
pub use metrics::SessionMetrics;
pub use recovery::PendingRecovery;
pub use recovery::RecoveryKind;
pub use scheduler::ApprovalDecider;
pub use scheduler::ApprovalDecision;
pub use scheduler::ScheduleContext;
pub use scheduler::SchedulerNotice;
pub use scheduler::ToolRuntime;
pub use scheduler::ToolScheduler;
pub use scheduler::TrackedToolCall;
pub use snapshot::build_recovery_snapshot;
