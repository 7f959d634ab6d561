//! The assistant turn controller.
//!
//! One cooperative event loop owns the conversation history, the recovery
//! counters, and the pending-recovery slot. It drives the model stream,
//! hands tool batches to the scheduler, forwards ripe tool responses back to
//! the model, and re-enters itself with synthesized prompts when a failure
//! category still has recovery budget.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use skiff_protocol::Part;
use skiff_protocol::QueryPayload;
use skiff_protocol::StreamEvent;
use skiff_protocol::ToolCallRequest;
use skiff_protocol::ToolCallStatus;

use crate::checkpoint::CheckpointWriter;
use crate::client::EventStream;
use crate::client::ModelClient;
use crate::client::TurnError;
use crate::client::format_api_error;
use crate::clock::Clock;
use crate::clock::PromptIdSource;
use crate::config::ControllerConfig;
use crate::history::HistoryEntry;
use crate::history::HistoryRecord;
use crate::history::HistoryStore;
use crate::history::Pending;
use crate::history::ToolGroupCall;
use crate::markdown::last_safe_split_point;
use crate::metrics::SessionMetrics;
use crate::recovery;
use crate::recovery::PendingRecovery;
use crate::recovery::RecoveryKind;
use crate::recovery::format_count;
use crate::scheduler::ApprovalDecider;
use crate::scheduler::ScheduleContext;
use crate::scheduler::SchedulerNotice;
use crate::scheduler::ToolRuntime;
use crate::scheduler::ToolScheduler;
use crate::scheduler::TrackedToolCall;
use crate::snapshot::build_recovery_snapshot;

/// Split the pending assistant message once its buffer grows past this many
/// bytes, provided a safe markdown boundary exists.
const CONTENT_SPLIT_THRESHOLD: usize = 4096;

/// Tool whose success triggers an external memory refresh.
const SAVE_MEMORY_TOOL: &str = "save_memory";

/// Bound on the processed-set that deduplicates memory refreshes.
const MAX_PROCESSED_MEMORY_IDS: usize = 1024;

/// Where the controller stands with respect to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingState {
    #[default]
    Idle,
    Responding,
    /// At least one tool call is waiting for user approval.
    WaitingForConfirmation,
}

/// Options accepted by `submit_query`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Continuations never reset recovery counters and bypass the in-flight
    /// guard.
    pub is_continuation: bool,
    pub skip_loop_reset: bool,
    pub skip_provider_reset: bool,
    pub skip_limit_reset: bool,
    pub skip_finish_reset: bool,
}

impl SubmitOptions {
    pub fn continuation() -> Self {
        Self {
            is_continuation: true,
            ..Self::default()
        }
    }
}

/// Attempt counters scoped to one user-originated turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnCounters {
    pub retry_attempts: u32,
    pub auto_recovery_attempts: u32,
    pub loop_recovery_attempts: u32,
    pub provider_recovery_attempts: u32,
    pub limit_recovery_attempts: u32,
    pub finish_recovery_attempts: u32,
}

/// Resets counters on entry to a turn, honoring the skip flags.
fn apply_reset_policy(counters: &mut TurnCounters, options: &SubmitOptions) {
    if options.is_continuation {
        return;
    }
    counters.retry_attempts = 0;
    counters.auto_recovery_attempts = 0;
    if !options.skip_loop_reset {
        counters.loop_recovery_attempts = 0;
    }
    if !options.skip_provider_reset {
        counters.provider_recovery_attempts = 0;
    }
    if !options.skip_limit_reset {
        counters.limit_recovery_attempts = 0;
    }
    if !options.skip_finish_reset {
        counters.finish_recovery_attempts = 0;
    }
}

/// Events surfaced to the renderer.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    EntryAppended(HistoryEntry),
    /// The pending entry changed; it is rendered separately from history.
    PendingChanged(Pending),
    Thought(Option<String>),
    StateChanged(StreamingState),
}

/// Cloneable callback the controller reports through.
#[derive(Clone)]
pub struct ControllerEventSender {
    inner: Arc<dyn Fn(ControllerEvent) + Send + Sync>,
}

impl ControllerEventSender {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ControllerEvent) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Sink that drops every event.
    pub fn null() -> Self {
        Self::new(|_| {})
    }

    pub fn send(&self, event: ControllerEvent) {
        (self.inner)(event);
    }
}

/// Result of routing a query through the external slash-command registry.
#[derive(Debug, Clone)]
pub enum SlashOutcome {
    /// Dispatch a client-initiated tool call; no model request is made.
    ScheduleTool {
        name: String,
        arguments: Map<String, Value>,
    },
    /// Replace the payload sent to the model.
    SubmitPrompt(String),
    /// The command completed on its own.
    Handled,
}

/// External command surfaces: slash commands, `@file` expansion, shell mode.
#[async_trait]
pub trait CommandHost: Send + Sync {
    fn route_slash_command(&self, query: &str) -> Option<SlashOutcome> {
        let _ = query;
        None
    }

    /// May enrich the payload with file contents; `Ok(None)` means the query
    /// had no at-commands.
    async fn expand_at_commands(&self, query: &str) -> anyhow::Result<Option<QueryPayload>> {
        let _ = query;
        Ok(None)
    }

    fn shell_mode_active(&self) -> bool {
        false
    }

    async fn run_shell_command(&self, command: &str) {
        let _ = command;
    }
}

/// Host with no command surfaces; every query goes to the model.
pub struct NoopCommandHost;

#[async_trait]
impl CommandHost for NoopCommandHost {}

/// Receives the memory-refresh signal after a successful `save_memory`.
#[async_trait]
pub trait MemoryHost: Send + Sync {
    async fn refresh_memory(&self);
}

pub struct NoopMemoryHost;

#[async_trait]
impl MemoryHost for NoopMemoryHost {
    async fn refresh_memory(&self) {}
}

/// Collaborators handed to the controller at spawn time.
pub struct ControllerDeps {
    pub client: Arc<dyn ModelClient>,
    pub tool_runtime: Arc<dyn ToolRuntime>,
    pub approvals: Arc<dyn ApprovalDecider>,
    pub checkpoints: Option<Arc<CheckpointWriter>>,
    pub command_host: Arc<dyn CommandHost>,
    pub memory_host: Arc<dyn MemoryHost>,
    pub clock: Arc<dyn Clock>,
    pub prompt_ids: PromptIdSource,
    pub events: ControllerEventSender,
    pub on_auth_error: Arc<dyn Fn() + Send + Sync>,
}

enum ControllerCommand {
    SubmitQuery {
        query: QueryPayload,
        options: SubmitOptions,
        prompt_id: Option<String>,
    },
    Cancel,
    Record(HistoryRecord),
    EmitStats,
    SetQuotaErrorModelSwitch(bool),
    Snapshot(oneshot::Sender<ControllerSnapshot>),
    Shutdown,
}

/// Point-in-time view of controller state, for observers and tests.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub entries: Vec<HistoryEntry>,
    pub pending: Pending,
    pub is_submitting_query: bool,
    pub counters: TurnCounters,
    pub streaming_state: StreamingState,
    pub has_pending_recovery: bool,
}

/// Handle used to drive a spawned controller.
#[derive(Clone)]
pub struct TurnControllerHandle {
    commands: mpsc::UnboundedSender<ControllerCommand>,
    state_rx: watch::Receiver<StreamingState>,
}

impl TurnControllerHandle {
    /// Submits one query. A non-continuation submission while a turn is in
    /// flight is silently dropped.
    pub fn submit_query(
        &self,
        query: impl Into<QueryPayload>,
        options: SubmitOptions,
        prompt_id: Option<String>,
    ) {
        let _ = self.commands.send(ControllerCommand::SubmitQuery {
            query: query.into(),
            options,
            prompt_id,
        });
    }

    /// No-op unless the controller is in the `Responding` phase.
    pub fn cancel_ongoing(&self) {
        let _ = self.commands.send(ControllerCommand::Cancel);
    }

    /// Appends an informational record produced outside the turn loop
    /// (about, help, summary, quit, ...).
    pub fn record(&self, record: HistoryRecord) {
        let _ = self.commands.send(ControllerCommand::Record(record));
    }

    /// Renders a `stats` entry from the session metrics.
    pub fn emit_stats(&self) {
        let _ = self.commands.send(ControllerCommand::EmitStats);
    }

    /// When set, completed tool batches are consumed without being forwarded
    /// to the model.
    pub fn set_model_switched_from_quota_error(&self, value: bool) {
        let _ = self
            .commands
            .send(ControllerCommand::SetQuotaErrorModelSwitch(value));
    }

    pub fn streaming_state(&self) -> watch::Receiver<StreamingState> {
        self.state_rx.clone()
    }

    pub async fn snapshot(&self) -> Option<ControllerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(ControllerCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ControllerCommand::Shutdown);
    }
}

/// Spawns the controller task and returns its handle.
pub fn start_turn_controller(
    config: ControllerConfig,
    deps: ControllerDeps,
) -> TurnControllerHandle {
    let (commands, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(StreamingState::Idle);
    let state_tx = Arc::new(state_tx);

    let notice_state = state_tx.clone();
    let notice_events = deps.events.clone();
    let notices: Arc<dyn Fn(SchedulerNotice) + Send + Sync> = Arc::new(move |notice| {
        let state = match notice {
            SchedulerNotice::ApprovalWaitStarted { .. } => StreamingState::WaitingForConfirmation,
            SchedulerNotice::ApprovalWaitEnded { .. } => StreamingState::Responding,
            SchedulerNotice::StatusChanged { .. } => return,
        };
        notice_state.send_replace(state);
        notice_events.send(ControllerEvent::StateChanged(state));
    });

    let checkpoints = if config.checkpointing_enabled {
        deps.checkpoints.clone()
    } else {
        None
    };
    let scheduler = Arc::new(ToolScheduler::new(
        deps.tool_runtime.clone(),
        deps.approvals.clone(),
        config.approval_mode,
        checkpoints,
        deps.clock.clone(),
        notices,
    ));

    let controller = TurnController {
        config,
        client: deps.client,
        scheduler,
        command_host: deps.command_host,
        memory_host: deps.memory_host,
        clock: deps.clock,
        prompt_ids: deps.prompt_ids,
        events: deps.events,
        on_auth_error: deps.on_auth_error,
        state_tx,
        history: HistoryStore::new(),
        metrics: SessionMetrics::new(),
        counters: TurnCounters::default(),
        pending_recovery: None,
        cancellation: None,
        is_submitting_query: false,
        model_switched_from_quota_error: false,
        processed_memory_ids: HashSet::new(),
        processed_memory_order: VecDeque::new(),
        queued_submissions: VecDeque::new(),
        shutdown_requested: false,
        thought: None,
    };

    tokio::spawn(controller.run(cmd_rx));

    TurnControllerHandle { commands, state_rx }
}

/// Who initiated this pass through the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnOrigin {
    User,
    /// Tool responses or an externally submitted continuation.
    Continuation,
    /// A synthesized recovery prompt.
    Recovery,
}

struct TurnInput {
    payload: QueryPayload,
    options: SubmitOptions,
    prompt_id: Option<String>,
    origin: TurnOrigin,
}

enum Preflight {
    Model(QueryPayload),
    ClientTool {
        name: String,
        arguments: Map<String, Value>,
    },
    Done,
}

/// How the stream loop ended.
enum StreamExit {
    Completed,
    Cancelled,
    RetryLimitExceeded,
    Failed,
    ClientError(TurnError),
}

struct StreamPass {
    exit: StreamExit,
    batch: Vec<ToolCallRequest>,
    loop_detected: bool,
}

struct TurnController {
    config: ControllerConfig,
    client: Arc<dyn ModelClient>,
    scheduler: Arc<ToolScheduler>,
    command_host: Arc<dyn CommandHost>,
    memory_host: Arc<dyn MemoryHost>,
    clock: Arc<dyn Clock>,
    prompt_ids: PromptIdSource,
    events: ControllerEventSender,
    on_auth_error: Arc<dyn Fn() + Send + Sync>,
    state_tx: Arc<watch::Sender<StreamingState>>,
    history: HistoryStore,
    metrics: SessionMetrics,
    counters: TurnCounters,
    pending_recovery: Option<PendingRecovery>,
    cancellation: Option<CancellationToken>,
    is_submitting_query: bool,
    model_switched_from_quota_error: bool,
    processed_memory_ids: HashSet<String>,
    processed_memory_order: VecDeque<String>,
    queued_submissions: VecDeque<TurnInput>,
    shutdown_requested: bool,
    thought: Option<String>,
}

impl TurnController {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ControllerCommand>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                ControllerCommand::SubmitQuery {
                    query,
                    options,
                    prompt_id,
                } => {
                    let origin = if options.is_continuation {
                        TurnOrigin::Continuation
                    } else {
                        TurnOrigin::User
                    };
                    self.submit_query(
                        &mut cmd_rx,
                        TurnInput {
                            payload: query,
                            options,
                            prompt_id,
                            origin,
                        },
                    )
                    .await;
                }
                // Cancellation outside `Responding` is a no-op.
                ControllerCommand::Cancel => {}
                ControllerCommand::Shutdown => break,
                other => self.handle_side_command(other),
            }
            if self.shutdown_requested {
                break;
            }
        }
    }

    /// Commands that are valid both between and during turns.
    fn handle_side_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Record(record) => {
                self.append(record);
            }
            ControllerCommand::EmitStats => {
                let record = self.metrics.as_record();
                self.append(record);
            }
            ControllerCommand::SetQuotaErrorModelSwitch(value) => {
                self.model_switched_from_quota_error = value;
            }
            ControllerCommand::Snapshot(tx) => {
                let _ = tx.send(self.snapshot());
            }
            ControllerCommand::SubmitQuery {
                query,
                options,
                prompt_id,
            } => {
                // Mid-turn path: the in-flight guard rejects everything that
                // is not a continuation.
                if options.is_continuation {
                    self.queued_submissions.push_back(TurnInput {
                        payload: query,
                        options,
                        prompt_id,
                        origin: TurnOrigin::Continuation,
                    });
                } else {
                    debug!("dropping concurrent non-continuation submission");
                }
            }
            ControllerCommand::Shutdown => {
                self.shutdown_requested = true;
                if let Some(cancel) = &self.cancellation {
                    cancel.cancel();
                }
            }
            ControllerCommand::Cancel => {}
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            entries: self.history.entries().to_vec(),
            pending: self.history.pending().clone(),
            is_submitting_query: self.is_submitting_query,
            counters: self.counters,
            streaming_state: *self.state_tx.borrow(),
            has_pending_recovery: self.pending_recovery.is_some(),
        }
    }

    /// Drives one turn and every continuation it spawns. The in-flight flag
    /// is set here and cleared on every exit path.
    async fn submit_query(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<ControllerCommand>,
        input: TurnInput,
    ) {
        if self.is_submitting_query && !input.options.is_continuation {
            return;
        }
        self.is_submitting_query = true;
        self.set_state(StreamingState::Responding);

        let mut next = Some(input);
        loop {
            let Some(input) = next
                .take()
                .or_else(|| self.queued_submissions.pop_front())
            else {
                break;
            };
            next = self.run_turn(cmd_rx, input).await;
            if self.shutdown_requested {
                break;
            }
        }

        self.cancellation = None;
        self.set_thought(None);
        self.is_submitting_query = false;
        self.set_state(StreamingState::Idle);
    }

    /// One pass: preflight, stream, drain, decide on recovery. Returns the
    /// next submission (forwarded tool responses or a queued recovery).
    async fn run_turn(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<ControllerCommand>,
        input: TurnInput,
    ) -> Option<TurnInput> {
        apply_reset_policy(&mut self.counters, &input.options);

        let prompt_id = input
            .prompt_id
            .clone()
            .unwrap_or_else(|| self.prompt_ids.next_prompt_id());

        let payload = match self.preflight(&input).await {
            Preflight::Done => return self.take_recovery_input(),
            Preflight::ClientTool { name, arguments } => {
                let request = ToolCallRequest {
                    call_id: self.prompt_ids.next_call_id(),
                    name,
                    arguments,
                    prompt_id: prompt_id.clone(),
                    client_initiated: true,
                };
                let cancel = CancellationToken::new();
                self.cancellation = Some(cancel.clone());
                let next = self.dispatch_tool_batch(cmd_rx, vec![request], &cancel).await;
                return next.or_else(|| self.take_recovery_input());
            }
            Preflight::Model(payload) => payload,
        };

        match input.origin {
            TurnOrigin::User => self.metrics.record_user_turn(),
            TurnOrigin::Continuation | TurnOrigin::Recovery => {
                self.metrics.record_continuation();
            }
        }

        let cancel = CancellationToken::new();
        self.cancellation = Some(cancel.clone());

        let stream = match self
            .client
            .stream(payload, &prompt_id, cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                self.handle_turn_error(error, &prompt_id).await;
                return self.take_recovery_input();
            }
        };

        let StreamPass {
            exit,
            batch,
            loop_detected,
        } = self.consume_stream(cmd_rx, stream, &prompt_id, &cancel).await;

        let exit = match exit {
            StreamExit::ClientError(error) => {
                self.handle_turn_error(error, &prompt_id).await;
                self.flush_pending();
                return self.take_recovery_input();
            }
            other => other,
        };
        let cancelled = matches!(exit, StreamExit::Cancelled);
        if cancelled {
            // Cancellation wins: nothing queued survives the turn.
            self.pending_recovery = None;
            return None;
        }

        // Draining: flush history first, then settle deferred loop handling.
        self.flush_pending();

        if loop_detected {
            self.handle_loop_detected(&prompt_id, &cancel);
            return self.take_recovery_input();
        }

        if matches!(exit, StreamExit::Completed) && !batch.is_empty() {
            let next = self.dispatch_tool_batch(cmd_rx, batch, &cancel).await;
            if next.is_some() {
                // Any queued recovery stays put; it is consumed when the
                // continuation chain tears down.
                return next;
            }
        }

        self.take_recovery_input()
    }

    /// Strips and routes the query. Only user-originated text passes through
    /// the command surfaces; continuations and recoveries go straight to the
    /// model, and non-text payloads pass through unchanged.
    async fn preflight(&mut self, input: &TurnInput) -> Preflight {
        let query = match &input.payload {
            QueryPayload::Parts(_) => return Preflight::Model(input.payload.clone()),
            QueryPayload::Text(raw) => raw.trim().to_string(),
        };
        if query.is_empty() {
            return Preflight::Done;
        }
        if input.origin != TurnOrigin::User {
            return Preflight::Model(QueryPayload::Text(query));
        }

        if let Some(outcome) = self.command_host.route_slash_command(&query) {
            self.append(HistoryRecord::User { text: query });
            return match outcome {
                SlashOutcome::ScheduleTool { name, arguments } => {
                    Preflight::ClientTool { name, arguments }
                }
                SlashOutcome::SubmitPrompt(content) => {
                    Preflight::Model(QueryPayload::Text(content))
                }
                SlashOutcome::Handled => Preflight::Done,
            };
        }

        if self.command_host.shell_mode_active() {
            self.append(HistoryRecord::UserShell {
                command: query.clone(),
            });
            self.command_host.run_shell_command(&query).await;
            return Preflight::Done;
        }

        self.append(HistoryRecord::User {
            text: query.clone(),
        });
        match self.command_host.expand_at_commands(&query).await {
            Ok(Some(payload)) => Preflight::Model(payload),
            Ok(None) => Preflight::Model(QueryPayload::Text(query)),
            Err(error) => {
                self.append_error(format!("Failed to process @-commands: {error:#}"));
                Preflight::Done
            }
        }
    }

    /// Consumes stream events until the sequence ends, a terminal control
    /// signal fires, or the user cancels.
    async fn consume_stream(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<ControllerCommand>,
        mut stream: EventStream,
        prompt_id: &str,
        cancel: &CancellationToken,
    ) -> StreamPass {
        let mut batch: Vec<ToolCallRequest> = Vec::new();
        let mut loop_detected = false;

        let exit = loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(ControllerCommand::Cancel) => {
                            cancel.cancel();
                            self.flush_pending();
                            self.append_info("Request cancelled.");
                            break StreamExit::Cancelled;
                        }
                        Some(ControllerCommand::Shutdown) | None => {
                            self.shutdown_requested = true;
                            cancel.cancel();
                            self.flush_pending();
                            break StreamExit::Cancelled;
                        }
                        Some(other) => self.handle_side_command(other),
                    }
                }
                event = stream.next() => {
                    match event {
                        None => break StreamExit::Completed,
                        Some(Ok(event)) => {
                            if let Some(exit) = self.dispatch_event(
                                event,
                                prompt_id,
                                cancel,
                                &mut batch,
                                &mut loop_detected,
                            ) {
                                break exit;
                            }
                        }
                        Some(Err(error)) => break StreamExit::ClientError(error),
                    }
                }
            }
        };

        StreamPass {
            exit,
            batch,
            loop_detected,
        }
    }

    /// The per-event action table.
    fn dispatch_event(
        &mut self,
        event: StreamEvent,
        prompt_id: &str,
        cancel: &CancellationToken,
        batch: &mut Vec<ToolCallRequest>,
        loop_detected: &mut bool,
    ) -> Option<StreamExit> {
        match event {
            StreamEvent::Thought { summary } => {
                self.set_thought(Some(summary));
            }
            StreamEvent::Content { value } => {
                self.counters.retry_attempts = 0;
                self.history.push_assistant_chunk(&value);
                self.maybe_split_pending();
                self.emit_pending();
            }
            StreamEvent::ToolCallRequest(request) => {
                batch.push(request);
            }
            StreamEvent::UserCancelled => {
                self.history.cancel_pending_tools();
                self.flush_pending();
                self.append_info("User cancelled the request.");
                return Some(StreamExit::Cancelled);
            }
            StreamEvent::Error { error, message } => {
                let text = match error {
                    Some(code) => format!("Model error ({code}): {message}"),
                    None => format!("Model error: {message}"),
                };
                self.append_error(text);
            }
            StreamEvent::ChatCompressed {
                original_token_count,
                new_token_count,
            } => {
                self.metrics
                    .record_compression(original_token_count, new_token_count);
                self.append(HistoryRecord::Compression {
                    original_token_count,
                    new_token_count,
                });
            }
            StreamEvent::ToolCallConfirmation { .. } | StreamEvent::ToolCallResponse { .. } => {
                // Owned by the scheduler.
            }
            StreamEvent::MaxSessionTurns => {
                let ceiling = self
                    .config
                    .max_session_turns
                    .map(|turns| format!(" of {turns} turns"))
                    .unwrap_or_default();
                let entry = HistoryRecord::Info {
                    text: format!("The session reached its turn limit{ceiling}."),
                };
                let max_turns = self.config.max_session_turns;
                return Some(self.handle_limit_exceeded(
                    RecoveryKind::TurnLimit,
                    entry,
                    prompt_id,
                    cancel,
                    |snapshot| recovery::turn_limit_prompt(max_turns, snapshot),
                ));
            }
            StreamEvent::SessionTokenLimitExceeded {
                current_tokens,
                limit,
                message,
            } => {
                self.metrics.record_token_watermark(current_tokens);
                let detail = message.map(|m| format!(" {m}")).unwrap_or_default();
                let entry = HistoryRecord::Error {
                    text: format!(
                        "Session token limit exceeded: {} of {} tokens used.{detail} You can: \
                         1) run /compress to compact the conversation, 2) run /clear to start \
                         a fresh session, or 3) raise the session token limit in settings.",
                        format_count(current_tokens),
                        format_count(limit)
                    ),
                };
                return Some(self.handle_limit_exceeded(
                    RecoveryKind::TokenLimit,
                    entry,
                    prompt_id,
                    cancel,
                    |snapshot| recovery::token_limit_prompt(current_tokens, limit, snapshot),
                ));
            }
            StreamEvent::TurnBudgetExceeded { limit } => {
                let ceiling = limit
                    .map(|tokens| format!(" ({} tokens)", format_count(tokens)))
                    .unwrap_or_default();
                let entry = HistoryRecord::Error {
                    text: format!("The turn token budget{ceiling} was exceeded."),
                };
                return Some(self.handle_limit_exceeded(
                    RecoveryKind::TurnBudget,
                    entry,
                    prompt_id,
                    cancel,
                    |snapshot| recovery::turn_budget_prompt(limit, snapshot),
                ));
            }
            StreamEvent::Finished { reason } => {
                if reason.is_early_termination() {
                    self.append_info(format!(
                        "The response ended early (finish reason: {}).",
                        reason.as_str()
                    ));
                    if self.pending_recovery.is_none()
                        && self.counters.finish_recovery_attempts
                            < self.config.finish_recovery_max_attempts
                    {
                        self.counters.finish_recovery_attempts += 1;
                        let snapshot = self.context_snapshot();
                        let recovery = PendingRecovery::new(
                            RecoveryKind::Finish(reason),
                            prompt_id,
                            self.counters.finish_recovery_attempts,
                            recovery::finish_prompt(reason, &snapshot),
                            self.clock.now(),
                        );
                        self.queue_recovery(recovery);
                    }
                } else {
                    debug!(reason = reason.as_str(), "stream finished");
                }
            }
            StreamEvent::LoopDetected => {
                // Deferred: handled in draining, after the history flush.
                *loop_detected = true;
            }
            StreamEvent::Retry => {
                // The client reissues the request; everything staged from the
                // stalled attempt is discarded.
                batch.clear();
                return self.handle_stream_stall(prompt_id);
            }
        }
        None
    }

    /// Stream-stall recovery (category: auto).
    fn handle_stream_stall(&mut self, prompt_id: &str) -> Option<StreamExit> {
        self.counters.retry_attempts += 1;
        self.history.discard_pending();
        self.emit_pending();
        self.append_info(format!(
            "Model response stalled. Retrying attempt {}/{}...",
            self.counters.retry_attempts, self.config.stream_retry_limit
        ));

        if self.counters.retry_attempts < self.config.stream_retry_limit {
            return None;
        }

        if self.counters.auto_recovery_attempts < self.config.auto_recovery_max_attempts {
            self.counters.auto_recovery_attempts += 1;
            let snapshot = self.context_snapshot();
            let recovery = PendingRecovery::new(
                RecoveryKind::Stall,
                prompt_id,
                self.counters.auto_recovery_attempts,
                recovery::stall_prompt(&snapshot),
                self.clock.now(),
            );
            if self.queue_recovery(recovery) {
                self.append_info("Attempting self-recovery…");
            }
            // The resumed stream gets a fresh stall window.
            self.counters.retry_attempts = 0;
            Some(StreamExit::RetryLimitExceeded)
        } else {
            self.append_error(
                "The model response stalled repeatedly and self-recovery was already attempted.",
            );
            Some(StreamExit::Failed)
        }
    }

    /// Shared handling for the three limit-exceeded signals. One budget
    /// covers them all, and the first writer owns the recovery slot.
    fn handle_limit_exceeded(
        &mut self,
        kind: RecoveryKind,
        entry: HistoryRecord,
        prompt_id: &str,
        cancel: &CancellationToken,
        build_prompt: impl FnOnce(&str) -> String,
    ) -> StreamExit {
        self.append(entry);
        let snapshot = self.context_snapshot();
        cancel.cancel();
        self.scheduler.reset("session limit exceeded");
        self.history.discard_pending();
        self.emit_pending();

        if self.counters.limit_recovery_attempts >= self.config.limit_recovery_max_attempts {
            self.append_error(
                "A session limit was hit again and automatic recovery was already attempted.",
            );
            return StreamExit::Failed;
        }
        self.counters.limit_recovery_attempts += 1;
        let recovery = PendingRecovery::new(
            kind,
            prompt_id,
            self.counters.limit_recovery_attempts,
            build_prompt(&snapshot),
            self.clock.now(),
        );
        self.queue_recovery(recovery);
        StreamExit::Failed
    }

    /// Loop recovery, deferred from the stream loop to the draining phase.
    fn handle_loop_detected(&mut self, prompt_id: &str, cancel: &CancellationToken) {
        cancel.cancel();
        self.scheduler.reset("loop detected");
        let snapshot = self.context_snapshot();
        self.history.discard_pending();
        self.emit_pending();

        let notice = if snapshot.is_empty() {
            "A potential tool loop was detected.".to_string()
        } else {
            format!("A potential tool loop was detected.\n{snapshot}")
        };
        self.append_info(notice);

        if self.counters.loop_recovery_attempts >= self.config.loop_recovery_max_attempts {
            self.append_error(
                "A tool loop was detected again and automatic recovery was already attempted.",
            );
            return;
        }
        self.counters.loop_recovery_attempts += 1;
        let recovery = PendingRecovery::new(
            RecoveryKind::Loop,
            prompt_id,
            self.counters.loop_recovery_attempts,
            recovery::loop_prompt(&snapshot),
            self.clock.now(),
        );
        if self.queue_recovery(recovery) {
            self.append_info("Attempting automatic recovery…");
        }
    }

    /// Failures raised by the model client at the turn boundary.
    async fn handle_turn_error(&mut self, error: TurnError, prompt_id: &str) {
        match error {
            TurnError::Unauthorized => {
                (self.on_auth_error)();
            }
            TurnError::Aborted => {
                // Produced by cancellation; swallowed silently.
            }
            TurnError::ProviderRetryExhausted {
                attempts,
                error_codes,
                last_error,
            } => {
                self.handle_provider_failure(attempts, error_codes, last_error, prompt_id)
                    .await;
            }
            other => {
                self.append_error(format_api_error(&other));
            }
        }
    }

    /// Provider-failure recovery (category: provider).
    async fn handle_provider_failure(
        &mut self,
        attempts: u32,
        error_codes: Vec<String>,
        last_error: String,
        prompt_id: &str,
    ) {
        let snapshot = self.context_snapshot();
        let codes = if error_codes.is_empty() {
            "unknown".to_string()
        } else {
            error_codes.join(", ")
        };
        let mut notice = format!(
            "The provider failed after {attempts} attempts (error codes: {codes}). \
             Last error: {last_error}"
        );
        if !snapshot.is_empty() {
            notice.push('\n');
            notice.push_str(&snapshot);
        }
        self.append_info(notice);

        if let Err(error) = self.client.reset_chat().await {
            self.append_error(format!(
                "Failed to reset the conversation after a provider failure: {error:#}"
            ));
            return;
        }

        if self.counters.provider_recovery_attempts >= self.config.provider_recovery_max_attempts {
            self.append_error(
                "Provider failures persisted and automatic recovery was already attempted.",
            );
            return;
        }
        self.counters.provider_recovery_attempts += 1;
        let recovery = PendingRecovery::new(
            RecoveryKind::Provider,
            prompt_id,
            self.counters.provider_recovery_attempts,
            recovery::provider_prompt(attempts, &error_codes, &last_error, &snapshot),
            self.clock.now(),
        );
        self.queue_recovery(recovery);
    }

    /// Runs a tool batch to completion, servicing cancellation while it runs,
    /// then performs the completion handshake.
    async fn dispatch_tool_batch(
        &mut self,
        cmd_rx: &mut mpsc::UnboundedReceiver<ControllerCommand>,
        batch: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Option<TurnInput> {
        let calls: Vec<ToolGroupCall> = batch
            .iter()
            .map(|request| ToolGroupCall {
                call_id: request.call_id.clone(),
                name: request.name.clone(),
                status: ToolCallStatus::Validating,
            })
            .collect();
        self.history.set_pending_tool_group(calls);
        self.emit_pending();

        let context = ScheduleContext {
            history: self.history.entries().to_vec(),
            client_history: self.client.client_history(),
        };
        let scheduler = self.scheduler.clone();
        let token = cancel.clone();
        let mut run = Box::pin(async move { scheduler.schedule(batch, token, context).await });

        let mut cancel_handled = false;
        let completed = loop {
            tokio::select! {
                completed = &mut run => break completed,
                command = cmd_rx.recv() => {
                    match command {
                        Some(ControllerCommand::Cancel) => {
                            // Only effective while responding; approval waits
                            // are not cancellable from here. Idempotent.
                            if !cancel_handled
                                && *self.state_tx.borrow() == StreamingState::Responding
                            {
                                cancel_handled = true;
                                cancel.cancel();
                                self.scheduler.reset("user cancelled");
                                self.pending_recovery = None;
                                self.append_info("Request cancelled.");
                            }
                        }
                        Some(ControllerCommand::Shutdown) | None => {
                            self.shutdown_requested = true;
                            cancel.cancel();
                            self.scheduler.reset("controller shutting down");
                        }
                        Some(other) => self.handle_side_command(other),
                    }
                }
            }
        };

        self.handle_completed_tools(completed).await
    }

    /// The completion handshake: record the group, refresh memory, and either
    /// forward ripe responses or inject a synthetic cancellation message.
    async fn handle_completed_tools(
        &mut self,
        completed: Vec<TrackedToolCall>,
    ) -> Option<TurnInput> {
        if completed.is_empty() {
            self.history.discard_pending();
            self.emit_pending();
            return None;
        }

        let calls: Vec<ToolGroupCall> = completed
            .iter()
            .map(|call| ToolGroupCall {
                call_id: call.request.call_id.clone(),
                name: call.request.name.clone(),
                status: call.status,
            })
            .collect();
        self.history.set_pending_tool_group(calls);
        self.flush_pending();

        for call in &completed {
            if call.status == ToolCallStatus::Success
                && call.request.name == SAVE_MEMORY_TOOL
                && self.mark_memory_processed(&call.request.call_id)
            {
                self.memory_host.refresh_memory().await;
            }
        }

        if completed
            .iter()
            .all(|call| call.status == ToolCallStatus::Cancelled)
        {
            // Nothing goes back through the model; record the cancellations
            // in its history instead.
            let parts: Vec<Part> = completed
                .iter()
                .flat_map(|call| call.response.clone())
                .collect();
            self.client.inject_synthetic_user_message(parts);
            let ids: Vec<String> = completed
                .iter()
                .map(|call| call.request.call_id.clone())
                .collect();
            self.scheduler.mark_submitted(&ids);
            return None;
        }

        // Client-initiated calls are consumed here; only scheduler-produced
        // responses flow back to the model.
        let client_ids: Vec<String> = completed
            .iter()
            .filter(|call| call.request.client_initiated)
            .map(|call| call.request.call_id.clone())
            .collect();
        if !client_ids.is_empty() {
            self.scheduler.mark_submitted(&client_ids);
        }

        let forwardable: Vec<&TrackedToolCall> = completed
            .iter()
            .filter(|call| !call.request.client_initiated && call.is_ripe())
            .collect();
        if forwardable.is_empty() {
            return None;
        }

        let ids: Vec<String> = forwardable
            .iter()
            .map(|call| call.request.call_id.clone())
            .collect();

        if self.model_switched_from_quota_error {
            warn!("skipping tool response forwarding after quota-error model switch");
            self.scheduler.mark_submitted(&ids);
            return None;
        }

        let parts: Vec<Part> = forwardable
            .iter()
            .flat_map(|call| call.response.clone())
            .collect();
        let first_prompt_id = forwardable[0].request.prompt_id.clone();
        self.scheduler.mark_submitted(&ids);

        Some(TurnInput {
            payload: QueryPayload::Parts(parts),
            options: SubmitOptions::continuation(),
            prompt_id: Some(first_prompt_id),
            origin: TurnOrigin::Continuation,
        })
    }

    /// Consumes the pending-recovery slot; called exactly once per teardown.
    fn take_recovery_input(&mut self) -> Option<TurnInput> {
        let recovery = self.pending_recovery.take()?;
        Some(TurnInput {
            payload: QueryPayload::Text(recovery.query_text),
            options: SubmitOptions {
                is_continuation: recovery.is_continuation,
                skip_loop_reset: recovery.skip_loop_reset,
                skip_provider_reset: recovery.skip_provider_reset,
                skip_limit_reset: recovery.skip_limit_reset,
                skip_finish_reset: recovery.skip_finish_reset,
            },
            prompt_id: Some(recovery.prompt_id),
            origin: TurnOrigin::Recovery,
        })
    }

    /// First writer wins; at most one recovery is ever queued.
    fn queue_recovery(&mut self, recovery: PendingRecovery) -> bool {
        if self.pending_recovery.is_some() {
            debug!("recovery slot already taken; dropping {}", recovery.prompt_id);
            return false;
        }
        self.pending_recovery = Some(recovery);
        true
    }

    /// Dedup guard for memory refreshes, bounded to the most recent ids.
    fn mark_memory_processed(&mut self, call_id: &str) -> bool {
        if self.processed_memory_ids.contains(call_id) {
            return false;
        }
        self.processed_memory_ids.insert(call_id.to_string());
        self.processed_memory_order.push_back(call_id.to_string());
        while self.processed_memory_order.len() > MAX_PROCESSED_MEMORY_IDS {
            if let Some(evicted) = self.processed_memory_order.pop_front() {
                self.processed_memory_ids.remove(&evicted);
            }
        }
        true
    }

    fn maybe_split_pending(&mut self) {
        let Some(text) = self.history.pending().assistant_text() else {
            return;
        };
        if text.len() <= CONTENT_SPLIT_THRESHOLD {
            return;
        }
        let Some(at) = last_safe_split_point(text) else {
            return;
        };
        if let Some(entry) = self.history.split_pending_assistant(at, self.clock.now()) {
            self.events.send(ControllerEvent::EntryAppended(entry));
        }
    }

    fn context_snapshot(&self) -> String {
        build_recovery_snapshot(self.history.entries(), self.history.pending())
    }

    fn flush_pending(&mut self) {
        if let Some(entry) = self.history.finalize_pending(self.clock.now()) {
            self.events.send(ControllerEvent::EntryAppended(entry));
        }
        self.emit_pending();
    }

    fn emit_pending(&self) {
        self.events
            .send(ControllerEvent::PendingChanged(self.history.pending().clone()));
    }

    fn append(&mut self, record: HistoryRecord) {
        let entry = self.history.append(record, self.clock.now());
        self.events.send(ControllerEvent::EntryAppended(entry));
    }

    fn append_info(&mut self, text: impl Into<String>) {
        self.append(HistoryRecord::Info { text: text.into() });
    }

    fn append_error(&mut self, text: impl Into<String>) {
        self.append(HistoryRecord::Error { text: text.into() });
    }

    fn set_thought(&mut self, thought: Option<String>) {
        if self.thought == thought {
            return;
        }
        self.thought = thought.clone();
        self.events.send(ControllerEvent::Thought(thought));
    }

    fn set_state(&self, state: StreamingState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        self.state_tx.send_replace(state);
        self.events.send(ControllerEvent::StateChanged(state));
    }
}
