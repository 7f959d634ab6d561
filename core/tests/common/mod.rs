#![allow(dead_code)]

//! Shared fakes for driving a spawned controller deterministically: a
//! scripted model client, a recording tool runtime, scripted approvals, and a
//! fixed clock.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use skiff_core::ApprovalDecider;
use skiff_core::ApprovalDecision;
use skiff_core::CheckpointWriter;
use skiff_core::Clock;
use skiff_core::CommandHost;
use skiff_core::ControllerConfig;
use skiff_core::ControllerDeps;
use skiff_core::ControllerEvent;
use skiff_core::ControllerEventSender;
use skiff_core::ControllerSnapshot;
use skiff_core::GitSnapshot;
use skiff_core::HistoryRecord;
use skiff_core::MemoryHost;
use skiff_core::ModelClient;
use skiff_core::NoopCommandHost;
use skiff_core::PromptIdSource;
use skiff_core::StreamingState;
use skiff_core::ToolRuntime;
use skiff_core::TurnControllerHandle;
use skiff_core::TurnError;
use skiff_core::start_turn_controller;
use skiff_protocol::ClientMessage;
use skiff_protocol::Part;
use skiff_protocol::QueryPayload;
use skiff_protocol::Role;
use skiff_protocol::StreamEvent;
use skiff_protocol::ToolCallRequest;

pub const SESSION_ID: &str = "sess";

/// What the scripted client does for one `stream` call.
pub enum Script {
    /// Yield these events, then end the stream.
    Events(Vec<StreamEvent>),
    /// Yield these events, then hang until the turn is cancelled.
    EventsThenHang(Vec<StreamEvent>),
    /// Fail the request with a retry-exhausted provider error.
    FailProvider {
        attempts: u32,
        error_codes: Vec<String>,
        last_error: String,
    },
    /// Fail the request with an authentication error.
    FailUnauthorized,
}

/// One recorded `stream` call.
#[derive(Debug, Clone)]
pub struct Submission {
    pub payload: QueryPayload,
    pub prompt_id: String,
}

impl Submission {
    pub fn text(&self) -> &str {
        self.payload.as_text().unwrap_or_default()
    }
}

pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Script>>,
    pub submissions: Mutex<Vec<Submission>>,
    pub injected: Mutex<Vec<Vec<Part>>>,
    pub resets: AtomicUsize,
    pub fail_reset: Mutex<bool>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            submissions: Mutex::new(Vec::new()),
            injected: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            fail_reset: Mutex::new(false),
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn injected(&self) -> Vec<Vec<Part>> {
        self.injected.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(
        &self,
        payload: QueryPayload,
        prompt_id: &str,
        _cancel: CancellationToken,
    ) -> Result<skiff_core::EventStream, TurnError> {
        self.submissions.lock().unwrap().push(Submission {
            payload,
            prompt_id: prompt_id.to_string(),
        });
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Events(Vec::new()));
        match script {
            Script::Events(events) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            Script::EventsThenHang(events) => Ok(stream::iter(events.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Script::FailProvider {
                attempts,
                error_codes,
                last_error,
            } => Err(TurnError::ProviderRetryExhausted {
                attempts,
                error_codes,
                last_error,
            }),
            Script::FailUnauthorized => Err(TurnError::Unauthorized),
        }
    }

    async fn reset_chat(&self) -> anyhow::Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if *self.fail_reset.lock().unwrap() {
            anyhow::bail!("reset refused");
        }
        Ok(())
    }

    fn inject_synthetic_user_message(&self, parts: Vec<Part>) {
        self.injected.lock().unwrap().push(parts);
    }

    fn client_history(&self) -> Vec<ClientMessage> {
        self.injected
            .lock()
            .unwrap()
            .iter()
            .map(|parts| ClientMessage {
                role: Role::User,
                parts: parts.clone(),
            })
            .collect()
    }
}

/// Executes instantly; `broken` fails, everything else succeeds with an
/// echoed function response.
pub struct RecordingRuntime {
    pub executed: Mutex<Vec<ToolCallRequest>>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<ToolCallRequest> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRuntime for RecordingRuntime {
    async fn execute(
        &self,
        request: &ToolCallRequest,
        _cancel: CancellationToken,
    ) -> Result<Vec<Part>, String> {
        self.executed.lock().unwrap().push(request.clone());
        if request.name == "broken" {
            return Err("tool failed".to_string());
        }
        Ok(vec![Part::function_response(
            &request.call_id,
            &request.name,
            json!({ "ok": true }),
        )])
    }
}

pub struct AutoApprove;

#[async_trait]
impl ApprovalDecider for AutoApprove {
    async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

pub struct AutoReject;

#[async_trait]
impl ApprovalDecider for AutoReject {
    async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
        ApprovalDecision::Rejected
    }
}

pub struct CountingMemoryHost {
    pub refreshes: AtomicUsize,
}

#[async_trait]
impl MemoryHost for CountingMemoryHost {
    async fn refresh_memory(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct NullGit;

impl GitSnapshot for NullGit {
    fn snapshot_file(&self, _file_path: &std::path::Path) -> anyhow::Result<String> {
        Ok("deadbeefcafe".to_string())
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn default_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub struct HarnessOptions {
    pub config: ControllerConfig,
    pub scripts: Vec<Script>,
    pub approvals: Arc<dyn ApprovalDecider>,
    pub checkpoint_dir: Option<PathBuf>,
    pub command_host: Arc<dyn CommandHost>,
}

impl HarnessOptions {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            config: ControllerConfig::default(),
            scripts,
            approvals: Arc::new(AutoApprove),
            checkpoint_dir: None,
            command_host: Arc::new(NoopCommandHost),
        }
    }
}

pub struct Harness {
    pub handle: TurnControllerHandle,
    pub client: Arc<ScriptedClient>,
    pub runtime: Arc<RecordingRuntime>,
    pub memory: Arc<CountingMemoryHost>,
    pub auth_errors: Arc<AtomicUsize>,
    pub events: Arc<Mutex<Vec<ControllerEvent>>>,
}

pub fn start_harness(options: HarnessOptions) -> Harness {
    let client = Arc::new(ScriptedClient::new(options.scripts));
    let runtime = Arc::new(RecordingRuntime::new());
    let memory = Arc::new(CountingMemoryHost {
        refreshes: AtomicUsize::new(0),
    });
    let auth_errors = Arc::new(AtomicUsize::new(0));
    let events: Arc<Mutex<Vec<ControllerEvent>>> = Arc::new(Mutex::new(Vec::new()));

    let event_log = events.clone();
    let auth_counter = auth_errors.clone();
    let checkpoints = options.checkpoint_dir.map(|dir| {
        Arc::new(CheckpointWriter::new(dir, Arc::new(NullGit) as Arc<dyn GitSnapshot>))
    });

    let handle = start_turn_controller(
        options.config,
        ControllerDeps {
            client: client.clone(),
            tool_runtime: runtime.clone(),
            approvals: options.approvals,
            checkpoints,
            command_host: options.command_host,
            memory_host: memory.clone(),
            clock: Arc::new(FixedClock(FixedClock::default_time())),
            prompt_ids: PromptIdSource::new(SESSION_ID),
            events: ControllerEventSender::new(move |event| {
                event_log.lock().unwrap().push(event);
            }),
            on_auth_error: Arc::new(move || {
                auth_counter.fetch_add(1, Ordering::SeqCst);
            }),
        },
    );

    Harness {
        handle,
        client,
        runtime,
        memory,
        auth_errors,
        events,
    }
}

/// Polls until the controller settles back to `Idle` with the in-flight
/// guard released.
pub async fn wait_for_idle(handle: &TurnControllerHandle) -> ControllerSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(snapshot) = handle.snapshot().await {
            if !snapshot.is_submitting_query
                && snapshot.streaming_state == StreamingState::Idle
            {
                return snapshot;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "controller did not go idle in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Polls until `predicate` holds for a snapshot.
pub async fn wait_for_snapshot(
    handle: &TurnControllerHandle,
    predicate: impl Fn(&ControllerSnapshot) -> bool,
) -> ControllerSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(snapshot) = handle.snapshot().await {
            if predicate(&snapshot) {
                return snapshot;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapshot condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn info_texts(snapshot: &ControllerSnapshot) -> Vec<String> {
    snapshot
        .entries
        .iter()
        .filter_map(|entry| match &entry.record {
            HistoryRecord::Info { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn error_texts(snapshot: &ControllerSnapshot) -> Vec<String> {
    snapshot
        .entries
        .iter()
        .filter_map(|entry| match &entry.record {
            HistoryRecord::Error { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn tool_call_request(call_id: &str, name: &str, prompt_id: &str) -> ToolCallRequest {
    ToolCallRequest {
        call_id: call_id.to_string(),
        name: name.to_string(),
        arguments: serde_json::Map::new(),
        prompt_id: prompt_id.to_string(),
        client_initiated: false,
    }
}

/// The first prompt id the harness's id source hands out.
pub fn first_prompt_id() -> String {
    format!("{SESSION_ID}########1")
}
