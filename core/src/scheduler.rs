//! Tool scheduling: batch acceptance, per-call lifecycle, approval gating,
//! and the completion handshake with the turn controller.
//!
//! Calls move `validating → scheduled → executing` (with an
//! `awaiting_approval` stop for gated tools) and settle in `success`,
//! `error`, or `cancelled`. A batch completes only once every member is
//! terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use skiff_protocol::ClientMessage;
use skiff_protocol::Part;
use skiff_protocol::ToolCallRequest;
use skiff_protocol::ToolCallStatus;

use crate::checkpoint::CheckpointWriter;
use crate::clock::Clock;
use crate::config::ApprovalMode;
use crate::history::HistoryEntry;

/// Tools that mutate the workspace; gated behind approval and checkpointed.
const MUTATING_TOOLS: &[&str] = &["edit", "write_file"];

/// Executes tool calls on behalf of the scheduler.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Extra approval requirements beyond the built-in mutating set.
    fn requires_approval(&self, request: &ToolCallRequest) -> bool {
        let _ = request;
        false
    }

    /// Runs the tool. `Err` carries a user-presentable message.
    async fn execute(
        &self,
        request: &ToolCallRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<Part>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Answers approval requests for gated tools.
#[async_trait]
pub trait ApprovalDecider: Send + Sync {
    async fn decide(&self, request: &ToolCallRequest) -> ApprovalDecision;
}

/// Lifecycle notices pushed to the controller while a batch runs.
#[derive(Debug, Clone)]
pub enum SchedulerNotice {
    StatusChanged {
        call_id: String,
        status: ToolCallStatus,
    },
    ApprovalWaitStarted {
        call_id: String,
    },
    ApprovalWaitEnded {
        call_id: String,
    },
}

/// Conversation state captured at dispatch time for the checkpoint hook.
#[derive(Clone, Default)]
pub struct ScheduleContext {
    pub history: Vec<HistoryEntry>,
    pub client_history: Vec<ClientMessage>,
}

/// A request plus its tracked lifecycle state.
#[derive(Debug, Clone)]
pub struct TrackedToolCall {
    pub request: ToolCallRequest,
    pub status: ToolCallStatus,
    /// Model-addressable outcome; populated in terminal states.
    pub response: Vec<Part>,
    /// Whether the outcome has been fed back to the model.
    pub response_submitted: bool,
}

impl TrackedToolCall {
    /// Terminal but not yet forwarded: eligible to go back to the model
    /// exactly once.
    pub fn is_ripe(&self) -> bool {
        self.status.is_terminal() && !self.response_submitted
    }
}

#[derive(Default)]
struct SchedulerState {
    calls: HashMap<String, TrackedToolCall>,
    batch_cancel: Option<CancellationToken>,
}

pub struct ToolScheduler {
    runtime: Arc<dyn ToolRuntime>,
    approvals: Arc<dyn ApprovalDecider>,
    approval_mode: ApprovalMode,
    checkpoints: Option<Arc<CheckpointWriter>>,
    clock: Arc<dyn Clock>,
    notices: Arc<dyn Fn(SchedulerNotice) + Send + Sync>,
    state: Mutex<SchedulerState>,
}

impl ToolScheduler {
    pub fn new(
        runtime: Arc<dyn ToolRuntime>,
        approvals: Arc<dyn ApprovalDecider>,
        approval_mode: ApprovalMode,
        checkpoints: Option<Arc<CheckpointWriter>>,
        clock: Arc<dyn Clock>,
        notices: Arc<dyn Fn(SchedulerNotice) + Send + Sync>,
    ) -> Self {
        Self {
            runtime,
            approvals,
            approval_mode,
            checkpoints,
            clock,
            notices,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Accepts a batch and drives every member to a terminal state. Returns
    /// the batch in dispatch order once all members are terminal.
    pub async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: CancellationToken,
        context: ScheduleContext,
    ) -> Vec<TrackedToolCall> {
        let batch_cancel = cancel.child_token();
        let call_ids: Vec<String> = requests.iter().map(|r| r.call_id.clone()).collect();
        {
            let mut state = self.lock();
            state.batch_cancel = Some(batch_cancel.clone());
            for request in &requests {
                state.calls.insert(
                    request.call_id.clone(),
                    TrackedToolCall {
                        request: request.clone(),
                        status: ToolCallStatus::Validating,
                        response: Vec::new(),
                        response_submitted: false,
                    },
                );
            }
        }
        for request in &requests {
            self.notify_status(&request.call_id, ToolCallStatus::Validating);
        }

        for request in &requests {
            self.run_one(request, &batch_cancel, &context).await;
        }

        {
            let mut state = self.lock();
            state.batch_cancel = None;
        }

        let state = self.lock();
        call_ids
            .iter()
            .filter_map(|id| state.calls.get(id).cloned())
            .collect()
    }

    async fn run_one(
        &self,
        request: &ToolCallRequest,
        cancel: &CancellationToken,
        context: &ScheduleContext,
    ) {
        if self.current_status(&request.call_id).is_none_or(ToolCallStatus::is_terminal) {
            return;
        }
        if cancel.is_cancelled() {
            self.settle_cancelled(request, "Tool call cancelled before it started.");
            return;
        }

        if self.needs_approval(request) {
            self.set_status(&request.call_id, ToolCallStatus::AwaitingApproval);
            (self.notices)(SchedulerNotice::ApprovalWaitStarted {
                call_id: request.call_id.clone(),
            });
            self.write_checkpoint(request, context);

            let decision = tokio::select! {
                decision = self.approvals.decide(request) => decision,
                _ = cancel.cancelled() => ApprovalDecision::Rejected,
            };
            (self.notices)(SchedulerNotice::ApprovalWaitEnded {
                call_id: request.call_id.clone(),
            });

            // A reset may have settled the call while we waited.
            if self.current_status(&request.call_id).is_none_or(ToolCallStatus::is_terminal) {
                return;
            }
            if decision == ApprovalDecision::Rejected {
                self.settle_cancelled(request, "Tool call was not approved.");
                return;
            }
        } else {
            self.set_status(&request.call_id, ToolCallStatus::Scheduled);
        }

        self.set_status(&request.call_id, ToolCallStatus::Executing);
        let result = tokio::select! {
            result = self.runtime.execute(request, cancel.clone()) => Some(result),
            _ = cancel.cancelled() => None,
        };
        if self.current_status(&request.call_id).is_none_or(ToolCallStatus::is_terminal) {
            return;
        }
        match result {
            Some(Ok(parts)) => self.settle(&request.call_id, ToolCallStatus::Success, parts),
            Some(Err(message)) => {
                let part = Part::function_response(
                    &request.call_id,
                    &request.name,
                    json!({ "error": message }),
                );
                self.settle(&request.call_id, ToolCallStatus::Error, vec![part]);
            }
            None => self.settle_cancelled(request, "Tool call cancelled while executing."),
        }
    }

    /// Cancels every non-terminal call, flushing cancellation responses into
    /// the batch result. Safe to call while a batch is in flight.
    pub fn reset(&self, reason: &str) {
        let mut settled: Vec<String> = Vec::new();
        {
            let mut state = self.lock();
            if let Some(token) = state.batch_cancel.take() {
                token.cancel();
            }
            for (call_id, call) in state.calls.iter_mut() {
                if !call.status.is_terminal() {
                    call.status = ToolCallStatus::Cancelled;
                    call.response = vec![Part::function_response(
                        &call.request.call_id,
                        &call.request.name,
                        json!({ "cancelled": true, "reason": reason }),
                    )];
                    settled.push(call_id.clone());
                }
            }
        }
        for call_id in settled {
            debug!(call_id = %call_id, reason, "tool call cancelled by reset");
            self.notify_status(&call_id, ToolCallStatus::Cancelled);
        }
    }

    /// Marks responses as fed back to the model. Idempotent.
    pub fn mark_submitted(&self, call_ids: &[String]) {
        let mut state = self.lock();
        for call_id in call_ids {
            if let Some(call) = state.calls.get_mut(call_id) {
                call.response_submitted = true;
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Option<TrackedToolCall> {
        self.lock().calls.get(call_id).cloned()
    }

    /// Any call that is pre-terminal or terminal-but-unforwarded; keeps the
    /// controller out of `Idle` until the batch is fully consumed.
    pub fn any_unresolved(&self) -> bool {
        self.lock()
            .calls
            .values()
            .any(|call| !call.status.is_terminal() || call.is_ripe())
    }

    fn needs_approval(&self, request: &ToolCallRequest) -> bool {
        if self.approval_mode == ApprovalMode::Yolo {
            return false;
        }
        MUTATING_TOOLS.contains(&request.name.as_str()) || self.runtime.requires_approval(request)
    }

    /// Persists a restorable checkpoint before approval can proceed.
    /// Failures are logged; the tool still runs.
    fn write_checkpoint(&self, request: &ToolCallRequest, context: &ScheduleContext) {
        let Some(writer) = &self.checkpoints else {
            return;
        };
        if !MUTATING_TOOLS.contains(&request.name.as_str()) {
            return;
        }
        if let Err(error) = writer.save(
            request,
            &context.history,
            &context.client_history,
            self.clock.now(),
        ) {
            warn!(call_id = %request.call_id, "checkpoint save failed: {error:#}");
        }
    }

    fn settle_cancelled(&self, request: &ToolCallRequest, reason: &str) {
        let part = Part::function_response(
            &request.call_id,
            &request.name,
            json!({ "cancelled": true, "reason": reason }),
        );
        self.settle(&request.call_id, ToolCallStatus::Cancelled, vec![part]);
    }

    fn settle(&self, call_id: &str, status: ToolCallStatus, response: Vec<Part>) {
        {
            let mut state = self.lock();
            if let Some(call) = state.calls.get_mut(call_id) {
                if call.status.is_terminal() {
                    return;
                }
                call.status = status;
                call.response = response;
            }
        }
        self.notify_status(call_id, status);
    }

    fn set_status(&self, call_id: &str, status: ToolCallStatus) {
        {
            let mut state = self.lock();
            if let Some(call) = state.calls.get_mut(call_id) {
                if call.status.is_terminal() {
                    return;
                }
                call.status = status;
            }
        }
        self.notify_status(call_id, status);
    }

    fn current_status(&self, call_id: &str) -> Option<ToolCallStatus> {
        self.lock().calls.get(call_id).map(|call| call.status)
    }

    fn notify_status(&self, call_id: &str, status: ToolCallStatus) {
        (self.notices)(SchedulerNotice::StatusChanged {
            call_id: call_id.to_string(),
            status,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    use crate::clock::SystemClock;

    struct EchoRuntime;

    #[async_trait]
    impl ToolRuntime for EchoRuntime {
        async fn execute(
            &self,
            request: &ToolCallRequest,
            _cancel: CancellationToken,
        ) -> Result<Vec<Part>, String> {
            if request.name == "broken" {
                return Err("tool exploded".to_string());
            }
            Ok(vec![Part::function_response(
                &request.call_id,
                &request.name,
                json!({ "ok": true }),
            )])
        }
    }

    struct Approve;

    #[async_trait]
    impl ApprovalDecider for Approve {
        async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
            ApprovalDecision::Approved
        }
    }

    struct Reject;

    #[async_trait]
    impl ApprovalDecider for Reject {
        async fn decide(&self, _request: &ToolCallRequest) -> ApprovalDecision {
            ApprovalDecision::Rejected
        }
    }

    fn request(call_id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments: Map::new(),
            prompt_id: "p-1".to_string(),
            client_initiated: false,
        }
    }

    fn scheduler(
        approvals: Arc<dyn ApprovalDecider>,
        mode: ApprovalMode,
    ) -> (ToolScheduler, Arc<Mutex<Vec<SchedulerNotice>>>) {
        let notices: Arc<Mutex<Vec<SchedulerNotice>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = notices.clone();
        let scheduler = ToolScheduler::new(
            Arc::new(EchoRuntime),
            approvals,
            mode,
            None,
            Arc::new(SystemClock),
            Arc::new(move |notice| sink.lock().unwrap().push(notice)),
        );
        (scheduler, notices)
    }

    #[tokio::test]
    async fn batch_runs_to_terminal_states_in_dispatch_order() {
        let (scheduler, _) = scheduler(Arc::new(Approve), ApprovalMode::Default);
        let batch = vec![
            request("a", "read_file"),
            request("b", "broken"),
            request("c", "grep"),
        ];

        let completed = scheduler
            .schedule(batch, CancellationToken::new(), ScheduleContext::default())
            .await;

        assert_eq!(completed.len(), 3);
        assert_eq!(completed[0].request.call_id, "a");
        assert_eq!(completed[0].status, ToolCallStatus::Success);
        assert_eq!(completed[1].status, ToolCallStatus::Error);
        assert_eq!(completed[2].status, ToolCallStatus::Success);
        assert!(completed.iter().all(|call| call.is_ripe()));
    }

    #[tokio::test]
    async fn mutating_tools_pass_through_approval() {
        let (scheduler, notices) = scheduler(Arc::new(Approve), ApprovalMode::Default);
        let completed = scheduler
            .schedule(
                vec![request("a", "edit")],
                CancellationToken::new(),
                ScheduleContext::default(),
            )
            .await;

        assert_eq!(completed[0].status, ToolCallStatus::Success);
        let notices = notices.lock().unwrap();
        assert!(notices.iter().any(|n| matches!(
            n,
            SchedulerNotice::StatusChanged {
                status: ToolCallStatus::AwaitingApproval,
                ..
            }
        )));
        assert!(notices
            .iter()
            .any(|n| matches!(n, SchedulerNotice::ApprovalWaitStarted { .. })));
    }

    #[tokio::test]
    async fn yolo_mode_skips_approval() {
        let (scheduler, notices) = scheduler(Arc::new(Reject), ApprovalMode::Yolo);
        let completed = scheduler
            .schedule(
                vec![request("a", "write_file")],
                CancellationToken::new(),
                ScheduleContext::default(),
            )
            .await;

        assert_eq!(completed[0].status, ToolCallStatus::Success);
        assert!(!notices
            .lock()
            .unwrap()
            .iter()
            .any(|n| matches!(n, SchedulerNotice::ApprovalWaitStarted { .. })));
    }

    #[tokio::test]
    async fn rejected_approval_settles_as_cancelled() {
        let (scheduler, _) = scheduler(Arc::new(Reject), ApprovalMode::Default);
        let completed = scheduler
            .schedule(
                vec![request("a", "edit")],
                CancellationToken::new(),
                ScheduleContext::default(),
            )
            .await;

        assert_eq!(completed[0].status, ToolCallStatus::Cancelled);
        assert_eq!(completed[0].response.len(), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_batch_settles_everything_cancelled() {
        let (scheduler, _) = scheduler(Arc::new(Approve), ApprovalMode::Default);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let completed = scheduler
            .schedule(
                vec![request("a", "read_file"), request("b", "grep")],
                cancel,
                ScheduleContext::default(),
            )
            .await;

        assert!(completed
            .iter()
            .all(|call| call.status == ToolCallStatus::Cancelled));
    }

    #[tokio::test]
    async fn mark_submitted_is_idempotent() {
        let (scheduler, _) = scheduler(Arc::new(Approve), ApprovalMode::Default);
        scheduler
            .schedule(
                vec![request("a", "read_file")],
                CancellationToken::new(),
                ScheduleContext::default(),
            )
            .await;

        let ids = vec!["a".to_string()];
        scheduler.mark_submitted(&ids);
        assert!(!scheduler.get("a").unwrap().is_ripe());
        scheduler.mark_submitted(&ids);
        assert!(scheduler.get("a").unwrap().response_submitted);
        assert!(!scheduler.any_unresolved());
    }

    #[tokio::test]
    async fn reset_flushes_non_terminal_calls() {
        let (scheduler, _) = scheduler(Arc::new(Approve), ApprovalMode::Default);
        scheduler
            .schedule(
                vec![request("a", "read_file")],
                CancellationToken::new(),
                ScheduleContext::default(),
            )
            .await;
        // "a" is terminal; reset must not disturb it.
        scheduler.reset("test reset");
        assert_eq!(scheduler.get("a").unwrap().status, ToolCallStatus::Success);
    }
}
