//! Session management.
//!
//! A `SessionHandle` is the single owner of a session's mutable state. It is
//! driven two ways: hook/connector-sourced events go through
//! `extract_state()` -> `transition::transition()` -> `apply_state()`, which
//! keeps `phase` (the rich internal work-phase machine) as the source of
//! truth; direct Codex/Claude subprocess sessions (their own native
//! stream-json protocol, not `ConnectorEvent`) instead call the plain
//! setters below directly. Both paths converge on the same fields, so
//! `state()`/`summary()`/`SessionSnapshot` always reflect whichever path
//! touched the session most recently.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use orbitdock_protocol::{
    ApprovalRequest, ApprovalType, ClaudeIntegrationMode, CodexIntegrationMode, Message, Provider,
    ServerMessage, SessionState, SessionStatus, SessionSummary, StateChanges, TokenUsage, TurnDiff,
    WorkStatus,
};
use tokio::sync::broadcast;

use crate::transition::{self, TransitionState, WorkPhase};

/// Bounded ring buffer of recently broadcast events, keyed by the revision
/// they were sent at. Backs `replay_since` for reconnecting clients close
/// enough to the live edge to avoid a full snapshot resync.
const REPLAY_LOG_CAPACITY: usize = 200;

/// Cheap, `Clone`-free read view of a session, published via `ArcSwap` so
/// list/dashboard reads never contend with the owning actor task.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub provider: Provider,
    pub project_path: String,
    pub transcript_path: Option<String>,
    pub project_name: Option<String>,
    pub model: Option<String>,
    pub custom_name: Option<String>,
    pub summary: Option<String>,
    pub status: SessionStatus,
    pub work_status: WorkStatus,
    pub attention_reason: orbitdock_protocol::AttentionReason,
    pub has_pending_approval: bool,
    pub codex_integration_mode: Option<CodexIntegrationMode>,
    pub claude_integration_mode: Option<ClaudeIntegrationMode>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
    pub git_branch: Option<String>,
    pub git_sha: Option<String>,
    pub current_cwd: Option<String>,
    pub first_prompt: Option<String>,
    pub last_message: Option<String>,
    pub effort: Option<String>,
    pub token_usage: TokenUsage,
    pub turn_count: u64,
    pub started_at: Option<String>,
    pub last_activity_at: Option<String>,
}

/// Handle to a running session's state.
pub struct SessionHandle {
    id: String,
    provider: Provider,
    project_path: String,
    project_name: Option<String>,
    transcript_path: Option<String>,
    model: Option<String>,
    status: SessionStatus,
    phase: WorkPhase,
    messages: Vec<Message>,
    token_usage: TokenUsage,
    current_diff: Option<String>,
    current_plan: Option<String>,
    custom_name: Option<String>,
    summary: Option<String>,
    last_tool: Option<String>,
    last_message: Option<String>,
    first_prompt: Option<String>,
    effort: Option<String>,
    approval_policy: Option<String>,
    sandbox_mode: Option<String>,
    codex_integration_mode: Option<CodexIntegrationMode>,
    claude_integration_mode: Option<ClaudeIntegrationMode>,
    forked_from_session_id: Option<String>,
    current_turn_id: Option<String>,
    turn_count: u64,
    turn_diffs: Vec<orbitdock_protocol::TurnDiff>,
    git_branch: Option<String>,
    git_sha: Option<String>,
    current_cwd: Option<String>,
    /// Terminal-pairing metadata for direct Claude sessions launched from a
    /// paired terminal app. Bookkeeping only — not exposed on `SessionSnapshot`.
    terminal_session_id: Option<String>,
    terminal_app: Option<String>,
    /// Single pending approval, shared by the transition-driven phase machine
    /// (which embeds its own copy of the fingerprinting detail in `phase`)
    /// and the direct-session ad hoc `SetPendingApproval`/`TakePendingApproval`
    /// commands.
    pending_approval: Option<ApprovalRequest>,
    session_approvals: Vec<(String, String, String)>,
    started_at: Option<String>,
    last_activity_at: Option<String>,

    revision: u64,
    replay_log: VecDeque<(u64, String)>,
    subscribers: broadcast::Sender<ServerMessage>,
    list_tx: Option<broadcast::Sender<ServerMessage>>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionHandle {
    /// Create a new session handle.
    pub fn new(id: String, provider: Provider, project_path: String) -> Self {
        let now = chrono_now();
        let (subscribers, _) = broadcast::channel(256);
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot {
            id: id.clone(),
            provider,
            project_path: project_path.clone(),
            transcript_path: None,
            project_name: None,
            model: None,
            custom_name: None,
            summary: None,
            status: SessionStatus::Active,
            work_status: WorkStatus::Waiting,
            attention_reason: orbitdock_protocol::AttentionReason::None,
            has_pending_approval: false,
            codex_integration_mode: None,
            claude_integration_mode: None,
            approval_policy: None,
            sandbox_mode: None,
            git_branch: None,
            git_sha: None,
            current_cwd: None,
            first_prompt: None,
            last_message: None,
            effort: None,
            token_usage: TokenUsage::default(),
            turn_count: 0,
            started_at: Some(now.clone()),
            last_activity_at: Some(now.clone()),
        }));

        Self {
            id,
            provider,
            project_path,
            project_name: None,
            transcript_path: None,
            model: None,
            status: SessionStatus::Active,
            phase: WorkPhase::Idle,
            messages: Vec::new(),
            token_usage: TokenUsage::default(),
            current_diff: None,
            current_plan: None,
            custom_name: None,
            summary: None,
            last_tool: None,
            last_message: None,
            first_prompt: None,
            effort: None,
            approval_policy: None,
            sandbox_mode: None,
            codex_integration_mode: None,
            claude_integration_mode: None,
            forked_from_session_id: None,
            current_turn_id: None,
            turn_count: 0,
            turn_diffs: Vec::new(),
            git_branch: None,
            git_sha: None,
            current_cwd: None,
            terminal_session_id: None,
            terminal_app: None,
            pending_approval: None,
            session_approvals: Vec::new(),
            started_at: Some(now.clone()),
            last_activity_at: Some(now),
            revision: 0,
            replay_log: VecDeque::with_capacity(REPLAY_LOG_CAPACITY),
            subscribers,
            list_tx: None,
            snapshot,
        }
    }

    /// Rebuild a handle from a persisted row at startup. Approval bookkeeping
    /// isn't persisted, so a restored `Permission` work status falls back to
    /// `AwaitingReply` — any in-flight approval is gone with the process that
    /// raised it.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: String,
        provider: Provider,
        project_path: String,
        transcript_path: Option<String>,
        project_name: Option<String>,
        model: Option<String>,
        custom_name: Option<String>,
        summary: Option<String>,
        status: SessionStatus,
        work_status: WorkStatus,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
        token_usage: TokenUsage,
        started_at: Option<String>,
        last_activity_at: Option<String>,
        messages: Vec<Message>,
        current_diff: Option<String>,
        current_plan: Option<String>,
        turn_diffs: Vec<TurnDiff>,
        git_branch: Option<String>,
        git_sha: Option<String>,
        current_cwd: Option<String>,
        first_prompt: Option<String>,
        last_message: Option<String>,
        effort: Option<String>,
        terminal_session_id: Option<String>,
        terminal_app: Option<String>,
    ) -> Self {
        let mut handle = Self::new(id, provider, project_path);
        handle.transcript_path = transcript_path;
        handle.project_name = project_name;
        handle.model = model;
        handle.custom_name = custom_name;
        handle.summary = summary;
        handle.status = status;
        handle.phase = match work_status {
            WorkStatus::Working => WorkPhase::Working,
            WorkStatus::Waiting | WorkStatus::Permission => WorkPhase::AwaitingReply,
            WorkStatus::Unknown => WorkPhase::Ended {
                reason: String::new(),
            },
        };
        handle.approval_policy = approval_policy;
        handle.sandbox_mode = sandbox_mode;
        handle.token_usage = token_usage;
        handle.started_at = started_at;
        handle.last_activity_at = last_activity_at;
        handle.messages = messages;
        handle.current_diff = current_diff;
        handle.current_plan = current_plan;
        handle.turn_diffs = turn_diffs;
        handle.git_branch = git_branch;
        handle.git_sha = git_sha;
        handle.current_cwd = current_cwd;
        handle.first_prompt = first_prompt;
        handle.last_message = last_message;
        handle.effort = effort;
        handle.terminal_session_id = terminal_session_id;
        handle.terminal_app = terminal_app;
        handle
    }

    pub fn set_terminal_info(&mut self, terminal_session_id: Option<String>, terminal_app: Option<String>) {
        self.terminal_session_id = terminal_session_id;
        self.terminal_app = terminal_app;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn work_status(&self) -> WorkStatus {
        self.phase.to_work_status()
    }

    pub fn last_tool(&self) -> Option<&str> {
        self.last_tool.as_deref()
    }

    pub fn custom_name(&self) -> Option<&str> {
        self.custom_name.as_deref()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Store the global session-list broadcast sender. Set once, right after
    /// the session is registered in `SessionRegistry`.
    pub fn set_list_tx(&mut self, tx: broadcast::Sender<ServerMessage>) {
        self.list_tx = Some(tx);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            provider: self.provider,
            project_path: self.project_path.clone(),
            transcript_path: self.transcript_path.clone(),
            project_name: self.project_name.clone(),
            model: self.model.clone(),
            custom_name: self.custom_name.clone(),
            summary: self.summary.clone(),
            status: self.status,
            work_status: self.phase.to_work_status(),
            attention_reason: self.phase.to_attention_reason(),
            has_pending_approval: self.pending_approval.is_some(),
            codex_integration_mode: self.codex_integration_mode,
            claude_integration_mode: self.claude_integration_mode,
            approval_policy: self.approval_policy.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            git_branch: self.git_branch.clone(),
            git_sha: self.git_sha.clone(),
            current_cwd: self.current_cwd.clone(),
            first_prompt: self.first_prompt.clone(),
            last_message: self.last_message.clone(),
            effort: self.effort.clone(),
            token_usage: self.token_usage.clone(),
            turn_count: self.turn_count,
            started_at: self.started_at.clone(),
            last_activity_at: self.last_activity_at.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            id: self.id.clone(),
            provider: self.provider,
            project_path: self.project_path.clone(),
            project_name: self.project_name.clone(),
            model: self.model.clone(),
            custom_name: self.custom_name.clone(),
            status: self.status,
            work_status: self.phase.to_work_status(),
            attention_reason: self.phase.to_attention_reason(),
            messages: self.messages.clone(),
            pending_approval: self.pending_approval.clone(),
            token_usage: self.token_usage.clone(),
            current_diff: self.current_diff.clone(),
            current_plan: self.current_plan.clone(),
            codex_integration_mode: self.codex_integration_mode,
            claude_integration_mode: self.claude_integration_mode,
            approval_policy: self.approval_policy.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            git_branch: self.git_branch.clone(),
            git_sha: self.git_sha.clone(),
            current_turn_id: self.current_turn_id.clone(),
            turn_count: self.turn_count,
            forked_from_session_id: self.forked_from_session_id.clone(),
            started_at: self.started_at.clone(),
            last_activity_at: self.last_activity_at.clone(),
        }
    }

    fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            provider: self.provider,
            project_path: self.project_path.clone(),
            transcript_path: self.transcript_path.clone(),
            project_name: self.project_name.clone(),
            model: self.model.clone(),
            custom_name: self.custom_name.clone(),
            summary: self.summary.clone(),
            status: self.status,
            work_status: self.phase.to_work_status(),
            attention_reason: self.phase.to_attention_reason(),
            has_pending_approval: self.pending_approval.is_some(),
            codex_integration_mode: self.codex_integration_mode,
            claude_integration_mode: self.claude_integration_mode,
            approval_policy: self.approval_policy.clone(),
            sandbox_mode: self.sandbox_mode.clone(),
            git_branch: self.git_branch.clone(),
            git_sha: self.git_sha.clone(),
            current_cwd: self.current_cwd.clone(),
            first_prompt: self.first_prompt.clone(),
            last_message: self.last_message.clone(),
            effort: self.effort.clone(),
            token_usage: self.token_usage.clone(),
            turn_count: self.turn_count,
            started_at: self.started_at.clone(),
            last_activity_at: self.last_activity_at.clone(),
        }
    }

    /// Publish the current state to the lock-free `ArcSwap`. Called
    /// unconditionally after every command by the actor loop.
    pub fn refresh_snapshot(&self) {
        self.snapshot.store(Arc::new(self.to_snapshot()));
    }

    pub fn snapshot_arc(&self) -> Arc<ArcSwap<SessionSnapshot>> {
        self.snapshot.clone()
    }

    fn bump_revision(&mut self) {
        self.revision += 1;
        self.last_activity_at = Some(chrono_now());
    }

    // -- Bridge to the pure transition core --------------------------------

    /// Snapshot current state into a `TransitionState` for feeding through
    /// `transition::transition()`.
    pub fn extract_state(&self) -> TransitionState {
        TransitionState {
            id: self.id.clone(),
            revision: self.revision,
            phase: self.phase.clone(),
            messages: self.messages.clone(),
            token_usage: self.token_usage.clone(),
            current_diff: self.current_diff.clone(),
            current_plan: self.current_plan.clone(),
            custom_name: self.custom_name.clone(),
            project_path: self.project_path.clone(),
            last_activity_at: self.last_activity_at.clone(),
            current_turn_id: self.current_turn_id.clone(),
            turn_count: self.turn_count,
            turn_diffs: self.turn_diffs.clone(),
            git_branch: self.git_branch.clone(),
            git_sha: self.git_sha.clone(),
            current_cwd: self.current_cwd.clone(),
            pending_approval: self.pending_approval.clone(),
            session_approvals: self.session_approvals.clone(),
        }
    }

    /// Fold a `transition::transition()` result back onto the handle.
    pub fn apply_state(&mut self, new_state: TransitionState) {
        self.phase = new_state.phase;
        self.messages = new_state.messages;
        self.token_usage = new_state.token_usage;
        self.current_diff = new_state.current_diff;
        self.current_plan = new_state.current_plan;
        self.custom_name = new_state.custom_name;
        self.project_path = new_state.project_path;
        self.last_activity_at = new_state.last_activity_at;
        self.current_turn_id = new_state.current_turn_id;
        self.turn_count = new_state.turn_count;
        self.turn_diffs = new_state.turn_diffs;
        self.git_branch = new_state.git_branch;
        self.git_sha = new_state.git_sha;
        self.current_cwd = new_state.current_cwd;
        self.pending_approval = new_state.pending_approval;
        self.session_approvals = new_state.session_approvals;
        self.bump_revision();
    }

    // -- Direct setters (used by Codex/Claude direct session loops) --------

    pub fn set_custom_name(&mut self, name: Option<String>) {
        self.custom_name = name;
        self.bump_revision();
    }

    pub fn set_summary(&mut self, summary: Option<String>) {
        self.summary = summary;
        self.bump_revision();
    }

    /// Direct-path equivalent of flipping `phase`. Transition-driven sessions
    /// never call this — they go through `apply_state` instead. Permission
    /// reuses whatever `pending_approval` is already set so approval detail
    /// isn't lost when a direct session flags itself as waiting on one.
    pub fn set_work_status(&mut self, status: WorkStatus) {
        self.phase = match status {
            WorkStatus::Working => WorkPhase::Working,
            WorkStatus::Waiting => WorkPhase::AwaitingReply,
            WorkStatus::Permission => match &self.pending_approval {
                Some(req) => WorkPhase::AwaitingApproval {
                    request_id: req.id.clone(),
                    approval_type: req.approval_type,
                    tool_name: None,
                    fingerprint: req
                        .command
                        .as_deref()
                        .map(crate::approval_fingerprint::fingerprint),
                    proposed_amendment: req.proposed_amendment.clone(),
                },
                None => WorkPhase::AwaitingApproval {
                    request_id: String::new(),
                    approval_type: ApprovalType::Exec,
                    tool_name: None,
                    fingerprint: None,
                    proposed_amendment: None,
                },
            },
            WorkStatus::Unknown => WorkPhase::Ended {
                reason: String::new(),
            },
        };
        self.bump_revision();
    }

    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
        self.bump_revision();
    }

    pub fn set_config(&mut self, approval_policy: Option<String>, sandbox_mode: Option<String>) {
        self.approval_policy = approval_policy;
        self.sandbox_mode = sandbox_mode;
        self.bump_revision();
    }

    pub fn set_transcript_path(&mut self, path: Option<String>) {
        self.transcript_path = path;
        self.bump_revision();
    }

    pub fn set_project_name(&mut self, name: Option<String>) {
        self.project_name = name;
        self.bump_revision();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.bump_revision();
    }

    pub fn set_started_at(&mut self, ts: Option<String>) {
        self.started_at = ts;
        self.bump_revision();
    }

    pub fn set_last_activity_at(&mut self, ts: Option<String>) {
        self.last_activity_at = ts;
    }

    pub fn set_codex_integration_mode(&mut self, mode: Option<CodexIntegrationMode>) {
        self.codex_integration_mode = mode;
        self.bump_revision();
    }

    pub fn set_claude_integration_mode(&mut self, mode: Option<ClaudeIntegrationMode>) {
        self.claude_integration_mode = mode;
        self.bump_revision();
    }

    pub fn set_forked_from(&mut self, source_id: String) {
        self.forked_from_session_id = Some(source_id);
        self.bump_revision();
    }

    pub fn set_last_tool(&mut self, tool: Option<String>) {
        self.last_tool = tool;
        self.bump_revision();
    }

    pub fn set_last_message(&mut self, message: Option<String>) {
        self.last_message = message;
    }

    pub fn set_first_prompt(&mut self, prompt: Option<String>) {
        if self.first_prompt.is_none() {
            self.first_prompt = prompt;
        }
    }

    pub fn set_effort(&mut self, effort: Option<String>) {
        self.effort = effort;
        self.bump_revision();
    }

    // -- Messages ------------------------------------------------------

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.bump_revision();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.bump_revision();
    }

    // -- Approval (direct-session ad hoc bookkeeping) -------------------

    /// Peek the pending approval's type without clearing it. Paired with
    /// `take_pending_amendment`, which performs the actual clear — callers
    /// invoke both for the same `request_id` in a single step.
    pub fn take_pending_approval(&mut self, request_id: &str) -> Option<ApprovalType> {
        self.pending_approval
            .as_ref()
            .filter(|req| req.id == request_id)
            .map(|req| req.approval_type)
    }

    pub fn take_pending_amendment(&mut self, request_id: &str) -> Option<Vec<String>> {
        if self.pending_approval.as_ref().map(|r| r.id.as_str()) != Some(request_id) {
            return None;
        }
        let req = self.pending_approval.take()?;
        self.bump_revision();
        req.proposed_amendment
    }

    pub fn set_pending_approval(
        &mut self,
        request_id: String,
        approval_type: ApprovalType,
        proposed_amendment: Option<Vec<String>>,
    ) {
        self.pending_approval = Some(ApprovalRequest {
            id: request_id,
            session_id: self.id.clone(),
            approval_type,
            command: None,
            file_path: None,
            diff: None,
            question: None,
            proposed_amendment,
        });
        self.bump_revision();
    }

    // -- Delta application -----------------------------------------------

    pub fn apply_changes(&mut self, changes: &StateChanges) {
        if let Some(status) = changes.status {
            self.status = status;
        }
        if let Some(work_status) = changes.work_status {
            self.set_work_status(work_status);
        }
        if let Some(pending) = &changes.pending_approval {
            self.pending_approval = pending.clone();
        }
        if let Some(usage) = &changes.token_usage {
            self.token_usage = usage.clone();
        }
        if let Some(diff) = &changes.current_diff {
            self.current_diff = diff.clone();
        }
        if let Some(plan) = &changes.current_plan {
            self.current_plan = plan.clone();
        }
        if let Some(name) = &changes.custom_name {
            self.custom_name = name.clone();
        }
        if let Some(mode) = &changes.codex_integration_mode {
            self.codex_integration_mode = *mode;
        }
        if let Some(policy) = &changes.approval_policy {
            self.approval_policy = policy.clone();
        }
        if let Some(sandbox) = &changes.sandbox_mode {
            self.sandbox_mode = sandbox.clone();
        }
        if let Some(model) = &changes.model {
            self.model = model.clone();
        }
        if let Some(cwd) = &changes.current_cwd {
            self.current_cwd = cwd.clone();
        }
        if let Some(branch) = &changes.git_branch {
            self.git_branch = branch.clone();
        }
        if let Some(sha) = &changes.git_sha {
            self.git_sha = sha.clone();
        }
        if let Some(turn_id) = &changes.current_turn_id {
            self.current_turn_id = turn_id.clone();
        }
        if let Some(count) = changes.turn_count {
            self.turn_count = count;
        }
        if let Some(ts) = &changes.last_activity_at {
            self.last_activity_at = Some(ts.clone());
        }
        self.bump_revision();
    }

    // -- Subscriptions / broadcast -----------------------------------------

    pub fn subscribe(&mut self) -> broadcast::Receiver<ServerMessage> {
        self.subscribers.subscribe()
    }

    /// Return replayable events since `since_revision`, or `None` if the
    /// requested revision has already scrolled out of the replay buffer
    /// (caller should fall back to a full snapshot).
    pub fn replay_since(&self, since_revision: u64) -> Option<Vec<String>> {
        let oldest = self.replay_log.front()?.0;
        if since_revision + 1 < oldest {
            return None;
        }
        Some(
            self.replay_log
                .iter()
                .filter(|(rev, _)| *rev > since_revision)
                .map(|(_, json)| json.clone())
                .collect(),
        )
    }

    /// Broadcast a message to per-session subscribers, the global session
    /// list, and the replay log.
    pub fn broadcast(&mut self, msg: ServerMessage) {
        self.bump_revision();

        if let Ok(json) = serde_json::to_string(&msg) {
            if self.replay_log.len() >= REPLAY_LOG_CAPACITY {
                self.replay_log.pop_front();
            }
            self.replay_log.push_back((self.revision, json));
        }

        let _ = self.subscribers.send(msg.clone());
        if let Some(list_tx) = &self.list_tx {
            let _ = list_tx.send(msg);
        }
    }
}

/// Get current time as an ISO 8601-ish string (seconds-granularity epoch).
fn chrono_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}Z", duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> SessionHandle {
        SessionHandle::new(
            "test-session".to_string(),
            Provider::Codex,
            "/tmp/test".to_string(),
        )
    }

    #[test]
    fn new_session_starts_waiting() {
        let handle = test_handle();
        assert_eq!(handle.work_status(), WorkStatus::Waiting);
        assert_eq!(handle.message_count(), 0);
    }

    #[test]
    fn set_work_status_flips_phase() {
        let mut handle = test_handle();
        handle.set_work_status(WorkStatus::Working);
        assert_eq!(handle.work_status(), WorkStatus::Working);
    }

    #[test]
    fn extract_then_apply_round_trips_through_transition() {
        let mut handle = test_handle();
        let state = handle.extract_state();
        let (new_state, _effects) =
            transition::transition(state, transition::Input::TurnStarted, "2024-01-01T00:00:00Z");
        handle.apply_state(new_state);
        assert_eq!(handle.work_status(), WorkStatus::Working);
    }

    #[test]
    fn pending_approval_take_then_take_amendment_clears_it() {
        let mut handle = test_handle();
        handle.set_pending_approval(
            "req-1".to_string(),
            ApprovalType::Exec,
            Some(vec!["echo hi".to_string()]),
        );

        let atype = handle.take_pending_approval("req-1");
        assert_eq!(atype, Some(ApprovalType::Exec));

        let amendment = handle.take_pending_amendment("req-1");
        assert_eq!(amendment, Some(vec!["echo hi".to_string()]));

        assert!(handle.take_pending_approval("req-1").is_none());
    }

    #[test]
    fn replay_since_returns_none_when_out_of_window() {
        let handle = test_handle();
        assert!(handle.replay_since(0).is_none());
    }

    #[test]
    fn broadcast_increments_revision_and_fills_replay_log() {
        let mut handle = test_handle();
        handle.broadcast(ServerMessage::SessionEnded {
            session_id: handle.id().to_string(),
            reason: "test".to_string(),
        });
        let events = handle.replay_since(0).expect("replay buffer populated");
        assert_eq!(events.len(), 1);
    }
}
