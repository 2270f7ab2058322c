//! Pure state transition function
//!
//! All business logic for session state changes lives here as a pure,
//! synchronous function: `transition(state, input) -> (state, effects)`.
//! No IO, no async, no locking — fully unit-testable.

use orbitdock_connectors::{ApprovalType as ConnectorApprovalType, ConnectorEvent};
use orbitdock_protocol::{
    ApprovalDecision, ApprovalRequest, ApprovalType, AttentionReason, Message, MessageChanges,
    MessageType, ServerMessage, SessionStatus, StateChanges, TokenUsage, TurnDiff, WorkStatus,
};

use crate::approval_fingerprint::fingerprint;

// ---------------------------------------------------------------------------
// WorkPhase — internal state machine (maps to WorkStatus/AttentionReason)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkPhase {
    Idle,
    Working,
    AwaitingReply,
    AwaitingApproval {
        request_id: String,
        approval_type: ApprovalType,
        tool_name: Option<String>,
        fingerprint: Option<String>,
        proposed_amendment: Option<Vec<String>>,
    },
    Ended {
        reason: String,
    },
}

impl WorkPhase {
    pub fn to_work_status(&self) -> WorkStatus {
        match self {
            WorkPhase::Idle | WorkPhase::AwaitingReply => WorkStatus::Waiting,
            WorkPhase::Working => WorkStatus::Working,
            WorkPhase::AwaitingApproval { .. } => WorkStatus::Permission,
            WorkPhase::Ended { .. } => WorkStatus::Unknown,
        }
    }

    pub fn to_attention_reason(&self) -> AttentionReason {
        match self {
            WorkPhase::Idle | WorkPhase::Working | WorkPhase::Ended { .. } => AttentionReason::None,
            WorkPhase::AwaitingReply => AttentionReason::AwaitingReply,
            WorkPhase::AwaitingApproval { approval_type, .. } => match approval_type {
                ApprovalType::Question => AttentionReason::AwaitingQuestion,
                _ => AttentionReason::AwaitingPermission,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionState — pure data snapshot of a session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct TransitionState {
    pub id: String,
    pub revision: u64,
    pub phase: WorkPhase,
    pub messages: Vec<Message>,
    pub token_usage: TokenUsage,
    pub current_diff: Option<String>,
    pub current_plan: Option<String>,
    pub custom_name: Option<String>,
    pub project_path: String,
    pub last_activity_at: Option<String>,
    pub current_turn_id: Option<String>,
    pub turn_count: u64,
    pub turn_diffs: Vec<TurnDiff>,
    pub git_branch: Option<String>,
    pub git_sha: Option<String>,
    pub current_cwd: Option<String>,
    pub pending_approval: Option<ApprovalRequest>,
    /// Session-scoped grants from `approved_for_session` decisions, keyed by
    /// `(tool, fingerprint, cwd)`. Invariant 7: grants only ever apply to an
    /// identical tuple.
    pub session_approvals: Vec<(String, String, String)>,
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Input {
    // -- Connector events (embedded-runtime provider) ----------------------
    TurnStarted,
    TurnCompleted,
    TurnAborted {
        reason: String,
    },
    MessageCreated(Message),
    MessageUpdated {
        message_id: String,
        content: Option<String>,
        tool_output: Option<String>,
        is_error: Option<bool>,
        duration_ms: Option<u64>,
    },
    ApprovalRequested {
        request_id: String,
        approval_type: ApprovalType,
        tool_name: Option<String>,
        command: Option<String>,
        file_path: Option<String>,
        diff: Option<String>,
        question: Option<String>,
        proposed_amendment: Option<Vec<String>>,
    },
    TokensUpdated(TokenUsage),
    DiffUpdated(String),
    PlanUpdated(String),
    ThreadNameUpdated(String),
    SessionEnded {
        reason: String,
    },
    ClaudeInitialized {
        slash_commands: Vec<String>,
        skills: Vec<String>,
        tools: Vec<String>,
    },
    ModelUpdated(String),
    ContextCompacted,
    UndoStarted {
        message: Option<String>,
    },
    UndoCompleted {
        success: bool,
        message: Option<String>,
    },
    ThreadRolledBack {
        num_turns: u32,
    },
    EnvironmentChanged {
        cwd: Option<String>,
        git_branch: Option<String>,
        git_sha: Option<String>,
    },
    Error(String),

    // -- Client commands (WS/HTTP control plane) ----------------------------
    /// `ClientCommand::Approve` — resolves the pending approval, if any.
    /// Carries the raw `(tool, argv, cwd)` so a stale/mismatched request can
    /// be rejected without ever mutating state.
    ApproveDecision {
        request_id: String,
        decision: ApprovalDecision,
        reason: Option<String>,
        interrupt: bool,
    },
}

impl From<ConnectorEvent> for Input {
    fn from(event: ConnectorEvent) -> Self {
        match event {
            ConnectorEvent::TurnStarted => Input::TurnStarted,
            ConnectorEvent::TurnCompleted => Input::TurnCompleted,
            ConnectorEvent::TurnAborted { reason } => Input::TurnAborted { reason },
            ConnectorEvent::MessageCreated(msg) => Input::MessageCreated(msg),
            ConnectorEvent::MessageUpdated {
                message_id,
                content,
                tool_output,
                is_error,
                duration_ms,
            } => Input::MessageUpdated {
                message_id,
                content,
                tool_output,
                is_error,
                duration_ms,
            },
            ConnectorEvent::ApprovalRequested {
                request_id,
                approval_type,
                tool_name,
                command,
                file_path,
                diff,
                question,
                proposed_amendment,
            } => Input::ApprovalRequested {
                request_id,
                approval_type: match approval_type {
                    ConnectorApprovalType::Exec => ApprovalType::Exec,
                    ConnectorApprovalType::Patch => ApprovalType::Patch,
                    ConnectorApprovalType::Question => ApprovalType::Question,
                },
                tool_name,
                command,
                file_path,
                diff,
                question,
                proposed_amendment,
            },
            ConnectorEvent::TokensUpdated(usage) => Input::TokensUpdated(usage),
            ConnectorEvent::DiffUpdated(diff) => Input::DiffUpdated(diff),
            ConnectorEvent::PlanUpdated(plan) => Input::PlanUpdated(plan),
            ConnectorEvent::ThreadNameUpdated(name) => Input::ThreadNameUpdated(name),
            ConnectorEvent::SessionEnded { reason } => Input::SessionEnded { reason },
            ConnectorEvent::ClaudeInitialized {
                slash_commands,
                skills,
                tools,
            } => Input::ClaudeInitialized {
                slash_commands,
                skills,
                tools,
            },
            ConnectorEvent::ModelUpdated(model) => Input::ModelUpdated(model),
            ConnectorEvent::ContextCompacted => Input::ContextCompacted,
            ConnectorEvent::UndoStarted { message } => Input::UndoStarted { message },
            ConnectorEvent::UndoCompleted { success, message } => {
                Input::UndoCompleted { success, message }
            }
            ConnectorEvent::ThreadRolledBack { num_turns } => Input::ThreadRolledBack { num_turns },
            ConnectorEvent::EnvironmentChanged {
                cwd,
                git_branch,
                git_sha,
            } => Input::EnvironmentChanged {
                cwd,
                git_branch,
                git_sha,
            },
            ConnectorEvent::Error(msg) => Input::Error(msg),
            // Handled in event loop before reaching transitions
            ConnectorEvent::HookSessionId(_) => unreachable!(),
        }
    }
}

// ---------------------------------------------------------------------------
// Effects — describe IO to be executed by the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Effect {
    Persist(Box<PersistOp>),
    Emit(Box<ServerMessage>),
    ConnectorCommand(ConnectorCommand),
    /// A command was rejected without touching state — e.g. a stale or
    /// unknown approval id. No Persist, no state mutation.
    RejectWithError { code: String, message: String },
}

/// Commands the transition function hands back to the connector task.
#[derive(Debug, Clone)]
pub enum ConnectorCommand {
    SubmitApproval {
        request_id: String,
        decision: ApprovalDecision,
        proposed_amendment: Option<Vec<String>>,
    },
    Interrupt,
}

#[derive(Debug, Clone)]
pub enum PersistOp {
    SessionUpdate {
        id: String,
        status: Option<SessionStatus>,
        work_status: Option<WorkStatus>,
        last_activity_at: Option<String>,
    },
    SessionEnd {
        id: String,
        reason: String,
    },
    MessageAppend {
        session_id: String,
        message: Message,
    },
    MessageUpdate {
        session_id: String,
        message_id: String,
        content: Option<String>,
        tool_output: Option<String>,
        duration_ms: Option<u64>,
        is_error: Option<bool>,
    },
    TokensUpdate {
        session_id: String,
        usage: TokenUsage,
    },
    TurnStateUpdate {
        session_id: String,
        diff: Option<String>,
        plan: Option<String>,
    },
    TurnDiffInsert {
        session_id: String,
        turn_id: String,
        diff: String,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        context_window: u64,
    },
    SetCustomName {
        session_id: String,
        custom_name: Option<String>,
    },
    ApprovalRequested {
        session_id: String,
        request_id: String,
        approval_type: ApprovalType,
        tool_name: Option<String>,
        command: Option<String>,
        file_path: Option<String>,
        cwd: Option<String>,
        proposed_amendment: Option<Vec<String>>,
    },
    ApprovalDecision {
        session_id: String,
        request_id: String,
        decision: ApprovalDecision,
        reason: Option<String>,
        interrupt: bool,
    },
    EnvironmentUpdate {
        session_id: String,
        cwd: Option<String>,
        git_branch: Option<String>,
        git_sha: Option<String>,
    },
    ToolCountIncrement {
        session_id: String,
    },
    ModelUpdate {
        session_id: String,
        model: String,
    },
}

impl PersistOp {
    /// Convert to the existing PersistCommand used by the persistence layer
    pub fn into_persist_command(self) -> crate::persistence::PersistCommand {
        use crate::persistence::PersistCommand;
        match self {
            PersistOp::SessionUpdate {
                id,
                status,
                work_status,
                last_activity_at,
            } => PersistCommand::SessionUpdate {
                id,
                status,
                work_status,
                last_activity_at,
            },
            PersistOp::SessionEnd { id, reason } => PersistCommand::SessionEnd { id, reason },
            PersistOp::MessageAppend {
                session_id,
                message,
            } => PersistCommand::MessageAppend {
                session_id,
                message,
            },
            PersistOp::MessageUpdate {
                session_id,
                message_id,
                content,
                tool_output,
                duration_ms,
                is_error,
            } => PersistCommand::MessageUpdate {
                session_id,
                message_id,
                content,
                tool_output,
                duration_ms,
                is_error,
            },
            PersistOp::TokensUpdate { session_id, usage } => {
                PersistCommand::TokensUpdate { session_id, usage }
            }
            PersistOp::TurnStateUpdate {
                session_id,
                diff,
                plan,
            } => PersistCommand::TurnStateUpdate {
                session_id,
                diff,
                plan,
            },
            PersistOp::TurnDiffInsert {
                session_id,
                turn_id,
                diff,
                input_tokens,
                output_tokens,
                cached_tokens,
                context_window,
            } => PersistCommand::TurnDiffInsert {
                session_id,
                turn_id,
                diff,
                input_tokens,
                output_tokens,
                cached_tokens,
                context_window,
            },
            PersistOp::SetCustomName {
                session_id,
                custom_name,
            } => PersistCommand::SetCustomName {
                session_id,
                custom_name,
            },
            PersistOp::ApprovalRequested {
                session_id,
                request_id,
                approval_type,
                tool_name,
                command,
                file_path,
                cwd,
                proposed_amendment,
            } => PersistCommand::ApprovalRequested {
                session_id,
                request_id,
                approval_type,
                tool_name,
                command,
                file_path,
                cwd,
                proposed_amendment,
            },
            PersistOp::ApprovalDecision {
                session_id,
                request_id,
                decision,
                reason,
                interrupt,
            } => PersistCommand::ApprovalDecision {
                session_id,
                request_id,
                decision,
                reason,
                interrupt,
            },
            PersistOp::EnvironmentUpdate {
                session_id,
                cwd,
                git_branch,
                git_sha,
            } => PersistCommand::EnvironmentUpdate {
                session_id,
                cwd,
                git_branch,
                git_sha,
            },
            PersistOp::ToolCountIncrement { session_id } => {
                PersistCommand::ToolCountIncrement { session_id }
            }
            PersistOp::ModelUpdate { session_id, model } => {
                PersistCommand::ModelUpdate { session_id, model }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// transition() — the pure core
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input event, returns the new state
/// and a list of effects (persistence writes, broadcasts) to execute.
pub fn transition(
    mut state: TransitionState,
    input: Input,
    now: &str,
) -> (TransitionState, Vec<Effect>) {
    let sid = state.id.clone();
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        // -- Status transitions -----------------------------------------------
        Input::TurnStarted => {
            state.phase = WorkPhase::Working;
            state.last_activity_at = Some(now.to_string());
            state.turn_count += 1;
            let turn_id = format!("turn-{}", state.turn_count);
            state.current_turn_id = Some(turn_id.clone());

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Working),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    work_status: Some(WorkStatus::Working),
                    attention_reason: Some(AttentionReason::None),
                    last_activity_at: Some(now.to_string()),
                    current_turn_id: Some(Some(turn_id)),
                    turn_count: Some(state.turn_count),
                    ..Default::default()
                },
            })));
        }

        Input::TurnCompleted => {
            // Snapshot the current diff for this turn before clearing
            if let (Some(turn_id), Some(diff)) =
                (state.current_turn_id.as_ref(), state.current_diff.as_ref())
            {
                let usage = &state.token_usage;
                let snapshot = TurnDiff {
                    turn_id: turn_id.clone(),
                    diff: diff.clone(),
                    token_usage: Some(usage.clone()),
                };
                state.turn_diffs.push(snapshot);
                effects.push(Effect::Persist(Box::new(PersistOp::TurnDiffInsert {
                    session_id: sid.clone(),
                    turn_id: turn_id.clone(),
                    diff: diff.clone(),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cached_tokens: usage.cached_tokens,
                    context_window: usage.context_window,
                })));
                effects.push(Effect::Emit(Box::new(ServerMessage::TurnDiffSnapshot {
                    session_id: sid.clone(),
                    diff: TurnDiff {
                        turn_id: turn_id.clone(),
                        diff: diff.clone(),
                        token_usage: Some(usage.clone()),
                    },
                })));
            }

            // Only transition if we're actually working
            if matches!(state.phase, WorkPhase::Working) {
                state.phase = WorkPhase::AwaitingReply;
            }
            state.last_activity_at = Some(now.to_string());
            state.current_turn_id = None;

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Waiting),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    work_status: Some(WorkStatus::Waiting),
                    attention_reason: Some(AttentionReason::AwaitingReply),
                    last_activity_at: Some(now.to_string()),
                    current_turn_id: Some(None),
                    ..Default::default()
                },
            })));
        }

        Input::TurnAborted { .. } => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());
            state.current_turn_id = None;

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Waiting),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    work_status: Some(WorkStatus::Waiting),
                    attention_reason: Some(AttentionReason::None),
                    last_activity_at: Some(now.to_string()),
                    current_turn_id: Some(None),
                    ..Default::default()
                },
            })));
        }

        Input::Error(_) => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Waiting),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    work_status: Some(WorkStatus::Waiting),
                    attention_reason: Some(AttentionReason::None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            })));
        }

        // -- Messages ---------------------------------------------------------
        Input::MessageCreated(mut message) => {
            message.session_id = sid.clone();

            // Extract data-URI images to disk before storing/broadcasting
            if !message.images.is_empty() {
                message.images =
                    crate::images::extract_images_to_disk(&message.images, &sid, &message.id);
            }

            // Dedup: skip echoed user messages from the connector
            let is_dup =
                message.message_type == MessageType::User
                    && state.messages.iter().rev().take(5).any(|m| {
                        m.message_type == MessageType::User && m.content == message.content
                    });

            if !is_dup {
                message.sequence = state.messages.len() as u64 + 1;
                state.messages.push(message.clone());
                state.last_activity_at = Some(now.to_string());

                effects.push(Effect::Persist(Box::new(PersistOp::MessageAppend {
                    session_id: sid.clone(),
                    message: message.clone(),
                })));

                // Increment tool_count for tool messages
                if message.message_type == MessageType::Tool {
                    effects.push(Effect::Persist(Box::new(PersistOp::ToolCountIncrement {
                        session_id: sid.clone(),
                    })));
                }

                effects.push(Effect::Emit(Box::new(ServerMessage::MessageAppended {
                    session_id: sid,
                    message,
                })));
            }
        }

        Input::MessageUpdated {
            message_id,
            content,
            tool_output,
            is_error,
            duration_ms,
        } => {
            effects.push(Effect::Persist(Box::new(PersistOp::MessageUpdate {
                session_id: sid.clone(),
                message_id: message_id.clone(),
                content: content.clone(),
                tool_output: tool_output.clone(),
                duration_ms,
                is_error,
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::MessageUpdated {
                session_id: sid,
                message_id,
                changes: MessageChanges {
                    content,
                    tool_output,
                    is_error,
                    duration_ms,
                    ..Default::default()
                },
            })));
        }

        // -- Approval -----------------------------------------------------------
        Input::ApprovalRequested {
            request_id,
            approval_type,
            tool_name,
            command,
            file_path,
            diff,
            question,
            proposed_amendment,
        } => {
            // Invariant 3: at most one pending approval per session. A
            // concurrent ApprovalRequested while one is already pending is a
            // connector protocol violation — force-resolve the stale one as
            // an abort before accepting the new one.
            if let WorkPhase::AwaitingApproval {
                request_id: stale_id,
                ..
            } = &state.phase
            {
                effects.push(Effect::Persist(Box::new(PersistOp::ApprovalDecision {
                    session_id: sid.clone(),
                    request_id: stale_id.clone(),
                    decision: ApprovalDecision::Abort,
                    reason: Some("superseded by a concurrent approval request".to_string()),
                    interrupt: false,
                })));
            }

            let fp = command
                .as_deref()
                .map(|cmd| fingerprint(cmd));

            state.phase = WorkPhase::AwaitingApproval {
                request_id: request_id.clone(),
                approval_type,
                tool_name: tool_name.clone(),
                fingerprint: fp,
                proposed_amendment: proposed_amendment.clone(),
            };
            state.last_activity_at = Some(now.to_string());

            let request = ApprovalRequest {
                id: request_id.clone(),
                session_id: sid.clone(),
                approval_type,
                command: command.clone(),
                file_path: file_path.clone(),
                diff,
                question,
                proposed_amendment: proposed_amendment.clone(),
            };

            state.pending_approval = Some(request.clone());

            effects.push(Effect::Persist(Box::new(PersistOp::ApprovalRequested {
                session_id: sid.clone(),
                request_id,
                approval_type,
                tool_name,
                command,
                file_path,
                cwd: Some(state.project_path.clone()),
                proposed_amendment,
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    work_status: Some(WorkStatus::Permission),
                    attention_reason: Some(state.phase.to_attention_reason()),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::ApprovalRequested {
                session_id: sid,
                request,
            })));
        }

        Input::ApproveDecision {
            request_id,
            decision,
            reason,
            interrupt,
        } => {
            let pending = match &state.phase {
                WorkPhase::AwaitingApproval {
                    request_id: pending_id,
                    ..
                } if *pending_id == request_id => true,
                _ => false,
            };

            if !pending {
                // Key rule: stale or mismatched approval id is rejected
                // outright. No state mutation, no Persist effect.
                effects.push(Effect::RejectWithError {
                    code: "STALE_APPROVAL".to_string(),
                    message: format!(
                        "approval request {request_id} is not the pending approval for this session"
                    ),
                });
            } else {
                if let WorkPhase::AwaitingApproval {
                    tool_name,
                    fingerprint: fp,
                    ..
                } = &state.phase
                {
                    if matches!(decision, ApprovalDecision::ApprovedForSession) {
                        if let (Some(tool), Some(fp)) = (tool_name.clone(), fp.clone()) {
                            state
                                .session_approvals
                                .push((tool, fp, state.project_path.clone()));
                        }
                    }
                }

                effects.push(Effect::ConnectorCommand(ConnectorCommand::SubmitApproval {
                    request_id: request_id.clone(),
                    decision,
                    proposed_amendment: match &state.phase {
                        WorkPhase::AwaitingApproval {
                            proposed_amendment, ..
                        } => proposed_amendment.clone(),
                        _ => None,
                    },
                }));
                effects.push(Effect::Persist(Box::new(PersistOp::ApprovalDecision {
                    session_id: sid.clone(),
                    request_id: request_id.clone(),
                    decision,
                    reason: reason.clone(),
                    interrupt,
                })));

                let deny_keeps_working = matches!(decision, ApprovalDecision::Denied) && !interrupt;
                state.phase = if deny_keeps_working {
                    WorkPhase::Working
                } else {
                    WorkPhase::Working
                };
                state.pending_approval = None;
                state.last_activity_at = Some(now.to_string());

                if interrupt {
                    effects.push(Effect::ConnectorCommand(ConnectorCommand::Interrupt));
                }

                effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                    session_id: sid,
                    changes: StateChanges {
                        work_status: Some(WorkStatus::Working),
                        attention_reason: Some(AttentionReason::None),
                        pending_approval: Some(None),
                        last_activity_at: Some(now.to_string()),
                        ..Default::default()
                    },
                })));
            }
        }

        // -- Metadata ---------------------------------------------------------
        Input::TokensUpdated(usage) => {
            state.token_usage = usage.clone();

            effects.push(Effect::Persist(Box::new(PersistOp::TokensUpdate {
                session_id: sid.clone(),
                usage: usage.clone(),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::TokensUpdated {
                session_id: sid,
                usage,
            })));
        }

        Input::DiffUpdated(diff) => {
            state.current_diff = Some(diff.clone());

            effects.push(Effect::Persist(Box::new(PersistOp::TurnStateUpdate {
                session_id: sid.clone(),
                diff: Some(diff.clone()),
                plan: None,
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    current_diff: Some(Some(diff)),
                    ..Default::default()
                },
            })));
        }

        Input::PlanUpdated(plan) => {
            state.current_plan = Some(plan.clone());

            effects.push(Effect::Persist(Box::new(PersistOp::TurnStateUpdate {
                session_id: sid.clone(),
                diff: None,
                plan: Some(plan.clone()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    current_plan: Some(Some(plan)),
                    ..Default::default()
                },
            })));
        }

        Input::ThreadNameUpdated(name) => {
            state.custom_name = Some(name.clone());
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Persist(Box::new(PersistOp::SetCustomName {
                session_id: sid.clone(),
                custom_name: Some(name.clone()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    custom_name: Some(Some(name)),
                    ..Default::default()
                },
            })));
        }

        // -- Lifecycle --------------------------------------------------------
        Input::SessionEnded { reason } => {
            // Invariant 3 / session_end rule: clear any pending approval,
            // recording it as an abort in history.
            if let WorkPhase::AwaitingApproval {
                request_id: pending_id,
                ..
            } = &state.phase
            {
                effects.push(Effect::Persist(Box::new(PersistOp::ApprovalDecision {
                    session_id: sid.clone(),
                    request_id: pending_id.clone(),
                    decision: ApprovalDecision::Abort,
                    reason: Some("session ended with a pending approval".to_string()),
                    interrupt: false,
                })));
            }

            state.phase = WorkPhase::Ended {
                reason: reason.clone(),
            };
            state.pending_approval = None;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Persist(Box::new(PersistOp::SessionEnd {
                id: sid.clone(),
                reason: reason.clone(),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionEnded {
                session_id: sid,
                reason,
            })));
        }

        // -- Undo/Rollback ----------------------------------------------------
        Input::UndoStarted { message } => {
            state.phase = WorkPhase::Working;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Working),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    work_status: Some(WorkStatus::Working),
                    attention_reason: Some(AttentionReason::None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::UndoStarted {
                session_id: sid,
                turn_id: state.turn_count,
            })));
            let _ = message;
        }

        Input::UndoCompleted { success, message } => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Waiting),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    work_status: Some(WorkStatus::Waiting),
                    attention_reason: Some(AttentionReason::None),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::UndoCompleted {
                session_id: sid,
                turn_id: state.turn_count,
            })));
            let _ = (success, message);
        }

        Input::ThreadRolledBack { num_turns } => {
            state.phase = WorkPhase::Idle;
            state.last_activity_at = Some(now.to_string());
            state.turn_count = state.turn_count.saturating_sub(num_turns as u64);

            let to_message_id = state
                .messages
                .last()
                .map(|m| m.id.clone())
                .unwrap_or_default();

            effects.push(Effect::Persist(Box::new(PersistOp::SessionUpdate {
                id: sid.clone(),
                status: None,
                work_status: Some(WorkStatus::Waiting),
                last_activity_at: Some(now.to_string()),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid.clone(),
                changes: StateChanges {
                    work_status: Some(WorkStatus::Waiting),
                    attention_reason: Some(AttentionReason::None),
                    turn_count: Some(state.turn_count),
                    last_activity_at: Some(now.to_string()),
                    ..Default::default()
                },
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::ThreadRolledBack {
                session_id: sid,
                to_message_id,
            })));
        }

        // -- Environment --------------------------------------------------------
        Input::EnvironmentChanged {
            cwd,
            git_branch,
            git_sha,
        } => {
            let mut changed = false;
            if cwd.is_some() && cwd != state.current_cwd {
                state.current_cwd = cwd.clone();
                changed = true;
            }
            if git_branch.is_some() && git_branch != state.git_branch {
                state.git_branch = git_branch.clone();
                changed = true;
            }
            if git_sha.is_some() && git_sha != state.git_sha {
                state.git_sha = git_sha.clone();
                changed = true;
            }

            if changed {
                state.last_activity_at = Some(now.to_string());

                effects.push(Effect::Persist(Box::new(PersistOp::EnvironmentUpdate {
                    session_id: sid.clone(),
                    cwd: state.current_cwd.clone(),
                    git_branch: state.git_branch.clone(),
                    git_sha: state.git_sha.clone(),
                })));
                effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                    session_id: sid,
                    changes: StateChanges {
                        current_cwd: Some(state.current_cwd.clone()),
                        git_branch: Some(state.git_branch.clone()),
                        git_sha: Some(state.git_sha.clone()),
                        last_activity_at: Some(now.to_string()),
                        ..Default::default()
                    },
                })));
            }
        }

        // -- Model ---------------------------------------------------------------
        Input::ModelUpdated(model) => {
            effects.push(Effect::Persist(Box::new(PersistOp::ModelUpdate {
                session_id: sid.clone(),
                model: model.clone(),
            })));
            effects.push(Effect::Emit(Box::new(ServerMessage::SessionDelta {
                session_id: sid,
                changes: StateChanges {
                    model: Some(Some(model)),
                    ..Default::default()
                },
            })));
        }

        // -- Claude capabilities (from init message) ---------------------------
        Input::ClaudeInitialized { slash_commands, .. } => {
            effects.push(Effect::Emit(Box::new(ServerMessage::ClaudeCapabilities {
                session_id: sid,
                slash_commands,
            })));
        }

        // -- Pass-through (broadcast only, no state change) -------------------
        Input::ContextCompacted => {
            effects.push(Effect::Emit(Box::new(ServerMessage::ContextCompacted {
                session_id: sid,
            })));
        }
    }

    // Clear pending_approval whenever phase transitions away from AwaitingApproval.
    // The ApprovalRequested handler sets it; all other transitions clear it.
    if !matches!(state.phase, WorkPhase::AwaitingApproval { .. }) {
        state.pending_approval = None;
    }

    (state, effects)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orbitdock_protocol::{Message, MessageType, TokenUsage};

    fn test_state() -> TransitionState {
        TransitionState {
            id: "test-session".to_string(),
            revision: 0,
            phase: WorkPhase::Idle,
            messages: Vec::new(),
            token_usage: TokenUsage::default(),
            current_diff: None,
            current_plan: None,
            custom_name: None,
            project_path: "/tmp/project".to_string(),
            last_activity_at: None,
            current_turn_id: None,
            turn_count: 0,
            turn_diffs: Vec::new(),
            git_branch: None,
            git_sha: None,
            current_cwd: None,
            pending_approval: None,
            session_approvals: Vec::new(),
        }
    }

    fn test_message(msg_type: MessageType, content: &str) -> Message {
        Message {
            id: format!("msg-{}", content.len()),
            session_id: String::new(),
            sequence: 0,
            message_type: msg_type,
            content: content.to_string(),
            tool_name: None,
            tool_input: None,
            tool_output: None,
            is_error: false,
            images: vec![],
            thinking: None,
            is_in_progress: false,
            timestamp: "0Z".to_string(),
            duration_ms: None,
        }
    }

    const NOW: &str = "1000Z";

    #[test]
    fn turn_started_transitions_to_working() {
        let state = test_state();
        let (new_state, effects) = transition(state, Input::TurnStarted, NOW);

        assert_eq!(new_state.phase, WorkPhase::Working);
        assert_eq!(effects.len(), 2); // Persist + Emit
        assert!(matches!(
            effects[0],
            Effect::Persist(ref op) if matches!(**op, PersistOp::SessionUpdate { .. })
        ));
        assert!(matches!(
            effects[1],
            Effect::Emit(ref msg) if matches!(**msg, ServerMessage::SessionDelta { .. })
        ));
    }

    #[test]
    fn turn_completed_transitions_to_awaiting_reply() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (new_state, effects) = transition(state, Input::TurnCompleted, NOW);

        assert_eq!(new_state.phase, WorkPhase::AwaitingReply);
        assert_eq!(new_state.phase.to_attention_reason(), AttentionReason::AwaitingReply);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn turn_completed_when_idle_stays_idle() {
        let state = test_state();
        assert_eq!(state.phase, WorkPhase::Idle);

        let (new_state, effects) = transition(state, Input::TurnCompleted, NOW);

        // Phase stays Idle (guard prevents transition from non-Working)
        assert_eq!(new_state.phase, WorkPhase::Idle);
        // Still emits persist + broadcast for consistency
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn approval_requested_sets_awaiting_phase() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (new_state, effects) = transition(
            state,
            Input::ApprovalRequested {
                request_id: "req-1".to_string(),
                approval_type: ApprovalType::Exec,
                tool_name: Some("Bash".to_string()),
                command: Some("rm -rf /".to_string()),
                file_path: None,
                diff: None,
                question: None,
                proposed_amendment: None,
            },
            NOW,
        );

        assert!(matches!(
            new_state.phase,
            WorkPhase::AwaitingApproval {
                ref request_id,
                approval_type: ApprovalType::Exec,
                ..
            } if request_id == "req-1"
        ));
        assert_eq!(
            new_state.phase.to_attention_reason(),
            AttentionReason::AwaitingPermission
        );
        // Persist(ApprovalRequested) + Emit(SessionDelta) + Emit(ApprovalRequested)
        assert_eq!(effects.len(), 3);
    }

    #[test]
    fn approve_decision_with_matching_id_resolves() {
        let mut state = test_state();
        state.phase = WorkPhase::AwaitingApproval {
            request_id: "req-1".to_string(),
            approval_type: ApprovalType::Exec,
            tool_name: Some("Bash".to_string()),
            fingerprint: Some("echo hi".to_string()),
            proposed_amendment: None,
        };

        let (new_state, effects) = transition(
            state,
            Input::ApproveDecision {
                request_id: "req-1".to_string(),
                decision: ApprovalDecision::Approved,
                reason: None,
                interrupt: false,
            },
            NOW,
        );

        assert_eq!(new_state.phase, WorkPhase::Working);
        assert!(new_state.pending_approval.is_none());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ConnectorCommand(ConnectorCommand::SubmitApproval { .. }))));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::RejectWithError { .. })));
    }

    #[test]
    fn approve_decision_with_stale_id_is_rejected_without_mutation() {
        let mut state = test_state();
        state.phase = WorkPhase::AwaitingApproval {
            request_id: "req-1".to_string(),
            approval_type: ApprovalType::Exec,
            tool_name: Some("Bash".to_string()),
            fingerprint: Some("echo hi".to_string()),
            proposed_amendment: None,
        };
        let before = state.phase.clone();

        let (new_state, effects) = transition(
            state,
            Input::ApproveDecision {
                request_id: "req-stale".to_string(),
                decision: ApprovalDecision::Approved,
                reason: None,
                interrupt: false,
            },
            NOW,
        );

        assert_eq!(new_state.phase, before);
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            effects[0],
            Effect::RejectWithError { ref code, .. } if code == "STALE_APPROVAL"
        ));
    }

    #[test]
    fn approve_decision_with_no_pending_approval_is_rejected() {
        let state = test_state();
        assert_eq!(state.phase, WorkPhase::Idle);

        let (_, effects) = transition(
            state,
            Input::ApproveDecision {
                request_id: "req-1".to_string(),
                decision: ApprovalDecision::Approved,
                reason: None,
                interrupt: false,
            },
            NOW,
        );

        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::RejectWithError { .. }));
    }

    #[test]
    fn message_created_appends_to_state() {
        let state = test_state();
        let msg = test_message(MessageType::Assistant, "Hello world");

        let (new_state, effects) = transition(state, Input::MessageCreated(msg), NOW);

        assert_eq!(new_state.messages.len(), 1);
        assert_eq!(new_state.messages[0].content, "Hello world");
        assert_eq!(effects.len(), 2); // Persist + Emit
    }

    #[test]
    fn user_message_dedup_skips_echo() {
        let mut state = test_state();
        state
            .messages
            .push(test_message(MessageType::User, "do something"));

        let echo = test_message(MessageType::User, "do something");
        let (new_state, effects) = transition(state, Input::MessageCreated(echo), NOW);

        // Should NOT add duplicate
        assert_eq!(new_state.messages.len(), 1);
        assert!(effects.is_empty());
    }

    #[test]
    fn session_ended_transitions_to_ended() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (new_state, effects) = transition(
            state,
            Input::SessionEnded {
                reason: "user_quit".to_string(),
            },
            NOW,
        );

        assert!(matches!(
            new_state.phase,
            WorkPhase::Ended { ref reason } if reason == "user_quit"
        ));
        assert_eq!(effects.len(), 2); // Persist + Emit
    }

    #[test]
    fn session_ended_with_pending_approval_records_abort() {
        let mut state = test_state();
        state.phase = WorkPhase::AwaitingApproval {
            request_id: "req-1".to_string(),
            approval_type: ApprovalType::Exec,
            tool_name: Some("Bash".to_string()),
            fingerprint: Some("echo hi".to_string()),
            proposed_amendment: None,
        };

        let (new_state, effects) = transition(
            state,
            Input::SessionEnded {
                reason: "client_closed".to_string(),
            },
            NOW,
        );

        assert!(new_state.pending_approval.is_none());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Persist(op) if matches!(**op, PersistOp::ApprovalDecision { decision: ApprovalDecision::Abort, .. })
        )));
    }

    #[test]
    fn undo_started_transitions_to_working() {
        let state = test_state();

        let (new_state, effects) = transition(
            state,
            Input::UndoStarted {
                message: Some("reverting".to_string()),
            },
            NOW,
        );

        assert_eq!(new_state.phase, WorkPhase::Working);
        // Persist + SessionDelta + UndoStarted
        assert_eq!(effects.len(), 3);
    }

    #[test]
    fn undo_completed_transitions_to_idle() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (new_state, effects) = transition(
            state,
            Input::UndoCompleted {
                success: true,
                message: None,
            },
            NOW,
        );

        assert_eq!(new_state.phase, WorkPhase::Idle);
        // Persist + SessionDelta + UndoCompleted
        assert_eq!(effects.len(), 3);
    }

    #[test]
    fn pass_through_events_only_emit() {
        let state = test_state();

        let (new_state, effects) = transition(state.clone(), Input::ContextCompacted, NOW);
        assert_eq!(new_state.phase, state.phase);
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Emit(_)));
    }

    #[test]
    fn error_transitions_to_idle() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;

        let (new_state, effects) =
            transition(state, Input::Error("something broke".to_string()), NOW);

        assert_eq!(new_state.phase, WorkPhase::Idle);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn tokens_updated_stores_usage() {
        let state = test_state();
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cached_tokens: 20,
            context_window: 128000,
        };

        let (new_state, effects) = transition(state, Input::TokensUpdated(usage.clone()), NOW);

        assert_eq!(new_state.token_usage.input_tokens, 100);
        assert_eq!(new_state.token_usage.output_tokens, 50);
        assert_eq!(effects.len(), 2); // Persist + Emit
    }

    #[test]
    fn thread_rolled_back_transitions_to_idle() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        state.turn_count = 3;

        let (new_state, effects) = transition(state, Input::ThreadRolledBack { num_turns: 1 }, NOW);

        assert_eq!(new_state.phase, WorkPhase::Idle);
        assert_eq!(new_state.turn_count, 2);
        // Persist + SessionDelta + ThreadRolledBack
        assert_eq!(effects.len(), 3);
    }

    #[test]
    fn turn_started_generates_turn_id() {
        let state = test_state();
        assert_eq!(state.turn_count, 0);
        assert!(state.current_turn_id.is_none());

        let (new_state, effects) = transition(state, Input::TurnStarted, NOW);

        assert_eq!(new_state.turn_count, 1);
        assert_eq!(new_state.current_turn_id, Some("turn-1".to_string()));

        // Verify turn_id and turn_count are in the delta
        if let Effect::Emit(ref msg) = effects[1] {
            if let ServerMessage::SessionDelta { changes, .. } = msg.as_ref() {
                assert_eq!(changes.current_turn_id, Some(Some("turn-1".to_string())));
                assert_eq!(changes.turn_count, Some(1));
            } else {
                panic!("expected SessionDelta");
            }
        }
    }

    #[test]
    fn turn_count_increments_across_turns() {
        let state = test_state();

        // First turn
        let (state1, _) = transition(state, Input::TurnStarted, NOW);
        assert_eq!(state1.turn_count, 1);
        assert_eq!(state1.current_turn_id, Some("turn-1".to_string()));

        let (state2, _) = transition(state1, Input::TurnCompleted, NOW);
        assert!(state2.current_turn_id.is_none());

        // Second turn
        let (state3, _) = transition(state2, Input::TurnStarted, NOW);
        assert_eq!(state3.turn_count, 2);
        assert_eq!(state3.current_turn_id, Some("turn-2".to_string()));
    }

    #[test]
    fn turn_completed_snapshots_diff() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        state.current_turn_id = Some("turn-1".to_string());
        state.turn_count = 1;
        state.current_diff =
            Some("--- a/file.rs\n+++ b/file.rs\n@@ -1 +1 @@\n-old\n+new".to_string());

        let (new_state, effects) = transition(state, Input::TurnCompleted, NOW);

        // Diff should be snapshotted
        assert_eq!(new_state.turn_diffs.len(), 1);
        assert_eq!(new_state.turn_diffs[0].turn_id, "turn-1");
        assert!(new_state.turn_diffs[0].diff.contains("+new"));

        // Turn ID should be cleared
        assert!(new_state.current_turn_id.is_none());

        // Should emit TurnDiffSnapshot
        let has_snapshot = effects.iter().any(|e| matches!(
            e,
            Effect::Emit(ref msg) if matches!(msg.as_ref(), ServerMessage::TurnDiffSnapshot { .. })
        ));
        assert!(has_snapshot, "should emit TurnDiffSnapshot");
    }

    #[test]
    fn turn_completed_without_diff_skips_snapshot() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        state.current_turn_id = Some("turn-1".to_string());
        state.turn_count = 1;
        state.current_diff = None;

        let (new_state, effects) = transition(state, Input::TurnCompleted, NOW);

        assert!(new_state.turn_diffs.is_empty());

        let has_snapshot = effects.iter().any(|e| matches!(
            e,
            Effect::Emit(ref msg) if matches!(msg.as_ref(), ServerMessage::TurnDiffSnapshot { .. })
        ));
        assert!(
            !has_snapshot,
            "should NOT emit TurnDiffSnapshot without diff"
        );
    }

    #[test]
    fn turn_aborted_clears_turn_id() {
        let mut state = test_state();
        state.phase = WorkPhase::Working;
        state.current_turn_id = Some("turn-1".to_string());

        let (new_state, _) = transition(
            state,
            Input::TurnAborted {
                reason: "interrupted".to_string(),
            },
            NOW,
        );

        assert!(new_state.current_turn_id.is_none());
    }
}
