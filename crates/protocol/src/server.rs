//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    SessionSnapshot {
        session: SessionState,
    },

    // Incremental updates
    SessionDelta {
        session_id: String,
        changes: StateChanges,
    },
    MessageAppended {
        session_id: String,
        message: Message,
    },
    MessageUpdated {
        session_id: String,
        message_id: String,
        changes: MessageChanges,
    },
    ApprovalRequested {
        session_id: String,
        request: ApprovalRequest,
    },
    TokensUpdated {
        session_id: String,
        usage: TokenUsage,
    },
    TurnDiffSnapshot {
        session_id: String,
        diff: TurnDiff,
    },
    ContextCompacted {
        session_id: String,
    },

    // Undo / rollback
    UndoStarted {
        session_id: String,
        turn_id: u64,
    },
    UndoCompleted {
        session_id: String,
        turn_id: u64,
    },
    ThreadRolledBack {
        session_id: String,
        to_message_id: String,
    },

    // Capability discovery (hook-driven provider)
    ClaudeCapabilities {
        session_id: String,
        slash_commands: Vec<String>,
    },

    // Lifecycle
    SessionCreated {
        session: SessionSummary,
    },
    SessionEnded {
        session_id: String,
        reason: String,
    },

    // Approval history
    ApprovalsList {
        session_id: Option<String>,
        approvals: Vec<ApprovalHistoryItem>,
    },
    ApprovalDeleted {
        approval_id: i64,
    },

    // Review comments
    ReviewCommentCreated {
        comment: ReviewComment,
    },
    ReviewCommentsList {
        session_id: String,
        comments: Vec<ReviewComment>,
    },
    ReviewCommentResolved {
        comment_id: String,
    },
    ReviewCommentDeleted {
        comment_id: String,
    },

    // Codex models / account
    ModelsList {
        models: Vec<CodexModelOption>,
    },
    CodexLoginChatgptStarted {
        login_id: String,
        auth_url: String,
    },
    CodexLoginChatgptCompleted {
        login_id: String,
        success: bool,
        error: Option<String>,
    },
    CodexAccountUpdated {
        status: CodexAccountStatus,
    },
    CodexAccountStatus {
        status: CodexAccountStatus,
    },

    // Request/response correlation
    Ack {
        request_id: String,
    },

    // Errors
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}
