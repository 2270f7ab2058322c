//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::Provider;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    SubscribeSession {
        session_id: String,
    },
    UnsubscribeSession {
        session_id: String,
    },
    SubscribeList,

    // Turn-level actions
    SendMessage {
        session_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        effort: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Inject a message mid-turn while the agent is still working.
    SteerSession {
        session_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    InterruptSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Ask the connector to summarise and drop earlier turn history.
    CompactSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    EndSession {
        session_id: String,
    },

    // Approvals
    ApproveTool {
        session_id: String,
        request_id: String,
        /// One of "approved", "approved_for_session", "approved_always", "denied", "abort".
        decision: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        interrupt: bool,
    },
    AnswerQuestion {
        session_id: String,
        request_id: String,
        answer: String,
    },

    // Session config
    UpdateSessionConfig {
        session_id: String,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },
    SetPermissionMode {
        session_id: String,
        mode: String,
    },

    // Session naming
    RenameSession {
        session_id: String,
        name: Option<String>,
    },

    // Session management
    CreateSession {
        provider: Provider,
        cwd: String,
        model: Option<String>,
        approval_policy: Option<String>,
        sandbox_mode: Option<String>,
    },
    ResumeSession {
        session_id: String,
    },
    /// Branch a new session from an existing one, optionally rolling back to
    /// an earlier message before continuing.
    ForkSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_message_id: Option<String>,
    },

    // Approval history
    ListApprovals {
        session_id: Option<String>,
        limit: Option<u32>,
    },
    DeleteApproval {
        approval_id: i64,
    },

    // Review comments
    CreateReviewComment {
        session_id: String,
        file_path: String,
        line_start: u32,
        line_end: u32,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    ListReviewComments {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<crate::types::ReviewCommentStatus>,
    },
    ResolveReviewComment {
        comment_id: String,
    },
    DeleteReviewComment {
        comment_id: String,
    },

    // Codex models / account
    ListModels,
    CodexLoginChatgptStart,
    CodexLoginChatgptCancel,
    CodexLogout,
}
