//! OrbitDock Connectors
//!
//! Connectors for different AI providers (Claude, Codex).
//! Each connector handles communication with its respective provider
//! and translates events to the common OrbitDock protocol.

pub mod codex;

pub use codex::CodexConnector;
use orbitdock_protocol::TokenUsage;
use thiserror::Error;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Process communication error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Provider error: {0}")]
    ProviderError(String),
}

/// Events emitted by connectors
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// Turn started
    TurnStarted,

    /// Turn completed
    TurnCompleted,

    /// Turn aborted
    TurnAborted { reason: String },

    /// New message created
    MessageCreated(orbitdock_protocol::Message),

    /// Message updated
    MessageUpdated {
        message_id: String,
        content: Option<String>,
        tool_output: Option<String>,
        is_error: Option<bool>,
        duration_ms: Option<u64>,
    },

    /// Approval requested
    ApprovalRequested {
        request_id: String,
        approval_type: ApprovalType,
        tool_name: Option<String>,
        command: Option<String>,
        file_path: Option<String>,
        diff: Option<String>,
        question: Option<String>,
        /// Codex may propose an amended argv for the user to approve instead.
        proposed_amendment: Option<Vec<String>>,
    },

    /// Token usage updated
    TokensUpdated(TokenUsage),

    /// Aggregated diff updated
    DiffUpdated(String),

    /// Plan updated
    PlanUpdated(String),

    /// The thread/session display name changed (e.g. Claude auto-naming).
    ThreadNameUpdated(String),

    /// Session ended
    SessionEnded { reason: String },

    /// Claude's hook-driven init handshake reported available capabilities.
    ClaudeInitialized {
        slash_commands: Vec<String>,
        skills: Vec<String>,
        tools: Vec<String>,
    },

    /// The active model changed mid-session.
    ModelUpdated(String),

    /// The provider compacted/summarised earlier turn history.
    ContextCompacted,

    /// An undo of the last turn began.
    UndoStarted { message: Option<String> },

    /// An undo completed, successfully or not.
    UndoCompleted { success: bool, message: Option<String> },

    /// The thread was rolled back by `num_turns` turns (fork-from-message).
    ThreadRolledBack { num_turns: u32 },

    /// The working directory or git state changed underneath the session.
    EnvironmentChanged {
        cwd: Option<String>,
        git_branch: Option<String>,
        git_sha: Option<String>,
    },

    /// Error occurred
    Error(String),

    /// Hook-driven provider identified which OrbitDock session a hook
    /// invocation belongs to. Consumed by the event loop before reaching
    /// `transition()` — never turned into an `Input`.
    HookSessionId(String),
}

/// Type of approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalType {
    Exec,
    Patch,
    Question,
}
