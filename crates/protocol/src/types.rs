//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// AI provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
}

/// How a Codex session is wired to its runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexIntegrationMode {
    Direct,
    Passive,
}

/// How a Claude session is wired to its runtime: hook-driven (passive
/// observation via shell hooks) or CLI-subprocess (direct stream-json).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeIntegrationMode {
    Direct,
    Passive,
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Ended,
}

/// Work status - what the agent is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Working,
    Waiting,
    Permission,
    Unknown,
}

/// Why a session is currently flagged as needing human attention. Distinct
/// from `work_status`: `work_status` is "what is the agent doing", this is
/// "what is the *client* waiting on".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionReason {
    None,
    AwaitingReply,
    AwaitingPermission,
    AwaitingQuestion,
}

impl Default for AttentionReason {
    fn default() -> Self {
        AttentionReason::None
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    Thinking,
    Tool,
    ToolResult,
    /// A mid-turn steering message injected while the agent was working.
    Steer,
    /// Raw shell output surfaced outside of a tool call (hook-driven provider).
    Shell,
    System,
}

/// An image attached to an outgoing message: either a data URI (client
/// upload, pre-extraction) or a `path` reference (post-extraction, or a
/// path the client already has on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInput {
    #[serde(rename = "type")]
    pub input_type: String,
    pub value: String,
}

/// A client-side `@skill` mention resolved at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// A client-side `@file` or `@symbol` mention resolved at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionInput {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_range: Option<(u32, u32)>,
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sequence: u64,
    pub message_type: MessageType,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub is_in_progress: bool,
    pub timestamp: String,
    pub duration_ms: Option<u64>,
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub context_window: u64,
}

impl TokenUsage {
    /// Calculate context fill percentage
    pub fn context_fill_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        (self.input_tokens as f64 / self.context_window as f64) * 100.0
    }

    /// Calculate cache hit percentage
    pub fn cache_hit_percent(&self) -> f64 {
        if self.input_tokens == 0 {
            return 0.0;
        }
        (self.cached_tokens as f64 / self.input_tokens as f64) * 100.0
    }
}

/// One completed turn's unified diff plus the token snapshot at turn end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDiff {
    pub turn_id: String,
    pub diff: String,
    pub token_usage: Option<TokenUsage>,
}

/// Type of approval being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Exec,
    Patch,
    Question,
}

/// Approval request for tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub approval_type: ApprovalType,
    pub command: Option<String>,
    pub file_path: Option<String>,
    pub diff: Option<String>,
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_amendment: Option<Vec<String>>,
}

/// Final disposition recorded for a resolved approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    ApprovedForSession,
    ApprovedAlways,
    Denied,
    Abort,
}

/// A row in the approval history log. `decision`/`decided_at` are `None`
/// while the request is still pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalHistoryItem {
    pub id: i64,
    pub session_id: String,
    pub request_id: String,
    #[serde(rename = "type")]
    pub approval_type: ApprovalType,
    pub tool_name: Option<String>,
    pub command: Option<String>,
    pub file_path: Option<String>,
    pub cwd: Option<String>,
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_amendment: Option<Vec<String>>,
    pub created_at: String,
    pub decided_at: Option<String>,
}

/// Status of a review comment attached to a turn diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCommentStatus {
    Open,
    Resolved,
}

/// Client-authored annotation on a location within a `TurnDiff`. Pure
/// metadata: the server never interprets `tag` or mutates diffs because of
/// these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub session_id: String,
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub status: ReviewCommentStatus,
    pub created_at: String,
}

/// A Codex account's auth mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexAuthMode {
    ApiKey,
    Chatgpt,
}

/// Outcome of cancelling an in-flight ChatGPT login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexLoginCancelStatus {
    Canceled,
    NotFound,
    InvalidId,
}

/// The embedded Codex runtime's authenticated account, by auth mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "auth_mode", rename_all = "snake_case")]
pub enum CodexAccount {
    ApiKey,
    Chatgpt {
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        plan_type: Option<String>,
    },
}

/// Snapshot of the Codex account / ChatGPT login state, broadcast whenever
/// it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexAccountStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<CodexAuthMode>,
    pub requires_openai_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<CodexAccount>,
    pub login_in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_login_id: Option<String>,
}

/// One selectable Codex model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexModelOption {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Summary of a session for list views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub provider: Provider,
    pub project_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    pub project_name: Option<String>,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    /// Short AI-generated description shown in list views alongside `custom_name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub status: SessionStatus,
    pub work_status: WorkStatus,
    pub attention_reason: AttentionReason,
    pub has_pending_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_integration_mode: Option<CodexIntegrationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_integration_mode: Option<ClaudeIntegrationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cwd: Option<String>,
    /// The session's first user prompt, truncated — used as a list-view fallback label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_prompt: Option<String>,
    /// Truncated content of the most recent user/assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    pub token_usage: TokenUsage,
    pub turn_count: u64,
    pub started_at: Option<String>,
    pub last_activity_at: Option<String>,
}

/// Full session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub provider: Provider,
    pub project_path: String,
    pub project_name: Option<String>,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    pub status: SessionStatus,
    pub work_status: WorkStatus,
    pub attention_reason: AttentionReason,
    pub messages: Vec<Message>,
    pub pending_approval: Option<ApprovalRequest>,
    pub token_usage: TokenUsage,
    pub current_diff: Option<String>,
    pub current_plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_integration_mode: Option<CodexIntegrationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_integration_mode: Option<ClaudeIntegrationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_turn_id: Option<String>,
    pub turn_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forked_from_session_id: Option<String>,
    pub started_at: Option<String>,
    pub last_activity_at: Option<String>,
}

/// Changes to apply to a session state (delta updates)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_status: Option<WorkStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attention_reason: Option<AttentionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<Option<ApprovalRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_diff: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_integration_mode: Option<Option<CodexIntegrationMode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cwd: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_turn_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
}

/// Changes to apply to a message (delta updates)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_in_progress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
