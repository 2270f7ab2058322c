//! Hook ingest events — the wire format `POST /api/hook` accepts.
//!
//! Distinct from `ClientMessage`: hooks are a fire-and-forget HTTP feed from
//! the Claude Code CLI, not a WebSocket control channel, and the two have
//! never shared a transport. Kept as its own enum so the offline spool can
//! round-trip a raw line through `serde_json` without dragging in the rest
//! of the client protocol.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    ClaudeSessionStart {
        session_id: String,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        context_label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_app: Option<String>,
    },
    ClaudeSessionEnd {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ClaudeStatusEvent {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript_path: Option<String>,
        hook_event_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        notification_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(default)]
        stop_hook_active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_instructions: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
    },
    ClaudeToolEvent {
        session_id: String,
        cwd: String,
        hook_event_name: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_input: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_response: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        is_interrupt: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        permission_mode: Option<String>,
    },
    ClaudeSubagentEvent {
        session_id: String,
        hook_event_name: String,
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_transcript_path: Option<String>,
    },
}
