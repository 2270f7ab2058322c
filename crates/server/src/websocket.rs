//! WebSocket handling
//!
//! Each connection gets one inbound/outbound pump. Session-level commands
//! never touch a session directly — everything is routed through
//! `SessionActorHandle::send(SessionCommand::...)` so the actor stays the
//! sole owner of its `SessionHandle`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use orbitdock_protocol::{
    ClaudeIntegrationMode, ClientMessage, CodexIntegrationMode, Provider, ReviewComment,
    ReviewCommentStatus, ServerMessage, SessionStatus,
};

use crate::claude_session::{ClaudeAction, ClaudeSession};
use crate::codex_session::{CodexAction, CodexSession};
use crate::persistence::PersistCommand;
use crate::session::SessionHandle;
use crate::session_actor::SessionActorHandle;
use crate::session_command::{PersistOp, SessionCommand, SubscribeResult};
use crate::state::SessionRegistry;

/// Messages that can be sent through the WebSocket
#[derive(Clone)]
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response, echoing a client-initiated ping
    Pong(Bytes),
    /// Server-initiated heartbeat ping
    Ping(Bytes),
}

impl OutboundMessage {
    /// Snapshot-class messages and heartbeat pings are never dropped to make room —
    /// everything else (deltas, acks, errors, pongs) is fair game.
    fn is_protected(&self) -> bool {
        matches!(
            self,
            OutboundMessage::Json(ServerMessage::SessionSnapshot { .. })
                | OutboundMessage::Json(ServerMessage::SessionsList { .. })
                | OutboundMessage::Ping(_)
        )
    }
}

const CLIENT_QUEUE_CAPACITY: usize = 1024;
const LAGGED_DROP_THRESHOLD: u32 = 32;

/// Bounded per-client outbound queue with drop-oldest-non-snapshot backpressure.
///
/// A plain `mpsc::channel` blocks the sender once full, which would let one slow
/// client stall the broadcast fan-out for every other subscriber of the same
/// session. This drops instead of blocking, and flags the connection as `LAGGED`
/// once the client has fallen far enough behind that dropping stops helping.
struct ClientQueue {
    items: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    consecutive_drops: AtomicU32,
    lagged: AtomicBool,
    closed: AtomicBool,
}

impl ClientQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::with_capacity(CLIENT_QUEUE_CAPACITY)),
            notify: Notify::new(),
            consecutive_drops: AtomicU32::new(0),
            lagged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a message, never blocking. Drops the oldest evictable message if the
    /// queue is full; if nothing is evictable (queue is all protected messages) the
    /// incoming message is dropped instead.
    fn push(&self, msg: OutboundMessage) {
        if self.lagged.load(Ordering::Acquire) {
            return;
        }

        let mut items = self.items.lock().expect("client queue lock poisoned");

        if items.len() < CLIENT_QUEUE_CAPACITY {
            items.push_back(msg);
            self.consecutive_drops.store(0, Ordering::Release);
            drop(items);
            self.notify.notify_one();
            return;
        }

        if let Some(idx) = items.iter().position(|m| !m.is_protected()) {
            items.remove(idx);
            items.push_back(msg);
        }
        // else: every queued message is protected, drop the incoming one silently.

        let drops = self.consecutive_drops.fetch_add(1, Ordering::AcqRel) + 1;
        if drops > LAGGED_DROP_THRESHOLD {
            self.lagged.store(true, Ordering::Release);
        }
        drop(items);
        self.notify.notify_one();
    }

    fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    /// Wait for and pop the next queued message. Returns `None` once `close()` has
    /// been called and the queue has drained.
    async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            {
                let mut items = self.items.lock().expect("client queue lock poisoned");
                if let Some(msg) = items.pop_front() {
                    return Some(msg);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Per-connection bookkeeping: forwarder tasks for sessions this client has
/// subscribed to, so `UnsubscribeSession` can actually stop the forwarder
/// instead of just leaving it running against a closed channel.
#[derive(Default)]
struct Subscriptions {
    sessions: HashMap<String, JoinHandle<()>>,
    list: Option<JoinHandle<()>>,
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (_, task) in self.sessions.drain() {
            task.abort();
        }
        if let Some(task) = self.list.take() {
            task.abort();
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<SessionRegistry>) {
    info!("New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Bounded, drop-oldest-non-snapshot outbound queue for this client.
    let queue = ClientQueue::new();

    // Spawn task to forward queued messages to the socket.
    let send_queue = queue.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = send_queue.pop().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
                OutboundMessage::Ping(data) => ws_tx.send(Message::Ping(data)).await,
            };

            if result.is_err() {
                debug!("WebSocket send failed, client disconnected");
                break;
            }

            if send_queue.is_lagged() {
                let frame = CloseFrame {
                    code: 4000,
                    reason: "LAGGED".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                info!("Disconnecting WebSocket client: send queue saturated (LAGGED)");
                break;
            }
        }
    });

    // Server-initiated heartbeat: ping every 20s, close after 3 consecutive misses.
    let missed_pings = Arc::new(AtomicU32::new(0));
    let heartbeat_queue = queue.clone();
    let heartbeat_missed = missed_pings.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if heartbeat_missed.load(Ordering::Acquire) >= HEARTBEAT_MISS_LIMIT {
                warn!("WebSocket client missed {} heartbeats, closing", HEARTBEAT_MISS_LIMIT);
                heartbeat_queue.close();
                break;
            }
            heartbeat_missed.fetch_add(1, Ordering::AcqRel);
            heartbeat_queue.push(OutboundMessage::Ping(Bytes::new()));
        }
    });

    let client_tx = queue.clone();
    let mut subs = Subscriptions::default();

    // Handle incoming messages
    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                queue.push(OutboundMessage::Pong(data));
                continue;
            }
            Ok(Message::Pong(_)) => {
                missed_pings.store(0, Ordering::Release);
                continue;
            }
            Ok(Message::Close(_)) => {
                info!("Client sent close frame");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to parse client message: {} - {}", e, msg);
                send_json(
                    &client_tx,
                    ServerMessage::Error {
                        code: "parse_error".into(),
                        message: e.to_string(),
                        session_id: None,
                        request_id: None,
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(client_msg, &client_tx, &state, &mut subs).await;

        if queue.is_lagged() {
            break;
        }
    }

    info!("WebSocket connection closed");
    heartbeat_task.abort();
    queue.close();
    send_task.abort();
}

/// Send a ServerMessage through the outbound queue
async fn send_json(tx: &Arc<ClientQueue>, msg: ServerMessage) {
    tx.push(OutboundMessage::Json(msg));
}

fn send_error(
    client_tx: &Arc<ClientQueue>,
    code: &str,
    message: impl Into<String>,
    session_id: Option<String>,
) {
    client_tx.push(OutboundMessage::Json(ServerMessage::Error {
        code: code.to_string(),
        message: message.into(),
        session_id,
        request_id: None,
    }));
}

/// Spawn a task that forwards a broadcast receiver onto this client's outbound queue.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    client_tx: Arc<ClientQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if client_tx.is_lagged() {
                break;
            }
            match rx.recv().await {
                Ok(msg) => client_tx.push(OutboundMessage::Json(msg)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Current time as an ISO 8601 string. Hand-rolled to match `persistence::chrono_now`
/// byte-for-byte so timestamps stamped here compare correctly against DB-stored ones.
pub(crate) fn chrono_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let mut days = days_since_epoch as i64;
    let mut year = 1970i64;
    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if days < days_in_year {
            break;
        }
        days -= days_in_year;
        year += 1;
    }

    let mut month = 1;
    let days_in_months = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };
    for days_in_month in days_in_months {
        if days < days_in_month {
            break;
        }
        days -= days_in_month;
        month += 1;
    }
    let day = days + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// Last path segment, used as a human-readable project label.
pub(crate) fn project_name_from_cwd(cwd: &str) -> Option<String> {
    cwd.split('/').next_back().filter(|s| !s.is_empty()).map(String::from)
}

/// Derive the on-disk Claude Code transcript path for a `(cwd, session_id)` pair.
///
/// Claude Code lays out transcripts under `~/.claude/projects/<sanitized-cwd>/<session_id>.jsonl`,
/// where the sanitized cwd has every `/` replaced with `-`.
pub(crate) fn claude_transcript_path_from_cwd(cwd: &str, session_id: &str) -> Option<String> {
    let home = dirs::home_dir()?;
    let sanitized = cwd.replace('/', "-");
    Some(
        home.join(".claude")
            .join("projects")
            .join(sanitized)
            .join(format!("{session_id}.jsonl"))
            .to_string_lossy()
            .into_owned(),
    )
}

/// True when `summary` is a different, still-active, empty Claude session in the same
/// project directory as the one currently materializing — a leftover `claude -c` bootstrap
/// shell that never got a first prompt and should be pruned rather than left to rot.
pub(crate) fn is_stale_empty_claude_shell(
    summary: &orbitdock_protocol::SessionSummary,
    current_session_id: &str,
    cwd: &str,
    now_secs: u64,
) -> bool {
    if summary.id == current_session_id {
        return false;
    }
    if summary.provider != Provider::Claude {
        return false;
    }
    if summary.project_path != cwd {
        return false;
    }
    if summary.status != SessionStatus::Active {
        return false;
    }
    if summary.turn_count != 0 || summary.first_prompt.is_some() {
        return false;
    }

    let last_active_secs = summary
        .last_activity_at
        .as_deref()
        .or(summary.started_at.as_deref())
        .and_then(parse_iso8601_secs);

    match last_active_secs {
        Some(secs) => now_secs.saturating_sub(secs) > 30,
        None => true,
    }
}

/// Parse the `chrono_now`/`persistence::chrono_now` ISO 8601 format back to Unix seconds.
/// Best-effort: any other timestamp shape is treated as "can't tell, assume stale".
fn parse_iso8601_secs(s: &str) -> Option<u64> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 14 {
        return None;
    }
    let year: i64 = digits[0..4].parse().ok()?;
    let month: i64 = digits[4..6].parse().ok()?;
    let day: i64 = digits[6..8].parse().ok()?;
    let hour: i64 = digits[8..10].parse().ok()?;
    let minute: i64 = digits[10..12].parse().ok()?;
    let second: i64 = digits[12..14].parse().ok()?;

    let mut days: i64 = 0;
    for y in 1970..year {
        days += if is_leap_year(y) { 366 } else { 365 };
    }
    let days_in_months = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };
    for m in 0..(month - 1).max(0) as usize {
        days += days_in_months[m];
    }
    days += day - 1;

    let secs = days * 86400 + hour * 3600 + minute * 60 + second;
    if secs < 0 {
        None
    } else {
        Some(secs as u64)
    }
}

/// Reload a session's messages from its transcript file if none are loaded yet, pushing a
/// `MessagesReplaced`-style sync through the actor. No-op if messages are already present
/// or no transcript path is known.
pub(crate) async fn sync_transcript_messages(actor: &SessionActorHandle) {
    let snapshot = actor.snapshot();
    let Some(path) = snapshot.transcript_path.clone() else {
        return;
    };

    let (reply, rx) = oneshot::channel();
    actor
        .send(SessionCommand::LoadTranscriptAndSync {
            path,
            session_id: snapshot.id.clone(),
            reply,
        })
        .await;
    let _ = rx.await;
}

fn parse_decision(s: &str) -> orbitdock_protocol::ApprovalDecision {
    use orbitdock_protocol::ApprovalDecision;
    match s {
        "approved_for_session" => ApprovalDecision::ApprovedForSession,
        "approved_always" => ApprovalDecision::ApprovedAlways,
        "denied" => ApprovalDecision::Denied,
        "abort" => ApprovalDecision::Abort,
        _ => ApprovalDecision::Approved,
    }
}

/// Handle a client message
async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &Arc<ClientQueue>,
    state: &Arc<SessionRegistry>,
    subs: &mut Subscriptions,
) {
    debug!("Received: {:?}", msg);

    match msg {
        ClientMessage::SubscribeList => {
            let rx = state.subscribe_list();
            if let Some(old) = subs.list.replace(spawn_forwarder(rx, client_tx.clone())) {
                old.abort();
            }
            let sessions = state.get_session_summaries();
            send_json(client_tx, ServerMessage::SessionsList { sessions }).await;
        }

        ClientMessage::SubscribeSession { session_id } => {
            ensure_connector(state, &session_id).await;
            subscribe_session(&session_id, client_tx, state, subs).await;
        }

        ClientMessage::UnsubscribeSession { session_id } => {
            if let Some(task) = subs.sessions.remove(&session_id) {
                task.abort();
            }
        }

        ClientMessage::CreateSession {
            provider,
            cwd,
            model,
            approval_policy,
            sandbox_mode,
        } => {
            create_session(
                provider,
                cwd,
                model,
                approval_policy,
                sandbox_mode,
                client_tx,
                state,
                subs,
            )
            .await;
        }

        ClientMessage::SendMessage {
            session_id,
            content,
            model,
            effort,
            ..
        } => {
            info!("Sending message to {}: {}", session_id, content);
            let Some(actor) = state.get_session(&session_id) else {
                send_error(
                    client_tx,
                    "not_found",
                    format!("Session {session_id} not found"),
                    Some(session_id),
                );
                return;
            };
            match actor.snapshot().provider {
                Provider::Codex => {
                    if let Some(tx) = state.get_codex_action_tx(&session_id) {
                        let _ = tx
                            .send(CodexAction::SendMessage {
                                content,
                                model,
                                effort,
                                skills: Vec::new(),
                                images: Vec::new(),
                                mentions: Vec::new(),
                            })
                            .await;
                    } else {
                        send_error(
                            client_tx,
                            "not_found",
                            "Session has no active connector",
                            Some(session_id),
                        );
                    }
                }
                Provider::Claude => {
                    if let Some(tx) = state.get_claude_action_tx(&session_id) {
                        let _ = tx
                            .send(ClaudeAction::SendMessage {
                                content,
                                model,
                                effort,
                            })
                            .await;
                    } else {
                        send_error(
                            client_tx,
                            "not_found",
                            "Session has no active connector",
                            Some(session_id),
                        );
                    }
                }
            }
        }

        ClientMessage::SteerSession {
            session_id,
            content,
            ..
        } => {
            if let Some(tx) = state.get_codex_action_tx(&session_id) {
                let _ = tx
                    .send(CodexAction::SteerTurn {
                        content,
                        message_id: orbitdock_protocol::new_id(),
                    })
                    .await;
            } else {
                send_error(
                    client_tx,
                    "unsupported",
                    "Steering is only available on active Codex sessions",
                    Some(session_id),
                );
            }
        }

        ClientMessage::InterruptSession { session_id, .. } => {
            info!("Interrupting session {}", session_id);
            if let Some(tx) = state.get_codex_action_tx(&session_id) {
                let _ = tx.send(CodexAction::Interrupt).await;
            } else if let Some(tx) = state.get_claude_action_tx(&session_id) {
                let _ = tx.send(ClaudeAction::Interrupt).await;
            }
        }

        ClientMessage::CompactSession { session_id, .. } => {
            if let Some(tx) = state.get_codex_action_tx(&session_id) {
                let _ = tx.send(CodexAction::Compact).await;
            } else if let Some(tx) = state.get_claude_action_tx(&session_id) {
                let _ = tx.send(ClaudeAction::Compact).await;
            }
        }

        ClientMessage::EndSession { session_id } => {
            info!("Ending session {}", session_id);

            if let Some(tx) = state.get_codex_action_tx(&session_id) {
                let _ = tx.send(CodexAction::EndSession).await;
            } else if let Some(tx) = state.get_claude_action_tx(&session_id) {
                let _ = tx.send(ClaudeAction::EndSession).await;
            }

            let _ = state
                .persist()
                .send(PersistCommand::SessionEnd {
                    id: session_id.clone(),
                    reason: "user_requested".to_string(),
                })
                .await;

            if state.remove_session(&session_id).is_some() {
                state.broadcast_to_list(ServerMessage::SessionEnded {
                    session_id,
                    reason: "user_requested".to_string(),
                });
            }
        }

        ClientMessage::ApproveTool {
            session_id,
            request_id,
            decision,
            reason,
            interrupt,
        } => {
            approve_tool(&session_id, &request_id, &decision, reason, interrupt, state).await;
        }

        ClientMessage::AnswerQuestion {
            session_id,
            request_id,
            answer,
        } => {
            info!("Answer for {} in {}: {}", request_id, session_id, answer);
            if let Some(tx) = state.get_codex_action_tx(&session_id) {
                let mut answers = std::collections::HashMap::new();
                answers.insert("0".to_string(), answer);
                let _ = tx
                    .send(CodexAction::AnswerQuestion { request_id, answers })
                    .await;
            } else if let Some(tx) = state.get_claude_action_tx(&session_id) {
                let _ = tx
                    .send(ClaudeAction::AnswerQuestion { request_id, answer })
                    .await;
            }
        }

        ClientMessage::UpdateSessionConfig {
            session_id,
            approval_policy,
            sandbox_mode,
        } => {
            info!(
                "Updating session config for {}: approval={:?}, sandbox={:?}",
                session_id, approval_policy, sandbox_mode
            );
            if let Some(tx) = state.get_codex_action_tx(&session_id) {
                let _ = tx
                    .send(CodexAction::UpdateConfig {
                        approval_policy,
                        sandbox_mode,
                    })
                    .await;
            } else if let Some(actor) = state.get_session(&session_id) {
                actor
                    .send(SessionCommand::SetConfig {
                        approval_policy,
                        sandbox_mode,
                    })
                    .await;
            }
        }

        ClientMessage::SetPermissionMode { session_id, mode } => {
            if let Some(tx) = state.get_claude_action_tx(&session_id) {
                let _ = tx.send(ClaudeAction::SetPermissionMode { mode }).await;
            } else {
                send_error(
                    client_tx,
                    "unsupported",
                    "Permission mode only applies to active Claude sessions",
                    Some(session_id),
                );
            }
        }

        ClientMessage::RenameSession { session_id, name } => {
            let Some(actor) = state.get_session(&session_id) else {
                send_error(
                    client_tx,
                    "not_found",
                    format!("Session {session_id} not found"),
                    Some(session_id),
                );
                return;
            };
            let persisted_name = name.clone();
            let (tx, rx) = oneshot::channel();
            actor
                .send(SessionCommand::SetCustomNameAndNotify {
                    name,
                    persist_op: Some(PersistOp::SetCustomName {
                        session_id: session_id.clone(),
                        name: persisted_name,
                    }),
                    reply: tx,
                })
                .await;
            if let Ok(summary) = rx.await {
                state.broadcast_to_list(ServerMessage::SessionCreated { session: summary });
            }
        }

        ClientMessage::ResumeSession { session_id } => {
            ensure_connector(state, &session_id).await;
        }

        ClientMessage::ForkSession {
            session_id,
            from_message_id,
        } => {
            fork_session(&session_id, from_message_id, client_tx, state).await;
        }

        ClientMessage::ListApprovals { session_id, limit } => {
            match crate::persistence::list_approvals(session_id.clone(), limit).await {
                Ok(approvals) => {
                    send_json(
                        client_tx,
                        ServerMessage::ApprovalsList { session_id, approvals },
                    )
                    .await;
                }
                Err(e) => {
                    send_error(client_tx, "db_error", e.to_string(), session_id);
                }
            }
        }

        ClientMessage::DeleteApproval { approval_id } => {
            match crate::persistence::delete_approval(approval_id).await {
                Ok(true) => {
                    send_json(client_tx, ServerMessage::ApprovalDeleted { approval_id }).await;
                }
                Ok(false) => {
                    send_error(client_tx, "not_found", "No such approval", None);
                }
                Err(e) => {
                    send_error(client_tx, "db_error", e.to_string(), None);
                }
            }
        }

        ClientMessage::CreateReviewComment {
            session_id,
            file_path,
            line_start,
            line_end,
            body,
            tag,
        } => {
            let comment = ReviewComment {
                id: orbitdock_protocol::new_id(),
                session_id,
                file_path,
                line_start,
                line_end,
                body,
                tag,
                status: ReviewCommentStatus::Open,
                created_at: chrono_now(),
            };
            match crate::persistence::create_review_comment(comment.clone()).await {
                Ok(()) => {
                    send_json(client_tx, ServerMessage::ReviewCommentCreated { comment }).await;
                }
                Err(e) => send_error(client_tx, "db_error", e.to_string(), None),
            }
        }

        ClientMessage::ListReviewComments { session_id, status } => {
            match crate::persistence::list_review_comments(session_id.clone(), status).await {
                Ok(comments) => {
                    send_json(
                        client_tx,
                        ServerMessage::ReviewCommentsList { session_id, comments },
                    )
                    .await;
                }
                Err(e) => send_error(client_tx, "db_error", e.to_string(), Some(session_id)),
            }
        }

        ClientMessage::ResolveReviewComment { comment_id } => {
            match crate::persistence::resolve_review_comment(comment_id.clone()).await {
                Ok(true) => {
                    send_json(
                        client_tx,
                        ServerMessage::ReviewCommentResolved { comment_id },
                    )
                    .await;
                }
                Ok(false) => send_error(client_tx, "not_found", "No such comment", None),
                Err(e) => send_error(client_tx, "db_error", e.to_string(), None),
            }
        }

        ClientMessage::DeleteReviewComment { comment_id } => {
            match crate::persistence::delete_review_comment(comment_id.clone()).await {
                Ok(true) => {
                    send_json(client_tx, ServerMessage::ReviewCommentDeleted { comment_id }).await;
                }
                Ok(false) => send_error(client_tx, "not_found", "No such comment", None),
                Err(e) => send_error(client_tx, "db_error", e.to_string(), None),
            }
        }

        ClientMessage::ListModels => {
            send_json(
                client_tx,
                ServerMessage::ModelsList {
                    models: default_model_options(),
                },
            )
            .await;
        }

        ClientMessage::CodexLoginChatgptStart => {
            let auth = state.codex_auth();
            match auth.start_chatgpt_login().await {
                Ok((login_id, auth_url)) => {
                    send_json(
                        client_tx,
                        ServerMessage::CodexLoginChatgptStarted { login_id, auth_url },
                    )
                    .await;
                }
                Err(e) => send_error(client_tx, "login_error", e, None),
            }
        }

        ClientMessage::CodexLoginChatgptCancel => {
            // The request doesn't carry a login_id; cancel whatever login is
            // active for the account.
            let auth = state.codex_auth();
            if let Ok(status) = auth.read_account(false).await {
                if let Some(login_id) = status.active_login_id {
                    auth.cancel_chatgpt_login(login_id).await;
                }
            }
        }

        ClientMessage::CodexLogout => {
            let auth = state.codex_auth();
            match auth.logout().await {
                Ok(status) => {
                    state.broadcast_to_list(ServerMessage::CodexAccountStatus { status });
                }
                Err(e) => send_error(client_tx, "logout_error", e, None),
            }
        }
    }
}

/// Subscribe a client to a session's updates: send the initial snapshot
/// (or replay, if supported) and start forwarding subsequent broadcasts.
async fn subscribe_session(
    session_id: &str,
    client_tx: &Arc<ClientQueue>,
    state: &Arc<SessionRegistry>,
    subs: &mut Subscriptions,
) {
    let Some(actor) = state.get_session(session_id) else {
        send_error(
            client_tx,
            "not_found",
            format!("Session {session_id} not found"),
            Some(session_id.to_string()),
        );
        return;
    };

    let (tx, rx) = oneshot::channel();
    actor
        .send(SessionCommand::Subscribe {
            since_revision: None,
            reply: tx,
        })
        .await;

    let Ok(result) = rx.await else { return };
    match result {
        SubscribeResult::Snapshot { state: snap, rx } => {
            send_json(client_tx, ServerMessage::SessionSnapshot { session: *snap }).await;
            if let Some(old) = subs
                .sessions
                .insert(session_id.to_string(), spawn_forwarder(rx, client_tx.clone()))
            {
                old.abort();
            }
        }
        SubscribeResult::Replay { events: _, rx } => {
            if let Some(old) = subs
                .sessions
                .insert(session_id.to_string(), spawn_forwarder(rx, client_tx.clone()))
            {
                old.abort();
            }
        }
    }
}

/// Lazily spawn a live connector for a passive (restored or not-yet-connected)
/// direct session. No-op if a connector is already attached, the session is
/// hook-driven/passive, or it's ended.
async fn ensure_connector(state: &Arc<SessionRegistry>, session_id: &str) {
    let Some(actor) = state.get_session(session_id) else {
        return;
    };
    let snap = actor.snapshot();
    if snap.status != SessionStatus::Active {
        return;
    }

    match snap.provider {
        Provider::Codex => {
            if state.has_codex_connector(session_id) {
                return;
            }
            if snap.codex_integration_mode != Some(CodexIntegrationMode::Direct) {
                return;
            }
            let Some(thread_id) = state.codex_thread_for_session(session_id) else {
                return;
            };
            match CodexSession::resume(
                session_id.to_string(),
                &snap.project_path,
                &thread_id,
                snap.model.as_deref(),
                snap.approval_policy.as_deref(),
                snap.sandbox_mode.as_deref(),
            )
            .await
            {
                Ok(codex_session) => attach_codex_connector(state, session_id, codex_session).await,
                Err(e) => {
                    error!("Failed to resume Codex session {}: {}", session_id, e);
                }
            }
        }
        Provider::Claude => {
            if state.has_claude_connector(session_id) {
                return;
            }
            if snap.claude_integration_mode != Some(ClaudeIntegrationMode::Direct) {
                return;
            }
            let Some(sdk_id) = state.claude_sdk_id_for_session(session_id) else {
                return;
            };
            match ClaudeSession::new(
                session_id.to_string(),
                &snap.project_path,
                snap.model.as_deref(),
                Some(&sdk_id),
                None,
                &[],
                &[],
            )
            .await
            {
                Ok(claude_session) => {
                    attach_claude_connector(state, session_id, claude_session).await
                }
                Err(e) => {
                    error!("Failed to resume Claude session {}: {}", session_id, e);
                }
            }
        }
    }
}

/// Hand the passive actor's owned `SessionHandle` off to a freshly-connected
/// Codex event loop, replacing the actor entry in place.
async fn attach_codex_connector(
    state: &Arc<SessionRegistry>,
    session_id: &str,
    codex_session: CodexSession,
) {
    let Some(old_actor) = state.get_session(session_id) else {
        return;
    };
    let (tx, rx) = oneshot::channel();
    old_actor.send(SessionCommand::TakeHandle { reply: tx }).await;
    let Ok(handle) = rx.await else {
        warn!("TakeHandle failed for session {session_id}, connector not attached");
        return;
    };

    let thread_id = codex_session.thread_id().to_string();
    let persist_tx = state.persist().clone();
    let (actor, action_tx) = codex_session.start_event_loop(handle, persist_tx.clone());
    state.add_session_actor(actor);
    state.set_codex_action_tx(session_id, action_tx);
    let _ = persist_tx
        .send(PersistCommand::SetThreadId {
            session_id: session_id.to_string(),
            thread_id,
        })
        .await;
    info!("Resumed Codex connector for session {session_id}");
}

async fn attach_claude_connector(
    state: &Arc<SessionRegistry>,
    session_id: &str,
    claude_session: ClaudeSession,
) {
    let Some(old_actor) = state.get_session(session_id) else {
        return;
    };
    let (tx, rx) = oneshot::channel();
    old_actor.send(SessionCommand::TakeHandle { reply: tx }).await;
    let Ok(handle) = rx.await else {
        warn!("TakeHandle failed for session {session_id}, connector not attached");
        return;
    };

    let persist_tx = state.persist().clone();
    let list_tx = state.list_tx();
    let (actor, action_tx) =
        claude_session.start_event_loop(handle, persist_tx, list_tx, state.clone());
    state.add_session_actor(actor);
    state.set_claude_action_tx(session_id, action_tx);
    info!("Resumed Claude connector for session {session_id}");
}

#[allow(clippy::too_many_arguments)]
async fn create_session(
    provider: Provider,
    cwd: String,
    model: Option<String>,
    approval_policy: Option<String>,
    sandbox_mode: Option<String>,
    client_tx: &Arc<ClientQueue>,
    state: &Arc<SessionRegistry>,
    subs: &mut Subscriptions,
) {
    info!("Creating {:?} session in {}", provider, cwd);

    let id = orbitdock_protocol::new_id();
    let project_name = cwd.split('/').next_back().map(String::from);
    let mut handle = SessionHandle::new(id.clone(), provider, cwd.clone());
    handle.set_list_tx(state.list_tx());
    handle.set_project_name(project_name.clone());
    handle.set_model(model.clone());
    handle.set_config(approval_policy.clone(), sandbox_mode.clone());

    let persist_tx = state.persist().clone();
    let _ = persist_tx
        .send(PersistCommand::SessionCreate {
            id: id.clone(),
            provider,
            project_path: cwd.clone(),
            project_name,
            model: model.clone(),
            approval_policy: approval_policy.clone(),
            sandbox_mode: sandbox_mode.clone(),
        })
        .await;

    let (actor, connector_result): (SessionActorHandle, Result<(), String>) = match provider {
        Provider::Codex => {
            match CodexSession::new(
                id.clone(),
                &cwd,
                model.as_deref(),
                approval_policy.as_deref(),
                sandbox_mode.as_deref(),
            )
            .await
            {
                Ok(codex_session) => {
                    let thread_id = codex_session.thread_id().to_string();
                    let (actor, action_tx) =
                        codex_session.start_event_loop(handle, persist_tx.clone());
                    state.set_codex_action_tx(&id, action_tx);
                    let _ = persist_tx
                        .send(PersistCommand::SetThreadId {
                            session_id: id.clone(),
                            thread_id,
                        })
                        .await;
                    (actor, Ok(()))
                }
                Err(e) => {
                    error!("Failed to start Codex session: {}", e);
                    (
                        SessionActorHandle::spawn(handle, persist_tx.clone()),
                        Err(e.to_string()),
                    )
                }
            }
        }
        Provider::Claude => {
            match ClaudeSession::new(id.clone(), &cwd, model.as_deref(), None, None, &[], &[])
                .await
            {
                Ok(claude_session) => {
                    let list_tx = state.list_tx();
                    let (actor, action_tx) = claude_session.start_event_loop(
                        handle,
                        persist_tx.clone(),
                        list_tx,
                        state.clone(),
                    );
                    state.set_claude_action_tx(&id, action_tx);
                    (actor, Ok(()))
                }
                Err(e) => {
                    error!("Failed to start Claude session: {}", e);
                    (
                        SessionActorHandle::spawn(handle, persist_tx.clone()),
                        Err(e.to_string()),
                    )
                }
            }
        }
    };

    state.add_session_actor(actor);

    subscribe_session(&id, client_tx, state, subs).await;
    if let Some(summary) = state.summary_for(&id) {
        state.broadcast_to_list(ServerMessage::SessionCreated { session: summary });
    }

    if let Err(e) = connector_result {
        send_error(client_tx, "connector_error", e, Some(id));
    }
}

async fn approve_tool(
    session_id: &str,
    request_id: &str,
    decision: &str,
    reason: Option<String>,
    interrupt: bool,
    state: &Arc<SessionRegistry>,
) {
    info!("Approval for {} in {}: {}", request_id, session_id, decision);

    let Some(actor) = state.get_session(session_id) else {
        return;
    };

    let (tx, rx) = oneshot::channel();
    actor
        .send(SessionCommand::TakePendingApproval {
            request_id: request_id.to_string(),
            reply: tx,
        })
        .await;
    let (approval_type, proposed_amendment) = rx.await.unwrap_or((None, None));

    if let Some(tx) = state.get_codex_action_tx(session_id) {
        let action = match approval_type {
            Some(orbitdock_protocol::ApprovalType::Patch) => CodexAction::ApprovePatch {
                request_id: request_id.to_string(),
                decision: decision.to_string(),
            },
            _ => CodexAction::ApproveExec {
                request_id: request_id.to_string(),
                decision: decision.to_string(),
                proposed_amendment,
            },
        };
        let _ = tx.send(action).await;
    } else if let Some(tx) = state.get_claude_action_tx(session_id) {
        let _ = tx
            .send(ClaudeAction::ApproveTool {
                request_id: request_id.to_string(),
                decision: decision.to_string(),
                message: reason.clone(),
                interrupt: Some(interrupt),
                updated_input: None,
            })
            .await;
    }

    let _ = state
        .persist()
        .send(PersistCommand::ApprovalDecision {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            decision: parse_decision(decision),
            reason,
            interrupt,
        })
        .await;

    actor
        .send(SessionCommand::ApplyDelta {
            changes: orbitdock_protocol::StateChanges {
                work_status: Some(orbitdock_protocol::WorkStatus::Working),
                pending_approval: Some(None),
                ..Default::default()
            },
            persist_op: Some(PersistOp::SessionUpdate {
                id: session_id.to_string(),
                status: None,
                work_status: Some(orbitdock_protocol::WorkStatus::Working),
                last_activity_at: None,
            }),
        })
        .await;
}

/// Fork a Codex session's thread from its source session's live connector.
/// Claude forking happens at connector spawn time (`--resume --fork-session`)
/// and isn't exposed as a standalone websocket action.
async fn fork_session(
    source_session_id: &str,
    from_message_id: Option<String>,
    client_tx: &Arc<ClientQueue>,
    state: &Arc<SessionRegistry>,
) {
    let Some(source_actor) = state.get_session(source_session_id) else {
        send_error(
            client_tx,
            "not_found",
            "Source session not found",
            Some(source_session_id.to_string()),
        );
        return;
    };
    let snapshot = source_actor.snapshot();
    if snapshot.provider != Provider::Codex {
        send_error(
            client_tx,
            "unsupported",
            "Forking is only available for Codex sessions",
            Some(source_session_id.to_string()),
        );
        return;
    }
    let Some(tx) = state.get_codex_action_tx(source_session_id) else {
        send_error(
            client_tx,
            "not_found",
            "Source session has no active connector",
            Some(source_session_id.to_string()),
        );
        return;
    };

    let nth_user_message = from_message_id.and_then(|id| id.parse::<u32>().ok());
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = tx
        .send(CodexAction::ForkSession {
            source_session_id: source_session_id.to_string(),
            nth_user_message,
            model: snapshot.model.clone(),
            approval_policy: snapshot.approval_policy.clone(),
            sandbox_mode: snapshot.sandbox_mode.clone(),
            cwd: Some(snapshot.project_path.clone()),
            reply_tx,
        })
        .await;

    let Ok(result) = reply_rx.await else {
        send_error(
            client_tx,
            "fork_error",
            "Fork request dropped",
            Some(source_session_id.to_string()),
        );
        return;
    };

    match result {
        Ok((connector, thread_id)) => {
            let new_id = orbitdock_protocol::new_id();
            let mut handle =
                SessionHandle::new(new_id.clone(), Provider::Codex, snapshot.project_path.clone());
            handle.set_list_tx(state.list_tx());
            handle.set_forked_from(source_session_id.to_string());
            handle.set_project_name(snapshot.project_name.clone());
            handle.set_model(snapshot.model.clone());
            handle.set_config(snapshot.approval_policy.clone(), snapshot.sandbox_mode.clone());

            let persist_tx = state.persist().clone();
            let _ = persist_tx
                .send(PersistCommand::SessionCreate {
                    id: new_id.clone(),
                    provider: Provider::Codex,
                    project_path: snapshot.project_path.clone(),
                    project_name: snapshot.project_name.clone(),
                    model: snapshot.model.clone(),
                    approval_policy: snapshot.approval_policy.clone(),
                    sandbox_mode: snapshot.sandbox_mode.clone(),
                })
                .await;

            let codex_session = CodexSession {
                session_id: new_id.clone(),
                connector,
            };
            let (actor, action_tx) = codex_session.start_event_loop(handle, persist_tx.clone());
            state.add_session_actor(actor);
            state.set_codex_action_tx(&new_id, action_tx);
            let _ = persist_tx
                .send(PersistCommand::SetThreadId {
                    session_id: new_id.clone(),
                    thread_id,
                })
                .await;

            if let Some(summary) = state.summary_for(&new_id) {
                state.broadcast_to_list(ServerMessage::SessionCreated { session: summary });
            }
        }
        Err(e) => {
            send_error(
                client_tx,
                "fork_error",
                e.to_string(),
                Some(source_session_id.to_string()),
            );
        }
    }
}

fn default_model_options() -> Vec<orbitdock_protocol::CodexModelOption> {
    vec![
        orbitdock_protocol::CodexModelOption {
            id: "gpt-5-codex".to_string(),
            display_name: "GPT-5 Codex".to_string(),
            description: Some("Default coding model".to_string()),
        },
        orbitdock_protocol::CodexModelOption {
            id: "o4-mini".to_string(),
            display_name: "o4-mini".to_string(),
            description: Some("Faster, lower-cost reasoning model".to_string()),
        },
    ]
}
