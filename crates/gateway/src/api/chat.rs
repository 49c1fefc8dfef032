//! Chat API endpoints — the primary interface for running agent turns.
//!
//! - `POST /v1/chat`        — non-streaming: returns full response
//! - `POST /v1/chat/stream` — SSE streaming: streams deltas + tool activity
//!
//! Both submit a `cmd.request` to the [`Scheduler`] and consume the result
//! off the driver's per-request output topic (§4.2, §4.4), rather than
//! calling [`crate::runtime::run_turn`] directly — that keeps every HTTP
//! turn going through the same session-serial queueing, control-signal, and
//! graceful-restart machinery a Discord/Github relay would use.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;

use sa_domain::config::InboundMetadata;
use sa_domain::tool::{Message, MessageContent, Role};
use sa_providers::ResponseFormat;
use sa_sessions::compute_session_key;
use sa_sessions::store::SessionOrigin;

use crate::runtime::contracts::{
    CmdRequestMessage, DeliveryMode, OutputEvent, QueueMode, RequestClient, RequestRaw,
};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Explicit session key. If absent, computed from channel_context.
    #[serde(default)]
    pub session_key: Option<String>,
    /// User message text.
    pub message: String,
    /// Optional model override (e.g. "openai/gpt-4o").
    #[serde(default)]
    pub model: Option<String>,
    /// Controls the response format: text, json_object, or json_schema.
    ///
    /// Accepted for backward compatibility but not forwarded: `cmd.request`
    /// (§4.2) carries no response-format field, so a turn submitted through
    /// the scheduler always runs in the default text mode. Callers that
    /// need JSON mode should go through `openai_compat`, which still calls
    /// `run_turn` directly.
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Inbound channel context (used to compute session key if not explicit).
    #[serde(default)]
    pub channel_context: Option<InboundMetadata>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat (non-streaming)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    // Pre-flight: reject early with 503 if no LLM providers are available.
    if let Err(resp) = require_llm_provider(&state) {
        return resp.into_response();
    }

    let (scheduler, driver) = match require_coordinator(&state) {
        Ok(pair) => pair,
        Err(resp) => return resp.into_response(),
    };

    let (session_key, session_id) = match resolve_session(&state, &body) {
        Ok(s) => s,
        Err(e) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e })),
            )
                .into_response();
        }
    };

    if let Err(resp) = check_queue_depth(&state, &scheduler, &session_id) {
        return resp.into_response();
    }

    let normalized = state.entity_mapper.normalize_incoming(&body.message).await;
    let request_id = uuid::Uuid::new_v4().to_string();

    // Subscribe before submitting so nothing published between submission
    // and our own `tail_from` call is missed.
    let output_topic = driver.output_topics.get_or_create(&request_id);
    let mut tail = output_topic.tail_from(None);

    let cmd = CmdRequestMessage {
        request_id: request_id.clone(),
        session_id: session_id.clone(),
        request_client: RequestClient::Unknown,
        router_session_mode: None,
        queue: QueueMode::Prompt,
        messages: vec![Message {
            role: Role::User,
            content: MessageContent::Text(normalized),
        }],
        model_override: body.model,
        raw: RequestRaw::default(),
        recovery: None,
    };

    if let Err(e) = scheduler.handle_cmd_request(cmd).await {
        return (
            axum::http::StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    let idle_timeout = std::time::Duration::from_millis(state.config.core.relay_idle_timeout_ms);
    let mut tool_calls = Vec::new();
    let mut final_text = String::new();
    let mut delivery = DeliveryMode::Send;
    let mut stats_for_nerds_line = None;
    let mut errors = Vec::new();

    loop {
        match tokio::time::timeout(idle_timeout, tail.recv()).await {
            Ok(Some(envelope)) => match envelope.payload {
                OutputEvent::ToolCall { tool_call_id, status, display, ok, error, duration_ms } => {
                    tool_calls.push(serde_json::json!({
                        "tool_call_id": tool_call_id,
                        "status": status,
                        "display": display,
                        "ok": ok,
                        "error": error,
                        "duration_ms": duration_ms,
                    }));
                }
                OutputEvent::ResponseText { final_text: text, delivery: d, stats_for_nerds_line: stats } => {
                    final_text = text;
                    delivery = d;
                    stats_for_nerds_line = stats;
                    break;
                }
                OutputEvent::DeltaText { .. }
                | OutputEvent::DeltaReasoning { .. }
                | OutputEvent::ResponseBinary { .. } => {}
            },
            Ok(None) => break,
            Err(_) => {
                errors.push("timed out waiting for a response".to_string());
                break;
            }
        }
    }

    let final_text = state.entity_mapper.rewrite_outgoing(&final_text).await;

    Json(serde_json::json!({
        "session_key": session_key,
        "session_id": session_id,
        "request_id": request_id,
        "content": final_text,
        "delivery": delivery,
        "tool_calls": tool_calls,
        "stats_for_nerds_line": stats_for_nerds_line,
        "errors": errors,
    }))
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    // Pre-flight: reject early with 503 if no LLM providers are available.
    if let Err(resp) = require_llm_provider(&state) {
        return resp.into_response();
    }

    let (scheduler, driver) = match require_coordinator(&state) {
        Ok(pair) => pair,
        Err(resp) => return sse_error(error_message(&resp)).into_response(),
    };

    let (session_key, session_id) = match resolve_session(&state, &body) {
        Ok(s) => s,
        Err(e) => return sse_error(e).into_response(),
    };

    if let Err(resp) = check_queue_depth(&state, &scheduler, &session_id) {
        return sse_error(error_message(&resp)).into_response();
    }

    let normalized = state.entity_mapper.normalize_incoming(&body.message).await;
    let request_id = uuid::Uuid::new_v4().to_string();

    let output_topic = driver.output_topics.get_or_create(&request_id);
    let tail = output_topic.tail_from(None);

    let cmd = CmdRequestMessage {
        request_id: request_id.clone(),
        session_id: session_id.clone(),
        request_client: RequestClient::Unknown,
        router_session_mode: None,
        queue: QueueMode::Prompt,
        messages: vec![Message {
            role: Role::User,
            content: MessageContent::Text(normalized),
        }],
        model_override: body.model,
        raw: RequestRaw::default(),
        recovery: None,
    };

    if let Err(e) = scheduler.handle_cmd_request(cmd).await {
        return sse_error(e.to_string()).into_response();
    }

    let idle_timeout = std::time::Duration::from_millis(state.config.core.relay_idle_timeout_ms);
    let stream = make_sse_stream(tail, state.entity_mapper.clone(), idle_timeout);

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn error_message(resp: &(axum::http::StatusCode, Json<serde_json::Value>)) -> String {
    resp.1
        .0
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("request failed")
        .to_string()
}

fn sse_error(message: String) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let stream = futures_util::stream::once(async move {
        Ok::<_, std::convert::Infallible>(
            Event::default()
                .event("error")
                .data(serde_json::json!({ "error": message }).to_string()),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn make_sse_stream(
    mut tail: sa_bus::TailSubscriber<OutputEvent>,
    entity_mapper: std::sync::Arc<crate::surface::entity::EntityMapper<crate::surface::entity::NullEntityStore>>,
    idle_timeout: std::time::Duration,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        loop {
            let envelope = match tokio::time::timeout(idle_timeout, tail.recv()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(_) => {
                    yield Ok(Event::default()
                        .event("error")
                        .data(r#"{"error":"timed out waiting for a response"}"#));
                    break;
                }
            };

            let is_final = matches!(envelope.payload, OutputEvent::ResponseText { .. });
            let event_type = match &envelope.payload {
                OutputEvent::DeltaText { .. } => "delta_text",
                OutputEvent::DeltaReasoning { .. } => "delta_reasoning",
                OutputEvent::ToolCall { .. } => "tool_call",
                OutputEvent::ResponseBinary { .. } => "response_binary",
                OutputEvent::ResponseText { .. } => "response_text",
            };

            let payload = if let OutputEvent::ResponseText { final_text, delivery, stats_for_nerds_line } = envelope.payload {
                let final_text = entity_mapper.rewrite_outgoing(&final_text).await;
                serde_json::json!({
                    "final_text": final_text,
                    "delivery": delivery,
                    "stats_for_nerds_line": stats_for_nerds_line,
                })
            } else {
                serde_json::to_value(&envelope.payload).unwrap_or(serde_json::Value::Null)
            };

            yield Ok(Event::default().event(event_type).data(payload.to_string()));

            if is_final {
                break;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator / session resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pre-flight check: return a structured 503 if no LLM providers are
/// available.  This gives callers a clear, consistent signal (instead of
/// a vague "no_provider_configured" buried inside a turn-error stream)
/// and includes the init_errors summary so operators can diagnose the root
/// cause without scraping logs.
fn require_llm_provider(
    state: &AppState,
) -> Result<(), (axum::http::StatusCode, Json<serde_json::Value>)> {
    if !state.llm.is_empty() {
        return Ok(());
    }

    let init_errors: Vec<serde_json::Value> = state
        .llm
        .init_errors()
        .iter()
        .map(|e| {
            serde_json::json!({
                "provider_id": e.provider_id,
                "kind": e.kind,
                "error": e.error,
            })
        })
        .collect();

    Err((
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": "no_llm_provider",
            "reason": "No LLM providers are available. Configure at least one \
                       provider in config.toml under [llm.providers], or check \
                       /v1/models/readiness for details.",
            "init_errors": init_errors,
            "startup_policy": format!("{:?}", state.config.llm.startup_policy),
        })),
    ))
}

/// Pre-flight check: the scheduler/driver pair must be constructed (they
/// are always `Some` once `bootstrap::build_app_state` has run; `None` only
/// happens during the narrow construction window itself).
type Coordinator = (
    std::sync::Arc<crate::runtime::scheduler::Scheduler<crate::runtime::driver::AgentRunDriver>>,
    std::sync::Arc<crate::runtime::driver::AgentRunDriver>,
);

fn require_coordinator(
    state: &AppState,
) -> Result<Coordinator, (axum::http::StatusCode, Json<serde_json::Value>)> {
    match (state.scheduler.clone(), state.agent_driver.clone()) {
        (Some(scheduler), Some(driver)) => Ok((scheduler, driver)),
        _ => Err((
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "coordinator_not_ready",
                "reason": "the session scheduler has not finished starting up",
            })),
        )),
    }
}

/// Reject with 429 once a session's queued backlog hits the configured
/// depth, rather than letting it grow unbounded (§4.2 queueing, invariant).
fn check_queue_depth(
    state: &AppState,
    scheduler: &crate::runtime::scheduler::Scheduler<crate::runtime::driver::AgentRunDriver>,
    session_id: &str,
) -> Result<(), (axum::http::StatusCode, Json<serde_json::Value>)> {
    if scheduler.queue_len(session_id) >= state.config.core.max_queue_depth {
        return Err((
            axum::http::StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "session is busy — too many requests already queued"
            })),
        ));
    }
    Ok(())
}

fn resolve_session(
    state: &AppState,
    body: &ChatRequest,
) -> Result<(String, String), String> {
    // Compute session key.
    let session_key = if let Some(ref explicit) = body.session_key {
        explicit.clone()
    } else if let Some(ref ctx) = body.channel_context {
        // Resolve canonical peer ID.
        let meta = if let Some(ref peer) = ctx.peer_id {
            let canonical = state.identity.resolve(peer);
            let mut resolved = ctx.clone();
            resolved.peer_id = Some(canonical);
            resolved
        } else {
            ctx.clone()
        };
        compute_session_key(
            &state.config.sessions.agent_id,
            state.config.sessions.dm_scope,
            &meta,
        )
    } else {
        // Default to the "main" session.
        format!("agent:{}:main", state.config.sessions.agent_id)
    };

    // Check lifecycle (daily/idle reset).
    if let Some(entry) = state.sessions.get(&session_key) {
        let meta = body
            .channel_context
            .as_ref()
            .cloned()
            .unwrap_or_default();
        if let Some(reason) = state.lifecycle.should_reset(&entry, &meta, chrono::Utc::now()) {
            tracing::info!(
                session_key = %session_key,
                reason = %reason,
                "resetting session"
            );
            state.sessions.reset_session(&session_key, &reason.to_string());
        }
    }

    // Resolve or create the session.
    let origin = body
        .channel_context
        .as_ref()
        .map(SessionOrigin::from)
        .unwrap_or_default();

    let (entry, is_new) = state.sessions.resolve_or_create(&session_key, origin);
    if is_new {
        tracing::info!(session_key = %session_key, session_id = %entry.session_id, "new session created");
    }

    state.sessions.touch(&session_key);

    Ok((session_key, entry.session_id))
}
