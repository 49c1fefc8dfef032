//! Agent run driver — drives one [`EnqueuedRequest`] end to end: model
//! resolution, system prompt assembly, tool-set selection, message
//! transforms, event translation onto the per-request output topic, and
//! lifecycle publication.
//!
//! The pure helpers in this module (model resolution, transforms, stats
//! line, delivery-mode parsing) are unit-tested directly; the IO-bound
//! [`AgentRunDriver`] wires them to a live [`AppState`] and the existing
//! [`super::turn::run_turn`] loop, and is exercised through integration
//! rather than unit tests, matching how `turn.rs` itself is tested.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sa_domain::tool::{ContentPart, Message, MessageContent, Role};

use crate::state::AppState;

use super::contracts::{
    DeliveryMode, LifecycleState, OutputEvent, RequestClient, RequestEvent, ToolCallStatus,
};
use super::scheduler::{ActiveControl, EnqueuedRequest, RequestDriver};
use super::turn::{self, TurnEvent, TurnInput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model resolution (§4.3 step 3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a model spec string in precedence order: explicit per-request
/// override, then (for subagent runs) the profile's own model, then the
/// caller-supplied default slot.
pub fn resolve_model_selection<'a>(
    explicit_override: Option<&'a str>,
    subagent_profile_model: Option<&'a str>,
    default_model_slot: &'a str,
) -> &'a str {
    explicit_override
        .or(subagent_profile_model)
        .unwrap_or(default_model_slot)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt assembly (§4.3 step 4)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentProfile {
    Explore,
    General,
    SelfProfile,
}

impl SubagentProfile {
    fn overlay_label(self) -> &'static str {
        match self {
            SubagentProfile::Explore => "explore",
            SubagentProfile::General => "general",
            SubagentProfile::SelfProfile => "self",
        }
    }
}

/// One resolved session memo entry: either a literal string, or the
/// contents of a `file://` reference inlined with a filename+path header.
pub struct ResolvedMemo {
    pub header: Option<String>,
    pub body: String,
}

/// Resolve raw memo strings (literals or `file://...` refs) via `read_file`.
/// Unreadable/invalid `file://` entries are skipped (the caller is expected
/// to warn via tracing at the call site).
pub fn resolve_session_memos(
    entries: &[String],
    read_file: impl Fn(&str) -> std::io::Result<String>,
) -> Vec<ResolvedMemo> {
    let mut resolved = Vec::new();
    for entry in entries {
        if let Some(path) = entry.strip_prefix("file://") {
            match read_file(path) {
                Ok(body) => resolved.push(ResolvedMemo {
                    header: Some(format!("# {path}")),
                    body,
                }),
                Err(err) => {
                    tracing::warn!(path, error = %err, "session memo file:// reference unreadable, skipping");
                }
            }
        } else {
            resolved.push(ResolvedMemo { header: None, body: entry.clone() });
        }
    }
    resolved
}

/// Assemble the full system prompt: base + (primary-run skills section) +
/// (subagent overlay) + an "Additional Session Memo" block.
pub fn build_system_prompt(
    base_prompt: &str,
    skills_section: Option<&str>,
    subagent_profile: Option<SubagentProfile>,
    memos: &[ResolvedMemo],
) -> String {
    let mut sections = vec![base_prompt.to_string()];

    if let Some(skills) = skills_section {
        sections.push(skills.to_string());
    }

    if let Some(profile) = subagent_profile {
        sections.push(format!(
            "You are running in {} subagent mode. Stay within the scope of the delegated task.",
            profile.overlay_label()
        ));
    }

    if !memos.is_empty() {
        let mut block = String::from("## Additional Session Memo\n\n");
        for memo in memos {
            if let Some(header) = &memo.header {
                block.push_str(header);
                block.push('\n');
            }
            block.push_str(&memo.body);
            block.push_str("\n\n");
        }
        sections.push(block.trim_end().to_string());
    }

    sections.join("\n\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool set by profile (§4.3 step 5)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Logical tool names granted to a run, before the tool registry resolves
/// them to concrete [`sa_domain::tool::ToolDefinition`]s.
pub fn tool_set_for_profile(
    profile: SubagentProfile,
    subagent_subsystem_enabled: bool,
    current_depth: u32,
    max_depth: u32,
) -> Vec<&'static str> {
    let mut tools = match profile {
        SubagentProfile::Explore => vec!["fs_read", "fs_list", "fs_search"],
        SubagentProfile::General | SubagentProfile::SelfProfile => {
            vec!["fs_read", "fs_list", "fs_search", "fs_write", "shell", "patch"]
        }
    };

    if !matches!(profile, SubagentProfile::Explore)
        && subagent_subsystem_enabled
        && current_depth < max_depth
    {
        tools.push("subagent_delegate");
    }

    tools.push("batch");
    tools
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message transforms (§4.3 step 6) — model-facing view only, never
// mutating the persisted transcript.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SINGLE_BINARY_LIMIT_BYTES: usize = 256 * 1024;
const TOTAL_BINARY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// Replace oversized inline data-URL image/file parts with a short textual
/// placeholder, preserving filename/media-type. Operates on a clone of the
/// message list; the persisted transcript is untouched.
pub fn scrub_binary_parts(messages: &[Message]) -> Vec<Message> {
    let mut total = 0usize;
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Parts(parts) => Message {
                role: m.role,
                content: MessageContent::Parts(
                    parts.iter().map(|p| scrub_part(p, &mut total)).collect(),
                ),
            },
            MessageContent::Text(_) => m.clone(),
        })
        .collect()
}

fn scrub_part(part: &ContentPart, total: &mut usize) -> ContentPart {
    let ContentPart::Image { url, media_type } = part else {
        return part.clone();
    };
    let Some(b64) = url.split_once(";base64,").map(|(_, data)| data) else {
        return part.clone();
    };
    if !url.starts_with("data:") {
        return part.clone();
    }
    let estimated = (b64.len() * 3) / 4;
    *total += estimated;
    if estimated > SINGLE_BINARY_LIMIT_BYTES || *total > TOTAL_BINARY_LIMIT_BYTES {
        let label = media_type.as_deref().unwrap_or("file");
        ContentPart::Text {
            text: format!("[attachment omitted: {label}, ~{estimated} bytes]"),
        }
    } else {
        part.clone()
    }
}

/// Tunables for tool-output compaction, mirroring the defaults named in the
/// component design.
#[derive(Debug, Clone)]
pub struct CompactionTuning {
    /// Token estimate above which older tool results become compaction
    /// candidates (chars/4 ~= tokens; default 40k tokens).
    pub protect_threshold_chars: usize,
    /// Minimum total pruned estimate required to actually apply compaction
    /// (default 20k tokens).
    pub min_prune_chars: usize,
    pub never_compact_tool_names: HashSet<String>,
}

impl Default for CompactionTuning {
    fn default() -> Self {
        Self {
            protect_threshold_chars: 40_000 * 4,
            min_prune_chars: 20_000 * 4,
            never_compact_tool_names: ["skill".to_string()].into_iter().collect(),
        }
    }
}

/// Walk the transcript from the end, skipping the most recent turn (the
/// trailing run of messages from the last user message onward), and decide
/// which older tool-result call ids should be compacted. Returns the empty
/// set if the total prunable estimate doesn't clear `min_prune_chars`.
/// `already_compacted` entries are skipped entirely (per-session-stable
/// caching so prompt caching stays effective).
pub fn plan_tool_output_compaction(
    messages: &[Message],
    tool_names_by_call_id: &HashMap<String, String>,
    already_compacted: &HashSet<String>,
    tuning: &CompactionTuning,
) -> HashSet<String> {
    let boundary = messages.iter().rposition(|m| m.role == Role::User).unwrap_or(messages.len());

    let mut cumulative = 0usize;
    let mut candidates: Vec<(String, usize)> = Vec::new();
    for message in messages[..boundary].iter().rev() {
        if message.role != Role::Tool {
            continue;
        }
        let MessageContent::Parts(parts) = &message.content else { continue };
        for part in parts {
            let ContentPart::ToolResult { tool_use_id, content, .. } = part else { continue };
            if already_compacted.contains(tool_use_id) {
                continue;
            }
            let tool_name = tool_names_by_call_id.get(tool_use_id).cloned().unwrap_or_default();
            if tuning.never_compact_tool_names.contains(&tool_name) {
                continue;
            }
            let len = content.len();
            if cumulative > tuning.protect_threshold_chars {
                candidates.push((tool_use_id.clone(), len));
            }
            cumulative += len;
        }
    }

    let pruned_total: usize = candidates.iter().map(|(_, len)| len).sum();
    if pruned_total < tuning.min_prune_chars {
        return HashSet::new();
    }
    candidates.into_iter().map(|(id, _)| id).collect()
}

const COMPACTION_PLACEHOLDER: &str = "[tool output omitted to save context]";

/// Apply a compaction plan (as returned by [`plan_tool_output_compaction`])
/// to a model-facing message list, replacing matched tool-result contents
/// with a placeholder.
pub fn apply_tool_output_compaction(messages: &[Message], compacted_ids: &HashSet<String>) -> Vec<Message> {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Parts(parts) => Message {
                role: m.role,
                content: MessageContent::Parts(
                    parts
                        .iter()
                        .map(|p| match p {
                            ContentPart::ToolResult { tool_use_id, is_error, .. }
                                if compacted_ids.contains(tool_use_id) =>
                            {
                                ContentPart::ToolResult {
                                    tool_use_id: tool_use_id.clone(),
                                    content: COMPACTION_PLACEHOLDER.to_string(),
                                    is_error: *is_error,
                                }
                            }
                            other => other.clone(),
                        })
                        .collect(),
                ),
            },
            MessageContent::Text(_) => m.clone(),
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider-option decoration — a pipeline of pure transforms (§9 design
// notes), each reading one setting and conditionally writing one key.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Attach a cache-control hint to the system prompt and last user message
/// for Anthropic-family specs, and pin a stable upstream provider order for
/// gateway providers.
pub fn with_anthropic_cache_control(
    opts: &mut serde_json::Value,
    is_anthropic_family: bool,
    is_gateway_provider: bool,
) {
    if !is_anthropic_family {
        return;
    }
    opts["cacheControl"] = serde_json::json!({ "system": true, "lastUserMessage": true });
    if is_gateway_provider && opts.get("providerOrder").is_none() {
        opts["providerOrder"] = serde_json::json!(["anthropic"]);
    }
}

/// Inject `reasoningSummary: "detailed"` for OpenAI-backed models when
/// reasoning display is enabled, unless an explicit value is already set.
pub fn with_reasoning_summary_default_for_openai_models(
    opts: &mut serde_json::Value,
    is_openai_backed: bool,
    reasoning_display_enabled: bool,
) {
    if !is_openai_backed || !reasoning_display_enabled {
        return;
    }
    if opts.get("reasoningSummary").is_none() {
        opts["reasoningSummary"] = serde_json::json!("detailed");
    }
}

/// Attach a session-scoped prompt cache key for direct OpenAI providers.
pub fn with_openai_prompt_cache_key(opts: &mut serde_json::Value, is_direct_openai: bool, session_key: &str) {
    if !is_direct_openai {
        return;
    }
    opts["promptCacheKey"] = serde_json::json!(session_key);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery mode (§4.3 step 9)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SKIP_REPLY_DIRECTIVE: &str = "<!-- skip-reply -->";

/// Detect a skip-reply directive in the final text. When present, the
/// directive is stripped and the returned text is empty with delivery mode
/// `Skip`; otherwise the text is returned unchanged with mode `Send`.
pub fn parse_delivery_mode(final_text: &str) -> (String, DeliveryMode) {
    if final_text.to_lowercase().contains(&SKIP_REPLY_DIRECTIVE.to_lowercase()) {
        (String::new(), DeliveryMode::Skip)
    } else {
        (final_text.to_string(), DeliveryMode::Send)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stats line (§4.3 step 9)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    pub input_tokens: u32,
    pub no_cache_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: u32,
    pub ttft_secs: f64,
    pub tokens_per_sec: f64,
}

pub fn compute_stats_line(model_id: &str, stats: &RunStats) -> String {
    format!(
        "[M]: {model}; [T]: \u{2191}{input}(NC: {no_cache}) \u{2193}{output}(R: {reasoning}); [TTFT]: {ttft:.2}s; [TPS]: {tps:.1}",
        model = model_id,
        input = stats.input_tokens,
        no_cache = stats.no_cache_tokens,
        output = stats.output_tokens,
        reasoning = stats.reasoning_tokens,
        ttft = stats.ttft_secs,
        tps = stats.tokens_per_sec,
    )
}

/// One per-call snapshot of what the provider actually saw: character
/// counts for system prompt, assistant turns, user turns, tool
/// definitions, and tool results — used to compute the input-composition
/// breakdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptSnapshot {
    pub system_chars: usize,
    pub assistant_chars: usize,
    pub user_chars: usize,
    pub tool_def_chars: usize,
    pub tool_result_chars: usize,
}

/// `[IC] S:%; A:%; U:%; TD:%; TR:%` computed from per-call prompt
/// snapshots, averaged across all snapshots in the run.
pub fn compute_input_composition_line(snapshots: &[PromptSnapshot]) -> String {
    if snapshots.is_empty() {
        return "[IC] S:0%; A:0%; U:0%; TD:0%; TR:0%".to_string();
    }

    let mut totals = (0usize, 0usize, 0usize, 0usize, 0usize);
    for s in snapshots {
        totals.0 += s.system_chars;
        totals.1 += s.assistant_chars;
        totals.2 += s.user_chars;
        totals.3 += s.tool_def_chars;
        totals.4 += s.tool_result_chars;
    }
    let grand_total = (totals.0 + totals.1 + totals.2 + totals.3 + totals.4).max(1) as f64;

    let pct = |n: usize| (n as f64 / grand_total) * 100.0;
    format!(
        "[IC] S:{s:.0}%; A:{a:.0}%; U:{u:.0}%; TD:{td:.0}%; TR:{tr:.0}%",
        s = pct(totals.0),
        a = pct(totals.1),
        u = pct(totals.2),
        td = pct(totals.3),
        tr = pct(totals.4),
    )
}

/// Build a call_id -> tool_name map from `ToolUse` parts, so later
/// compaction/result handling can look a call's tool name back up by id.
pub fn tool_names_by_call_id(messages: &[Message]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for message in messages {
        let MessageContent::Parts(parts) = &message.content else { continue };
        for part in parts {
            if let ContentPart::ToolUse { id, name, .. } = part {
                map.insert(id.clone(), name.clone());
            }
        }
    }
    map
}

/// Derive `ok` for a finished tool call. Batch/subagent-delegate results
/// wrap the outcome of several inner operations in their own JSON body, so
/// `is_error` alone (set only when the outer call itself faulted) isn't
/// enough — an inner `"ok": false` still means the call didn't do what was
/// asked even though the tool itself returned cleanly.
pub fn derive_tool_call_ok(tool_name: &str, content: &str, is_error: bool) -> bool {
    if is_error {
        return false;
    }
    if matches!(tool_name, "batch" | "subagent_delegate") {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
            if let Some(ok) = value.get("ok").and_then(|v| v.as_bool()) {
                return ok;
            }
        }
    }
    true
}

/// Coarse per-role character breakdown of a message list, used as a single
/// [`PromptSnapshot`] when the full per-provider-call breakdown isn't
/// available to the caller.
pub fn prompt_snapshot(messages: &[Message]) -> PromptSnapshot {
    let mut snapshot = PromptSnapshot::default();
    for message in messages {
        let text_len = message.content.extract_all_text().len();
        match message.role {
            Role::System => snapshot.system_chars += text_len,
            Role::Assistant => snapshot.assistant_chars += text_len,
            Role::User => snapshot.user_chars += text_len,
            Role::Tool => {
                if let MessageContent::Parts(parts) = &message.content {
                    for part in parts {
                        if let ContentPart::ToolResult { content, .. } = part {
                            snapshot.tool_result_chars += content.len();
                        }
                    }
                }
            }
        }
    }
    snapshot
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recovery resume prompt (§4.3 step 8)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The initial prompt for a request resuming after a graceful restart: a
/// short user-role system notice, optionally followed by the partial text
/// that was already visible to the surface.
pub fn build_recovery_resume_messages(partial_text: Option<&str>) -> Vec<Message> {
    let mut notice = String::from(
        "The server restarted during your previous turn. Continue from the last stable \
         boundary; failed tools should be treated as such.",
    );
    if let Some(partial) = partial_text {
        if !partial.is_empty() {
            notice.push_str("\n\nText already shown to the user before the restart:\n");
            notice.push_str(partial);
        }
    }
    vec![Message::user(notice)]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentRunDriver — wires the pure helpers above to a live AppState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry of live per-request output topics, so [`super::relay`] can
/// `tail_from` them and the driver can look one up to apply a control
/// signal's effect (e.g. publishing a cancellation marker).
#[derive(Default)]
pub struct OutputTopics {
    topics: Mutex<HashMap<String, Arc<sa_bus::Topic<OutputEvent>>>>,
}

impl OutputTopics {
    /// Returns the existing topic for `request_id` if one was already
    /// created (e.g. by a caller that subscribed before submitting the
    /// request to the scheduler, to avoid missing its first events), or
    /// creates a fresh one otherwise.
    pub fn get_or_create(&self, request_id: &str) -> Arc<sa_bus::Topic<OutputEvent>> {
        let mut topics = self.topics.lock();
        topics
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(sa_bus::Topic::new(4096, 256)))
            .clone()
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<sa_bus::Topic<OutputEvent>>> {
        self.topics.lock().get(request_id).cloned()
    }

    pub fn remove(&self, request_id: &str) {
        self.topics.lock().remove(request_id);
    }
}

pub struct AgentRunDriver {
    state: AppState,
    events: Arc<sa_bus::Topic<RequestEvent>>,
    pub output_topics: Arc<OutputTopics>,
    /// Text already streamed to the surface for each in-flight request, kept
    /// so a graceful-restart snapshot can carry it forward as a
    /// [`sa_restart_store::RecoveryBlock`] (§4.5).
    partial_text: Mutex<HashMap<String, String>>,
}

impl AgentRunDriver {
    pub fn new(state: AppState, events: Arc<sa_bus::Topic<RequestEvent>>) -> Self {
        Self {
            state,
            events,
            output_topics: Arc::new(OutputTopics::default()),
            partial_text: Mutex::new(HashMap::new()),
        }
    }

    /// Text streamed so far for a still-running request, if any.
    pub fn partial_text(&self, request_id: &str) -> Option<String> {
        self.partial_text.lock().get(request_id).cloned()
    }

    fn publish_lifecycle(&self, req: &EnqueuedRequest, state_: LifecycleState, detail: Option<String>) {
        self.events.publish(RequestEvent::LifecycleChanged {
            request_id: req.request_id.clone(),
            session_id: req.session_id.clone(),
            state: state_,
            detail,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        });
    }

    fn publish_reply(&self, req: &EnqueuedRequest) {
        self.events.publish(RequestEvent::Reply {
            request_id: req.request_id.clone(),
            session_id: req.session_id.clone(),
            request_client: req.request_client,
            reply_to: req.raw.target_message_id.clone(),
        });
    }
}

/// Build a [`sa_restart_store::RecoverySnapshot`] from a live scheduler's
/// lane state plus whatever partial text the driver has accumulated for
/// each active request (§4.5, §6.3). Read-only: does not touch either.
pub fn build_recovery_snapshot(
    scheduler: &super::scheduler::Scheduler<AgentRunDriver>,
    driver: &AgentRunDriver,
    deadline_ms: u64,
) -> sa_restart_store::RecoverySnapshot {
    let mut snapshot =
        sa_restart_store::RecoverySnapshot::new(deadline_ms, chrono::Utc::now().timestamp_millis());

    for lane in scheduler.snapshot_lanes() {
        if let Some(active) = &lane.active {
            snapshot.agents.push(sa_restart_store::AgentRecoveryEntry {
                kind: sa_restart_store::AgentRecoveryKind::Active,
                request_id: active.request_id.clone(),
                session_id: lane.session_id.clone(),
                messages: active.messages.clone(),
                recovery: Some(sa_restart_store::RecoveryBlock {
                    partial_text: driver.partial_text(&active.request_id),
                }),
            });
        }
        for queued in &lane.queued {
            snapshot.agents.push(sa_restart_store::AgentRecoveryEntry {
                kind: sa_restart_store::AgentRecoveryKind::Queued,
                request_id: queued.request_id.clone(),
                session_id: lane.session_id.clone(),
                messages: queued.messages.clone(),
                recovery: None,
            });
        }
    }

    snapshot
}

#[async_trait]
impl RequestDriver for AgentRunDriver {
    async fn run(&self, session_id: &str, request: EnqueuedRequest) {
        let detail = if request.recovery.is_some() {
            Some("resumed after server restart".to_string())
        } else if request.queue != super::contracts::QueueMode::Prompt {
            Some(format!("coerced queue={:?} to prompt", request.queue))
        } else {
            None
        };
        // No agent is attached to a scheduler-level request (that only
        // exists once `turn::run_turn` resolves one from session state), so
        // this checks the default-agent bucket — the same one
        // `turn_input.agent: None` below resolves to. Failing here avoids
        // spinning up a turn at all once that bucket is over quota.
        if let Err(exceeded) = self.state.quota_tracker.check_quota(None) {
            self.publish_lifecycle(
                &request,
                LifecycleState::Failed,
                Some(format!("{} quota exceeded ({}/{})", exceeded.kind, exceeded.used, exceeded.limit)),
            );
            let output_topic = self.output_topics.get_or_create(&request.request_id);
            output_topic.publish(OutputEvent::ResponseText {
                final_text: format!(
                    "Daily {} quota exceeded ({:.0}/{:.0}). Try again tomorrow.",
                    exceeded.kind, exceeded.used, exceeded.limit
                ),
                delivery: DeliveryMode::Send,
                stats_for_nerds_line: None,
            });
            self.output_topics.remove(&request.request_id);
            return;
        }

        self.publish_lifecycle(&request, LifecycleState::Running, detail);
        self.publish_reply(&request);

        let output_topic = self.output_topics.get_or_create(&request.request_id);

        let initial_messages = match &request.recovery {
            Some(hint) => build_recovery_resume_messages(hint.partial_text.as_deref()),
            None => request.messages.clone(),
        };

        // Binary scrubbing + tool-output compaction operate on the
        // model-facing view only; the persisted transcript (loaded fresh by
        // `turn::run_turn` from `request.session_id`) is never touched here.
        let scrubbed = scrub_binary_parts(&initial_messages);
        let tool_names_by_call_id = tool_names_by_call_id(&scrubbed);
        let already_compacted = self
            .state
            .tool_compaction_cache
            .lock()
            .entry(request.session_id.clone())
            .or_default()
            .clone();
        let compaction_plan = plan_tool_output_compaction(
            &scrubbed,
            &tool_names_by_call_id,
            &already_compacted,
            &CompactionTuning::default(),
        );
        let compacted_messages = if compaction_plan.is_empty() {
            scrubbed
        } else {
            self.state
                .tool_compaction_cache
                .lock()
                .entry(request.session_id.clone())
                .or_default()
                .extend(compaction_plan.iter().cloned());
            apply_tool_output_compaction(&scrubbed, &compaction_plan)
        };

        let user_text = compacted_messages
            .iter()
            .map(|m| m.content.extract_all_text())
            .collect::<Vec<_>>()
            .join("\n\n");

        let default_model_slot = self
            .state
            .config
            .llm
            .roles
            .get("executor")
            .map(|r| r.model.as_str())
            .unwrap_or_default();
        let resolved_model = resolve_model_selection(
            request.model_override.as_deref(),
            None,
            default_model_slot,
        );
        let model = if resolved_model.is_empty() {
            None
        } else {
            Some(resolved_model.to_string())
        };

        let tool_allowlist: Vec<String> = tool_set_for_profile(
            SubagentProfile::General,
            self.state.agents.is_some(),
            0,
            self.state.config.core.max_subagent_depth,
        )
        .into_iter()
        .map(str::to_string)
        .collect();

        let memos = resolve_session_memos(&[], |_| Ok(String::new()));
        let system_prompt_suffix = {
            let built = build_system_prompt("", None, None, &memos);
            if built.is_empty() { None } else { Some(built) }
        };

        let model_for_stats = model.clone().unwrap_or_else(|| "default".to_string());
        let input_composition = compute_input_composition_line(&[prompt_snapshot(&compacted_messages)]);

        let turn_input = TurnInput {
            session_key: session_id.to_string(),
            session_id: request.session_id.clone(),
            user_message: user_text,
            model,
            response_format: None,
            agent: None,
            routing_profile: None,
            system_prompt_suffix,
            tool_allowlist: Some(tool_allowlist),
        };

        let run_started_at = std::time::Instant::now();
        let mut first_token_at: Option<std::time::Instant> = None;
        let (_run_id, mut rx) = turn::run_turn(self.state.clone(), turn_input);

        let mut final_text = String::new();
        let mut ended_in_error = false;
        let mut ended_in_cancel = false;
        let mut run_stats = RunStats::default();
        let mut reasoning_buf = String::new();
        let mut reasoning_started = false;
        let mut reasoning_seq: u64 = 0;
        let mut tool_call_started: HashMap<String, std::time::Instant> = HashMap::new();

        while let Some(event) = rx.recv().await {
            if !matches!(event, TurnEvent::Thought { .. }) && !reasoning_buf.is_empty() {
                reasoning_seq += 1;
                output_topic.publish(OutputEvent::DeltaReasoning {
                    delta: std::mem::take(&mut reasoning_buf),
                    seq: Some(reasoning_seq),
                });
                reasoning_started = false;
            }
            match event {
                TurnEvent::Thought { content } => {
                    if !reasoning_started {
                        output_topic.publish(OutputEvent::DeltaReasoning {
                            delta: String::new(),
                            seq: None,
                        });
                        reasoning_started = true;
                    }
                    reasoning_buf.push_str(&content);
                }
                TurnEvent::AssistantDelta { text } => {
                    if first_token_at.is_none() {
                        first_token_at = Some(std::time::Instant::now());
                    }
                    final_text.push_str(&text);
                    self.partial_text
                        .lock()
                        .insert(request.request_id.clone(), final_text.clone());
                    output_topic.publish(OutputEvent::DeltaText { delta: text });
                }
                TurnEvent::ToolCallEvent { call_id, tool_name, .. } => {
                    tool_call_started.insert(call_id.clone(), std::time::Instant::now());
                    output_topic.publish(OutputEvent::ToolCall {
                        tool_call_id: call_id,
                        status: ToolCallStatus::Start,
                        display: format!("running {tool_name}"),
                        ok: None,
                        error: None,
                        duration_ms: None,
                    });
                }
                TurnEvent::ToolResult { call_id, tool_name, content, is_error } => {
                    let duration_ms = tool_call_started
                        .remove(&call_id)
                        .map(|started| started.elapsed().as_millis() as u64);
                    let ok = derive_tool_call_ok(&tool_name, &content, is_error);
                    output_topic.publish(OutputEvent::ToolCall {
                        tool_call_id: call_id,
                        status: ToolCallStatus::End,
                        display: format!("finished {tool_name}"),
                        ok: Some(ok),
                        error: if is_error { Some(content) } else { None },
                        duration_ms,
                    });
                }
                TurnEvent::UsageEvent { input_tokens, output_tokens, total_tokens } => {
                    run_stats.input_tokens = input_tokens;
                    run_stats.output_tokens = output_tokens;
                    run_stats.no_cache_tokens = total_tokens.saturating_sub(input_tokens + output_tokens);
                    let elapsed = run_started_at.elapsed().as_secs_f64();
                    run_stats.ttft_secs = first_token_at
                        .map(|t| (t - run_started_at).as_secs_f64())
                        .unwrap_or(elapsed);
                    run_stats.tokens_per_sec = if elapsed > 0.0 {
                        output_tokens as f64 / elapsed
                    } else {
                        0.0
                    };
                }
                TurnEvent::Final { content } => {
                    final_text = content;
                }
                TurnEvent::Stopped { content } => {
                    final_text = content;
                    self.publish_lifecycle(
                        &request,
                        LifecycleState::Cancelled,
                        Some("cancelled by interrupt".to_string()),
                    );
                    ended_in_cancel = true;
                    break;
                }
                TurnEvent::Error { message } => {
                    self.publish_lifecycle(&request, LifecycleState::Failed, Some(message.clone()));
                    output_topic.publish(OutputEvent::ResponseText {
                        final_text: format!("Error: {message}"),
                        delivery: DeliveryMode::Send,
                        stats_for_nerds_line: None,
                    });
                    ended_in_error = true;
                    break;
                }
            }
        }
        if !reasoning_buf.is_empty() {
            reasoning_seq += 1;
            output_topic.publish(OutputEvent::DeltaReasoning {
                delta: std::mem::take(&mut reasoning_buf),
                seq: Some(reasoning_seq),
            });
        }

        if !ended_in_error {
            if ended_in_cancel && final_text.is_empty() {
                final_text = "Cancelled.".to_string();
            }
            let (delivered_text, delivery) = parse_delivery_mode(&final_text);
            let stats_for_nerds_line = Some(format!(
                "{}; {}",
                compute_stats_line(&model_for_stats, &run_stats),
                input_composition
            ));
            output_topic.publish(OutputEvent::ResponseText {
                final_text: delivered_text,
                delivery,
                stats_for_nerds_line,
            });
            if !ended_in_cancel {
                self.publish_lifecycle(&request, LifecycleState::Resolved, None);
            }
        }

        self.output_topics.remove(&request.request_id);
        self.partial_text.lock().remove(&request.request_id);
    }

    async fn apply_control(&self, session_id: &str, request_id: &str, control: ActiveControl) {
        match control {
            ActiveControl::CancelActive => {
                // `run()`'s `TurnEvent::Stopped` branch publishes the final
                // `ResponseText` itself (using whatever partial text had
                // already streamed, falling back to "Cancelled." only if
                // none did) — publishing here too would race it and could
                // double-send to the surface.
                self.state.cancel_map.cancel(session_id);
            }
            ActiveControl::Steer(_) | ActiveControl::FollowUp(_) | ActiveControl::Interrupt(_) => {
                // Buffering steering/follow-up/interrupt content into a
                // running turn requires a channel into `turn::run_turn`'s
                // loop that the current `TurnInput`-per-call shape doesn't
                // expose; tracked as a follow-up once that loop accepts a
                // live input channel.
                tracing::debug!(request_id, "control signal accepted but not yet wired into a running turn");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_resolution_prefers_explicit_override() {
        assert_eq!(
            resolve_model_selection(Some("gpt-5"), Some("claude"), "default"),
            "gpt-5"
        );
    }

    #[test]
    fn model_resolution_falls_back_to_subagent_profile() {
        assert_eq!(resolve_model_selection(None, Some("claude"), "default"), "claude");
    }

    #[test]
    fn model_resolution_falls_back_to_default_slot() {
        assert_eq!(resolve_model_selection(None, None, "default"), "default");
    }

    #[test]
    fn system_prompt_includes_all_sections_in_order() {
        let memos = vec![ResolvedMemo { header: None, body: "remember X".into() }];
        let prompt = build_system_prompt(
            "base prompt",
            Some("skills here"),
            Some(SubagentProfile::Explore),
            &memos,
        );
        let base_pos = prompt.find("base prompt").unwrap();
        let skills_pos = prompt.find("skills here").unwrap();
        let overlay_pos = prompt.find("explore subagent mode").unwrap();
        let memo_pos = prompt.find("remember X").unwrap();
        assert!(base_pos < skills_pos && skills_pos < overlay_pos && overlay_pos < memo_pos);
    }

    #[test]
    fn session_memos_resolve_file_refs_and_skip_unreadable() {
        let entries = vec![
            "literal memo".to_string(),
            "file://notes.txt".to_string(),
            "file://missing.txt".to_string(),
        ];
        let resolved = resolve_session_memos(&entries, |p| {
            if p == "notes.txt" {
                Ok("file contents".to_string())
            } else {
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
            }
        });
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].body, "literal memo");
        assert_eq!(resolved[1].body, "file contents");
        assert_eq!(resolved[1].header.as_deref(), Some("# notes.txt"));
    }

    #[test]
    fn tool_set_explore_is_read_only() {
        let tools = tool_set_for_profile(SubagentProfile::Explore, true, 0, 3);
        assert!(!tools.contains(&"fs_write"));
        assert!(!tools.contains(&"shell"));
        assert!(tools.contains(&"batch"));
    }

    #[test]
    fn tool_set_general_includes_subagent_delegate_below_max_depth() {
        let tools = tool_set_for_profile(SubagentProfile::General, true, 1, 3);
        assert!(tools.contains(&"subagent_delegate"));
    }

    #[test]
    fn tool_set_general_excludes_subagent_delegate_at_max_depth() {
        let tools = tool_set_for_profile(SubagentProfile::General, true, 3, 3);
        assert!(!tools.contains(&"subagent_delegate"));
    }

    #[test]
    fn tool_set_general_excludes_subagent_delegate_when_disabled() {
        let tools = tool_set_for_profile(SubagentProfile::General, false, 0, 3);
        assert!(!tools.contains(&"subagent_delegate"));
    }

    fn data_url_image(approx_bytes: usize) -> ContentPart {
        let b64_len = approx_bytes * 4 / 3;
        ContentPart::Image {
            url: format!("data:image/png;base64,{}", "A".repeat(b64_len)),
            media_type: Some("image/png".into()),
        }
    }

    #[test]
    fn binary_scrub_leaves_small_attachments_untouched() {
        let messages = vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![data_url_image(1024)]),
        }];
        let scrubbed = scrub_binary_parts(&messages);
        match &scrubbed[0].content {
            MessageContent::Parts(parts) => assert!(matches!(parts[0], ContentPart::Image { .. })),
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn binary_scrub_replaces_oversized_single_attachment() {
        let messages = vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![data_url_image(300 * 1024)]),
        }];
        let scrubbed = scrub_binary_parts(&messages);
        match &scrubbed[0].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::Text { text } => assert!(text.contains("attachment omitted")),
                other => panic!("expected placeholder text, got {other:?}"),
            },
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn binary_scrub_replaces_once_total_exceeds_cap() {
        let messages = vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                data_url_image(1024 * 1024),
                data_url_image(1024 * 1024),
                data_url_image(100 * 1024),
            ]),
        }];
        let scrubbed = scrub_binary_parts(&messages);
        let MessageContent::Parts(parts) = &scrubbed[0].content else { panic!() };
        assert!(matches!(parts[2], ContentPart::Text { .. }));
    }

    fn tool_result_message(id: &str, len: usize) -> Message {
        Message {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: id.to_string(),
                content: "x".repeat(len),
                is_error: false,
            }]),
        }
    }

    #[test]
    fn compaction_skips_when_below_min_prune_threshold() {
        let messages = vec![
            Message::user("turn 1"),
            tool_result_message("c1", 100),
            Message::user("turn 2 (most recent)"),
        ];
        let tuning = CompactionTuning { protect_threshold_chars: 0, ..Default::default() };
        let plan = plan_tool_output_compaction(&messages, &HashMap::new(), &HashSet::new(), &tuning);
        assert!(plan.is_empty());
    }

    #[test]
    fn compaction_marks_old_tool_results_once_threshold_cleared() {
        let messages = vec![
            tool_result_message("old", 100_000),
            Message::user("most recent turn"),
        ];
        let tuning = CompactionTuning {
            protect_threshold_chars: 0,
            min_prune_chars: 1000,
            never_compact_tool_names: HashSet::new(),
        };
        let plan = plan_tool_output_compaction(&messages, &HashMap::new(), &HashSet::new(), &tuning);
        assert!(plan.contains("old"));
    }

    #[test]
    fn compaction_never_touches_protected_tool_names() {
        let mut names = HashMap::new();
        names.insert("s1".to_string(), "skill".to_string());
        let messages = vec![
            tool_result_message("s1", 100_000),
            Message::user("most recent"),
        ];
        let tuning = CompactionTuning { protect_threshold_chars: 0, min_prune_chars: 1, ..Default::default() };
        let plan = plan_tool_output_compaction(&messages, &names, &HashSet::new(), &tuning);
        assert!(plan.is_empty());
    }

    #[test]
    fn apply_compaction_replaces_matched_ids_only() {
        let messages = vec![tool_result_message("a", 10), tool_result_message("b", 10)];
        let mut ids = HashSet::new();
        ids.insert("a".to_string());
        let out = apply_tool_output_compaction(&messages, &ids);
        let MessageContent::Parts(parts_a) = &out[0].content else { panic!() };
        let ContentPart::ToolResult { content, .. } = &parts_a[0] else { panic!() };
        assert_eq!(content, COMPACTION_PLACEHOLDER);
        let MessageContent::Parts(parts_b) = &out[1].content else { panic!() };
        let ContentPart::ToolResult { content, .. } = &parts_b[0] else { panic!() };
        assert_eq!(content, "b".repeat(10).as_str());
    }

    #[test]
    fn reasoning_summary_default_only_applies_to_openai_with_display_enabled() {
        let mut opts = serde_json::json!({});
        with_reasoning_summary_default_for_openai_models(&mut opts, true, true);
        assert_eq!(opts["reasoningSummary"], "detailed");

        let mut opts2 = serde_json::json!({});
        with_reasoning_summary_default_for_openai_models(&mut opts2, false, true);
        assert!(opts2.get("reasoningSummary").is_none());
    }

    #[test]
    fn reasoning_summary_default_does_not_override_explicit_value() {
        let mut opts = serde_json::json!({ "reasoningSummary": "concise" });
        with_reasoning_summary_default_for_openai_models(&mut opts, true, true);
        assert_eq!(opts["reasoningSummary"], "concise");
    }

    #[test]
    fn anthropic_cache_control_only_applies_to_anthropic_family() {
        let mut opts = serde_json::json!({});
        with_anthropic_cache_control(&mut opts, false, true);
        assert!(opts.get("cacheControl").is_none());

        with_anthropic_cache_control(&mut opts, true, true);
        assert!(opts.get("cacheControl").is_some());
        assert_eq!(opts["providerOrder"], serde_json::json!(["anthropic"]));
    }

    #[test]
    fn openai_prompt_cache_key_only_for_direct_openai() {
        let mut opts = serde_json::json!({});
        with_openai_prompt_cache_key(&mut opts, false, "session-1");
        assert!(opts.get("promptCacheKey").is_none());
        with_openai_prompt_cache_key(&mut opts, true, "session-1");
        assert_eq!(opts["promptCacheKey"], "session-1");
    }

    #[test]
    fn delivery_mode_detects_skip_directive() {
        let (text, mode) = parse_delivery_mode("all done <!-- skip-reply -->");
        assert_eq!(mode, DeliveryMode::Skip);
        assert_eq!(text, "");
    }

    #[test]
    fn delivery_mode_defaults_to_send() {
        let (text, mode) = parse_delivery_mode("hello world");
        assert_eq!(mode, DeliveryMode::Send);
        assert_eq!(text, "hello world");
    }

    #[test]
    fn stats_line_matches_expected_format() {
        let stats = RunStats {
            input_tokens: 100,
            no_cache_tokens: 20,
            output_tokens: 50,
            reasoning_tokens: 5,
            ttft_secs: 1.234,
            tokens_per_sec: 42.0,
        };
        let line = compute_stats_line("gpt-5", &stats);
        assert_eq!(
            line,
            "[M]: gpt-5; [T]: \u{2191}100(NC: 20) \u{2193}50(R: 5); [TTFT]: 1.23s; [TPS]: 42.0"
        );
    }

    #[test]
    fn input_composition_line_sums_to_roughly_100_percent() {
        let snapshots = vec![PromptSnapshot {
            system_chars: 10,
            assistant_chars: 10,
            user_chars: 10,
            tool_def_chars: 10,
            tool_result_chars: 10,
        }];
        let line = compute_input_composition_line(&snapshots);
        assert_eq!(line, "[IC] S:20%; A:20%; U:20%; TD:20%; TR:20%");
    }

    #[test]
    fn input_composition_line_handles_empty_snapshots() {
        let line = compute_input_composition_line(&[]);
        assert_eq!(line, "[IC] S:0%; A:0%; U:0%; TD:0%; TR:0%");
    }

    #[test]
    fn recovery_resume_includes_partial_text() {
        let messages = build_recovery_resume_messages(Some("partial output so far"));
        assert_eq!(messages.len(), 1);
        let text = messages[0].content.extract_all_text();
        assert!(text.contains("server restarted"));
        assert!(text.contains("partial output so far"));
    }

    #[test]
    fn recovery_resume_without_partial_text_omits_section() {
        let messages = build_recovery_resume_messages(None);
        let text = messages[0].content.extract_all_text();
        assert!(!text.contains("Text already shown"));
    }
}
