use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use sa_domain::config::Config;
use sa_memory::provider::SerialMemoryProvider;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{IdentityResolver, LifecycleManager, SessionStore, TranscriptWriter};
use sa_skills::registry::SkillsRegistry;
use sa_mcp_client::McpManager;
use sa_tools::ProcessManager;

use crate::api::inbound::DedupeStore;
use crate::nodes::registry::NodeRegistry;
use crate::nodes::router::ToolRouter;
use crate::runtime::agent::AgentManager;
use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::contracts::RequestEvent;
use crate::runtime::deliveries::DeliveryStore;
use crate::runtime::driver::AgentRunDriver;
use crate::runtime::quota::QuotaTracker;
use crate::runtime::runs::RunStore;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::schedules::ScheduleStore;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::tasks::{TaskRunner, TaskStore};
use crate::skills::SkillEngine;
use crate::surface::entity::{EntityMapper, NullEntityStore};
use crate::workspace::bootstrap::BootstrapTracker;
use crate::workspace::files::WorkspaceReader;

/// Cached user facts with a TTL.
#[derive(Clone)]
pub struct CachedUserFacts {
    pub content: String,
    pub fetched_at: Instant,
}

/// Cached tool definitions keyed on (node generation, policy fingerprint).
#[derive(Clone)]
pub struct CachedToolDefs {
    pub defs: Arc<Vec<sa_domain::tool::ToolDefinition>>,
    pub generation: u64,
    pub policy_key: String,
}

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, memory, LLM providers
/// - **Session management** — sessions, identity, lifecycle, transcripts
/// - **Context & skills** — workspace, skills, bootstrap, skill engine
/// - **Runtime** — runs, schedules, deliveries, agents, processes
/// - **Nodes & tools** — node registry, tool router, cancel map
/// - **Security & caching** — token hashes, command deny list, caches
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub memory: Arc<dyn SerialMemoryProvider>,
    pub llm: Arc<ProviderRegistry>,

    // ── Session management ────────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub identity: Arc<IdentityResolver>,
    pub lifecycle: Arc<LifecycleManager>,
    pub transcripts: Arc<TranscriptWriter>,
    pub session_locks: Arc<SessionLockMap>,

    // ── Context & skills ──────────────────────────────────────────────
    pub skills: Arc<SkillsRegistry>,
    pub workspace: Arc<WorkspaceReader>,
    pub bootstrap: Arc<BootstrapTracker>,
    /// Callable skill engine (web.fetch, etc.).
    pub skill_engine: Arc<SkillEngine>,

    // ── Runtime ───────────────────────────────────────────────────────
    /// Run execution tracker.
    pub run_store: Arc<RunStore>,
    /// Schedule store (cron jobs).
    pub schedule_store: Arc<ScheduleStore>,
    /// Delivery store (inbox notifications from scheduled runs).
    pub delivery_store: Arc<DeliveryStore>,
    /// Sub-agent manager. `None` if no agents are configured.
    pub agents: Option<Arc<AgentManager>>,
    pub processes: Arc<ProcessManager>,
    pub cancel_map: Arc<CancelMap>,
    /// Per-agent daily usage limits.
    pub quota_tracker: Arc<QuotaTracker>,
    /// Background task execution tracker + concurrency-limited runner.
    pub task_store: Arc<TaskStore>,
    pub task_runner: Arc<TaskRunner>,
    /// Path the active config was loaded from (used by `config show`/reload).
    pub config_path: PathBuf,
    /// Signalled once a graceful shutdown has been requested.
    pub shutdown_tx: Arc<tokio::sync::Notify>,

    // ── Coordination engine ──────────────────────────────────────────────
    /// Fanout topic for `evt.request` (reply/lifecycle) events.
    pub request_events: Arc<sa_bus::Topic<RequestEvent>>,
    /// Per-session serial scheduler. `None` until [`AgentRunDriver`] (which
    /// embeds a clone of this very `AppState`) has been constructed —
    /// assigned immediately afterward, mirroring the `agents` field above.
    pub scheduler: Option<Arc<Scheduler<AgentRunDriver>>>,
    /// The scheduler's driver, kept alongside it so callers (the restart
    /// snapshot builder, control endpoints) can reach both without walking
    /// through `Scheduler`'s private fields.
    pub agent_driver: Option<Arc<AgentRunDriver>>,
    /// Durable single-row store for the graceful-restart snapshot.
    pub restart_store: Arc<sa_restart_store::RestartStore>,
    /// Bidirectional surface-text entity rewriter (code-span aware).
    pub entity_mapper: Arc<EntityMapper<NullEntityStore>>,
    /// Per-session cache of tool-result ids already compacted out of the
    /// model-facing view, so repeated turns don't re-decide the same plan.
    pub tool_compaction_cache: Arc<parking_lot::Mutex<HashMap<String, std::collections::HashSet<String>>>>,

    // ── MCP (Model Context Protocol) servers ────────────────────────────
    /// MCP server connections and tool registry.
    pub mcp: Arc<McpManager>,

    // ── Nodes & tools ─────────────────────────────────────────────────
    pub nodes: Arc<NodeRegistry>,
    pub tool_router: Arc<ToolRouter>,

    // ── Inbound ───────────────────────────────────────────────────────
    /// Idempotency store for inbound event deduplication.
    pub dedupe: Arc<DedupeStore>,

    // ── Admin & import ────────────────────────────────────────────────
    /// Root directory for import staging (e.g. `./data/import`).
    pub import_root: PathBuf,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the admin bearer token (read once at startup).
    /// `None` = dev mode (admin endpoints accessible without auth).
    pub admin_token_hash: Option<Vec<u8>>,
    /// Precompiled exec denied-pattern regexes (compiled once at startup).
    pub denied_command_set: Arc<regex::RegexSet>,
    /// Precompiled exec approval-pattern regexes (compiled once at startup).
    pub approval_command_set: Arc<regex::RegexSet>,
    /// Pending exec approvals awaiting human decision.
    pub approval_store: Arc<ApprovalStore>,

    // ── Caches ────────────────────────────────────────────────────────
    /// Per-user TTL cache for user facts (avoids network calls every turn).
    pub user_facts_cache: Arc<RwLock<HashMap<String, CachedUserFacts>>>,
    /// Cached tool definitions keyed on policy fingerprint; invalidated by
    /// node registry generation counter.
    pub tool_defs_cache: Arc<RwLock<HashMap<String, CachedToolDefs>>>,
}
