use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordination engine (scheduler / driver / relay / restart-store)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime tunables for the session scheduler, agent run driver, output
/// relay, and graceful-restart store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// How long an idle output relay (no subscriber attached) stays alive
    /// before it is torn down, in milliseconds.
    #[serde(default = "d_relay_idle_timeout_ms")]
    pub relay_idle_timeout_ms: u64,

    /// Maximum subagent delegation depth before `subagent_delegate` is
    /// refused.
    #[serde(default = "d_max_subagent_depth")]
    pub max_subagent_depth: u32,

    /// Message count above which a session's transcript becomes eligible
    /// for compaction.
    #[serde(default = "d_compaction_message_threshold")]
    pub compaction_message_threshold: usize,

    /// How long the process waits for in-flight runs to reach a
    /// checkpointable state during a graceful restart, in milliseconds,
    /// before forcing a snapshot of whatever state exists.
    #[serde(default = "d_restart_deadline_ms")]
    pub restart_deadline_ms: u64,

    /// Maximum number of requests a session lane will hold in its queue
    /// before rejecting further enqueues.
    #[serde(default = "d_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relay_idle_timeout_ms: d_relay_idle_timeout_ms(),
            max_subagent_depth: d_max_subagent_depth(),
            compaction_message_threshold: d_compaction_message_threshold(),
            restart_deadline_ms: d_restart_deadline_ms(),
            max_queue_depth: d_max_queue_depth(),
        }
    }
}

fn d_relay_idle_timeout_ms() -> u64 {
    120_000
}

fn d_max_subagent_depth() -> u32 {
    3
}

fn d_compaction_message_threshold() -> usize {
    60
}

fn d_restart_deadline_ms() -> u64 {
    10_000
}

fn d_max_queue_depth() -> usize {
    64
}
