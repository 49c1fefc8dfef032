//! Typed payloads carried over the event bus topics named in the external
//! interface: `cmd.request` (work), `cmd.surface` (fanout), `evt.request`
//! (fanout), and one tail-resumable per-request output topic per active
//! request. These are contracts, not a wire format — nothing here is
//! serialized to bytes; [`sa_bus::Topic`] carries the Rust values directly.

use serde::{Deserialize, Serialize};

use sa_domain::tool::Message;

/// How an [`super::scheduler`] lane should treat a newly-arrived request
/// relative to whatever is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Prompt,
    Steer,
    FollowUp,
    Interrupt,
}

/// Which surface originated a request; relays filter their fanout
/// subscription on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClient {
    Discord,
    Github,
    Unknown,
}

/// Optional preserved mode describing why a session became active, carried
/// through lifecycle publishes unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterSessionMode {
    Mention,
    Active,
}

/// Free-form hints carried on a request's `raw` field: cancel/steer control
/// bits plus chain-matching metadata for queued-cancel and
/// `targetMessageId` resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestRaw {
    #[serde(default)]
    pub cancel: bool,
    #[serde(default)]
    pub cancel_queued: bool,
    #[serde(default)]
    pub requires_active: bool,
    #[serde(default)]
    pub target_message_id: Option<String>,
    #[serde(default)]
    pub chain_message_ids: Vec<String>,
}

impl RequestRaw {
    /// True if `id` equals [`Self::target_message_id`] or appears in
    /// [`Self::chain_message_ids`] — the matching rule used by queued-cancel
    /// and active-cancel-by-target-message-id.
    pub fn chain_contains(&self, id: &str) -> bool {
        self.target_message_id.as_deref() == Some(id) || self.chain_message_ids.iter().any(|m| m == id)
    }
}

/// `CmdRequestMessage` — the payload of `cmd.request` (work mode, one
/// consumer: the scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdRequestMessage {
    pub request_id: String,
    pub session_id: String,
    pub request_client: RequestClient,
    #[serde(default)]
    pub router_session_mode: Option<RouterSessionMode>,
    pub queue: QueueMode,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub raw: RequestRaw,
    /// Present when this request resumes after a graceful restart.
    #[serde(default)]
    pub recovery: Option<RecoveryHint>,
}

/// The already-visible partial text for a request resuming after restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryHint {
    pub partial_text: Option<String>,
}

/// `CmdSurfaceOutputReanchor` — the payload of `cmd.surface` (fanout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdSurfaceOutputReanchor {
    pub request_id: String,
    pub inherit_reply_to: bool,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Lifecycle states published on `evt.request.lifecycle`, per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Queued,
    Running,
    Resolved,
    Cancelled,
    Failed,
}

/// Events published on the fanout `evt.request` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RequestEvent {
    Reply {
        request_id: String,
        session_id: String,
        request_client: RequestClient,
        reply_to: Option<String>,
    },
    LifecycleChanged {
        request_id: String,
        session_id: String,
        state: LifecycleState,
        detail: Option<String>,
        ts_ms: i64,
    },
}

/// Events published on the per-request tail-resumable output topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OutputEvent {
    DeltaText {
        delta: String,
    },
    DeltaReasoning {
        delta: String,
        #[serde(default)]
        seq: Option<u64>,
    },
    ToolCall {
        tool_call_id: String,
        status: ToolCallStatus,
        display: String,
        #[serde(default)]
        ok: Option<bool>,
        #[serde(default)]
        error: Option<String>,
        /// Wall-clock duration of the call, set only on `status: End`.
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    ResponseBinary {
        mime_type: String,
        data_base64: String,
        #[serde(default)]
        filename: Option<String>,
    },
    ResponseText {
        final_text: String,
        #[serde(default)]
        delivery: DeliveryMode,
        #[serde(default)]
        stats_for_nerds_line: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    Send,
    Skip,
}
