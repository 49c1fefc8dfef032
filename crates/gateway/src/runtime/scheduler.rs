//! Session scheduler — one serial execution lane per session id, draining a
//! typed queue of [`EnqueuedRequest`]s through a pluggable [`RequestDriver`].
//!
//! This module owns only routing and queue bookkeeping; actually running an
//! agent turn is delegated to a `RequestDriver` implementation (the
//! production one lives in [`super::driver`]) so the scheduling logic above
//! can be tested without spinning up a real LLM call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sa_domain::tool::{Message, MessageContent, Role};

use super::contracts::{
    CmdRequestMessage, LifecycleState, QueueMode, RecoveryHint, RequestClient, RequestEvent,
    RequestRaw,
};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("cmd.request missing required headers (request_id/session_id)")]
    MissingHeaders,
}

/// One accepted `cmd.request`, alive from enqueue until its run terminates
/// or it is cancelled while queued (§3.2, §3.3 invariant 2).
#[derive(Debug, Clone)]
pub struct EnqueuedRequest {
    pub request_id: String,
    pub session_id: String,
    pub request_client: RequestClient,
    pub queue: QueueMode,
    pub messages: Vec<Message>,
    pub model_override: Option<String>,
    pub raw: RequestRaw,
    pub recovery: Option<RecoveryHint>,
}

impl EnqueuedRequest {
    fn from_cmd(cmd: CmdRequestMessage) -> Self {
        Self {
            request_id: cmd.request_id,
            session_id: cmd.session_id,
            request_client: cmd.request_client,
            queue: cmd.queue,
            messages: cmd.messages,
            model_override: cmd.model_override,
            raw: cmd.raw,
            recovery: cmd.recovery,
        }
    }
}

/// A control signal applied to an already-running agent (§4.2 "Applying to
/// the running agent").
#[derive(Debug, Clone)]
pub enum ActiveControl {
    Steer(Vec<Message>),
    FollowUp(Vec<Message>),
    CancelActive,
    Interrupt(Vec<Message>),
}

/// Drives one [`EnqueuedRequest`] to completion, and delivers control
/// signals to whatever is currently running for a session. Implemented by
/// [`super::driver`] in production, and by a recording mock in tests.
#[async_trait]
pub trait RequestDriver: Send + Sync {
    async fn run(&self, session_id: &str, request: EnqueuedRequest);
    async fn apply_control(&self, session_id: &str, request_id: &str, control: ActiveControl);
}

struct SessionLane {
    running: bool,
    active_request_id: Option<String>,
    active_raw: Option<RequestRaw>,
    /// The full request currently being driven, kept (not just its id) so a
    /// graceful-restart snapshot can be rebuilt from live lane state without
    /// reaching back into the driver.
    active_request: Option<EnqueuedRequest>,
    queue: VecDeque<EnqueuedRequest>,
    /// Tool-call ids already compacted in the model-facing view for this
    /// lane; per-lane process-wide state per the design notes, never shared
    /// across lanes.
    compacted_tool_call_ids: HashSet<String>,
}

impl SessionLane {
    fn new() -> Self {
        Self {
            running: false,
            active_request_id: None,
            active_raw: None,
            active_request: None,
            queue: VecDeque::new(),
            compacted_tool_call_ids: HashSet::new(),
        }
    }
}

/// A point-in-time read of one session lane's in-flight and queued work,
/// used to build a [`sa_restart_store::RecoverySnapshot`] (§4.5).
pub struct LaneSnapshot {
    pub session_id: String,
    pub active: Option<EnqueuedRequest>,
    pub queued: Vec<EnqueuedRequest>,
}

pub struct Scheduler<D: RequestDriver> {
    lanes: Mutex<HashMap<String, SessionLane>>,
    draining: AtomicBool,
    driver: Arc<D>,
    events: Arc<sa_bus::Topic<RequestEvent>>,
}

impl<D: RequestDriver + 'static> Scheduler<D> {
    pub fn new(driver: Arc<D>, events: Arc<sa_bus::Topic<RequestEvent>>) -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            driver,
            events,
        })
    }

    /// Stop accepting new work; every subsequent `cmd.request` is dropped
    /// (and considered acknowledged) until the process exits.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Number of requests currently queued for a session (0 if the lane
    /// doesn't exist). Test/observability helper.
    pub fn queue_len(&self, session_id: &str) -> usize {
        self.lanes.lock().get(session_id).map_or(0, |l| l.queue.len())
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.lanes.lock().get(session_id).map_or(false, |l| l.running)
    }

    pub fn active_request_id(&self, session_id: &str) -> Option<String> {
        self.lanes.lock().get(session_id).and_then(|l| l.active_request_id.clone())
    }

    /// True if any lane is currently draining. Used by the graceful-shutdown
    /// listener to decide when it's safe to snapshot (§4.5, §6.3).
    pub fn any_lane_running(&self) -> bool {
        self.lanes.lock().values().any(|l| l.running)
    }

    /// Read-only snapshot of every lane's active + queued requests, used to
    /// build a [`sa_restart_store::RecoverySnapshot`]. Does not mutate any
    /// lane state.
    pub fn snapshot_lanes(&self) -> Vec<LaneSnapshot> {
        self.lanes
            .lock()
            .iter()
            .map(|(session_id, lane)| LaneSnapshot {
                session_id: session_id.clone(),
                active: lane.active_request.clone(),
                queued: lane.queue.iter().cloned().collect(),
            })
            .collect()
    }

    /// Re-enqueue recovered work from a loaded [`sa_restart_store::RecoverySnapshot`]
    /// (§4.5, §6.3, scenario S6). Active entries resume via a recovery-hint
    /// prompt built by the driver; queued entries simply rejoin the queue.
    /// Drain is kicked for every affected session so recovered work actually
    /// runs instead of sitting idle.
    pub fn restore_from_snapshot(self: &Arc<Self>, snapshot: &sa_restart_store::RecoverySnapshot) {
        let mut affected_sessions: Vec<String> = Vec::new();
        {
            let mut lanes = self.lanes.lock();
            for entry in &snapshot.agents {
                let lane = lanes.entry(entry.session_id.clone()).or_insert_with(SessionLane::new);
                let recovered = EnqueuedRequest {
                    request_id: entry.request_id.clone(),
                    session_id: entry.session_id.clone(),
                    request_client: RequestClient::Unknown,
                    queue: QueueMode::Prompt,
                    messages: entry.messages.clone(),
                    model_override: None,
                    raw: RequestRaw::default(),
                    recovery: entry.recovery.as_ref().map(|r| RecoveryHint {
                        partial_text: r.partial_text.clone(),
                    }),
                };
                lane.queue.push_back(recovered);
                if !affected_sessions.contains(&entry.session_id) {
                    affected_sessions.push(entry.session_id.clone());
                }
            }
        }
        for session_id in affected_sessions {
            self.start_drain_if_idle(session_id);
        }
    }

    /// Entry point for a `cmd.request` bus message (§4.2 steps 1-7).
    pub async fn handle_cmd_request(self: &Arc<Self>, cmd: CmdRequestMessage) -> Result<(), SchedulerError> {
        if cmd.request_id.is_empty() || cmd.session_id.is_empty() {
            return Err(SchedulerError::MissingHeaders);
        }

        if self.draining.load(Ordering::SeqCst) {
            tracing::debug!(request_id = %cmd.request_id, "dropping cmd.request: scheduler is draining");
            return Ok(());
        }

        if cmd.raw.cancel && cmd.raw.cancel_queued {
            self.handle_queued_cancel(&cmd).await;
            return Ok(());
        }

        let session_id = cmd.session_id.clone();
        let request = EnqueuedRequest::from_cmd(cmd);
        self.route(session_id, request).await;
        Ok(())
    }

    async fn handle_queued_cancel(self: &Arc<Self>, cmd: &CmdRequestMessage) {
        let session_id = &cmd.session_id;
        let target_request_id = &cmd.request_id;
        let target_msg_id = cmd.raw.target_message_id.as_deref();

        let removed_any = {
            let mut lanes = self.lanes.lock();
            match lanes.get_mut(session_id) {
                Some(lane) => {
                    let before = lane.queue.len();
                    lane.queue.retain(|entry| {
                        let by_request_id = entry.request_id == *target_request_id;
                        let by_chain = target_msg_id.is_some_and(|tid| entry.raw.chain_contains(tid));
                        !(by_request_id || by_chain)
                    });
                    lane.queue.len() != before
                }
                None => false,
            }
        };

        if removed_any {
            self.publish_lifecycle(
                session_id,
                target_request_id,
                LifecycleState::Cancelled,
                Some("cancelled while queued".into()),
            );
            return;
        }

        let active_matches = {
            let lanes = self.lanes.lock();
            lanes.get(session_id).is_some_and(|lane| {
                lane.active_request_id.as_deref() == Some(target_request_id.as_str())
                    || target_msg_id.is_some_and(|tid| {
                        lane.active_raw.as_ref().is_some_and(|raw| raw.chain_contains(tid))
                    })
            })
        };

        if active_matches {
            self.driver
                .apply_control(session_id, target_request_id, ActiveControl::CancelActive)
                .await;
        }
    }

    async fn route(self: &Arc<Self>, session_id: String, request: EnqueuedRequest) {
        enum Outcome {
            Drop,
            Enqueue,
            EnqueueAndDrain,
            Apply(ActiveControl),
        }

        let outcome = {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(session_id.clone()).or_insert_with(SessionLane::new);

            if !lane.running {
                if request.raw.cancel || (request.raw.requires_active && request.queue != QueueMode::Prompt) {
                    Outcome::Drop
                } else {
                    lane.queue.push_back(request.clone());
                    Outcome::EnqueueAndDrain
                }
            } else if lane.active_request_id.as_deref() == Some(request.request_id.as_str()) {
                Outcome::Apply(control_for(&request))
            } else if request.raw.requires_active || request.raw.cancel {
                Outcome::Drop
            } else {
                lane.queue.push_back(request.clone());
                Outcome::Enqueue
            }
        };

        match outcome {
            Outcome::Drop => {}
            Outcome::Apply(control) => {
                self.driver.apply_control(&session_id, &request.request_id, control).await;
            }
            Outcome::Enqueue => {
                self.publish_lifecycle(&session_id, &request.request_id, LifecycleState::Queued, None);
            }
            Outcome::EnqueueAndDrain => {
                self.publish_lifecycle(&session_id, &request.request_id, LifecycleState::Queued, None);
                self.start_drain_if_idle(session_id);
            }
        }
    }

    fn start_drain_if_idle(self: &Arc<Self>, session_id: String) {
        let should_spawn = {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(session_id.clone()).or_insert_with(SessionLane::new);
            if lane.running {
                false
            } else {
                lane.running = true;
                true
            }
        };
        if !should_spawn {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drain_loop(session_id).await;
        });
    }

    async fn drain_loop(self: Arc<Self>, session_id: String) {
        loop {
            let next = {
                let mut lanes = self.lanes.lock();
                let lane = match lanes.get_mut(&session_id) {
                    Some(l) => l,
                    None => return,
                };
                match lane.queue.pop_front() {
                    None => {
                        lane.running = false;
                        lane.active_request_id = None;
                        lane.active_raw = None;
                        lane.active_request = None;
                        None
                    }
                    Some(mut head) => {
                        let mut matched = Vec::new();
                        let mut remaining = VecDeque::new();
                        while let Some(entry) = lane.queue.pop_front() {
                            if entry.request_id == head.request_id {
                                matched.push(entry);
                            } else {
                                remaining.push_back(entry);
                            }
                        }
                        lane.queue = remaining;
                        if !matched.is_empty() {
                            let mut all = vec![head.clone()];
                            all.extend(matched);
                            head.messages = merge_same_request_messages(&all);
                        }
                        lane.active_request_id = Some(head.request_id.clone());
                        lane.active_raw = Some(head.raw.clone());
                        lane.active_request = Some(head.clone());
                        Some(head)
                    }
                }
            };

            let Some(request) = next else { break };
            self.driver.run(&session_id, request).await;
        }
    }

    fn publish_lifecycle(
        &self,
        session_id: &str,
        request_id: &str,
        state: LifecycleState,
        detail: Option<String>,
    ) {
        self.events.publish(RequestEvent::LifecycleChanged {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            state,
            detail,
            ts_ms: chrono::Utc::now().timestamp_millis(),
        });
    }
}

fn control_for(request: &EnqueuedRequest) -> ActiveControl {
    match request.queue {
        QueueMode::Steer => ActiveControl::Steer(request.messages.clone()),
        QueueMode::FollowUp | QueueMode::Prompt => ActiveControl::FollowUp(request.messages.clone()),
        QueueMode::Interrupt => {
            if request.raw.cancel {
                ActiveControl::CancelActive
            } else {
                ActiveControl::Interrupt(request.messages.clone())
            }
        }
    }
}

/// Merge the messages of every queued entry sharing a request id into the
/// initial prompt for that request (§4.2 "Merging initial queued
/// messages", testable property #5). String user contents are joined with
/// a blank-line separator in arrival order; if any entry's user content is
/// multipart (carries attachments), the newest such entry wins verbatim and
/// earlier plain-string contents are discarded.
pub fn merge_same_request_messages(entries: &[EnqueuedRequest]) -> Vec<Message> {
    let mut latest_multipart: Option<Message> = None;
    let mut joined_text_parts: Vec<String> = Vec::new();
    let mut non_user_messages: Vec<Message> = Vec::new();

    for entry in entries {
        for message in &entry.messages {
            if message.role != Role::User {
                non_user_messages.push(message.clone());
                continue;
            }
            match &message.content {
                MessageContent::Text(text) => joined_text_parts.push(text.clone()),
                MessageContent::Parts(_) => latest_multipart = Some(message.clone()),
            }
        }
    }

    let mut result = non_user_messages;
    if let Some(multipart) = latest_multipart {
        result.push(multipart);
    } else if !joined_text_parts.is_empty() {
        result.push(Message::user(joined_text_parts.join("\n\n")));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::tool::ContentPart;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct MockDriver {
        runs: AsyncMutex<Vec<(String, String)>>,
        controls: AsyncMutex<Vec<(String, String, String)>>,
        run_delay: AsyncMutex<Duration>,
    }

    impl MockDriver {
        fn new() -> Self {
            Self::default()
        }

        async fn set_delay(&self, d: Duration) {
            *self.run_delay.lock().await = d;
        }
    }

    #[async_trait]
    impl RequestDriver for MockDriver {
        async fn run(&self, session_id: &str, request: EnqueuedRequest) {
            let delay = *self.run_delay.lock().await;
            if !delay.is_zero() {
                sleep(delay).await;
            }
            self.runs
                .lock()
                .await
                .push((session_id.to_string(), request.request_id));
        }

        async fn apply_control(&self, session_id: &str, request_id: &str, control: ActiveControl) {
            let label = match control {
                ActiveControl::Steer(_) => "steer",
                ActiveControl::FollowUp(_) => "follow_up",
                ActiveControl::CancelActive => "cancel",
                ActiveControl::Interrupt(_) => "interrupt",
            };
            self.controls.lock().await.push((
                session_id.to_string(),
                request_id.to_string(),
                label.to_string(),
            ));
        }
    }

    fn cmd(request_id: &str, session_id: &str, queue: QueueMode) -> CmdRequestMessage {
        CmdRequestMessage {
            request_id: request_id.into(),
            session_id: session_id.into(),
            request_client: RequestClient::Discord,
            router_session_mode: None,
            queue,
            messages: vec![Message::user("hi")],
            model_override: None,
            raw: RequestRaw::default(),
            recovery: None,
        }
    }

    fn scheduler() -> (Arc<Scheduler<MockDriver>>, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new());
        let events: Arc<sa_bus::Topic<RequestEvent>> = Arc::new(sa_bus::Topic::new(256, 256));
        (Scheduler::new(driver.clone(), events), driver)
    }

    /// Scenario S1 (happy path): a single prompt on an idle lane drains.
    #[tokio::test]
    async fn happy_path_drains_single_request() {
        let (scheduler, driver) = scheduler();
        scheduler
            .handle_cmd_request(cmd("r1", "s1", QueueMode::Prompt))
            .await
            .unwrap();

        for _ in 0..50 {
            if !driver.runs.lock().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(driver.runs.lock().await.as_slice(), &[("s1".to_string(), "r1".to_string())]);
        // Lane settles back to idle once the queue drains.
        for _ in 0..50 {
            if !scheduler.is_running("s1") {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!scheduler.is_running("s1"));
    }

    /// Scenario S2: cancelled while queued.
    #[tokio::test]
    async fn cancelled_while_queued_removes_only_target() {
        let (scheduler, driver) = scheduler();
        driver.set_delay(Duration::from_millis(200)).await;

        scheduler.handle_cmd_request(cmd("r1", "s1", QueueMode::Prompt)).await.unwrap();
        sleep(Duration::from_millis(20)).await; // let r1 start running
        scheduler.handle_cmd_request(cmd("r2", "s1", QueueMode::Prompt)).await.unwrap();
        assert_eq!(scheduler.queue_len("s1"), 1);

        let mut cancel = cmd("r3", "s1", QueueMode::Prompt);
        cancel.raw.cancel = true;
        cancel.raw.cancel_queued = true;
        cancel.request_id = "r2".into();
        scheduler.handle_cmd_request(cancel).await.unwrap();

        assert_eq!(scheduler.queue_len("s1"), 0);
    }

    /// Testable property #4: queue cancel correctness — chain-matched
    /// entries are removed too, unrelated entries survive.
    #[tokio::test]
    async fn queue_cancel_matches_by_chain_id() {
        let (scheduler, driver) = scheduler();
        driver.set_delay(Duration::from_millis(200)).await;

        scheduler.handle_cmd_request(cmd("r1", "s1", QueueMode::Prompt)).await.unwrap();
        sleep(Duration::from_millis(20)).await;

        let mut r2 = cmd("r2", "s1", QueueMode::Prompt);
        r2.raw.chain_message_ids = vec!["m-target".into()];
        scheduler.handle_cmd_request(r2).await.unwrap();

        let r3 = cmd("r3", "s1", QueueMode::Prompt);
        scheduler.handle_cmd_request(r3).await.unwrap();
        assert_eq!(scheduler.queue_len("s1"), 2);

        let mut cancel = cmd("cancel-1", "s1", QueueMode::Prompt);
        cancel.raw.cancel = true;
        cancel.raw.cancel_queued = true;
        cancel.raw.target_message_id = Some("m-target".into());
        scheduler.handle_cmd_request(cancel).await.unwrap();

        assert_eq!(scheduler.queue_len("s1"), 1);
    }

    /// Scenario S3: cancel against the active request applies a control
    /// signal instead of mutating the queue.
    #[tokio::test]
    async fn cancel_active_request_applies_control() {
        let (scheduler, driver) = scheduler();
        driver.set_delay(Duration::from_millis(200)).await;

        scheduler.handle_cmd_request(cmd("r1", "s1", QueueMode::Prompt)).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.active_request_id("s1").as_deref(), Some("r1"));

        let mut cancel = cmd("r1", "s1", QueueMode::Interrupt);
        cancel.raw.cancel = true;
        cancel.raw.requires_active = true;
        scheduler.handle_cmd_request(cancel).await.unwrap();

        let controls = driver.controls.lock().await;
        assert_eq!(controls.as_slice(), &[("s1".to_string(), "r1".to_string(), "cancel".to_string())]);
    }

    /// Testable property #3: serial lane invariant — two requests for
    /// different sessions run concurrently, but a lane never reports more
    /// than one active request.
    #[tokio::test]
    async fn serial_lane_invariant_per_session() {
        let (scheduler, driver) = scheduler();
        driver.set_delay(Duration::from_millis(50)).await;

        scheduler.handle_cmd_request(cmd("r1", "s1", QueueMode::Prompt)).await.unwrap();
        scheduler.handle_cmd_request(cmd("r2", "s1", QueueMode::Prompt)).await.unwrap();
        scheduler.handle_cmd_request(cmd("r3", "s2", QueueMode::Prompt)).await.unwrap();

        sleep(Duration::from_millis(10)).await;
        // s1 has exactly one active request even though r2 is queued behind it.
        assert_eq!(scheduler.active_request_id("s1").as_deref(), Some("r1"));
        // s2's lane is independent and also has exactly one active request.
        assert_eq!(scheduler.active_request_id("s2").as_deref(), Some("r3"));

        for _ in 0..50 {
            if driver.runs.lock().await.len() == 3 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let runs = driver.runs.lock().await;
        // r1 must have completed before r2 started, proving serial order.
        let r1_pos = runs.iter().position(|(_, id)| id == "r1").unwrap();
        let r2_pos = runs.iter().position(|(_, id)| id == "r2").unwrap();
        assert!(r1_pos < r2_pos);
    }

    /// Testable property #5: merge invariant.
    #[test]
    fn merge_joins_string_user_contents_with_blank_line() {
        let e1 = EnqueuedRequest {
            request_id: "r1".into(),
            session_id: "s1".into(),
            request_client: RequestClient::Discord,
            queue: QueueMode::Prompt,
            messages: vec![Message::user("first")],
            model_override: None,
            raw: RequestRaw::default(),
            recovery: None,
        };
        let mut e2 = e1.clone();
        e2.messages = vec![Message::user("second")];

        let merged = merge_same_request_messages(&[e1, e2]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].content.extract_all_text(), "first\n\nsecond");
    }

    #[test]
    fn merge_prefers_newest_multipart_over_earlier_strings() {
        let mut e1 = EnqueuedRequest {
            request_id: "r1".into(),
            session_id: "s1".into(),
            request_client: RequestClient::Discord,
            queue: QueueMode::Prompt,
            messages: vec![Message::user("string part")],
            model_override: None,
            raw: RequestRaw::default(),
            recovery: None,
        };
        let mut e2 = e1.clone();
        e2.messages = vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text { text: "with attachment".into() }]),
        }];
        e1.messages.push(Message::user("ignored too"));

        let merged = merge_same_request_messages(&[e1, e2]);
        assert_eq!(merged.len(), 1);
        assert!(matches!(merged[0].content, MessageContent::Parts(_)));
    }

    #[tokio::test]
    async fn missing_headers_is_rejected() {
        let (scheduler, _driver) = scheduler();
        let mut c = cmd("", "s1", QueueMode::Prompt);
        c.request_id = String::new();
        let err = scheduler.handle_cmd_request(c).await.unwrap_err();
        assert!(matches!(err, SchedulerError::MissingHeaders));
    }

    /// Open question pinned: when a cancel's `targetMessageId` matches both
    /// a queued entry and the active request's chain, only the queue match
    /// is cancelled — `handle_queued_cancel` escalates to the active request
    /// only when no queue entry matched, so a single cancel message hits at
    /// most one of {queue, active}, never both.
    #[tokio::test]
    async fn target_message_id_cancel_hits_both_queued_and_active_matches() {
        let (scheduler, driver) = scheduler();
        driver.set_delay(Duration::from_millis(200)).await;

        let mut r1 = cmd("r1", "s1", QueueMode::Prompt);
        r1.raw.target_message_id = Some("m-shared".into());
        scheduler.handle_cmd_request(r1).await.unwrap();
        sleep(Duration::from_millis(20)).await; // r1 becomes active

        let mut r2 = cmd("r2", "s1", QueueMode::Prompt);
        r2.raw.chain_message_ids = vec!["m-shared".into()];
        scheduler.handle_cmd_request(r2).await.unwrap();
        assert_eq!(scheduler.queue_len("s1"), 1);

        let mut cancel = cmd("cancel-1", "s1", QueueMode::Prompt);
        cancel.raw.cancel = true;
        cancel.raw.cancel_queued = true;
        cancel.raw.target_message_id = Some("m-shared".into());
        scheduler.handle_cmd_request(cancel).await.unwrap();

        // Queued entry r2 removed...
        assert_eq!(scheduler.queue_len("s1"), 0);
        // ...and the active r1 never received a cancel control, because
        // handle_queued_cancel only escalates to the active request when no
        // queue entries matched. Pin that precedence explicitly: re-issue
        // the same target against an empty queue to confirm the active-path
        // still works on its own.
        let mut cancel2 = cmd("cancel-2", "s1", QueueMode::Prompt);
        cancel2.raw.cancel = true;
        cancel2.raw.cancel_queued = true;
        cancel2.raw.target_message_id = Some("m-shared".into());
        scheduler.handle_cmd_request(cancel2).await.unwrap();
        let controls = driver.controls.lock().await;
        assert_eq!(controls.as_slice(), &[("s1".to_string(), "r1".to_string(), "cancel".to_string())]);
    }

    #[tokio::test]
    async fn draining_scheduler_drops_new_requests() {
        let (scheduler, driver) = scheduler();
        scheduler.begin_drain();
        scheduler.handle_cmd_request(cmd("r1", "s1", QueueMode::Prompt)).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(driver.runs.lock().await.is_empty());
        assert_eq!(scheduler.queue_len("s1"), 0);
    }
}
