//! Output relay — bridges the per-request output topic to a surface's
//! streaming reply. One relay instance exists per active request; it is
//! created when `evt.request.reply` fires and torn down on idle timeout,
//! final text, or cancel.
//!
//! Event application is serialized through a single-task FIFO executor so a
//! concurrent reanchor can never interleave with a push (§4.4, §9 design
//! notes: "reanchor and event application must be mutually exclusive").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::surface::entity::{EntityMapper, NullEntityStore};

use super::contracts::{DeliveryMode, OutputEvent};

/// Default relay idle timeout, per §5 (overridden by
/// [`sa_domain::config::CoreConfig::relay_idle_timeout_ms`]).
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Reason a surface stream was aborted, surfaced to the adapter so it can
/// decide how to finalize the in-place message (freeze it, mark it
/// cancelled, or just stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Reanchor,
    Cancel,
    IdleTimeout,
}

/// External collaborator interface: the concrete Discord/GitHub/etc. surface
/// implementation. Only the interface is in scope here — the adapters
/// themselves are out of scope of this crate.
#[async_trait]
pub trait SurfaceAdapter: Send + Sync {
    /// Start a new outgoing stream for a session, optionally replying to a
    /// specific surface message. Returns an opaque stream handle.
    async fn start_stream(&self, session_id: &str, reply_to: Option<&str>) -> String;

    async fn push_text_delta(&self, stream: &str, delta: &str);
    async fn push_tool_status(&self, stream: &str, tool_call_id: &str, display: &str, ok: Option<bool>);
    async fn push_attachment(&self, stream: &str, mime_type: &str, data_base64: &str, filename: Option<&str>);

    /// Finish a stream with final text, returning created message refs plus
    /// the surface's designated "last" ref (used by the transcript store to
    /// link surface messages back to the request).
    async fn set_final_text(&self, stream: &str, final_text: &str) -> (Vec<String>, Option<String>);

    /// Abort a stream mid-flight. The adapter may freeze the partial text in
    /// place or rewrite it to a cancelled marker depending on `reason`.
    async fn abort_stream(&self, stream: &str, reason: AbortReason);
}

/// Latest known status line for one tool call, replayed verbatim when a
/// reanchor primes a fresh stream.
#[derive(Debug, Clone)]
struct ToolStatusEntry {
    display: String,
    ok: Option<bool>,
}

/// Mutable relay state guarded by the FIFO executor — only the executor task
/// ever touches this, so no lock is needed once routed through the channel.
struct RelayState {
    stream: String,
    visible_text: String,
    tool_status: HashMap<String, ToolStatusEntry>,
    reply_to: Option<String>,
}

enum RelayCommand {
    Output(OutputEvent),
    Reanchor { reply_to: Option<String> },
}

/// Handle to a live relay: cloneable, cheap, used by both the tail-event
/// pump and the reanchor command source to enqueue work on the same FIFO.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
    stream_token: Arc<AtomicU64>,
    idle_reset: Arc<tokio::sync::Notify>,
}

impl RelayHandle {
    pub fn apply_event(&self, event: OutputEvent) {
        self.idle_reset.notify_one();
        let _ = self.tx.send(RelayCommand::Output(event));
    }

    pub fn reanchor(&self, reply_to: Option<String>) {
        self.stream_token.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(RelayCommand::Reanchor { reply_to });
    }

    pub fn stream_token(&self) -> u64 {
        self.stream_token.load(Ordering::SeqCst)
    }
}

/// Spin up a relay for one request: starts the initial surface stream,
/// subscribes `tail` to the request's output topic from `begin`, and runs
/// the FIFO executor until final text, cancel, or idle timeout.
///
/// Returns a [`RelayHandle`] the caller can use to push a reanchor command
/// (e.g. in response to `cmd.surface`); the relay also self-registers its
/// event pump against `output_topic` and tears itself down without further
/// caller involvement.
pub fn spawn_relay<A: SurfaceAdapter + 'static>(
    adapter: Arc<A>,
    session_id: String,
    initial_reply_to: Option<String>,
    output_topic: Arc<sa_bus::Topic<OutputEvent>>,
    idle_timeout: Duration,
    entity_mapper: Option<Arc<EntityMapper<NullEntityStore>>>,
) -> RelayHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayCommand>();
    let stream_token = Arc::new(AtomicU64::new(0));
    let idle_reset = Arc::new(tokio::sync::Notify::new());

    let handle = RelayHandle {
        tx: tx.clone(),
        stream_token: stream_token.clone(),
        idle_reset: idle_reset.clone(),
    };

    // Tail-subscribe from the very beginning so events published before the
    // relay finished spinning up are not missed.
    let mut tail = output_topic.tail_from(None);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                envelope = tail.recv() => {
                    match envelope {
                        Some(env) => {
                            idle_reset.notify_one();
                            if tx.send(RelayCommand::Output(env.payload)).is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        let stream = adapter.start_stream(&session_id, initial_reply_to.as_deref()).await;
        let mut state = RelayState {
            stream,
            visible_text: String::new(),
            tool_status: HashMap::new(),
            reply_to: initial_reply_to,
        };

        loop {
            let command = tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(c) => c,
                    None => break,
                },
                _ = tokio::time::sleep(idle_timeout) => {
                    adapter.abort_stream(&state.stream, AbortReason::IdleTimeout).await;
                    tracing::warn!(session_id = %session_id, "relay idle timeout, stopping");
                    break;
                }
            };

            match command {
                RelayCommand::Output(event) => {
                    if apply_output_event(adapter.as_ref(), &mut state, event, entity_mapper.as_deref()).await {
                        break;
                    }
                }
                RelayCommand::Reanchor { reply_to } => {
                    adapter.abort_stream(&state.stream, AbortReason::Reanchor).await;
                    let new_reply_to = reply_to.or_else(|| state.reply_to.clone());
                    let new_stream = adapter.start_stream(&session_id, new_reply_to.as_deref()).await;
                    state.stream = new_stream;
                    state.reply_to = new_reply_to;

                    if !state.visible_text.is_empty() {
                        adapter.push_text_delta(&state.stream, &state.visible_text).await;
                    }
                    for (call_id, entry) in &state.tool_status {
                        adapter.push_tool_status(&state.stream, call_id, &entry.display, entry.ok).await;
                    }
                }
            }
        }
    });

    handle
}

/// Apply one output event to relay state via the adapter. Returns `true` if
/// the relay should stop after this event (final text, or an error that
/// best-effort-aborts the stream).
async fn apply_output_event<A: SurfaceAdapter>(
    adapter: &A,
    state: &mut RelayState,
    event: OutputEvent,
    entity_mapper: Option<&EntityMapper<NullEntityStore>>,
) -> bool {
    match event {
        OutputEvent::DeltaText { delta } => {
            let delta = match entity_mapper {
                Some(mapper) => mapper.rewrite_outgoing(&delta).await,
                None => delta,
            };
            state.visible_text.push_str(&delta);
            adapter.push_text_delta(&state.stream, &delta).await;
            false
        }
        OutputEvent::DeltaReasoning { .. } => {
            // Ignored by default; a surface adapter that wants to display
            // reasoning can subscribe to the topic directly instead.
            false
        }
        OutputEvent::ToolCall { tool_call_id, display, ok, .. } => {
            state
                .tool_status
                .insert(tool_call_id.clone(), ToolStatusEntry { display: display.clone(), ok });
            adapter.push_tool_status(&state.stream, &tool_call_id, &display, ok).await;
            false
        }
        OutputEvent::ResponseBinary { mime_type, data_base64, filename } => {
            adapter.push_attachment(&state.stream, &mime_type, &data_base64, filename.as_deref()).await;
            false
        }
        OutputEvent::ResponseText { final_text, delivery, .. } => {
            if delivery == DeliveryMode::Skip {
                adapter.abort_stream(&state.stream, AbortReason::Cancel).await;
                return true;
            }
            let final_text = match entity_mapper {
                Some(mapper) => mapper.rewrite_outgoing(&final_text).await,
                None => final_text,
            };
            let (_created, _last) = adapter.set_final_text(&state.stream, &final_text).await;
            tracing::debug!(chars = final_text.len(), "relay delivered final text");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start { reply_to: Option<String> },
        TextDelta(String),
        ToolStatus { id: String, display: String, ok: Option<bool> },
        Attachment { mime_type: String },
        FinalText(String),
        Abort(String /* debug repr of reason */),
    }

    #[derive(Default)]
    struct MockAdapter {
        calls: AsyncMutex<Vec<Call>>,
        next_stream_id: std::sync::atomic::AtomicU64,
    }

    impl MockAdapter {
        async fn calls(&self) -> Vec<Call> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl SurfaceAdapter for MockAdapter {
        async fn start_stream(&self, _session_id: &str, reply_to: Option<&str>) -> String {
            let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().await.push(Call::Start { reply_to: reply_to.map(String::from) });
            format!("stream-{id}")
        }

        async fn push_text_delta(&self, _stream: &str, delta: &str) {
            self.calls.lock().await.push(Call::TextDelta(delta.to_string()));
        }

        async fn push_tool_status(&self, _stream: &str, tool_call_id: &str, display: &str, ok: Option<bool>) {
            self.calls.lock().await.push(Call::ToolStatus {
                id: tool_call_id.to_string(),
                display: display.to_string(),
                ok,
            });
        }

        async fn push_attachment(&self, _stream: &str, mime_type: &str, _data_base64: &str, _filename: Option<&str>) {
            self.calls.lock().await.push(Call::Attachment { mime_type: mime_type.to_string() });
        }

        async fn set_final_text(&self, _stream: &str, final_text: &str) -> (Vec<String>, Option<String>) {
            self.calls.lock().await.push(Call::FinalText(final_text.to_string()));
            (vec!["msg-1".into()], Some("msg-1".into()))
        }

        async fn abort_stream(&self, _stream: &str, reason: AbortReason) {
            self.calls.lock().await.push(Call::Abort(format!("{reason:?}")));
        }
    }

    #[tokio::test]
    async fn relay_delivers_deltas_then_final_text_in_order() {
        let adapter = Arc::new(MockAdapter::default());
        let topic: Arc<sa_bus::Topic<OutputEvent>> = Arc::new(sa_bus::Topic::new(256, 256));
        let _handle = spawn_relay(
            adapter.clone(),
            "s1".into(),
            Some("orig-msg".into()),
            topic.clone(),
            Duration::from_secs(3600),
            None,
        );

        // Give the relay a moment to start its stream before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        topic.publish(OutputEvent::DeltaText { delta: "Hello".into() });
        topic.publish(OutputEvent::DeltaText { delta: ", world".into() });
        topic.publish(OutputEvent::ResponseText {
            final_text: "Hello, world".into(),
            delivery: DeliveryMode::Send,
            stats_for_nerds_line: None,
        });

        let mut calls = Vec::new();
        for _ in 0..100 {
            calls = adapter.calls().await;
            if calls.iter().any(|c| matches!(c, Call::FinalText(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            calls,
            vec![
                Call::Start { reply_to: Some("orig-msg".into()) },
                Call::TextDelta("Hello".into()),
                Call::TextDelta(", world".into()),
                Call::FinalText("Hello, world".into()),
            ]
        );
    }

    /// Testable property #9: output order is preserved under reanchor — no
    /// event applied before the reanchor leaks into the fresh stream out of
    /// order, and the fresh stream is primed with the full accumulated text
    /// exactly once.
    #[tokio::test]
    async fn reanchor_primes_fresh_stream_with_accumulated_state() {
        let adapter = Arc::new(MockAdapter::default());
        let topic: Arc<sa_bus::Topic<OutputEvent>> = Arc::new(sa_bus::Topic::new(256, 256));
        let handle = spawn_relay(
            adapter.clone(),
            "s1".into(),
            Some("orig-msg".into()),
            topic.clone(),
            Duration::from_secs(3600),
            None,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        topic.publish(OutputEvent::DeltaText { delta: "partial".into() });
        topic.publish(OutputEvent::ToolCall {
            tool_call_id: "c1".into(),
            status: super::super::contracts::ToolCallStatus::Start,
            display: "running fs_read".into(),
            ok: None,
            error: None,
        });

        for _ in 0..100 {
            if adapter.calls().await.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.reanchor(Some("new-msg".into()));

        for _ in 0..100 {
            let calls = adapter.calls().await;
            if calls.iter().any(|c| matches!(c, Call::Start { reply_to: Some(r) } if r == "new-msg")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let calls = adapter.calls().await;
        let reanchor_start_pos = calls
            .iter()
            .position(|c| matches!(c, Call::Start { reply_to: Some(r) } if r == "new-msg"))
            .expect("reanchor should have started a fresh stream");

        // An abort-for-reanchor precedes the fresh stream start.
        assert!(calls[..reanchor_start_pos].iter().any(|c| matches!(c, Call::Abort(r) if r == "Reanchor")));
        // The fresh stream is primed with the accumulated text and replayed
        // tool status strictly after its own start.
        let primed_text = calls[reanchor_start_pos..]
            .iter()
            .any(|c| matches!(c, Call::TextDelta(t) if t == "partial"));
        let primed_tool = calls[reanchor_start_pos..]
            .iter()
            .any(|c| matches!(c, Call::ToolStatus { id, .. } if id == "c1"));
        assert!(primed_text);
        assert!(primed_tool);
    }

    #[tokio::test]
    async fn cancel_delivery_skip_aborts_stream_without_final_text() {
        let adapter = Arc::new(MockAdapter::default());
        let topic: Arc<sa_bus::Topic<OutputEvent>> = Arc::new(sa_bus::Topic::new(256, 256));
        let _handle =
            spawn_relay(adapter.clone(), "s1".into(), None, topic.clone(), Duration::from_secs(3600), None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        topic.publish(OutputEvent::ResponseText {
            final_text: String::new(),
            delivery: DeliveryMode::Skip,
            stats_for_nerds_line: None,
        });

        for _ in 0..100 {
            if adapter.calls().await.iter().any(|c| matches!(c, Call::Abort(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let calls = adapter.calls().await;
        assert!(!calls.iter().any(|c| matches!(c, Call::FinalText(_))));
        assert!(calls.iter().any(|c| matches!(c, Call::Abort(r) if r == "Cancel")));
    }
}
