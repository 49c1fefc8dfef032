//! In-process event bus contract.
//!
//! Mirrors the durable pub/sub the orchestrator is specified against: typed
//! per-topic streams with two subscription modes (`work` — exactly one
//! consumer drains the queue; `fanout` — every subscriber sees every
//! message) plus cursor-based resume for tail subscriptions that must not
//! miss messages published before they subscribed.
//!
//! This crate is the single-node, in-memory stand-in for what would be a
//! durable bus (e.g. a message broker) in a multi-instance deployment. Only
//! the contract — not a wire format — is meant to be load-bearing here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Monotonic per-topic sequence number. Used as the cursor for tail resume.
pub type Seq = u64;

/// One published message plus its sequence number.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub seq: Seq,
    pub payload: T,
}

/// A typed topic supporting fanout broadcast, a single-consumer work queue,
/// and cursor-resumable tail subscriptions backed by a bounded retained log.
pub struct Topic<T: Clone + Send + 'static> {
    next_seq: AtomicU64,
    retained: Mutex<VecDeque<Envelope<T>>>,
    retain_cap: usize,
    fanout_tx: broadcast::Sender<Envelope<T>>,
    work_tx: mpsc::UnboundedSender<Envelope<T>>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope<T>>>>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// `retain_cap` bounds how many past messages a late tail subscriber can
    /// replay; `fanout_capacity` bounds the broadcast channel's lag buffer.
    pub fn new(retain_cap: usize, fanout_capacity: usize) -> Self {
        let (fanout_tx, _) = broadcast::channel(fanout_capacity.max(1));
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Self {
            next_seq: AtomicU64::new(0),
            retained: Mutex::new(VecDeque::new()),
            retain_cap,
            fanout_tx,
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
        }
    }

    /// Publish a message. Returns its sequence number.
    ///
    /// Delivered to: the retained log (for tail resume), every fanout
    /// subscriber (best-effort — a lagging subscriber drops old messages,
    /// never ordering), and the work queue (exactly one consumer will see
    /// it, in FIFO order, no drops).
    pub fn publish(&self, payload: T) -> Seq {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope { seq, payload };

        {
            let mut retained = self.retained.lock();
            retained.push_back(envelope.clone());
            while retained.len() > self.retain_cap {
                retained.pop_front();
            }
        }

        // Fanout: no receivers is not an error (nothing has subscribed yet).
        let _ = self.fanout_tx.send(envelope.clone());
        // Work queue: the receiver can only be dropped if taken and dropped
        // by the sole consumer; publishing after that is a programming
        // error upstream, but we must not panic the publisher for it.
        let _ = self.work_tx.send(envelope);

        seq
    }

    /// Take the single work-mode consumer. Returns `None` if already taken.
    pub fn subscribe_work(&self) -> Option<WorkSubscriber<T>> {
        self.work_rx.lock().take().map(WorkSubscriber)
    }

    /// Subscribe in fanout mode: only messages published after this call
    /// are observed (use [`Topic::tail_from`] to also replay history).
    pub fn subscribe_fanout(&self) -> FanoutSubscriber<T> {
        FanoutSubscriber(self.fanout_tx.subscribe())
    }

    /// Subscribe from a cursor: replays retained messages with
    /// `seq >= from` (or all retained messages if `from` is `None`), then
    /// continues with live fanout delivery. Messages published between the
    /// replay snapshot and the live subscription starting are deduplicated
    /// by sequence number, so no message is ever delivered twice nor
    /// skipped.
    pub fn tail_from(&self, from: Option<Seq>) -> TailSubscriber<T> {
        // Subscribe to live fanout *before* snapshotting the retained log,
        // so any message published concurrently is captured by one path or
        // the other (never both, never neither): the snapshot is read
        // after the subscription is registered, so anything the broadcast
        // channel sees after this point is also visible in the snapshot
        // it raced with, and TailSubscriber::recv's `last_seq` de-dups it.
        let live = self.fanout_tx.subscribe();
        let backlog: Vec<Envelope<T>> = {
            let retained = self.retained.lock();
            retained
                .iter()
                .filter(|e| from.map_or(true, |cursor| e.seq >= cursor))
                .cloned()
                .collect()
        };
        TailSubscriber {
            backlog: backlog.into(),
            live,
            last_seq: from.map(|c| c.wrapping_sub(1)),
        }
    }

    pub fn retained_len(&self) -> usize {
        self.retained.lock().len()
    }
}

/// Single-consumer handle. A second `subscribe_work` call on the same
/// topic returns `None` — work mode is exactly-one-consumer by contract.
pub struct WorkSubscriber<T>(mpsc::UnboundedReceiver<Envelope<T>>);

impl<T> WorkSubscriber<T> {
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        self.0.recv().await
    }
}

/// Broadcast handle: every subscriber observes every message published
/// after it subscribed.
pub struct FanoutSubscriber<T: Clone>(broadcast::Receiver<Envelope<T>>);

impl<T: Clone> FanoutSubscriber<T> {
    /// Returns `None` only if the topic itself has been dropped; a lagged
    /// subscriber silently skips ahead (matches broadcast-channel semantics
    /// — acceptable for fanout lifecycle notifications, never used for the
    /// output topic where ordering must be exact).
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        loop {
            match self.0.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Cursor-resumable subscriber: drains retained backlog first, then
/// switches to live delivery, skipping anything already seen.
pub struct TailSubscriber<T: Clone> {
    backlog: VecDeque<Envelope<T>>,
    live: broadcast::Receiver<Envelope<T>>,
    last_seq: Option<Seq>,
}

impl<T: Clone> TailSubscriber<T> {
    pub async fn recv(&mut self) -> Option<Envelope<T>> {
        loop {
            if let Some(envelope) = self.backlog.pop_front() {
                if self.last_seq.map_or(false, |last| envelope.seq <= last) {
                    continue;
                }
                self.last_seq = Some(envelope.seq);
                return Some(envelope);
            }

            match self.live.recv().await {
                Ok(envelope) => {
                    if self.last_seq.map_or(false, |last| envelope.seq <= last) {
                        continue;
                    }
                    self.last_seq = Some(envelope.seq);
                    return Some(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn work_mode_single_consumer_fifo() {
        let topic: Topic<i32> = Topic::new(16, 16);
        topic.publish(1);
        topic.publish(2);
        topic.publish(3);

        let mut sub = topic.subscribe_work().unwrap();
        assert_eq!(sub.recv().await.unwrap().payload, 1);
        assert_eq!(sub.recv().await.unwrap().payload, 2);
        assert_eq!(sub.recv().await.unwrap().payload, 3);
    }

    #[tokio::test]
    async fn work_mode_second_subscriber_gets_none() {
        let topic: Topic<i32> = Topic::new(16, 16);
        let _sub1 = topic.subscribe_work().unwrap();
        assert!(topic.subscribe_work().is_none());
    }

    #[tokio::test]
    async fn fanout_mode_every_subscriber_sees_every_message() {
        let topic: Topic<i32> = Topic::new(16, 16);
        let mut sub1 = topic.subscribe_fanout();
        let mut sub2 = topic.subscribe_fanout();

        topic.publish(42);

        assert_eq!(sub1.recv().await.unwrap().payload, 42);
        assert_eq!(sub2.recv().await.unwrap().payload, 42);
    }

    #[tokio::test]
    async fn tail_from_none_replays_all_retained() {
        let topic: Topic<i32> = Topic::new(16, 16);
        topic.publish(1);
        topic.publish(2);

        let mut tail = topic.tail_from(None);
        assert_eq!(tail.recv().await.unwrap().payload, 1);
        assert_eq!(tail.recv().await.unwrap().payload, 2);
    }

    #[tokio::test]
    async fn tail_from_cursor_skips_earlier_messages() {
        let topic: Topic<i32> = Topic::new(16, 16);
        topic.publish(1); // seq 0
        topic.publish(2); // seq 1
        topic.publish(3); // seq 2

        let mut tail = topic.tail_from(Some(1));
        assert_eq!(tail.recv().await.unwrap().payload, 2);
        assert_eq!(tail.recv().await.unwrap().payload, 3);
    }

    #[tokio::test]
    async fn tail_from_does_not_duplicate_backlog_and_live() {
        let topic: Topic<i32> = Topic::new(16, 16);
        topic.publish(1);

        let mut tail = topic.tail_from(None);
        // This publish happens "live" after the tail subscription started;
        // the implementation must not replay it twice via both the
        // snapshot and the live feed.
        topic.publish(2);

        let mut seen = Vec::new();
        seen.push(tail.recv().await.unwrap().payload);
        seen.push(tail.recv().await.unwrap().payload);
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn retained_log_is_bounded() {
        let topic: Topic<i32> = Topic::new(2, 16);
        topic.publish(1);
        topic.publish(2);
        topic.publish(3);
        assert_eq!(topic.retained_len(), 2);

        let mut tail = topic.tail_from(None);
        assert_eq!(tail.recv().await.unwrap().payload, 2);
        assert_eq!(tail.recv().await.unwrap().payload, 3);
    }
}
