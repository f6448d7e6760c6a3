//! Per-process event bus: single producer, multiple bounded consumers.
//!
//! Each subscriber owns a bounded queue with its own envelope numbering, so
//! every stream is contiguous even when progress events are collapsed. On a
//! full queue:
//!
//! - a **structural** event makes the publisher wait for space (never
//!   dropped),
//! - a **progress** event replaces the queued event with the same collapse
//!   key (latest-wins, seq of the replaced slot is reused), or is dropped
//!   when no collapsible predecessor is queued.
//!
//! A terminal event closes the bus; publishing afterwards is an error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use process_event::{EnvelopeState, ProcessEvent, ProcessEventEnvelope};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus is closed (terminal event already published)")]
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct BusConfig {
    /// Per-subscriber queue capacity.
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

struct SubscriberQueue {
    queue: VecDeque<ProcessEventEnvelope>,
    envelope: EnvelopeState,
    /// Terminal event enqueued; the stream ends after draining.
    finished: bool,
}

struct SubscriberShared {
    inner: Mutex<SubscriberQueue>,
    capacity: usize,
    data_ready: Notify,
    space_ready: Notify,
}

/// Consumer handle: ordered, gap-free within this subscription.
pub struct EventStream {
    shared: Arc<SubscriberShared>,
}

impl EventStream {
    /// Next event, or `None` once the terminal event has been consumed.
    pub async fn next(&mut self) -> Option<ProcessEventEnvelope> {
        loop {
            let notified = self.shared.data_ready.notified();
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if let Some(event) = inner.queue.pop_front() {
                    drop(inner);
                    self.shared.space_ready.notify_one();
                    return Some(event);
                }
                if inner.finished {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Drains everything currently available without waiting.
    pub fn drain_ready(&mut self) -> Vec<ProcessEventEnvelope> {
        let mut inner = self.shared.inner.lock().unwrap();
        let drained: Vec<_> = inner.queue.drain(..).collect();
        drop(inner);
        if !drained.is_empty() {
            self.shared.space_ready.notify_one();
        }
        drained
    }
}

/// The producer side, owned by the process supervisor.
pub struct EventBus {
    process_id: String,
    config: BusConfig,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    /// Replay log for subscribers that attach after publishing started.
    /// Progress events collapse in place, so its size is bounded by the
    /// structural event count.
    history: Mutex<Vec<ProcessEvent>>,
    closed: Mutex<bool>,
}

impl EventBus {
    pub fn new(process_id: impl Into<String>, config: BusConfig) -> Self {
        Self {
            process_id: process_id.into(),
            config,
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    /// Opens a new consumer. Everything published so far (progress
    /// collapsed) is replayed first, so attaching after `start` loses
    /// nothing; a subscriber added after the terminal event drains the
    /// replay and then ends.
    pub fn subscribe(&self) -> EventStream {
        // history lock held across subscriber registration so a concurrent
        // publish cannot slip an event between replay and live flow.
        let history = self.history.lock().unwrap();
        let mut envelope = EnvelopeState::new(self.process_id.clone());
        let ts = chrono::Utc::now().to_rfc3339();
        let mut queue = VecDeque::with_capacity(history.len());
        let mut finished = false;
        for event in history.iter() {
            finished = finished || event.is_terminal();
            queue.push_back(envelope.envelop(event.clone(), ts.as_str()));
        }
        let shared = Arc::new(SubscriberShared {
            inner: Mutex::new(SubscriberQueue {
                queue,
                envelope,
                finished,
            }),
            capacity: self.config.subscriber_buffer.max(1),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        });
        self.subscribers.lock().unwrap().push(Arc::clone(&shared));
        if !shared.inner.lock().unwrap().queue.is_empty() {
            shared.data_ready.notify_one();
        }
        EventStream { shared }
    }

    /// Publishes one event to every subscriber, applying the overflow policy
    /// per queue. Waits only when a structural event meets a full queue.
    pub async fn publish(&self, event: ProcessEvent) -> Result<(), BusError> {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return Err(BusError::Closed);
            }
            if event.is_terminal() {
                *closed = true;
            }
        }

        let ts = chrono::Utc::now().to_rfc3339();
        let subscribers: Vec<_> = {
            let mut history = self.history.lock().unwrap();
            match event.collapse_key() {
                Some(key) => {
                    match history
                        .iter_mut()
                        .find(|e| e.collapse_key() == Some(key))
                    {
                        Some(slot) => *slot = event.clone(),
                        None => history.push(event.clone()),
                    }
                }
                None => history.push(event.clone()),
            }
            // Subscriber snapshot taken under the history lock; see
            // `subscribe`.
            self.subscribers.lock().unwrap().clone()
        };
        for subscriber in subscribers {
            Self::offer(&subscriber, &event, &ts).await;
        }
        Ok(())
    }

    async fn offer(subscriber: &SubscriberShared, event: &ProcessEvent, ts: &str) {
        loop {
            let notified = subscriber.space_ready.notified();
            {
                let mut inner = subscriber.inner.lock().unwrap();
                if inner.finished {
                    return;
                }
                if inner.queue.len() < subscriber.capacity {
                    let enveloped = inner.envelope.envelop(event.clone(), ts);
                    if enveloped.event.is_terminal() {
                        inner.finished = true;
                    }
                    inner.queue.push_back(enveloped);
                    drop(inner);
                    subscriber.data_ready.notify_one();
                    return;
                }
                if let Some(key) = event.collapse_key() {
                    // Full queue, collapsible event: supersede the queued
                    // entry with the same key, keeping its seq slot.
                    if let Some(slot) = inner
                        .queue
                        .iter_mut()
                        .rev()
                        .find(|e| e.event.collapse_key() == Some(key))
                    {
                        slot.event = event.clone();
                        slot.envelope.ts = ts.to_string();
                        drop(inner);
                        subscriber.data_ready.notify_one();
                    }
                    // No predecessor to collapse into: the progress update
                    // is dropped.
                    return;
                }
            }
            // Structural event, full queue: wait for the consumer.
            notified.await;
        }
    }
}
