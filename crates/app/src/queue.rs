//! Bounded control queue feeding the automation loop.
//!
//! Sensor acquisition and the command channel push into one queue, tagged by
//! source. When the queue is full the oldest unread item is dropped and a drop
//! counter increments; producers never block.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sporekeeper_domain::actuator::ControlSource;
use sporekeeper_domain::command::{Command, DeliveryState};
use sporekeeper_domain::reading::Reading;
use tokio::sync::{Notify, oneshot};

/// Result of applying a queued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub state: DeliveryState,
    pub reason: Option<String>,
}

impl CommandOutcome {
    #[must_use]
    pub fn applied() -> Self {
        Self {
            state: DeliveryState::Applied,
            reason: None,
        }
    }

    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            state: DeliveryState::Rejected,
            reason: Some(reason.into()),
        }
    }

    /// The command never reached the controller and may be sent again.
    #[must_use]
    pub fn dropped(reason: impl Into<String>) -> Self {
        Self {
            state: DeliveryState::Dropped,
            reason: Some(reason.into()),
        }
    }
}

/// A command waiting for the controller, with an optional reply slot.
#[derive(Debug)]
pub struct QueuedCommand {
    pub command: Command,
    pub source: ControlSource,
    pub reply: Option<oneshot::Sender<CommandOutcome>>,
}

/// One unit of work for the automation loop.
#[derive(Debug)]
pub enum ControlInput {
    Reading(Reading),
    Command(QueuedCommand),
}

struct Inner {
    items: Mutex<VecDeque<ControlInput>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Multi-producer, single-consumer bounded drop-oldest queue.
#[derive(Clone)]
pub struct ControlQueue {
    inner: Arc<Inner>,
}

impl ControlQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                capacity: capacity.max(1),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an item. Returns `false` once the queue has been closed.
    pub fn push(&self, input: ControlInput) -> bool {
        if self.is_closed() {
            return false;
        }
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.inner.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(input);
            evicted
        };
        if let Some(evicted) = evicted {
            let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                kind = evicted.kind(),
                dropped_total = total,
                "control queue full, dropped oldest item"
            );
        }
        self.inner.notify.notify_one();
        true
    }

    /// Queue a command and wait up to `timeout` for the controller's answer.
    pub async fn submit(
        &self,
        command: Command,
        source: ControlSource,
        timeout: Duration,
    ) -> CommandOutcome {
        let (reply, rx) = oneshot::channel();
        let queued = self.push(ControlInput::Command(QueuedCommand {
            command,
            source,
            reply: Some(reply),
        }));
        if !queued {
            return CommandOutcome::dropped("controller is shutting down");
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommandOutcome::dropped("dropped from full control queue"),
            Err(_) => CommandOutcome::rejected("controller did not answer in time"),
        }
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<ControlInput> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Take the next item without waiting.
    #[must_use]
    pub fn try_pop(&self) -> Option<ControlInput> {
        self.lock().pop_front()
    }

    /// Stop accepting new work; the consumer drains what is left.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Items dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ControlInput>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ControlInput {
    fn kind(&self) -> &'static str {
        match self {
            Self::Reading(_) => "reading",
            Self::Command(_) => "command",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sporekeeper_domain::id::DeviceId;
    use sporekeeper_domain::reading::Metric;
    use sporekeeper_domain::time::now;

    fn reading(value: f64) -> ControlInput {
        ControlInput::Reading(Reading::new(
            DeviceId::new("chamber-01"),
            Metric::Co2,
            value,
            now(),
        ))
    }

    fn value_of(input: ControlInput) -> f64 {
        match input {
            ControlInput::Reading(r) => r.value,
            ControlInput::Command(_) => panic!("expected reading"),
        }
    }

    #[tokio::test]
    async fn should_deliver_items_in_fifo_order() {
        let queue = ControlQueue::new(8);
        queue.push(reading(1.0));
        queue.push(reading(2.0));

        assert_eq!(value_of(queue.pop().await.unwrap()), 1.0);
        assert_eq!(value_of(queue.pop().await.unwrap()), 2.0);
    }

    #[tokio::test]
    async fn should_drop_oldest_and_count_when_full() {
        let queue = ControlQueue::new(2);
        queue.push(reading(1.0));
        queue.push(reading(2.0));
        queue.push(reading(3.0));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(value_of(queue.pop().await.unwrap()), 2.0);
        assert_eq!(value_of(queue.pop().await.unwrap()), 3.0);
    }

    #[tokio::test]
    async fn should_wake_waiting_consumer_on_push() {
        let queue = ControlQueue::new(4);
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.pop().await.map(value_of) });

        tokio::task::yield_now().await;
        queue.push(reading(7.0));

        assert_eq!(handle.await.unwrap(), Some(7.0));
    }

    #[tokio::test]
    async fn should_drain_then_end_after_close() {
        let queue = ControlQueue::new(4);
        queue.push(reading(1.0));
        queue.close();

        assert!(!queue.push(reading(2.0)));
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn should_drop_reply_slot_of_evicted_command() {
        use sporekeeper_domain::command::{Command, CommandKind};
        use sporekeeper_domain::phase::Phase;

        let queue = ControlQueue::new(1);
        let (tx, rx) = oneshot::channel();
        queue.push(ControlInput::Command(QueuedCommand {
            command: Command::local(
                CommandKind::SetPhase {
                    phase: Phase::Fruiting,
                },
                now(),
            ),
            source: ControlSource::Manual,
            reply: Some(tx),
        }));
        queue.push(reading(1.0));

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn should_answer_dropped_when_submitted_to_closed_queue() {
        use sporekeeper_domain::command::CommandKind;
        use sporekeeper_domain::phase::Phase;

        let queue = ControlQueue::new(4);
        queue.close();
        let command = Command::local(
            CommandKind::SetPhase {
                phase: Phase::Fruiting,
            },
            now(),
        );

        let outcome = queue
            .submit(command, ControlSource::Manual, Duration::from_secs(1))
            .await;

        assert_eq!(outcome.state, DeliveryState::Dropped);
    }
}
