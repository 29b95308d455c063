//! In-process broker.
//!
//! Named FIFO queues with explicit acknowledgement. A delivery that is not
//! acknowledged stays parked until [`InMemoryBroker::recover`] is called for
//! its queue or the connection that received it closes; either puts it back
//! at the tail of the queue flagged as redelivered.
//!
//! Used by the `cbench` binary for local replays and by tests as the
//! stand-in for a real broker.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{
    Acknowledger, Broker, BrokerError, Connection, Consumer, Delivery, Message, Producer, Session,
};

#[derive(Debug)]
struct Parked {
    message: Message,
    redelivered: bool,
    connection: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Parked>,
    unacked: BTreeMap<u64, Parked>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    failing_sends: Mutex<HashSet<String>>,
    refuse_connections: AtomicBool,
    next_tag: AtomicU64,
    next_connection: AtomicU64,
    open_connections: AtomicU64,
    events: Mutex<Vec<String>>,
}

impl Inner {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, event: String) {
        trace!(event = %event, "in-memory broker");
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    fn requeue_unacked(&self, queue: &mut QueueState, only_connection: Option<u64>) -> usize {
        let tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, parked)| only_connection.is_none_or(|c| parked.connection == c))
            .map(|(tag, _)| *tag)
            .collect();

        for tag in &tags {
            if let Some(mut parked) = queue.unacked.remove(tag) {
                parked.redelivered = true;
                queue.ready.push_back(parked);
                queue.notify.notify_one();
            }
        }
        tags.len()
    }
}

/// A broker that lives entirely in this process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `queue` if it does not exist.
    pub fn declare(&self, queue: &str) {
        self.inner.queues().entry(queue.to_string()).or_default();
    }

    /// Enqueues a message from outside any connection.
    pub fn publish(&self, queue: &str, message: Message) {
        let mut queues = self.inner.queues();
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(Parked {
            message,
            redelivered: false,
            connection: 0,
        });
        state.notify.notify_one();
    }

    /// Removes and returns every ready message on `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Message> {
        self.inner
            .queues()
            .get_mut(queue)
            .map(|state| state.ready.drain(..).map(|p| p.message).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting to be delivered.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner
            .queues()
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Number of messages delivered but not yet acknowledged.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.inner
            .queues()
            .get(queue)
            .map_or(0, |state| state.unacked.len())
    }

    /// Puts every unacknowledged delivery on `queue` back up for delivery.
    pub fn recover(&self, queue: &str) -> usize {
        let mut queues = self.inner.queues();
        let Some(state) = queues.get_mut(queue) else {
            return 0;
        };
        let count = self.inner.requeue_unacked(state, None);
        debug!(queue = %queue, count, "Recovered unacknowledged deliveries");
        count
    }

    /// Makes every send to `queue` fail until [`restore_sends_to`](Self::restore_sends_to).
    pub fn fail_sends_to(&self, queue: &str) {
        self.inner
            .failing_sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(queue.to_string());
    }

    pub fn restore_sends_to(&self, queue: &str) {
        self.inner
            .failing_sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(queue);
    }

    /// Makes subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn open_connections(&self) -> u64 {
        self.inner.open_connections.load(Ordering::SeqCst)
    }

    /// Ordered record of resource creation and teardown.
    pub fn lifecycle_events(&self) -> Vec<String> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Polls until `queue` holds at least `count` ready messages.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_ready(&self, queue: &str, count: usize, timeout: Duration) -> bool {
        let poll = async {
            while self.ready_len(queue) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("connections refused".to_string()));
        }
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open_connections.fetch_add(1, Ordering::SeqCst);
        self.inner.record(format!("open connection {id}"));
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
            id,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_session(&self) -> Result<Arc<dyn Session>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("connection"));
        }
        self.inner.record("open session".to_string());
        Ok(Arc::new(MemorySession {
            inner: Arc::clone(&self.inner),
            connection: self.id,
            connection_closed: Arc::clone(&self.closed),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut queues = self.inner.queues();
            for state in queues.values_mut() {
                self.inner.requeue_unacked(state, Some(self.id));
                state.notify.notify_waiters();
            }
        }
        self.inner.open_connections.fetch_sub(1, Ordering::SeqCst);
        self.inner.record(format!("close connection {}", self.id));
        Ok(())
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    connection: u64,
    connection_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) || self.connection_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("session"));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.inner.queues().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn consumer(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        self.ensure_open()?;
        if !self.inner.queues().contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        self.inner.record(format!("open consumer {queue}"));
        Ok(Box::new(MemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            connection: self.connection,
            connection_closed: Arc::clone(&self.connection_closed),
            closed: false,
        }))
    }

    async fn producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
        self.ensure_open()?;
        self.inner.record("open producer".to_string());
        Ok(Arc::new(MemoryProducer {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.record("close session".to_string());
        }
        Ok(())
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    connection: u64,
    connection_closed: Arc<AtomicBool>,
    closed: bool,
}

impl MemoryConsumer {
    /// Takes the next ready message, or returns the notifier to wait on.
    fn try_take(&self) -> Result<Delivery, Option<Arc<Notify>>> {
        let mut queues = self.inner.queues();
        let Some(state) = queues.get_mut(&self.queue) else {
            return Err(None);
        };
        match state.ready.pop_front() {
            Some(parked) => {
                let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
                let message = parked.message.clone();
                let redelivered = parked.redelivered;
                state.unacked.insert(
                    tag,
                    Parked {
                        connection: self.connection,
                        ..parked
                    },
                );
                let acker = MemoryAck {
                    inner: Arc::clone(&self.inner),
                    queue: self.queue.clone(),
                    tag,
                };
                Ok(Delivery::new(message, redelivered, Box::new(acker)))
            }
            None => Err(Some(Arc::clone(&state.notify))),
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if self.closed || self.connection_closed.load(Ordering::SeqCst) {
                return None;
            }
            match self.try_take() {
                Ok(delivery) => return Some(delivery),
                Err(Some(notify)) => notify.notified().await,
                Err(None) => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.inner.record(format!("close consumer {}", self.queue));
        }
        Ok(())
    }
}

struct MemoryProducer {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed("producer"));
        }
        let failing = self
            .inner
            .failing_sends
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(queue);
        if failing {
            return Err(BrokerError::Send {
                queue: queue.to_string(),
                reason: "send rejected by broker".to_string(),
            });
        }

        let mut queues = self.inner.queues();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        state.ready.push_back(Parked {
            message,
            redelivered: false,
            connection: 0,
        });
        state.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.record("close producer".to_string());
        }
        Ok(())
    }
}

struct MemoryAck {
    inner: Arc<Inner>,
    queue: String,
    tag: u64,
}

impl Acknowledger for MemoryAck {
    fn ack(&self) -> Result<(), BrokerError> {
        let mut queues = self.inner.queues();
        let removed = queues
            .get_mut(&self.queue)
            .and_then(|state| state.unacked.remove(&self.tag));
        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::Ack(format!(
                "delivery {} on '{}' is no longer outstanding",
                self.tag, self.queue
            ))),
        }
    }
}
