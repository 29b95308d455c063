//! Lifecycle skeleton shared by queue-driven services.
//!
//! A [`ServiceRunner`] owns one service instance and its lifecycle state.
//! Starting it connects to the broker, declares the service's queues,
//! subscribes its handlers, and spawns a background task that does nothing
//! but wait for cancellation. The returned [`ServiceHandle`] either blocks
//! until shutdown or requests it.
//!
//! ```text
//! IDLE ──run_async──▶ RUNNING ──await_shutdown──▶ AWAITING_SHUTDOWN ──▶ IDLE
//!                        │                              │
//!                        └──────────close──────▶ SHUTTING_DOWN ──────▶ IDLE
//! ```
//!
//! Each start opens a new run. A handle only controls the run that created
//! it; once that run is over, the handle sees it as idle.
//!
//! Teardown happens exactly once per run, in this order: stop delivery,
//! close consumers (newest first), close the producer, the session, and the
//! connection. A failing step is logged and the remaining steps still run.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Connection, Consumer, Message, Producer, Session};

/// Lifecycle of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Idle = 0,
    Running = 1,
    AwaitingShutdown = 2,
    ShuttingDown = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::Running,
            2 => ServiceState::AwaitingShutdown,
            3 => ServiceState::ShuttingDown,
            _ => ServiceState::Idle,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Idle => "idle",
            ServiceState::Running => "running",
            ServiceState::AwaitingShutdown => "awaiting shutdown",
            ServiceState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Atomically guarded lifecycle state, owned by one service instance.
///
/// The state word carries the run generation in its upper bits, so every
/// transition names the run it applies to.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    word: Arc<AtomicU64>,
}

fn pack(generation: u64, state: ServiceState) -> u64 {
    (generation << 8) | state as u64
}

fn unpack(word: u64) -> (u64, ServiceState) {
    #[allow(clippy::cast_possible_truncation)]
    let state = ServiceState::from_u8(word as u8);
    (word >> 8, state)
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ServiceState {
        unpack(self.word.load(Ordering::SeqCst)).1
    }

    /// State of run `generation`; idle once a newer run has started.
    pub fn state_of(&self, generation: u64) -> ServiceState {
        match unpack(self.word.load(Ordering::SeqCst)) {
            (current, state) if current == generation => state,
            _ => ServiceState::Idle,
        }
    }

    /// Starts a new run from idle and returns its generation.
    pub fn start(&self) -> Result<u64, ServiceState> {
        let mut word = self.word.load(Ordering::SeqCst);
        loop {
            let (generation, state) = unpack(word);
            if state != ServiceState::Idle {
                return Err(state);
            }
            let next = generation + 1;
            match self.word.compare_exchange(
                word,
                pack(next, ServiceState::Running),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => word = actual,
            }
        }
    }

    /// Moves run `generation` from `from` to `to`, or returns the state that
    /// run is actually in.
    pub fn transition(
        &self,
        generation: u64,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<(), ServiceState> {
        self.word
            .compare_exchange(
                pack(generation, from),
                pack(generation, to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|actual| match unpack(actual) {
                (current, state) if current == generation => state,
                _ => ServiceState::Idle,
            })
    }

    /// Ends run `generation`. No effect once a newer run has started.
    fn reset(&self, generation: u64) {
        let _ = self
            .word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                (unpack(word).0 == generation).then_some(pack(generation, ServiceState::Idle))
            });
    }
}

/// Errors surfaced by the lifecycle wrapper.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} cannot {action} while {state}")]
    IllegalState {
        service: String,
        action: &'static str,
        state: ServiceState,
    },

    #[error("{service} failed to start at '{step}': {source}")]
    Startup {
        service: String,
        step: &'static str,
        #[source]
        source: BrokerError,
    },
}

/// What to do with a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from its queue.
    Ack,
    /// Leave the message unacknowledged so the broker redelivers it.
    Leave,
}

/// Handles messages from one queue.
///
/// Called concurrently for different messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Disposition;
}

/// A handler bound to the queue it consumes.
pub struct Subscription {
    pub queue: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            queue: queue.into(),
            handler,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// A long-running service driven by broker queues.
#[async_trait]
pub trait QueueService: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Every queue the service reads or writes; declared before subscribing.
    fn queues(&self) -> Vec<String>;

    /// Upper bound on concurrently running handlers.
    fn handler_concurrency(&self) -> usize {
        4
    }

    /// Builds the handlers for one run. `producer` is shared by all of them.
    async fn subscribe(&self, producer: Arc<dyn Producer>) -> Result<Vec<Subscription>, ServiceError>;
}

/// Runs a [`QueueService`] against a broker.
pub struct ServiceRunner<S: QueueService> {
    service: Arc<S>,
    broker: Arc<dyn Broker>,
    lifecycle: Lifecycle,
}

impl<S: QueueService> ServiceRunner<S> {
    pub fn new(service: S, broker: Arc<dyn Broker>) -> Self {
        Self {
            service: Arc::new(service),
            broker,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Starts the service and returns a handle to it.
    ///
    /// Setup failures tear down whatever was created and leave the runner idle.
    pub async fn run_async(&self) -> Result<ServiceHandle, ServiceError> {
        let name = self.service.name().to_string();
        let generation = self
            .lifecycle
            .start()
            .map_err(|state| ServiceError::IllegalState {
                service: name.clone(),
                action: "start",
                state,
            })?;

        let mut resources = Resources::new(name.clone());
        if let Err(e) = self.setup(&mut resources).await {
            error!(service = %name, error = %e, "Service setup failed");
            resources.release().await;
            self.lifecycle.reset(generation);
            return Err(e);
        }

        let inner = Arc::new(HandleInner {
            name: name.clone(),
            lifecycle: self.lifecycle.clone(),
            generation,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            resources: Mutex::new(Some(resources)),
        });

        let background = Arc::clone(&inner);
        let task: JoinHandle<()> = tokio::spawn(async move {
            background.cancel.cancelled().await;
            debug!(service = %background.name, "Background task cancelled");
            background.release().await;
            background.finished.cancel();
        });

        info!(service = %name, generation, "Service running");
        Ok(ServiceHandle {
            inner,
            _task: Arc::new(task),
        })
    }

    /// Starts the service and blocks until it shuts down.
    pub async fn run_sync(&self) -> Result<(), ServiceError> {
        self.run_async().await?.await_shutdown().await
    }

    async fn setup(&self, resources: &mut Resources) -> Result<(), ServiceError> {
        let name = self.service.name();
        let startup = |step: &'static str| {
            move |source: BrokerError| ServiceError::Startup {
                service: name.to_string(),
                step,
                source,
            }
        };

        let connection = self.broker.connect().await.map_err(startup("connect"))?;
        let session = connection.open_session().await;
        resources.connection = Some(connection);
        let session = session.map_err(startup("open session"))?;
        resources.session = Some(Arc::clone(&session));

        for queue in self.service.queues() {
            session
                .declare_queue(&queue)
                .await
                .map_err(startup("declare queue"))?;
        }

        let producer = session.producer().await.map_err(startup("create producer"))?;
        resources.producer = Some(Arc::clone(&producer));

        let permits = Arc::new(Semaphore::new(self.service.handler_concurrency().max(1)));
        for subscription in self.service.subscribe(producer).await? {
            let consumer = session
                .consumer(&subscription.queue)
                .await
                .map_err(startup("subscribe"))?;
            debug!(service = %name, queue = %subscription.queue, "Subscribed");
            let task = tokio::spawn(dispatch(
                consumer,
                subscription,
                Arc::clone(&permits),
                resources.stop_delivery.clone(),
            ));
            resources.dispatchers.push(task);
        }

        Ok(())
    }
}

/// Pumps deliveries from one consumer into its handler.
///
/// Returns the consumer once delivery is stopped so it can be closed in order.
async fn dispatch(
    mut consumer: Box<dyn Consumer>,
    subscription: Subscription,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
) -> Box<dyn Consumer> {
    let queue = subscription.queue;
    loop {
        let delivery = tokio::select! {
            () = stop.cancelled() => break,
            delivery = consumer.recv() => delivery,
        };
        let Some(delivery) = delivery else {
            debug!(queue = %queue, "Consumer drained");
            break;
        };

        let permit = tokio::select! {
            () = stop.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            break;
        };

        let handler = Arc::clone(&subscription.handler);
        let queue = queue.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match handler.handle(delivery.message()).await {
                Disposition::Ack => {
                    if let Err(e) = delivery.ack() {
                        warn!(queue = %queue, error = %e, "Failed to acknowledge message");
                    }
                }
                Disposition::Leave => {
                    debug!(queue = %queue, "Message left for redelivery");
                }
            }
        });
    }
    consumer
}

/// Broker resources held for one run.
struct Resources {
    service: String,
    stop_delivery: CancellationToken,
    dispatchers: Vec<JoinHandle<Box<dyn Consumer>>>,
    producer: Option<Arc<dyn Producer>>,
    session: Option<Arc<dyn Session>>,
    connection: Option<Box<dyn Connection>>,
}

impl Resources {
    fn new(service: String) -> Self {
        Self {
            service,
            stop_delivery: CancellationToken::new(),
            dispatchers: Vec::new(),
            producer: None,
            session: None,
            connection: None,
        }
    }

    async fn release(self) {
        let service = self.service;
        self.stop_delivery.cancel();

        let mut consumers = Vec::with_capacity(self.dispatchers.len());
        for dispatcher in self.dispatchers {
            match dispatcher.await {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => warn!(service = %service, error = %e, "Dispatcher ended abnormally"),
            }
        }

        for mut consumer in consumers.into_iter().rev() {
            if let Err(e) = consumer.close().await {
                warn!(service = %service, error = %e, "Failed to close consumer");
            }
        }

        if let Some(producer) = self.producer
            && let Err(e) = producer.close().await
        {
            warn!(service = %service, error = %e, "Failed to close producer");
        }

        if let Some(session) = self.session
            && let Err(e) = session.close().await
        {
            warn!(service = %service, error = %e, "Failed to close session");
        }

        if let Some(connection) = self.connection
            && let Err(e) = connection.close().await
        {
            warn!(service = %service, error = %e, "Failed to close connection");
        }

        debug!(service = %service, "Broker resources released");
    }
}

struct HandleInner {
    name: String,
    lifecycle: Lifecycle,
    generation: u64,
    cancel: CancellationToken,
    finished: CancellationToken,
    resources: Mutex<Option<Resources>>,
}

impl HandleInner {
    /// Releases resources if nobody has yet.
    async fn release(&self) {
        let resources = self
            .resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(resources) = resources {
            resources.release().await;
        }
    }

    fn transition(&self, from: ServiceState, to: ServiceState) -> Result<(), ServiceState> {
        self.lifecycle.transition(self.generation, from, to)
    }

    fn illegal(&self, action: &'static str, state: ServiceState) -> ServiceError {
        ServiceError::IllegalState {
            service: self.name.clone(),
            action,
            state,
        }
    }
}

/// Handle to a running service. Cheap to clone.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<HandleInner>,
    _task: Arc<JoinHandle<()>>,
}

impl ServiceHandle {
    /// State of this handle's run.
    pub fn state(&self) -> ServiceState {
        self.inner.lifecycle.state_of(self.inner.generation)
    }

    /// Cancels the service and releases its resources before returning.
    ///
    /// Allowed while running or while another caller awaits shutdown.
    pub async fn close(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        inner
            .transition(ServiceState::Running, ServiceState::ShuttingDown)
            .or_else(|_| inner.transition(ServiceState::AwaitingShutdown, ServiceState::ShuttingDown))
            .map_err(|state| inner.illegal("close", state))?;

        info!(service = %self.inner.name, "Service closing");
        self.inner.cancel.cancel();
        self.inner.release().await;
        self.inner.finished.cancelled().await;
        self.inner.lifecycle.reset(self.inner.generation);
        info!(service = %self.inner.name, "Service closed");
        Ok(())
    }

    /// Blocks until the service stops, then releases its resources.
    pub async fn await_shutdown(&self) -> Result<(), ServiceError> {
        self.inner
            .transition(ServiceState::Running, ServiceState::AwaitingShutdown)
            .map_err(|state| self.inner.illegal("await shutdown", state))?;

        self.inner.finished.cancelled().await;
        self.inner.release().await;
        self.inner.lifecycle.reset(self.inner.generation);
        info!(service = %self.inner.name, "Service shut down");
        Ok(())
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
