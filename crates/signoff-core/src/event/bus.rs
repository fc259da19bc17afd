//! Typed publish/subscribe bus with per-subscriber retry and dead-lettering.
//!
//! Subscribers register by event kind. Each subscriber owns a bounded mpsc
//! queue drained by its own tokio task, so one slow subscriber never stalls
//! another and delivery is FIFO per subscriber. `publish` awaits only the
//! enqueue; when a queue is full the publisher blocks until space frees up
//! (bounded back-pressure). A failing handler is retried with exponential
//! backoff; once the configured retries are exhausted the event goes to the
//! dead-letter sink with the terminal error and delivery moves on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use signoff_types::config::BusConfig;
use signoff_types::dlq::DlqEntry;
use signoff_types::error::RepositoryError;
use signoff_types::event::{EventKind, OrchestratorEvent};

use crate::retry::backoff_delay;

// ---------------------------------------------------------------------------
// Handler types
// ---------------------------------------------------------------------------

/// Error returned by an event handler. Any error triggers the retry policy.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        HandlerError(msg)
    }
}

/// Type-erased subscriber callback: every handler shares one signature.
pub type EventHandler =
    Arc<dyn Fn(OrchestratorEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Type-erased dead-letter persistence hook, normally backed by the gateway.
pub type DlqSink =
    Arc<dyn Fn(DlqEntry) -> BoxFuture<'static, Result<(), RepositoryError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct SubscriberSeat {
    name: String,
    kinds: HashSet<EventKind>,
    tx: mpsc::Sender<OrchestratorEvent>,
}

struct BusInner {
    config: BusConfig,
    dlq: DlqSink,
    cancel: CancellationToken,
    seats: RwLock<Vec<SubscriberSeat>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// In-process pub/sub bus. Cloning shares the underlying queues.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the given delivery policy and dead-letter sink.
    pub fn new(config: BusConfig, dlq: DlqSink) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                dlq,
                cancel: CancellationToken::new(),
                seats: RwLock::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A bus whose dead-letter sink only logs. For tests and tooling.
    pub fn with_discarding_dlq(config: BusConfig) -> Self {
        let sink: DlqSink = Arc::new(|entry| {
            Box::pin(async move {
                tracing::error!(
                    event_type = entry.event_type.as_str(),
                    error = entry.error.as_str(),
                    "dead-lettered event discarded (no DLQ store configured)"
                );
                Ok(())
            })
        });
        Self::new(config, sink)
    }

    /// Register a subscriber for a set of event kinds.
    ///
    /// Spawns the delivery task immediately; registration is expected to
    /// happen at startup, before traffic. Multiple subscribers per kind fan
    /// out independently.
    pub fn subscribe<F, Fut>(&self, name: &str, kinds: &[EventKind], handler: F)
    where
        F: Fn(OrchestratorEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let erased: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.subscribe_handler(name, kinds, erased);
    }

    /// Register an already type-erased handler.
    pub fn subscribe_handler(&self, name: &str, kinds: &[EventKind], handler: EventHandler) {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);

        let task = tokio::spawn(Self::deliver_loop(
            name.to_string(),
            rx,
            handler,
            self.inner.config.clone(),
            Arc::clone(&self.inner.dlq),
            self.inner.cancel.clone(),
        ));

        self.inner.tasks.lock().expect("bus task list poisoned").push(task);
        self.inner
            .seats
            .write()
            .expect("bus seat list poisoned")
            .push(SubscriberSeat {
                name: name.to_string(),
                kinds: kinds.iter().copied().collect(),
                tx,
            });

        tracing::debug!(subscriber = name, kinds = kinds.len(), "subscriber registered");
    }

    /// Publish an event to every subscriber of its kind.
    ///
    /// Returns once the event is enqueued everywhere; blocks on full queues.
    pub async fn publish(&self, event: OrchestratorEvent) {
        let kind = event.kind();
        let targets: Vec<(String, mpsc::Sender<OrchestratorEvent>)> = {
            let seats = self.inner.seats.read().expect("bus seat list poisoned");
            seats
                .iter()
                .filter(|s| s.kinds.contains(&kind))
                .map(|s| (s.name.clone(), s.tx.clone()))
                .collect()
        };

        for (name, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                tracing::warn!(
                    subscriber = name.as_str(),
                    event = %kind,
                    "subscriber queue closed, event dropped"
                );
            }
        }
    }

    /// Stop delivery: cancels every subscriber task and waits for them.
    /// Events still queued at shutdown are dropped.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.seats.write().expect("bus seat list poisoned").clear();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().expect("bus task list poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!("event bus shut down");
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.seats.read().expect("bus seat list poisoned").len()
    }

    async fn deliver_loop(
        name: String,
        mut rx: mpsc::Receiver<OrchestratorEvent>,
        handler: EventHandler,
        config: BusConfig,
        dlq: DlqSink,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
            };

            Self::deliver_with_retry(&name, &handler, event, &config, &dlq, &cancel).await;
        }
    }

    async fn deliver_with_retry(
        name: &str,
        handler: &EventHandler,
        event: OrchestratorEvent,
        config: &BusConfig,
        dlq: &DlqSink,
        cancel: &CancellationToken,
    ) {
        let kind = event.kind();
        let max_attempts = config.max_retries + 1;

        for attempt in 0..max_attempts {
            match handler(event.clone()).await {
                Ok(()) => return,
                Err(err) if attempt + 1 >= max_attempts => {
                    tracing::error!(
                        subscriber = name,
                        event = %kind,
                        attempts = max_attempts,
                        error = %err,
                        "delivery exhausted retries, dead-lettering"
                    );
                    let entry = DlqEntry::from_event(&event, err.to_string(), attempt + 1);
                    if let Err(db_err) = dlq(entry).await {
                        tracing::error!(
                            subscriber = name,
                            event = %kind,
                            error = %db_err,
                            "failed to persist dead-lettered event"
                        );
                    }
                    return;
                }
                Err(err) => {
                    let delay =
                        backoff_delay(config.backoff_initial, config.backoff_multiplier, attempt);
                    tracing::warn!(
                        subscriber = name,
                        event = %kind,
                        attempt = attempt + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "handler failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
