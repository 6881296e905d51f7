use std::{convert::Infallible, sync::Arc, time::Duration};

use anyhow::Context;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use tagtrail_events::{EventBus, FanoutBus};
use tagtrail_inventory::UnitMoved;
use tagtrail_infra::{
    config::AppConfig,
    external_ledger::{ExternalLedger, HttpLedgerClient, UnconfiguredLedger},
    reconcile::{ReconcileConfig, ReconcileTrigger, Reconciler, Shutdown},
    retry_queue::{InMemoryRetryQueue, RetryQueue, SqliteRetryQueue},
    store::{InMemoryUnitStore, SqliteUnitStore, UnitStore},
    transition_engine::TransitionEngine,
};

use crate::app::dto;

pub type SharedStore = Arc<dyn UnitStore>;
pub type SharedQueue = Arc<dyn RetryQueue>;
pub type SharedLedger = Arc<dyn ExternalLedger>;

pub type Engine = TransitionEngine<SharedStore, Arc<FanoutBus<UnitMoved>>, ReconcileTrigger>;
pub type Worker = Reconciler<SharedStore, SharedQueue, SharedLedger>;

/// Interval at which an idle SSE observer checks for shutdown and heartbeats.
const STREAM_POLL: Duration = Duration::from_secs(1);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(15);

/// Everything the handlers need: the engine for the command path, the
/// reconciler for the sync surface, and the fan-out bus for live observers.
#[derive(Clone)]
pub struct AppServices {
    pub engine: Arc<Engine>,
    pub reconciler: Arc<Worker>,
    pub bus: Arc<FanoutBus<UnitMoved>>,
    closing: Shutdown,
}

impl AppServices {
    pub fn new(
        store: SharedStore,
        queue: SharedQueue,
        ledger: SharedLedger,
        reconcile: ReconcileConfig,
        fanout_capacity: usize,
    ) -> Self {
        let bus = Arc::new(FanoutBus::with_capacity(fanout_capacity));
        let reconciler = Arc::new(Reconciler::new(store.clone(), queue, ledger, reconcile));
        let engine = Arc::new(TransitionEngine::new(store, bus.clone(), reconciler.trigger()));

        Self {
            engine,
            reconciler,
            bus,
            closing: Shutdown::new(),
        }
    }

    /// In-memory registry, ledger and retry queue in front of `ledger`.
    pub fn in_memory(ledger: SharedLedger, reconcile: ReconcileConfig) -> Self {
        Self::new(
            Arc::new(InMemoryUnitStore::new()),
            Arc::new(InMemoryRetryQueue::new()),
            ledger,
            reconcile,
            tagtrail_events::DEFAULT_OBSERVER_CAPACITY,
        )
    }

    /// Wire stores and the external ledger client from configuration.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let store: SharedStore = match &config.database_url {
            Some(url) => Arc::new(
                SqliteUnitStore::connect(url)
                    .await
                    .with_context(|| format!("failed to open unit store at {url}"))?,
            ),
            None => {
                tracing::warn!("TAGTRAIL_DATABASE_URL not set; unit registry is in-memory");
                Arc::new(InMemoryUnitStore::new())
            }
        };

        let queue: SharedQueue = match &config.retry_queue_url {
            Some(url) => Arc::new(
                SqliteRetryQueue::connect(url)
                    .await
                    .with_context(|| format!("failed to open retry queue at {url}"))?,
            ),
            None => Arc::new(InMemoryRetryQueue::new()),
        };

        let ledger: SharedLedger = match &config.ledger_credentials {
            Some(credentials) => Arc::new(
                HttpLedgerClient::new(
                    &config.ledger_base_url,
                    credentials.clone(),
                    config.reconcile.submit_timeout,
                )
                .context("failed to build external ledger client")?,
            ),
            None => {
                tracing::warn!("external ledger credentials not set; moves will queue for retry");
                Arc::new(UnconfiguredLedger)
            }
        };

        Ok(Self::new(
            store,
            queue,
            ledger,
            config.reconcile.clone(),
            config.fanout_capacity,
        ))
    }

    /// End every open observer stream (used on graceful shutdown).
    pub fn close_streams(&self) {
        self.closing.trigger();
    }

    /// SSE stream of committed moves, one `move` event per commit.
    ///
    /// The subscription is read on a blocking thread and forwarded through an
    /// unbounded channel; a slow client is dropped by the bus, not buffered.
    pub fn move_stream(
        &self,
    ) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>> + use<>> {
        let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
        let subscription = self.bus.subscribe();
        let closing = self.closing.clone();

        tokio::task::spawn_blocking(move || {
            let mut last_heartbeat = std::time::Instant::now();

            loop {
                if closing.is_triggered() {
                    break;
                }
                match subscription.recv_timeout(STREAM_POLL) {
                    Ok(moved) => {
                        let data = dto::moved_to_json(&moved).to_string();
                        let event = SseEvent::default().event("move").data(data);
                        if tx.send(Ok(event)).is_err() {
                            break;
                        }
                        last_heartbeat = std::time::Instant::now();
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if last_heartbeat.elapsed() >= HEARTBEAT_EVERY {
                            let heartbeat = SseEvent::default().event("heartbeat").data("{}");
                            if tx.send(Ok(heartbeat)).is_err() {
                                break;
                            }
                            last_heartbeat = std::time::Instant::now();
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        tracing::debug!(observer = subscription.id().value(), "observer dropped by bus");
                        break;
                    }
                }
            }
        });

        Sse::new(UnboundedReceiverStream::new(rx))
            .keep_alive(KeepAlive::new().interval(HEARTBEAT_EVERY))
    }
}
