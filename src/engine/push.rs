use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, EventStream};
use crate::engine::store::{ApplyOutcome, OrderStore};
use crate::observability::metrics::Metrics;

/// Advisory connection indicator for the UI. Correctness never depends on it.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
}

/// One live subscription bound to exactly one order.
/// Dropping the session stops its receive loop.
pub struct SyncSession {
    order_id: Uuid,
    epoch: u64,
    task: JoinHandle<()>,
}

impl SyncSession {
    pub fn order_id(&self) -> Uuid {
        self.order_id
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct PushSyncChannel {
    backend: Arc<dyn Backend>,
    store: Arc<OrderStore>,
    metrics: Metrics,
    reconnect_delay: Duration,
    connectivity: Arc<watch::Sender<Connectivity>>,
    session: Mutex<Option<SyncSession>>,
}

impl PushSyncChannel {
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<OrderStore>,
        metrics: Metrics,
        reconnect_delay: Duration,
    ) -> Self {
        let (connectivity, _unused_rx) = watch::channel(Connectivity::Disconnected);

        Self {
            backend,
            store,
            metrics,
            reconnect_delay,
            connectivity: Arc::new(connectivity),
            session: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<SyncSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a session for `order_id`, tearing down the previous one first.
    pub fn bind(&self, order_id: Uuid, epoch: u64) {
        let mut slot = self.slot();
        if let Some(previous) = slot.take() {
            debug!(order_id = %previous.order_id, "replacing push session");
            drop(previous);
        }

        let worker = SessionWorker {
            backend: self.backend.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            connectivity: self.connectivity.clone(),
            reconnect_delay: self.reconnect_delay,
            order_id,
            epoch,
        };

        *slot = Some(SyncSession {
            order_id,
            epoch,
            task: tokio::spawn(worker.run()),
        });
    }

    /// Stops the session if it still belongs to `epoch`.
    pub fn teardown_epoch(&self, epoch: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|session| session.epoch == epoch) {
            slot.take();
            self.mark_disconnected();
        }
    }

    pub fn teardown(&self) {
        if self.slot().take().is_some() {
            self.mark_disconnected();
        }
    }

    fn mark_disconnected(&self) {
        self.connectivity.send_replace(Connectivity::Disconnected);
        self.metrics.push_connected.set(0);
    }

    pub fn bound_order(&self) -> Option<Uuid> {
        self.slot().as_ref().map(SyncSession::order_id)
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }
}

struct SessionWorker {
    backend: Arc<dyn Backend>,
    store: Arc<OrderStore>,
    metrics: Metrics,
    connectivity: Arc<watch::Sender<Connectivity>>,
    reconnect_delay: Duration,
    order_id: Uuid,
    epoch: u64,
}

impl SessionWorker {
    async fn run(self) {
        info!(order_id = %self.order_id, "push session started");

        while self.store.is_current(self.epoch) {
            self.set_connectivity(Connectivity::Connecting);

            match self.backend.subscribe(self.order_id).await {
                Ok(stream) => {
                    self.set_connectivity(Connectivity::Connected);
                    info!(order_id = %self.order_id, "push channel connected");
                    self.resync().await;
                    if !self.pump(stream).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(order_id = %self.order_id, error = %err, "push subscribe failed");
                }
            }

            if !self.store.is_current(self.epoch) {
                break;
            }

            self.set_connectivity(Connectivity::Disconnected);
            self.metrics.push_reconnects_total.inc();
            debug!(
                order_id = %self.order_id,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "push reconnect scheduled"
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }

        debug!(order_id = %self.order_id, "push session ended");
    }

    /// Pulls the record once so changes missed while disconnected are not lost.
    async fn resync(&self) {
        match self.backend.get_order(self.order_id).await {
            Ok(order) => {
                if let ApplyOutcome::Updated(step) = self.store.apply_order(self.epoch, order) {
                    info!(order_id = %self.order_id, step = %step, "resynced after connect");
                }
            }
            Err(err) => {
                warn!(order_id = %self.order_id, error = %err, "resync after connect failed");
            }
        }
    }

    /// Applies events until the stream ends. Returns `false` once the
    /// binding this session serves is gone.
    async fn pump(&self, mut stream: EventStream) -> bool {
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    warn!(order_id = %self.order_id, error = %err, "push stream failed");
                    return true;
                }
            };

            if event.order_id != self.order_id {
                debug!(order_id = %event.order_id, "ignoring event for another order");
                continue;
            }

            match self
                .store
                .apply_status(self.epoch, self.order_id, &event.raw_status)
            {
                ApplyOutcome::Stale => {
                    self.metrics
                        .push_events_total
                        .with_label_values(&["stale"])
                        .inc();
                    return false;
                }
                ApplyOutcome::Unchanged => {
                    self.metrics
                        .push_events_total
                        .with_label_values(&["duplicate"])
                        .inc();
                }
                ApplyOutcome::Updated(step) => {
                    self.metrics
                        .push_events_total
                        .with_label_values(&["applied"])
                        .inc();
                    info!(
                        order_id = %self.order_id,
                        raw_status = %event.raw_status,
                        step = %step,
                        "order status pushed"
                    );
                }
            }
        }

        warn!(order_id = %self.order_id, "push stream closed");
        true
    }

    fn set_connectivity(&self, state: Connectivity) {
        if !self.store.is_current(self.epoch) {
            return;
        }
        self.connectivity.send_replace(state);
        self.metrics
            .push_connected
            .set(i64::from(state == Connectivity::Connected));
    }
}
