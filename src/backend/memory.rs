use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{Backend, EventStream};
use crate::error::BackendError;
use crate::models::courier::CourierStatus;
use crate::models::order::{DeliveryOrder, Evidence, OrderChanged};

/// Backend kept entirely in process memory.
///
/// Every status write is broadcast to the order's subscribers, the way the
/// real server emits change events. The knobs (`set_push_online`,
/// `reject_commands`, `set_command_latency`, ...) simulate the failure modes
/// the sync engine has to live with.
pub struct MemoryBackend {
    orders: DashMap<Uuid, DeliveryOrder>,
    feeds: DashMap<Uuid, broadcast::Sender<OrderChanged>>,
    status_writes: DashMap<Uuid, Vec<String>>,
    availability_writes: DashMap<Uuid, Vec<CourierStatus>>,
    proofs: DashMap<Uuid, Vec<Evidence>>,
    event_buffer_size: usize,
    push_online: AtomicBool,
    reads_online: AtomicBool,
    reject_commands: AtomicBool,
    command_latency_ms: AtomicU64,
}

impl MemoryBackend {
    pub fn new(event_buffer_size: usize) -> Self {
        Self {
            orders: DashMap::new(),
            feeds: DashMap::new(),
            status_writes: DashMap::new(),
            availability_writes: DashMap::new(),
            proofs: DashMap::new(),
            event_buffer_size: event_buffer_size.max(1),
            push_online: AtomicBool::new(true),
            reads_online: AtomicBool::new(true),
            reject_commands: AtomicBool::new(false),
            command_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn insert_order(&self, order: DeliveryOrder) {
        self.orders.insert(order.id, order);
    }

    pub fn order(&self, order_id: Uuid) -> Option<DeliveryOrder> {
        self.orders.get(&order_id).map(|entry| entry.value().clone())
    }

    /// Server-side status change, as if the shop or the recipient acted.
    pub fn server_set_status(&self, order_id: Uuid, raw_status: &str) {
        if let Some(mut order) = self.orders.get_mut(&order_id) {
            order.raw_status = raw_status.to_string();
            order.updated_at = Utc::now();
        }
        self.emit(order_id, raw_status);
    }

    /// Replays an event to current subscribers without touching the record.
    pub fn emit(&self, order_id: Uuid, raw_status: &str) {
        if let Some(feed) = self.feeds.get(&order_id) {
            let _ = feed.send(OrderChanged {
                order_id,
                raw_status: raw_status.to_string(),
            });
        }
    }

    /// Closes every open subscription for the order.
    pub fn drop_connections(&self, order_id: Uuid) {
        self.feeds.remove(&order_id);
    }

    pub fn set_push_online(&self, online: bool) {
        self.push_online.store(online, Ordering::SeqCst);
        if !online {
            self.feeds.clear();
        }
    }

    pub fn set_reads_online(&self, online: bool) {
        self.reads_online.store(online, Ordering::SeqCst);
    }

    pub fn reject_commands(&self, reject: bool) {
        self.reject_commands.store(reject, Ordering::SeqCst);
    }

    pub fn set_command_latency(&self, latency: Duration) {
        self.command_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, order_id: Uuid) -> usize {
        self.feeds
            .get(&order_id)
            .map(|feed| feed.receiver_count())
            .unwrap_or(0)
    }

    pub fn status_writes(&self, order_id: Uuid) -> Vec<String> {
        self.status_writes
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn availability_writes(&self, courier_id: Uuid) -> Vec<CourierStatus> {
        self.availability_writes
            .get(&courier_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn proof_uploads(&self, order_id: Uuid) -> usize {
        self.proofs
            .get(&order_id)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    async fn command_latency(&self) {
        let millis = self.command_latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn subscribe(&self, order_id: Uuid) -> Result<EventStream, BackendError> {
        if !self.push_online.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost(
                "push endpoint unreachable".to_string(),
            ));
        }

        let rx = self
            .feeds
            .entry(order_id)
            .or_insert_with(|| broadcast::channel(self.event_buffer_size).0)
            .subscribe();

        debug!(order_id = %order_id, "memory backend subscription opened");

        let stream = BroadcastStream::new(rx).map(|result| match result {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Err(BackendError::ConnectionLost(
                format!("subscriber lagged by {skipped} events"),
            )),
        });

        Ok(Box::pin(stream))
    }

    async fn get_order(&self, order_id: Uuid) -> Result<DeliveryOrder, BackendError> {
        if !self.reads_online.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost(
                "order endpoint unreachable".to_string(),
            ));
        }

        self.order(order_id).ok_or(BackendError::NotFound(order_id))
    }

    async fn set_order_status(
        &self,
        order_id: Uuid,
        raw_status: &str,
    ) -> Result<(), BackendError> {
        self.command_latency().await;

        if self.reject_commands.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!(
                "status {raw_status} refused"
            )));
        }
        if !self.orders.contains_key(&order_id) {
            return Err(BackendError::NotFound(order_id));
        }

        self.status_writes
            .entry(order_id)
            .or_default()
            .push(raw_status.to_string());
        self.server_set_status(order_id, raw_status);
        Ok(())
    }

    async fn upload_proof(
        &self,
        order_id: Uuid,
        evidence: &Evidence,
    ) -> Result<String, BackendError> {
        self.command_latency().await;

        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or(BackendError::NotFound(order_id))?;

        let mut uploads = self.proofs.entry(order_id).or_default();
        uploads.push(evidence.clone());
        let reference = format!("memory://proof/{order_id}/{}", uploads.len());

        order.proof_of_delivery = Some(reference.clone());
        Ok(reference)
    }

    async fn set_courier_availability(
        &self,
        courier_id: Uuid,
        status: CourierStatus,
    ) -> Result<(), BackendError> {
        self.availability_writes
            .entry(courier_id)
            .or_default()
            .push(status);
        Ok(())
    }

    async fn active_order(&self, courier_id: Uuid) -> Result<Option<DeliveryOrder>, BackendError> {
        Ok(self
            .orders
            .iter()
            .find(|entry| {
                let order = entry.value();
                order.assignee_id == Some(courier_id) && !order.step().is_settled()
            })
            .map(|entry| entry.value().clone()))
    }
}
