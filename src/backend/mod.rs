pub mod http;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::BackendError;
use crate::models::courier::CourierStatus;
use crate::models::order::{DeliveryOrder, Evidence, OrderChanged};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<OrderChanged, BackendError>> + Send>>;

/// The server that owns order records and emits their status changes.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens a live feed of status changes for one order, in send order.
    async fn subscribe(&self, order_id: Uuid) -> Result<EventStream, BackendError>;

    async fn get_order(&self, order_id: Uuid) -> Result<DeliveryOrder, BackendError>;

    async fn set_order_status(&self, order_id: Uuid, raw_status: &str)
    -> Result<(), BackendError>;

    /// Stores the evidence and returns the reference to attach to the order.
    async fn upload_proof(&self, order_id: Uuid, evidence: &Evidence)
    -> Result<String, BackendError>;

    async fn set_courier_availability(
        &self,
        courier_id: Uuid,
        status: CourierStatus,
    ) -> Result<(), BackendError>;

    async fn active_order(&self, courier_id: Uuid) -> Result<Option<DeliveryOrder>, BackendError>;
}
