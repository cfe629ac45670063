use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::status_map::map_to_step;
use crate::models::step::WorkflowStep;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryOrder {
    pub id: Uuid,
    pub raw_status: String,
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub proof_of_delivery: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryOrder {
    pub fn new(id: Uuid, raw_status: impl Into<String>, assignee_id: Option<Uuid>) -> Self {
        Self {
            id,
            raw_status: raw_status.into(),
            assignee_id,
            proof_of_delivery: None,
            updated_at: Utc::now(),
        }
    }

    pub fn step(&self) -> WorkflowStep {
        map_to_step(&self.raw_status)
    }
}

/// A status change pushed by the server for one order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderChanged {
    pub order_id: Uuid,
    pub raw_status: String,
}

/// Reference to proof-of-delivery media captured outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    pub uri: String,
    pub content_type: String,
}
