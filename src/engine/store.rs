use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::confirmation::ConfirmationReport;
use crate::models::order::DeliveryOrder;
use crate::models::step::WorkflowStep;

/// What the UI layer sees: the active order and its derived step.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderSnapshot {
    pub epoch: u64,
    pub order: Option<DeliveryOrder>,
    pub step: WorkflowStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The write belongs to a binding that is no longer current.
    Stale,
    /// Same status as already held; nothing observable changed.
    Unchanged,
    Updated(WorkflowStep),
}

struct StoreInner {
    epoch: u64,
    active: Option<DeliveryOrder>,
}

/// Holder of the single active order.
///
/// Each bind, unbind and retire starts a new epoch. Writers pass the epoch
/// they were started under and the store drops their writes once it has
/// moved on, so background work of a torn-down binding can never land on
/// the next order. The inner lock is never held across an `.await`.
pub struct OrderStore {
    inner: Mutex<StoreInner>,
    snapshots: watch::Sender<OrderSnapshot>,
    history: DashMap<Uuid, DeliveryOrder>,
    confirmations: DashMap<Uuid, ConfirmationReport>,
}

impl OrderStore {
    pub fn new() -> Self {
        let (snapshots, _unused_rx) = watch::channel(OrderSnapshot {
            epoch: 0,
            order: None,
            step: WorkflowStep::None,
        });

        Self {
            inner: Mutex::new(StoreInner {
                epoch: 0,
                active: None,
            }),
            snapshots,
            history: DashMap::new(),
            confirmations: DashMap::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &StoreInner) {
        let step = inner
            .active
            .as_ref()
            .map(DeliveryOrder::step)
            .unwrap_or(WorkflowStep::None);

        self.snapshots.send_replace(OrderSnapshot {
            epoch: inner.epoch,
            order: inner.active.clone(),
            step,
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<OrderSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> OrderSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.lock().epoch == epoch
    }

    /// Makes `order` the active order and returns the new epoch.
    pub fn bind(&self, order: DeliveryOrder) -> u64 {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.active = Some(order);
        self.publish(&inner);
        inner.epoch
    }

    /// Clears the active order of `epoch` and starts a new epoch, so every
    /// writer started under the old one becomes stale.
    pub fn unbind(&self, epoch: u64) -> Option<DeliveryOrder> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return None;
        }
        inner.epoch += 1;
        let previous = inner.active.take();
        self.publish(&inner);
        previous
    }

    /// Last-write-wins application of a pushed status.
    pub fn apply_status(&self, epoch: u64, order_id: Uuid, raw_status: &str) -> ApplyOutcome {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return ApplyOutcome::Stale;
        }

        let Some(order) = inner.active.as_mut().filter(|order| order.id == order_id) else {
            return ApplyOutcome::Stale;
        };

        if order.raw_status == raw_status {
            return ApplyOutcome::Unchanged;
        }

        order.raw_status = raw_status.to_string();
        order.updated_at = Utc::now();
        let step = order.step();
        self.publish(&inner);
        ApplyOutcome::Updated(step)
    }

    /// Applies a full record fetched from the server. A locally attached
    /// proof survives a record that does not carry one yet.
    pub fn apply_order(&self, epoch: u64, fetched: DeliveryOrder) -> ApplyOutcome {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return ApplyOutcome::Stale;
        }

        let Some(order) = inner.active.as_mut().filter(|order| order.id == fetched.id) else {
            return ApplyOutcome::Stale;
        };

        let proof = fetched
            .proof_of_delivery
            .or_else(|| order.proof_of_delivery.clone());
        let unchanged = order.raw_status == fetched.raw_status
            && order.assignee_id == fetched.assignee_id
            && order.proof_of_delivery == proof;
        if unchanged {
            return ApplyOutcome::Unchanged;
        }

        order.raw_status = fetched.raw_status;
        order.assignee_id = fetched.assignee_id;
        order.proof_of_delivery = proof;
        order.updated_at = Utc::now();
        let step = order.step();
        self.publish(&inner);
        ApplyOutcome::Updated(step)
    }

    /// Attaches the proof reference once; later calls keep the first one.
    pub fn attach_proof(&self, epoch: u64, reference: &str) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }

        let attached = match inner.active.as_mut() {
            Some(order) if order.proof_of_delivery.is_none() => {
                order.proof_of_delivery = Some(reference.to_string());
                true
            }
            _ => false,
        };

        if attached {
            self.publish(&inner);
        }
        attached
    }

    /// Moves the active order of `epoch` into history.
    pub fn retire(&self, epoch: u64, final_status: Option<&str>) -> Option<DeliveryOrder> {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return None;
        }

        let mut order = inner.active.take()?;
        if let Some(status) = final_status {
            order.raw_status = status.to_string();
        }
        order.updated_at = Utc::now();

        inner.epoch += 1;
        self.history.insert(order.id, order.clone());
        self.publish(&inner);
        Some(order)
    }

    pub fn record_confirmation(&self, report: ConfirmationReport) {
        self.confirmations.insert(report.order_id, report);
    }

    pub fn history(&self) -> Vec<DeliveryOrder> {
        let mut orders: Vec<DeliveryOrder> = self
            .history
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| order.updated_at);
        orders
    }

    pub fn confirmations(&self) -> Vec<ConfirmationReport> {
        let mut reports: Vec<ConfirmationReport> = self
            .confirmations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        reports.sort_by_key(|report| report.resolved_at);
        reports
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}
