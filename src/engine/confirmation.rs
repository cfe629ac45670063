use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::confirmation::{ConfirmationReport, ResolutionSource};

const OPEN: u8 = 0;
const RESOLVED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum AttemptState {
    Open,
    Resolved,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConfirmationView {
    pub attempt_id: Uuid,
    pub order_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub polls: u32,
    pub state: AttemptState,
    pub resolved_by: Option<ResolutionSource>,
}

/// The race between push, poll and timer for one confirmation phase.
///
/// Only the caller whose [`ConfirmationAttempt::try_resolve`] flips the
/// state from open gets to run the finalize effect.
#[derive(Debug)]
pub struct ConfirmationAttempt {
    id: Uuid,
    order_id: Uuid,
    started_at: DateTime<Utc>,
    polls: AtomicU32,
    state: AtomicU8,
    resolution: OnceLock<(ResolutionSource, DateTime<Utc>)>,
    settled: watch::Sender<bool>,
}

impl ConfirmationAttempt {
    pub fn new(order_id: Uuid) -> Self {
        let (settled, _unused_rx) = watch::channel(false);

        Self {
            id: Uuid::new_v4(),
            order_id,
            started_at: Utc::now(),
            polls: AtomicU32::new(0),
            state: AtomicU8::new(OPEN),
            resolution: OnceLock::new(),
            settled,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn order_id(&self) -> Uuid {
        self.order_id
    }

    pub fn state(&self) -> AttemptState {
        match self.state.load(Ordering::Acquire) {
            OPEN => AttemptState::Open,
            RESOLVED => AttemptState::Resolved,
            _ => AttemptState::Cancelled,
        }
    }

    pub fn record_poll(&self) -> u32 {
        self.polls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Returns `true` for exactly one caller over the attempt's lifetime.
    pub fn try_resolve(&self, source: ResolutionSource) -> bool {
        let won = self
            .state
            .compare_exchange(OPEN, RESOLVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            let _ = self.resolution.set((source, Utc::now()));
            self.settled.send_replace(true);
        }
        won
    }

    /// Withdraws the attempt; no trigger can resolve it afterwards.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(OPEN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.settled.send_replace(true);
        }
        cancelled
    }

    /// Completes once the attempt is resolved or cancelled.
    pub async fn settled(&self) {
        let mut settled = self.settled.subscribe();
        let _ = settled.wait_for(|done| *done).await;
    }

    pub fn resolved_by(&self) -> Option<ResolutionSource> {
        self.resolution.get().map(|(source, _)| *source)
    }

    pub fn view(&self) -> ConfirmationView {
        ConfirmationView {
            attempt_id: self.id,
            order_id: self.order_id,
            started_at: self.started_at,
            polls: self.polls(),
            state: self.state(),
            resolved_by: self.resolved_by(),
        }
    }

    pub fn report(&self) -> Option<ConfirmationReport> {
        let (resolved_by, resolved_at) = *self.resolution.get()?;
        Some(ConfirmationReport {
            attempt_id: self.id,
            order_id: self.order_id,
            started_at: self.started_at,
            resolved_at,
            polls: self.polls(),
            resolved_by,
        })
    }
}
