use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::models::order::DeliveryOrder;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed { polls: u32 },
    /// The deadline passed first. Informational: the auto-resolve timer
    /// still owns the final word.
    TimedOut { polls: u32 },
}

/// Secondary path to the terminal status: asks the server on a fixed
/// interval until a predicate holds or the deadline passes.
pub struct PollConfirmer {
    backend: Arc<dyn Backend>,
    metrics: Metrics,
    interval: Duration,
    deadline: Duration,
}

impl PollConfirmer {
    pub fn new(
        backend: Arc<dyn Backend>,
        metrics: Metrics,
        interval: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            backend,
            metrics,
            interval,
            deadline,
        }
    }

    /// Queries `order_id` every interval, starting one interval from now.
    ///
    /// `observe` sees each fetched record that does not satisfy `predicate`.
    /// Query failures are logged and count as a tick.
    pub async fn confirm_until<P, F>(&self, order_id: Uuid, predicate: P, mut observe: F) -> PollOutcome
    where
        P: Fn(&str) -> bool,
        F: FnMut(&DeliveryOrder),
    {
        let start = Instant::now();
        let deadline = start + self.deadline;
        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut polls = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => return PollOutcome::TimedOut { polls },
                _ = ticker.tick() => {}
            }

            polls += 1;
            self.metrics.poll_ticks_total.inc();

            match self.backend.get_order(order_id).await {
                Ok(order) if predicate(&order.raw_status) => {
                    debug!(order_id = %order_id, polls, "poll observed confirmation");
                    return PollOutcome::Confirmed { polls };
                }
                Ok(order) => observe(&order),
                Err(err) => {
                    warn!(order_id = %order_id, polls, error = %err, "confirmation poll failed");
                }
            }
        }
    }
}
