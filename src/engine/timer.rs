use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// One-shot fallback deadline for a confirmation attempt.
#[derive(Debug, Clone, Copy)]
pub struct AutoResolveTimer {
    deadline: Instant,
}

impl AutoResolveTimer {
    pub fn start(period: Duration) -> Self {
        Self {
            deadline: Instant::now() + period,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Completes once the deadline has passed.
    pub async fn expired(&self) {
        sleep_until(self.deadline).await;
    }
}
