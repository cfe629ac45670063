use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of the three racing paths resolved a confirmation attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResolutionSource {
    Push,
    Poll,
    Timer,
}

impl ResolutionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionSource::Push => "push",
            ResolutionSource::Poll => "poll",
            ResolutionSource::Timer => "timer",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationReport {
    pub attempt_id: Uuid,
    pub order_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub polls: u32,
    pub resolved_by: ResolutionSource,
}
