//! Rate-limit preflight.
//!
//! Bulk reads and writes check the remaining budget first. Below the floor the
//! operation is skipped outright; skipping is an outcome, not an error.

use crate::api::{BoardApi, RateLimitStatus};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Preflight {
    Proceed { remaining: u32 },
    Skip {
        remaining: u32,
        floor: u32,
        reset_at: DateTime<Utc>,
    },
}

impl Preflight {
    pub fn evaluate(status: &RateLimitStatus, floor: u32) -> Self {
        if status.remaining < floor {
            Preflight::Skip {
                remaining: status.remaining,
                floor,
                reset_at: status.reset_at,
            }
        } else {
            Preflight::Proceed {
                remaining: status.remaining,
            }
        }
    }

    pub fn proceeds(&self) -> bool {
        matches!(self, Preflight::Proceed { .. })
    }
}

/// Probe the board's budget before an operation labelled `operation`.
pub fn preflight(api: &dyn BoardApi, floor: u32, operation: &str) -> Result<Preflight> {
    let status = api.rate_limit_status()?;
    let outcome = Preflight::evaluate(&status, floor);
    match &outcome {
        Preflight::Proceed { remaining } => {
            tracing::debug!(operation, remaining, "rate-limit preflight passed");
        }
        Preflight::Skip {
            remaining,
            floor,
            reset_at,
        } => {
            tracing::warn!(
                operation,
                remaining,
                floor,
                reset_at = %reset_at,
                "rate-limit budget below floor; skipping"
            );
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn status(remaining: u32) -> RateLimitStatus {
        RateLimitStatus {
            remaining,
            limit: 5000,
            reset_at: Utc.with_ymd_and_hms(2024, 6, 1, 1, 0, 0).unwrap(),
        }
    }

    #[test]
    fn below_floor_skips() {
        let p = Preflight::evaluate(&status(99), 100);
        assert!(!p.proceeds());
        assert!(matches!(p, Preflight::Skip { remaining: 99, floor: 100, .. }));
    }

    #[test]
    fn at_floor_proceeds() {
        assert!(Preflight::evaluate(&status(100), 100).proceeds());
    }
}
