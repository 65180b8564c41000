//! Post-write verification with bounded retry.
//!
//! The board is eventually consistent: a field written a moment ago may still
//! read back stale. Transient failures are retried with exponential backoff
//! and jitter; everything else propagates on the first failure. Every attempt
//! is recorded per item so the run can report what was retried.

use crate::api::{BoardApi, Clock};
use crate::counters::{Counter, Counters};
use crate::error::{Result, SyncError};
use crate::transition::column_label;
use crate::types::BoardField;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_jitter_ms() -> u64 {
    250
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 for the first retry):
    /// `min(base * 2^retry, max) + jitter`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry));
        let capped = exponential.min(self.max_delay_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub label: String,
    /// 1-indexed.
    pub attempt: u32,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub transient: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemAudit {
    pub attempts: Vec<AttemptRecord>,
    pub completed_steps: BTreeSet<String>,
}

impl ItemAudit {
    pub fn attempts_for(&self, label: &str) -> u32 {
        self.attempts.iter().filter(|a| a.label == label).count() as u32
    }

    pub fn succeeded(&self, label: &str) -> bool {
        self.attempts
            .iter()
            .any(|a| a.label == label && a.succeeded)
    }
}

/// One retried operation, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub item: String,
    pub label: String,
    pub attempts: u32,
    pub succeeded: bool,
}

// ---------------------------------------------------------------------------
// StateVerifier
// ---------------------------------------------------------------------------

pub struct StateVerifier<'c> {
    policy: RetryPolicy,
    clock: &'c dyn Clock,
    audits: BTreeMap<String, ItemAudit>,
    counters: Counters,
}

impl<'c> StateVerifier<'c> {
    pub fn new(policy: RetryPolicy, clock: &'c dyn Clock) -> Self {
        Self {
            policy,
            clock,
            audits: BTreeMap::new(),
            counters: Counters::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying transient failures up to the policy bound.
    ///
    /// Non-transient errors return immediately. When transient failures use
    /// up every attempt the result is [`SyncError::RetriesExhausted`].
    pub fn retry_with_tracking<T, F>(&mut self, item: &str, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation() {
                Ok(value) => {
                    self.record(item, label, attempt, None, false);
                    if attempt > 1 {
                        tracing::info!(item, label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    self.record(item, label, attempt, Some(err.to_string()), true);
                    self.counters.increment(Counter::RetriesAttempted);
                    let delay = self.policy.delay_for(attempt - 1);
                    tracing::warn!(
                        item,
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; backing off"
                    );
                    self.clock.sleep(delay);
                }
                Err(err) if err.is_transient() => {
                    self.record(item, label, attempt, Some(err.to_string()), true);
                    self.counters.increment(Counter::RetriesExhausted);
                    tracing::warn!(item, label, attempts = attempt, error = %err, "retries exhausted");
                    return Err(SyncError::RetriesExhausted {
                        item: item.to_string(),
                        label: label.to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => {
                    self.record(item, label, attempt, Some(err.to_string()), false);
                    return Err(err);
                }
            }
        }
    }

    /// Re-read `field` until it shows `expected`. A step verified once for
    /// an item is not re-read again in the same run.
    pub fn verify_field(
        &mut self,
        api: &dyn BoardApi,
        item: &str,
        project_item_id: &str,
        field: BoardField,
        expected: Option<&str>,
    ) -> Result<()> {
        let step = format!("verify {field}={}", column_label(expected));
        if self.is_step_complete(item, &step) {
            tracing::debug!(item, step = %step, "already verified");
            return Ok(());
        }
        self.retry_with_tracking(item, &step, || {
            let actual = api.read_field(project_item_id, field)?;
            if actual.as_deref() == expected {
                Ok(())
            } else {
                Err(SyncError::EventualConsistency {
                    item: item.to_string(),
                    field: field.to_string(),
                    expected: column_label(expected).to_string(),
                    actual: column_label(actual.as_deref()).to_string(),
                })
            }
        })?;
        self.mark_step_complete(item, &step);
        Ok(())
    }

    /// Re-read an issue's or pull request's assignees until they match
    /// `expected`, ignoring order and case.
    pub fn verify_assignees(
        &mut self,
        api: &dyn BoardApi,
        item: &str,
        content_id: &str,
        expected: &[String],
    ) -> Result<()> {
        let mut wanted: Vec<String> = expected.iter().map(|l| l.to_ascii_lowercase()).collect();
        wanted.sort();
        wanted.dedup();
        let step = format!("verify assignees={}", wanted.join(","));
        if self.is_step_complete(item, &step) {
            return Ok(());
        }
        self.retry_with_tracking(item, &step, || {
            let mut actual: Vec<String> = api
                .read_assignees(content_id)?
                .iter()
                .map(|l| l.to_ascii_lowercase())
                .collect();
            actual.sort();
            actual.dedup();
            if actual == wanted {
                Ok(())
            } else {
                Err(SyncError::EventualConsistency {
                    item: item.to_string(),
                    field: "assignees".into(),
                    expected: wanted.join(","),
                    actual: actual.join(","),
                })
            }
        })?;
        self.mark_step_complete(item, &step);
        Ok(())
    }

    /// Returns `true` only the first time `step` is marked for `item`.
    pub fn mark_step_complete(&mut self, item: &str, step: &str) -> bool {
        self.audits
            .entry(item.to_string())
            .or_default()
            .completed_steps
            .insert(step.to_string())
    }

    pub fn is_step_complete(&self, item: &str, step: &str) -> bool {
        self.audits
            .get(item)
            .is_some_and(|a| a.completed_steps.contains(step))
    }

    pub fn audit(&self, item: &str) -> Option<&ItemAudit> {
        self.audits.get(item)
    }

    /// Operations that failed at least once and were attempted again.
    pub fn retried(&self) -> Vec<RetrySummary> {
        let mut out = Vec::new();
        for (item, audit) in &self.audits {
            let labels: BTreeSet<&str> = audit.attempts.iter().map(|a| a.label.as_str()).collect();
            for label in labels {
                let attempts = audit.attempts_for(label);
                let failed_once = audit
                    .attempts
                    .iter()
                    .any(|a| a.label == label && !a.succeeded);
                if attempts > 1 && failed_once {
                    out.push(RetrySummary {
                        item: item.clone(),
                        label: label.to_string(),
                        attempts,
                        succeeded: audit.succeeded(label),
                    });
                }
            }
        }
        out
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    fn record(&mut self, item: &str, label: &str, attempt: u32, error: Option<String>, transient: bool) {
        self.audits
            .entry(item.to_string())
            .or_default()
            .attempts
            .push(AttemptRecord {
                label: label.to_string(),
                attempt,
                succeeded: error.is_none(),
                error,
                transient,
            });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
