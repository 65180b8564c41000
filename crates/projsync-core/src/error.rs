use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed transition table: {0}")]
    MalformedTransitions(String),

    #[error("board field not found: {0}")]
    FieldNotFound(String),

    #[error("unknown column '{0}' on board")]
    UnknownColumn(String),

    #[error("work item not found: {0}")]
    ItemNotFound(String),

    #[error("item {item} is not on the board")]
    NotOnBoard { item: String },

    #[error("{field} for {item} not yet consistent: expected {expected}, read {actual}")]
    EventualConsistency {
        item: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("secondary rate limit hit: {0}")]
    SecondaryRateLimit(String),

    #[error("rate limit exhausted: {remaining} remaining, resets at {reset_at}")]
    RateLimitExhausted { remaining: u32, reset_at: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("mutation {alias} failed: {message}")]
    Mutation { alias: String, message: String },

    #[error("retries exhausted for '{label}' on {item} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        item: String,
        label: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid event payload: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Errors worth retrying: the board has not caught up with a write yet, or
    /// a short-lived secondary limit was tripped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::EventualConsistency { .. } | SyncError::SecondaryRateLimit(_)
        )
    }

    /// Errors that must stop the whole run instead of failing a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigNotFound(_)
                | SyncError::InvalidConfig(_)
                | SyncError::MalformedTransitions(_)
                | SyncError::FieldNotFound(_)
                | SyncError::RateLimitExhausted { .. }
                | SyncError::Unauthorized(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_mismatch_is_transient_not_fatal() {
        let err = SyncError::EventualConsistency {
            item: "PVTI_1".into(),
            field: "column".into(),
            expected: "Active".into(),
            actual: "New".into(),
        };
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn auth_and_exhaustion_are_fatal_and_never_transient() {
        let auth = SyncError::Unauthorized("bad credentials".into());
        let exhausted = SyncError::RateLimitExhausted {
            remaining: 0,
            reset_at: "2024-06-01T00:00:00Z".into(),
        };
        for err in [auth, exhausted] {
            assert!(err.is_fatal());
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn plain_api_error_is_neither() {
        let err = SyncError::Api("boom".into());
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
    }
}
