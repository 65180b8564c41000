pub mod api;
pub mod batch;
pub mod condition;
pub mod config;
pub mod context;
pub mod counters;
pub mod error;
pub mod github;
pub mod memory;
pub mod processors;
pub mod ratelimit;
pub mod reconciler;
pub mod rules;
pub mod sprint;
pub mod transition;
pub mod types;
pub mod verify;

pub use error::{Result, SyncError};
