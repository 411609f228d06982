pub mod cassandra;
pub mod postgres;
pub mod shard;

use crate::error::Result;
use crate::models::Submission;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A half-open or closed query window; either both bounds are inclusive
/// or neither.
#[derive(Debug, Clone, Copy)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub start_inclusive: bool,
    pub end_inclusive: bool,
}

impl QueryWindow {
    /// The window the coordinator always asks for: `[start, end)`.
    pub fn half_open(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        QueryWindow { start, end, start_inclusive: true, end_inclusive: false }
    }
}

/// Pluggable capability interface for reading validated submissions,
/// selected by the `SUBMISSION_STORAGE` config enum at startup.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get_submissions(
        &self,
        window: QueryWindow,
        limit: Option<u32>,
    ) -> Result<Vec<Submission>>;
}
