use chrono::{DateTime, NaiveDate, Utc};

/// A single block-producer observation, as read from the submission store.
/// Mirrors the `submissions` table / Cassandra row 1:1.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub submitted_at_date: NaiveDate,
    pub submitted_at: DateTime<Utc>,
    pub submitter: String,
    pub created_at: DateTime<Utc>,
    pub block_hash: String,
    pub state_hash: String,
    pub parent: String,
    pub height: i64,
    pub slot: i64,
    pub remote_addr: Option<String>,
    pub peer_id: Option<String>,
    pub graphql_control_port: Option<i32>,
    pub built_with_commit_sha: Option<String>,
    pub validation_error: Option<String>,
    pub verified: bool,
}

impl Submission {
    /// A submission participates in chain selection only when verified and
    /// free of a (non-empty) validation error. An empty-string error is
    /// treated as equivalent to no error.
    pub fn is_valid(&self) -> bool {
        self.verified
            && self
                .validation_error
                .as_deref()
                .map(|e| e.is_empty())
                .unwrap_or(true)
    }
}

/// One row of the flattened per-batch working set the chain selector
/// consumes; the Rust replacement for the source's `master_df`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub state_hash: String,
    pub parent_state_hash: String,
    pub block_producer_key: String,
    pub blockchain_height: i64,
    pub slot: i64,
    pub blockchain_epoch: i64,
    pub file_timestamps: DateTime<Utc>,
    pub file_name: String,
}

impl From<&Submission> for BatchRow {
    fn from(s: &Submission) -> Self {
        BatchRow {
            state_hash: s.state_hash.clone(),
            parent_state_hash: s.parent.clone(),
            block_producer_key: s.submitter.clone(),
            blockchain_height: s.height,
            slot: s.slot,
            blockchain_epoch: s.created_at.timestamp_millis(),
            file_timestamps: s.submitted_at,
            file_name: format!("{}-{}", s.submitted_at, s.submitter),
        }
    }
}

/// A block producer known to the scoreboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub block_producer_key: String,
}

/// The durable record of one processed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BotLog {
    pub id: i64,
    pub processing_time: f64,
    pub files_processed: i64,
    pub file_timestamps: DateTime<Utc>,
    pub batch_start_epoch: f64,
    pub batch_end_epoch: f64,
}

/// The canonical fragment chosen for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StatehashResult {
    pub bot_log_id: i64,
    pub state_hash: String,
    pub parent_state_hash: String,
}

/// One point awarded to a producer for landing on the canonical chain.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub file_name: String,
    pub file_timestamps: DateTime<Utc>,
    pub blockchain_epoch: i64,
    pub block_producer_key: String,
    pub blockchain_height: i64,
    pub amount: i32,
    pub created_at: DateTime<Utc>,
    pub bot_log_id: i64,
    pub state_hash: String,
}

/// A parent->child relation among state hashes, as persisted in
/// `statehash_results` for the prior batch and fed back into the next
/// batch's graph construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relation {
    pub parent_state_hash: String,
    pub state_hash: String,
}
