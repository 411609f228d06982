use super::{QueryWindow, SubmissionStore};
use crate::error::{CoordinatorError, Result};
use crate::models::Submission;
use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio_postgres::NoTls;

/// Postgres variant of `SubmissionStore`: a single `SELECT` against a
/// `submissions` table bounded by `created_at`.
pub struct PostgresSubmissionStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PostgresSubmissionStore {
    pub fn new(pool: Pool<PostgresConnectionManager<NoTls>>) -> Self {
        PostgresSubmissionStore { pool }
    }

    fn build_query(window: &QueryWindow, limit: Option<u32>) -> String {
        let start_op = if window.start_inclusive { ">=" } else { ">" };
        let end_op = if window.end_inclusive { "<=" } else { "<" };
        let mut query = format!(
            "SELECT submitted_at_date, submitted_at, submitter, created_at, block_hash, \
             remote_addr, peer_id, graphql_control_port, built_with_commit_sha, state_hash, \
             parent, height, slot, validation_error, verified \
             FROM submissions WHERE created_at {start_op} $1 AND created_at {end_op} $2"
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        query
    }
}

#[async_trait]
impl SubmissionStore for PostgresSubmissionStore {
    async fn get_submissions(
        &self,
        window: QueryWindow,
        limit: Option<u32>,
    ) -> Result<Vec<Submission>> {
        let conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let query = Self::build_query(&window, limit);
        let rows = conn.query(&query, &[&window.start, &window.end]).await?;

        let mut submissions = Vec::with_capacity(rows.len());
        for row in rows {
            submissions.push(Submission {
                submitted_at_date: row.try_get("submitted_at_date")?,
                submitted_at: row.try_get("submitted_at")?,
                submitter: row.try_get("submitter")?,
                created_at: row.try_get("created_at")?,
                block_hash: row.try_get("block_hash")?,
                state_hash: row.try_get("state_hash")?,
                parent: row.try_get("parent")?,
                height: row.try_get("height")?,
                slot: row.try_get("slot")?,
                remote_addr: row.try_get("remote_addr")?,
                peer_id: row.try_get("peer_id")?,
                graphql_control_port: row.try_get("graphql_control_port")?,
                built_with_commit_sha: row.try_get("built_with_commit_sha")?,
                validation_error: row.try_get("validation_error")?,
                verified: row.try_get("verified")?,
            });
        }
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn query_respects_inclusivity_flags() {
        let window = QueryWindow {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
            start_inclusive: true,
            end_inclusive: false,
        };
        let query = PostgresSubmissionStore::build_query(&window, None);
        assert!(query.contains("created_at >= $1"));
        assert!(query.contains("created_at < $2"));
    }
}
