use crate::error::{CoordinatorError, Result};
use crate::models::{BotLog, PointRecord, Relation, StatehashResult, Submission};
use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio_postgres::NoTls;

/// Postgres-backed persistence for everything downstream of chain
/// selection: bot logs, the canonical fragment, point records, and the
/// scoreboard. Batch persistence runs as one atomic transaction; the
/// scoreboard refresh is a separate transaction.
pub struct ResultDB {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

/// What `persist_batch` needs to know before the batch has a row id.
pub struct NewBotLog {
    pub processing_time: f64,
    pub files_processed: i64,
    pub file_timestamps: DateTime<Utc>,
    pub batch_start_epoch: f64,
    pub batch_end_epoch: f64,
}

/// Persistence seam so the batch loop can run against a fake in tests
/// without a live Postgres connection.
#[async_trait]
pub trait ResultDb: Send + Sync {
    async fn get_last_bot_log(&self) -> Result<Option<BotLog>>;

    async fn get_previous_selection(
        &self,
        prior_bot_log_id: Option<i64>,
    ) -> Result<(Vec<String>, Vec<Relation>)>;

    async fn persist_batch(
        &self,
        bot_log: NewBotLog,
        submitters: &[String],
        statehash_results: &[StatehashResult],
        point_records: &[PointRecord],
    ) -> Result<i64>;

    async fn update_scoreboard(&self, uptime_days_for_score: i64) -> Result<()>;

    async fn update_application_status(&self, statuses: &[(String, bool)]) -> Result<()>;

    async fn mirror_submissions(&self, submissions: &[Submission]) -> Result<()>;
}

impl ResultDB {
    pub fn new(pool: Pool<PostgresConnectionManager<NoTls>>) -> Self {
        ResultDB { pool }
    }
}

#[async_trait]
impl ResultDb for ResultDB {
    /// Seeds `BatchState` on startup.
    async fn get_last_bot_log(&self) -> Result<Option<BotLog>> {
        let conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let row = conn
            .query_opt(
                "SELECT id, processing_time, files_processed, file_timestamps, \
                 batch_start_epoch, batch_end_epoch FROM bot_logs ORDER BY id DESC LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.map(|r| BotLog {
            id: r.get("id"),
            processing_time: r.get("processing_time"),
            files_processed: r.get("files_processed"),
            file_timestamps: r.get("file_timestamps"),
            batch_start_epoch: r.get("batch_start_epoch"),
            batch_end_epoch: r.get("batch_end_epoch"),
        }))
    }

    /// The canonical fragment and relations selected by the prior batch.
    /// Empty on the first batch, when there is no prior `bot_log_id`.
    async fn get_previous_selection(
        &self,
        prior_bot_log_id: Option<i64>,
    ) -> Result<(Vec<String>, Vec<Relation>)> {
        let Some(bot_log_id) = prior_bot_log_id else {
            return Ok((Vec::new(), Vec::new()));
        };
        let conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let rows = conn
            .query(
                "SELECT state_hash, parent_state_hash FROM statehash_results WHERE bot_log_id = $1",
                &[&bot_log_id],
            )
            .await?;

        let mut selected = Vec::with_capacity(rows.len());
        let mut relations = Vec::with_capacity(rows.len());
        for row in rows {
            let state_hash: String = row.get("state_hash");
            let parent_state_hash: String = row.get("parent_state_hash");
            selected.push(state_hash.clone());
            relations.push(Relation { parent_state_hash, state_hash });
        }
        Ok((selected, relations))
    }

    /// Writes the bot log row, every distinct submitter observed this
    /// batch, the canonical fragment, and the point records it earned, all
    /// in one transaction.
    async fn persist_batch(
        &self,
        bot_log: NewBotLog,
        submitters: &[String],
        statehash_results: &[StatehashResult],
        point_records: &[PointRecord],
    ) -> Result<i64> {
        let mut conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_one(
                "INSERT INTO bot_logs (processing_time, files_processed, file_timestamps, \
                 batch_start_epoch, batch_end_epoch) VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[
                    &bot_log.processing_time,
                    &bot_log.files_processed,
                    &bot_log.file_timestamps,
                    &bot_log.batch_start_epoch,
                    &bot_log.batch_end_epoch,
                ],
            )
            .await?;
        let bot_log_id: i64 = row.get("id");

        // Every submitter observed this batch gets a node row, not just
        // the ones that earned a point (original_source coordinator.py,
        // master_df["submitter"].unique()).
        let distinct_submitters: HashSet<&str> = submitters.iter().map(String::as_str).collect();
        for producer in distinct_submitters {
            tx.execute(
                "INSERT INTO nodes (block_producer_key) VALUES ($1) \
                 ON CONFLICT (block_producer_key) DO NOTHING",
                &[&producer],
            )
            .await?;
        }

        // state_hash/parent_state_hash must exist in `statehash` before
        // statehash_results can reference them.
        let mut hashes: HashSet<&str> = HashSet::new();
        for result in statehash_results {
            hashes.insert(result.state_hash.as_str());
            hashes.insert(result.parent_state_hash.as_str());
        }
        for hash in hashes {
            tx.execute(
                "INSERT INTO statehash (state_hash) VALUES ($1) ON CONFLICT (state_hash) DO NOTHING",
                &[&hash],
            )
            .await?;
        }

        for result in statehash_results {
            tx.execute(
                "INSERT INTO statehash_results (bot_log_id, state_hash, parent_state_hash) \
                 VALUES ($1, $2, $3)",
                &[&bot_log_id, &result.state_hash, &result.parent_state_hash],
            )
            .await?;
        }

        for point in point_records {
            tx.execute(
                "INSERT INTO point_record (file_name, file_timestamps, blockchain_epoch, \
                 block_producer_key, blockchain_height, amount, created_at, bot_log_id, state_hash) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &point.file_name,
                    &point.file_timestamps,
                    &point.blockchain_epoch,
                    &point.block_producer_key,
                    &point.blockchain_height,
                    &point.amount,
                    &point.created_at,
                    &bot_log_id,
                    &point.state_hash,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(bot_log_id)
    }

    /// Runs in its own transaction, separate from `persist_batch`: a
    /// scoreboard recompute failure must not roll back an already
    /// committed batch.
    async fn update_scoreboard(&self, uptime_days_for_score: i64) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let tx = conn.transaction().await?;
        let cutoff = Utc::now() - chrono::Duration::days(uptime_days_for_score);

        tx.execute(
            "INSERT INTO scoreboard (block_producer_key, point_total, updated_at)
             SELECT block_producer_key, SUM(amount), now()
             FROM point_record
             WHERE created_at >= $1
             GROUP BY block_producer_key
             ON CONFLICT (block_producer_key)
             DO UPDATE SET point_total = EXCLUDED.point_total, updated_at = EXCLUDED.updated_at",
            &[&cutoff],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upserts `application_status` rows reconciled from the contact
    /// spreadsheet.
    async fn update_application_status(&self, statuses: &[(String, bool)]) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let tx = conn.transaction().await?;
        for (producer, is_active) in statuses {
            tx.execute(
                "INSERT INTO application_status (block_producer_key, is_active, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (block_producer_key) DO UPDATE SET is_active = EXCLUDED.is_active, \
                 updated_at = EXCLUDED.updated_at",
                &[producer, is_active],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mirrors newly read submissions into Postgres when the primary
    /// store is Cassandra, keyed on `(submitter, submitted_at)`.
    async fn mirror_submissions(&self, submissions: &[Submission]) -> Result<()> {
        if submissions.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await.map_err(|e| CoordinatorError::Pool(e.to_string()))?;
        let tx = conn.transaction().await?;
        for s in submissions {
            tx.execute(
                "INSERT INTO submissions (submitted_at_date, submitted_at, submitter, created_at, \
                 block_hash, state_hash, parent, height, slot, remote_addr, peer_id, \
                 graphql_control_port, built_with_commit_sha, validation_error, verified) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 ON CONFLICT (submitter, submitted_at) DO NOTHING",
                &[
                    &s.submitted_at_date,
                    &s.submitted_at,
                    &s.submitter,
                    &s.created_at,
                    &s.block_hash,
                    &s.state_hash,
                    &s.parent,
                    &s.height,
                    &s.slot,
                    &s.remote_addr,
                    &s.peer_id,
                    &s.graphql_control_port,
                    &s.built_with_commit_sha,
                    &s.validation_error,
                    &s.verified,
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
