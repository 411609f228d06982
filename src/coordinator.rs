use crate::alert::AlertSink;
use crate::app_status::ApplicationStatusUpdater;
use crate::batch_state::BatchState;
use crate::chain_selector::ChainSelector;
use crate::clock::{Clock, Timer};
use crate::config::Config;
use crate::dispatcher::{split_into_mini_batches, WorkerDispatcher};
use crate::error::Result;
use crate::models::BatchRow;
use crate::result_db::{NewBotLog, ResultDb};
use crate::submission_store::{QueryWindow, SubmissionStore};
use log::{error, info, warn};
use std::collections::HashSet;

/// Top-level orchestration: for each batch, reconcile application status,
/// dispatch workers, load submissions, run `ChainSelector`, persist,
/// update the scoreboard, and advance (or retry) the window.
pub struct Coordinator {
    config: Config,
    clock: Box<dyn Clock>,
    submission_store: Box<dyn SubmissionStore>,
    dispatcher: Box<dyn WorkerDispatcher>,
    result_db: Box<dyn ResultDb>,
    app_status: ApplicationStatusUpdater,
    alert: AlertSink,
    chain_selector: ChainSelector,
}

impl Coordinator {
    pub fn new(
        config: Config,
        clock: Box<dyn Clock>,
        submission_store: Box<dyn SubmissionStore>,
        dispatcher: Box<dyn WorkerDispatcher>,
        result_db: Box<dyn ResultDb>,
        app_status: ApplicationStatusUpdater,
        alert: AlertSink,
    ) -> Self {
        let chain_selector = ChainSelector::new(config.state_hash_selection_threshold);
        Coordinator {
            config,
            clock,
            submission_store,
            dispatcher,
            result_db,
            app_status,
            alert,
            chain_selector,
        }
    }

    /// Reads the latest bot_log row to find the next unprocessed window.
    /// Assumes a seed row already exists; `coordinator-admin init-database`
    /// is responsible for inserting it.
    async fn initial_state(&self) -> Result<BatchState> {
        let last = self.result_db.get_last_bot_log().await?;
        let (prev_end, last_bot_log_id) = match last {
            Some(log) => (
                chrono::DateTime::from_timestamp(log.batch_end_epoch as i64, 0)
                    .unwrap_or_else(|| self.clock.now()),
                log.id,
            ),
            None => (self.clock.now(), 0),
        };
        Ok(BatchState::initialize(
            prev_end,
            last_bot_log_id,
            self.config.survey_interval(),
            self.config.retry_count,
            self.clock.now(),
        ))
    }

    /// Runs the batch loop until `BatchState` reaches `Stopped` (retries
    /// exhausted) or a fatal error occurs.
    pub async fn run(&self) -> Result<()> {
        let mut state = self.initial_state().await?;

        while !state.is_stopped() {
            state.wait_until_batch_ends(self.clock.as_ref()).await;
            if !state.batch_end_is_future() {
                match self.process_batch(&state).await {
                    Ok(new_bot_log_id) => state.advance_to_next_batch(new_bot_log_id, self.clock.as_ref()),
                    Err(e) => {
                        error!("batch processing failed, will retry: {e:?}");
                        state.retry_batch(self.clock.as_ref());
                    }
                }
            }
        }

        warn!("batch state machine stopped after exhausting retries");
        Ok(())
    }

    /// One full iteration: application status, dispatch, ingest, select,
    /// persist, scoreboard. Returns the new `bot_log_id` on success.
    async fn process_batch(&self, state: &BatchState) -> Result<i64> {
        self.app_status.refresh(self.result_db.as_ref()).await;

        let timer = Timer::start();
        let intervals =
            split_into_mini_batches(state.batch.start_time, state.batch.end_time, self.config.mini_batch_number);
        self.dispatcher
            .dispatch(&intervals, &self.config.worker_image, &self.config.worker_tag)
            .await?;
        let dispatch_secs = timer.elapsed_secs();
        self.alert
            .check_dispatch_duration(
                dispatch_secs,
                self.config.alarm_zk_lower_limit_sec,
                self.config.alarm_zk_upper_limit_sec,
            )
            .await;

        let window = QueryWindow::half_open(state.batch.start_time, state.batch.end_time);
        let submissions = self.submission_store.get_submissions(window, None).await?;
        let rows: Vec<BatchRow> =
            submissions.iter().filter(|s| s.is_valid()).map(BatchRow::from).collect();

        // Every submitter observed this batch registers a node, not just
        // the ones whose submission was valid (original_source
        // coordinator.py, `master_df["submitter"].unique()`).
        let submitters: Vec<String> = submissions
            .iter()
            .map(|s| s.submitter.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if self.config.submission_storage == crate::config::SubmissionStorage::Cassandra {
            self.result_db.mirror_submissions(&submissions).await?;
        }

        let (prev_selected, prev_relations) =
            self.result_db.get_previous_selection(Some(state.batch.bot_log_id)).await?;

        // The real bot_log_id doesn't exist yet; `persist_batch` stamps the
        // freshly inserted id onto every row it writes regardless of what's
        // carried here.
        let outcome = self.chain_selector.select(&rows, &prev_selected, &prev_relations, 0);

        let new_bot_log = NewBotLog {
            processing_time: timer.elapsed_secs(),
            files_processed: rows.len() as i64,
            file_timestamps: self.clock.now(),
            batch_start_epoch: state.batch.start_time.timestamp() as f64,
            batch_end_epoch: state.batch.end_time.timestamp() as f64,
        };

        let bot_log_id = self
            .result_db
            .persist_batch(new_bot_log, &submitters, &outcome.statehash_results, &outcome.point_records)
            .await?;

        if let Err(e) = self.result_db.update_scoreboard(self.config.uptime_days_for_score).await {
            // Isolated failure: the batch itself already committed, so the
            // loop still advances.
            warn!("scoreboard update failed for bot_log_id={bot_log_id}: {e:?}");
        }

        info!(
            "batch [{}, {}) committed as bot_log_id={bot_log_id}, {} submissions, {} canonical hashes",
            state.batch.start_time,
            state.batch.end_time,
            rows.len(),
            outcome.selected_state_hashes.len()
        );

        Ok(bot_log_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_status::ApplicationStatusUpdater;
    use crate::dispatcher::MiniInterval;
    use crate::error::CoordinatorError;
    use crate::models::{PointRecord, Relation, StatehashResult, Submission};
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use clap::Parser;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct FakeSubmissionStore(Vec<Submission>);

    #[async_trait]
    impl SubmissionStore for FakeSubmissionStore {
        async fn get_submissions(&self, _window: QueryWindow, _limit: Option<u32>) -> Result<Vec<Submission>> {
            Ok(self.0.clone())
        }
    }

    struct FakeWorkerDispatcher {
        fail: bool,
    }

    #[async_trait]
    impl WorkerDispatcher for FakeWorkerDispatcher {
        async fn dispatch(&self, _intervals: &[MiniInterval], _image: &str, _tag: &str) -> Result<()> {
            if self.fail {
                Err(CoordinatorError::Dispatch("worker pool unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct FakeResultDb {
        next_id: AtomicI64,
        persisted: Mutex<Vec<(i64, Vec<String>)>>,
        scoreboard_calls: Mutex<u32>,
    }

    #[async_trait]
    impl ResultDb for FakeResultDb {
        async fn get_last_bot_log(&self) -> Result<Option<crate::models::BotLog>> {
            Ok(None)
        }

        async fn get_previous_selection(&self, _prior: Option<i64>) -> Result<(Vec<String>, Vec<Relation>)> {
            Ok((Vec::new(), Vec::new()))
        }

        async fn persist_batch(
            &self,
            bot_log: NewBotLog,
            submitters: &[String],
            _statehash_results: &[StatehashResult],
            _point_records: &[PointRecord],
        ) -> Result<i64> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.persisted.lock().unwrap().push((bot_log.files_processed, submitters.to_vec()));
            Ok(id)
        }

        async fn update_scoreboard(&self, _uptime_days_for_score: i64) -> Result<()> {
            *self.scoreboard_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn update_application_status(&self, _statuses: &[(String, bool)]) -> Result<()> {
            Ok(())
        }

        async fn mirror_submissions(&self, _submissions: &[Submission]) -> Result<()> {
            Ok(())
        }
    }

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn submission(submitter: &str, verified: bool) -> Submission {
        Submission {
            submitted_at_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            submitted_at: t(0, 0, 0),
            submitter: submitter.to_string(),
            created_at: t(0, 0, 0),
            block_hash: "b".to_string(),
            state_hash: "A".to_string(),
            parent: "G".to_string(),
            height: 2,
            slot: 2,
            remote_addr: None,
            peer_id: None,
            graphql_control_port: None,
            built_with_commit_sha: None,
            validation_error: None,
            verified,
        }
    }

    fn make_coordinator(
        submissions: Vec<Submission>,
        dispatch_fails: bool,
        result_db: FakeResultDb,
    ) -> (Coordinator, std::sync::Arc<FakeResultDb>) {
        let config = Config::try_parse_from([
            "coordinator",
            "--postgres-host", "localhost",
            "--postgres-db", "uptime",
            "--postgres-user", "uptime",
            "--postgres-password", "secret",
            "--survey-interval-minutes", "20",
            "--mini-batch-number", "4",
            "--retry-count", "3",
            "--uptime-days-for-score", "30",
            "--worker-image", "validator",
            "--worker-tag", "latest",
            "--submission-storage", "postgres",
        ])
        .unwrap();

        let result_db = std::sync::Arc::new(result_db);
        let coordinator = Coordinator::new(
            config,
            Box::new(FixedClock(Mutex::new(t(0, 0, 0)))),
            Box::new(FakeSubmissionStore(submissions)),
            Box::new(FakeWorkerDispatcher { fail: dispatch_fails }),
            Box::new(ArcResultDb(result_db.clone())),
            ApplicationStatusUpdater::new(None, true),
            AlertSink::new(""),
        );
        (coordinator, result_db)
    }

    struct ArcResultDb(std::sync::Arc<FakeResultDb>);

    #[async_trait]
    impl ResultDb for ArcResultDb {
        async fn get_last_bot_log(&self) -> Result<Option<crate::models::BotLog>> {
            self.0.get_last_bot_log().await
        }
        async fn get_previous_selection(&self, prior: Option<i64>) -> Result<(Vec<String>, Vec<Relation>)> {
            self.0.get_previous_selection(prior).await
        }
        async fn persist_batch(
            &self,
            bot_log: NewBotLog,
            submitters: &[String],
            statehash_results: &[StatehashResult],
            point_records: &[PointRecord],
        ) -> Result<i64> {
            self.0.persist_batch(bot_log, submitters, statehash_results, point_records).await
        }
        async fn update_scoreboard(&self, uptime_days_for_score: i64) -> Result<()> {
            self.0.update_scoreboard(uptime_days_for_score).await
        }
        async fn update_application_status(&self, statuses: &[(String, bool)]) -> Result<()> {
            self.0.update_application_status(statuses).await
        }
        async fn mirror_submissions(&self, submissions: &[Submission]) -> Result<()> {
            self.0.mirror_submissions(submissions).await
        }
    }

    fn state() -> BatchState {
        BatchState::initialize(t(0, 0, 0), 1, chrono::Duration::minutes(20), 3, t(0, 20, 0))
    }

    /// An empty window still commits a bot_log with `files_processed = 0`
    /// and still runs the scoreboard recompute.
    #[tokio::test]
    async fn empty_window_still_writes_bot_log_and_runs_scoreboard() {
        let (coordinator, result_db) = make_coordinator(Vec::new(), false, FakeResultDb::default());
        let bot_log_id = coordinator.process_batch(&state()).await.unwrap();
        assert_eq!(bot_log_id, 1);

        let persisted = result_db.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].0, 0);
        assert!(persisted[0].1.is_empty());
        assert_eq!(*result_db.scoreboard_calls.lock().unwrap(), 1);
    }

    /// Every distinct submitter observed this batch is registered, even an
    /// unverified one that never earns a point record.
    #[tokio::test]
    async fn unverified_submitter_is_still_registered_as_a_node() {
        let submissions = vec![submission("node-a", true), submission("node-b", false)];
        let (coordinator, result_db) = make_coordinator(submissions, false, FakeResultDb::default());
        coordinator.process_batch(&state()).await.unwrap();

        let persisted = result_db.persisted.lock().unwrap();
        let mut submitters = persisted[0].1.clone();
        submitters.sort();
        assert_eq!(submitters, vec!["node-a".to_string(), "node-b".to_string()]);
    }

    /// A dispatch failure fails the batch before anything is persisted; a
    /// later successful attempt commits exactly one bot_log, and the
    /// retry budget only drops for the failed attempt.
    #[tokio::test]
    async fn failed_attempt_retries_then_succeeds_without_duplicate_commit() {
        let (coordinator, result_db) = make_coordinator(Vec::new(), true, FakeResultDb::default());
        let clock = FixedClock(Mutex::new(t(0, 20, 0)));
        let mut batch_state = state();

        assert!(coordinator.process_batch(&batch_state).await.is_err());
        batch_state.retry_batch(&clock);
        assert_eq!(batch_state.retrials_left, 2);
        assert!(result_db.persisted.lock().unwrap().is_empty());

        let (coordinator, result_db) = make_coordinator(Vec::new(), false, FakeResultDb::default());
        let bot_log_id = coordinator.process_batch(&batch_state).await.unwrap();
        batch_state.advance_to_next_batch(bot_log_id, &clock);

        assert_eq!(batch_state.batch.bot_log_id, bot_log_id);
        assert_eq!(result_db.persisted.lock().unwrap().len(), 1);
        assert_eq!(batch_state.retrials_left, 3);
    }
}
