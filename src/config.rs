use crate::error::{CoordinatorError, Result};
use clap::{Parser, ValueEnum};

/// Which backing store `SubmissionStore` reads from (`SUBMISSION_STORAGE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum SubmissionStorage {
    Cassandra,
    Postgres,
}

/// Which backend `WorkerDispatcher` fans mini-batches out to. Not itself an
/// environment variable, derived from `TEST_ENV` (mirrors the original
/// `test_env()` branch in `coordinator.py`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    Pods,
    Processes,
}

/// All runtime parameters, resolved once at startup and passed around by
/// reference. Built with `clap::Parser` so every field has a typed
/// accessor and env-var source in one place, the way `bin/kvstore` sources
/// its own options via `#[arg(env = "...")]`.
#[derive(Debug, Clone, Parser)]
#[command(name = "coordinator", about = "Uptime-validation batch coordinator")]
pub struct Config {
    #[arg(long, env = "POSTGRES_HOST")]
    pub postgres_host: String,
    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,
    #[arg(long, env = "POSTGRES_DB")]
    pub postgres_db: String,
    #[arg(long, env = "POSTGRES_USER")]
    pub postgres_user: String,
    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: String,

    #[arg(long, env = "POSTGRES_RO_USER")]
    pub postgres_ro_user: Option<String>,
    #[arg(long, env = "POSTGRES_RO_PASSWORD")]
    pub postgres_ro_password: Option<String>,

    #[arg(long, env = "CASSANDRA_HOST", default_value = "")]
    pub cassandra_host: String,
    #[arg(long, env = "CASSANDRA_PORT", default_value_t = 9142)]
    pub cassandra_port: u16,
    #[arg(long, env = "CASSANDRA_USERNAME")]
    pub cassandra_username: Option<String>,
    #[arg(long, env = "CASSANDRA_PASSWORD")]
    pub cassandra_password: Option<String>,
    #[arg(long, env = "AWS_KEYSPACE", default_value = "")]
    pub aws_keyspace: String,

    #[arg(long, env = "AWS_ACCESS_KEY_ID")]
    pub aws_access_key_id: Option<String>,
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY")]
    pub aws_secret_access_key: Option<String>,
    #[arg(long, env = "AWS_ROLE_ARN")]
    pub aws_role_arn: Option<String>,
    #[arg(long, env = "AWS_ROLE_SESSION_NAME")]
    pub aws_role_session_name: Option<String>,
    #[arg(long, env = "AWS_WEB_IDENTITY_TOKEN_FILE")]
    pub aws_web_identity_token_file: Option<String>,

    #[arg(long, env = "SSL_CERTFILE", default_value = "")]
    pub ssl_certfile: String,

    #[arg(long, env = "SURVEY_INTERVAL_MINUTES")]
    pub survey_interval_minutes: i64,
    #[arg(long, env = "MINI_BATCH_NUMBER")]
    pub mini_batch_number: u32,
    #[arg(long, env = "RETRY_COUNT")]
    pub retry_count: u32,
    #[arg(long, env = "UPTIME_DAYS_FOR_SCORE")]
    pub uptime_days_for_score: i64,

    #[arg(long, env = "WORKER_IMAGE")]
    pub worker_image: String,
    #[arg(long, env = "WORKER_TAG")]
    pub worker_tag: String,

    #[arg(long, env = "SUBMISSION_STORAGE", value_enum)]
    pub submission_storage: SubmissionStorage,

    #[arg(long, env = "WEBHOOK_URL", default_value = "")]
    pub webhook_url: String,
    #[arg(long, env = "ALARM_ZK_LOWER_LIMIT_SEC", default_value_t = 0.0)]
    pub alarm_zk_lower_limit_sec: f64,
    #[arg(long, env = "ALARM_ZK_UPPER_LIMIT_SEC", default_value_t = f64::MAX)]
    pub alarm_zk_upper_limit_sec: f64,

    #[arg(long, env = "TEST_ENV", action = clap::ArgAction::Set, default_value_t = false)]
    pub test_env: bool,
    #[arg(long, env = "IGNORE_APPLICATION_STATUS", action = clap::ArgAction::Set, default_value_t = false)]
    pub ignore_application_status: bool,
    #[arg(long, env = "APPLICATION_STATUS_SPREADSHEET_URL")]
    pub application_status_spreadsheet_url: Option<String>,

    /// Submitter-coverage threshold for
    /// `ChainSelector::filter_by_submitter_percentage` (see `DESIGN.md`).
    #[arg(long, env = "STATE_HASH_SELECTION_THRESHOLD", default_value_t = 0.5)]
    pub state_hash_selection_threshold: f64,
}

impl Config {
    /// Parses configuration from the process environment, validating
    /// enum-valued options and cross-field consistency up front so a bad
    /// deployment fails fast rather than mid-loop.
    pub fn from_env() -> Result<Self> {
        let config = Config::try_parse().map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.survey_interval_minutes <= 0 {
            return Err(CoordinatorError::Config(
                "SURVEY_INTERVAL_MINUTES must be positive".into(),
            ));
        }
        if self.mini_batch_number == 0 {
            return Err(CoordinatorError::Config(
                "MINI_BATCH_NUMBER must be positive".into(),
            ));
        }
        if self.submission_storage == SubmissionStorage::Cassandra && self.cassandra_host.is_empty()
        {
            return Err(CoordinatorError::Config(
                "CASSANDRA_HOST is required when SUBMISSION_STORAGE=cassandra".into(),
            ));
        }
        if self.using_assumed_role() && self.aws_web_identity_token_file.is_none() {
            return Err(CoordinatorError::Config(
                "AWS_WEB_IDENTITY_TOKEN_FILE is required when AWS_ROLE_ARN is set".into(),
            ));
        }
        if self.using_assumed_role() && self.aws_role_session_name.is_none() {
            return Err(CoordinatorError::Config(
                "AWS_ROLE_SESSION_NAME is required when AWS_ROLE_ARN is set".into(),
            ));
        }
        Ok(())
    }

    /// Mirrors `AWSKeyspacesClient._using_assumed_role`.
    pub fn using_assumed_role(&self) -> bool {
        self.aws_role_arn.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn dispatcher_kind(&self) -> DispatcherKind {
        if self.test_env {
            DispatcherKind::Processes
        } else {
            DispatcherKind::Pods
        }
    }

    pub fn survey_interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.survey_interval_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
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
        ]
    }

    #[test]
    fn parses_required_fields_from_cli_or_env() {
        let config = Config::try_parse_from(base_args()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.submission_storage, SubmissionStorage::Postgres);
        assert_eq!(config.dispatcher_kind(), DispatcherKind::Pods);
    }

    #[test]
    fn rejects_cassandra_without_host() {
        let config = Config::try_parse_from(base_args()).unwrap();
        let mut config = config;
        config.submission_storage = SubmissionStorage::Cassandra;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_selects_process_dispatcher() {
        let mut args = base_args();
        args.extend(["--test-env", "true"]);
        let config = Config::try_parse_from(args).unwrap();
        assert_eq!(config.dispatcher_kind(), DispatcherKind::Processes);
    }

    #[test]
    fn rejects_non_positive_interval() {
        let mut config = Config::try_parse_from(base_args()).unwrap();
        config.survey_interval_minutes = 0;
        assert!(config.validate().is_err());
    }
}
