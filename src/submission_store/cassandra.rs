use super::shard::ShardCalculator;
use super::{QueryWindow, SubmissionStore};
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::models::Submission;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use scylla::retry_policy::{RetryDecision, RetryPolicy, RetrySession};
use scylla::transport::errors::QueryError;
use scylla::{Session, SessionBuilder};
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff with jitter, capped at `max_retries`: `delay =
/// min(max_delay, base * 2^retry) + uniform(0, 0.1) * delay`.
/// On a read/write timeout, retry with the same consistency; on
/// unavailability, retry against the next host; anything else rethrows.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl Default for ExponentialBackoffRetryPolicy {
    fn default() -> Self {
        ExponentialBackoffRetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 10,
        }
    }
}

impl ExponentialBackoffRetryPolicy {
    pub fn backoff(&self, retry_num: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(retry_num as i32);
        let delay = exp.min(self.max_delay.as_secs_f64());
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.1) * delay;
        Duration::from_secs_f64(delay + jitter)
    }
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(ExponentialBackoffRetrySession { policy: self.clone(), retry_num: 0 })
    }
}

struct ExponentialBackoffRetrySession {
    policy: ExponentialBackoffRetryPolicy,
    retry_num: u32,
}

impl RetrySession for ExponentialBackoffRetrySession {
    fn decide_should_retry(
        &mut self,
        request_info: scylla::retry_policy::RequestInfo,
    ) -> RetryDecision {
        if self.retry_num >= self.policy.max_retries {
            return RetryDecision::DontRetry;
        }
        let decision = match request_info.error {
            QueryError::TimeoutError | QueryError::RequestTimeout(_) => {
                RetryDecision::RetrySameTarget(None)
            }
            QueryError::UnableToAllocStreamId | QueryError::ConnectionPoolError(_) => {
                RetryDecision::RetryNextTarget(None)
            }
            _ => RetryDecision::DontRetry,
        };
        if !matches!(decision, RetryDecision::DontRetry) {
            self.retry_num += 1;
        }
        decision
    }

    fn reset(&mut self) {
        self.retry_num = 0;
    }
}

/// Cassandra / AWS Keyspaces variant of `SubmissionStore`.
///
/// Sessions are opened, queried, and closed per read, matching the
/// original `AWSKeyspacesClient.connect()/close()` lifecycle. Credentials
/// are re-resolved on every `connect()` call since assumed-role
/// credentials expire.
pub struct CassandraSubmissionStore {
    keyspace: String,
    hosts: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    role_arn: Option<String>,
    role_session_name: Option<String>,
    web_identity_token_file: Option<String>,
    retry_policy: Arc<ExponentialBackoffRetryPolicy>,
}

impl CassandraSubmissionStore {
    pub fn new(config: &Config) -> Self {
        CassandraSubmissionStore {
            keyspace: config.aws_keyspace.clone(),
            hosts: vec![format!("{}:{}", config.cassandra_host, config.cassandra_port)],
            username: config.aws_access_key_id.clone().or_else(|| config.cassandra_username.clone()),
            password: config.aws_secret_access_key.clone().or_else(|| config.cassandra_password.clone()),
            role_arn: config.aws_role_arn.clone(),
            role_session_name: config.aws_role_session_name.clone(),
            web_identity_token_file: config.aws_web_identity_token_file.clone(),
            retry_policy: Arc::new(ExponentialBackoffRetryPolicy::default()),
        }
    }

    /// Resolves the SigV4 key pair handed to the `scylla` session as a
    /// static username/password (see `DESIGN.md` "Cassandra SigV4 auth").
    /// When `AWS_ROLE_ARN` is set, assumes the role via STS
    /// web-identity federation and uses the temporary credentials;
    /// otherwise falls back to the static `AWS_ACCESS_KEY_ID` /
    /// `AWS_SECRET_ACCESS_KEY` (or plain Cassandra username/password, for
    /// non-AWS Cassandra deployments).
    async fn resolve_credentials(&self) -> Result<Option<(String, String)>> {
        let (Some(arn), Some(session_name), Some(token_file)) =
            (&self.role_arn, &self.role_session_name, &self.web_identity_token_file)
        else {
            return Ok(self.username.clone().zip(self.password.clone()));
        };

        let token = tokio::fs::read_to_string(token_file)
            .await
            .map_err(|e| CoordinatorError::Cassandra(format!("failed to read web identity token: {e}")))?;
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        let sts = aws_sdk_sts::Client::new(&sdk_config);
        let assumed = sts
            .assume_role_with_web_identity()
            .role_arn(arn)
            .role_session_name(session_name)
            .web_identity_token(token.trim())
            .send()
            .await
            .map_err(|e| CoordinatorError::Cassandra(format!("failed to assume role {arn}: {e}")))?;
        let creds = assumed
            .credentials()
            .ok_or_else(|| CoordinatorError::Cassandra("STS returned no credentials".into()))?;
        Ok(Some((creds.access_key_id().to_string(), creds.secret_access_key().to_string())))
    }

    async fn connect(&self) -> Result<Session> {
        let credentials = self.resolve_credentials().await?;
        let mut builder = SessionBuilder::new()
            .known_nodes(&self.hosts)
            .connection_timeout(Duration::from_secs(20))
            .default_execution_profile_handle(
                scylla::ExecutionProfile::builder()
                    .retry_policy(self.retry_policy.clone())
                    .request_timeout(Some(Duration::from_secs(20)))
                    .build()
                    .into_handle(),
            );
        if let Some((user, pass)) = &credentials {
            builder = builder.user(user, pass);
        }
        builder
            .build()
            .await
            .map_err(|e| CoordinatorError::Cassandra(e.to_string()))
    }

    fn build_query(&self, window: &QueryWindow, limit: Option<u32>) -> (String, Vec<String>) {
        let mut conditions = Vec::new();

        let dates = ShardCalculator::dates_in_range(window.start, window.end);
        if dates.len() == 1 {
            conditions.push(format!("submitted_at_date = '{}'", dates[0]));
        } else {
            let list = dates.iter().map(|d| format!("'{d}'")).collect::<Vec<_>>().join(",");
            conditions.push(format!("submitted_at_date IN ({list})"));
        }

        conditions.push(ShardCalculator::shard_in_clause(window.start, window.end));

        let start_op = if window.start_inclusive { ">=" } else { ">" };
        conditions.push(format!("submitted_at {start_op} '{}'", window.start.to_rfc3339()));
        let end_op = if window.end_inclusive { "<=" } else { "<" };
        conditions.push(format!("submitted_at {end_op} '{}'", window.end.to_rfc3339()));

        let mut query = format!(
            "SELECT submitted_at_date, submitted_at, submitter, created_at, block_hash, \
             remote_addr, peer_id, graphql_control_port, built_with_commit_sha, state_hash, \
             parent, height, slot, validation_error, verified FROM {}.submissions WHERE {}",
            self.keyspace,
            conditions.join(" AND ")
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        (query, conditions)
    }
}

#[async_trait]
impl SubmissionStore for CassandraSubmissionStore {
    async fn get_submissions(
        &self,
        window: QueryWindow,
        limit: Option<u32>,
    ) -> Result<Vec<Submission>> {
        let (query, _conditions) = self.build_query(&window, limit);
        let session = self.connect().await?;
        let result = session
            .query(query, &[])
            .await
            .map_err(|e| CoordinatorError::Cassandra(e.to_string()))?;

        let rows = result.rows.unwrap_or_default();
        let mut submissions = Vec::with_capacity(rows.len());
        for row in rows {
            let (
                submitted_at_date,
                submitted_at,
                submitter,
                created_at,
                block_hash,
                remote_addr,
                peer_id,
                graphql_control_port,
                built_with_commit_sha,
                state_hash,
                parent,
                height,
                slot,
                validation_error,
                verified,
            ): (
                chrono::NaiveDate,
                DateTime<Utc>,
                String,
                DateTime<Utc>,
                String,
                Option<String>,
                Option<String>,
                Option<i32>,
                Option<String>,
                String,
                String,
                i64,
                i64,
                Option<String>,
                bool,
            ) = row
                .into_typed()
                .map_err(|e| CoordinatorError::Cassandra(e.to_string()))?;

            submissions.push(Submission {
                submitted_at_date,
                submitted_at,
                submitter,
                created_at,
                block_hash,
                state_hash,
                parent,
                height,
                slot,
                remote_addr,
                peer_id,
                graphql_control_port,
                built_with_commit_sha,
                validation_error,
                verified,
            });
        }
        Ok(submissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn single_day_query_uses_equality() {
        let store = CassandraSubmissionStore {
            keyspace: "ks".into(),
            hosts: vec![],
            username: None,
            password: None,
            role_arn: None,
            role_session_name: None,
            web_identity_token_file: None,
            retry_policy: Arc::new(ExponentialBackoffRetryPolicy::default()),
        };
        let window = QueryWindow::half_open(t(0, 0, 0), t(1, 0, 0));
        let (query, _) = store.build_query(&window, None);
        assert!(query.contains("submitted_at_date = '2024-03-01'"));
        assert!(query.contains("shard IN"));
    }

    #[test]
    fn limit_is_appended() {
        let store = CassandraSubmissionStore {
            keyspace: "ks".into(),
            hosts: vec![],
            username: None,
            password: None,
            role_arn: None,
            role_session_name: None,
            web_identity_token_file: None,
            retry_policy: Arc::new(ExponentialBackoffRetryPolicy::default()),
        };
        let window = QueryWindow::half_open(t(0, 0, 0), t(1, 0, 0));
        let (query, _) = store.build_query(&window, Some(500));
        assert!(query.ends_with("LIMIT 500"));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let policy = ExponentialBackoffRetryPolicy::default();
        let backoff = policy.backoff(20);
        assert!(backoff <= Duration::from_secs_f64(11.0));
    }

    #[tokio::test]
    async fn resolve_credentials_falls_back_to_static_pair_without_role_arn() {
        let store = CassandraSubmissionStore {
            keyspace: "ks".into(),
            hosts: vec![],
            username: Some("AKIA...".into()),
            password: Some("secret".into()),
            role_arn: None,
            role_session_name: None,
            web_identity_token_file: None,
            retry_policy: Arc::new(ExponentialBackoffRetryPolicy::default()),
        };
        let resolved = store.resolve_credentials().await.unwrap();
        assert_eq!(resolved, Some(("AKIA...".to_string(), "secret".to_string())));
    }

    #[tokio::test]
    async fn resolve_credentials_is_none_without_any_configured_pair() {
        let store = CassandraSubmissionStore {
            keyspace: "ks".into(),
            hosts: vec![],
            username: None,
            password: None,
            role_arn: None,
            role_session_name: None,
            web_identity_token_file: None,
            retry_policy: Arc::new(ExponentialBackoffRetryPolicy::default()),
        };
        assert_eq!(store.resolve_credentials().await.unwrap(), None);
    }
}
