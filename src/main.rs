use anyhow::Context;
use bb8_postgres::PostgresConnectionManager;
use std::process::ExitCode;
use tokio_postgres::NoTls;
use uptime_coordinator::alert::AlertSink;
use uptime_coordinator::app_status::ApplicationStatusUpdater;
use uptime_coordinator::clock::SystemClock;
use uptime_coordinator::config::{Config, DispatcherKind, SubmissionStorage};
use uptime_coordinator::coordinator::Coordinator;
use uptime_coordinator::dispatcher::pods::PodDispatcher;
use uptime_coordinator::dispatcher::processes::ProcessDispatcher;
use uptime_coordinator::dispatcher::WorkerDispatcher;
use uptime_coordinator::result_db::{ResultDB, ResultDb};
use uptime_coordinator::submission_store::cassandra::CassandraSubmissionStore;
use uptime_coordinator::submission_store::postgres::PostgresSubmissionStore;
use uptime_coordinator::submission_store::SubmissionStore;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Configuration error: fatal at startup, never enter the loop.
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("coordinator exited with a fatal error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let manager = PostgresConnectionManager::new_from_stringlike(
        format!(
            "host={} port={} dbname={} user={} password={}",
            config.postgres_host,
            config.postgres_port,
            config.postgres_db,
            config.postgres_user,
            config.postgres_password
        ),
        NoTls,
    )
    .context("invalid postgres connection string")?;
    let pool = bb8::Pool::builder()
        .build(manager)
        .await
        .context("failed to build postgres connection pool")?;
    let result_db: Box<dyn ResultDb> = Box::new(ResultDB::new(pool.clone()));

    let submission_store: Box<dyn SubmissionStore> = match config.submission_storage {
        SubmissionStorage::Cassandra => Box::new(CassandraSubmissionStore::new(&config)),
        SubmissionStorage::Postgres => Box::new(PostgresSubmissionStore::new(pool)),
    };

    let dispatcher: Box<dyn WorkerDispatcher> = match config.dispatcher_kind() {
        DispatcherKind::Pods => Box::new(
            PodDispatcher::connect("default")
                .await
                .context("failed to connect to the cluster scheduler")?,
        ),
        DispatcherKind::Processes => Box::new(ProcessDispatcher::new(config.worker_image.clone())),
    };

    let alert = AlertSink::new(config.webhook_url.clone());
    let app_status = ApplicationStatusUpdater::new(
        config.application_status_spreadsheet_url.clone(),
        config.ignore_application_status,
    );

    let coordinator = Coordinator::new(
        config,
        Box::new(SystemClock),
        submission_store,
        dispatcher,
        result_db,
        app_status,
        alert,
    );

    coordinator.run().await.context("batch loop terminated with an error")
}
