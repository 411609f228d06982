use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tokio_postgres::NoTls;
use uptime_coordinator::config::Config;

/// Administrative tasks for the coordinator's Postgres schema, reworked
/// from the original `tasks.py` `@task` functions into subcommands.
/// None of these run against the batch loop; each opens its own
/// short-lived connection and exits.
#[derive(Debug, Parser)]
#[command(name = "coordinator-admin")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    config: Config,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates `POSTGRES_DB` on the maintenance database and applies
    /// `sql/create_tables.sql`.
    CreateDatabase,
    /// Inserts the seed `bot_logs` row the main loop bootstraps from.
    InitDatabase {
        /// Anchor the seed row's `batch_end_epoch` this many minutes in
        /// the past.
        #[arg(long, conflicts_with = "at")]
        mins_ago: Option<i64>,
        /// Anchor the seed row's `batch_end_epoch` at an explicit RFC
        /// 3339 timestamp or Unix epoch.
        #[arg(long, conflicts_with = "mins_ago")]
        at: Option<String>,
        /// Insert the seed row even if `bot_logs` is non-empty.
        #[arg(long)]
        override_empty: bool,
    },
    /// Creates `POSTGRES_RO_USER` and grants it read-only access.
    CreateRoUser,
    /// Drops `POSTGRES_DB`. Logs (does not fail) on error.
    DropDatabase,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::CreateDatabase => create_database(&cli.config).await,
        Command::InitDatabase { mins_ago, at, override_empty } => {
            init_database(&cli.config, mins_ago, at.as_deref(), override_empty).await
        }
        Command::CreateRoUser => create_ro_user(&cli.config).await,
        Command::DropDatabase => drop_database(&cli.config).await,
    }
}

async fn maintenance_client(config: &Config, dbname: &str) -> anyhow::Result<tokio_postgres::Client> {
    let conn_string = format!(
        "host={} port={} dbname={} user={} password={}",
        config.postgres_host, config.postgres_port, dbname, config.postgres_user, config.postgres_password
    );
    let (client, connection) = tokio_postgres::connect(&conn_string, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("postgres maintenance connection error: {e:?}");
        }
    });
    Ok(client)
}

/// Mirrors `tasks.py::create_database`.
async fn create_database(config: &Config) -> anyhow::Result<()> {
    let client = maintenance_client(config, "postgres").await?;
    let create = format!("CREATE DATABASE \"{}\"", config.postgres_db);
    match client.batch_execute(&create).await {
        Ok(()) => log::info!("created database {}", config.postgres_db),
        Err(e) if e.to_string().contains("already exists") => {
            log::info!("database {} already exists", config.postgres_db);
        }
        Err(e) => return Err(e).context("failed to create database"),
    }

    let db_client = maintenance_client(config, &config.postgres_db).await?;
    let schema = include_str!("../../sql/create_tables.sql");
    db_client.batch_execute(schema).await.context("failed to apply schema")?;
    log::info!("applied schema to {}", config.postgres_db);
    Ok(())
}

/// Mirrors `tasks.py::init_database`. A no-op on a non-empty table
/// unless `--override-empty`.
async fn init_database(
    config: &Config,
    mins_ago: Option<i64>,
    at: Option<&str>,
    override_empty: bool,
) -> anyhow::Result<()> {
    let client = maintenance_client(config, &config.postgres_db).await?;

    let count: i64 = client.query_one("SELECT count(*) FROM bot_logs", &[]).await?.get(0);
    if count > 0 && !override_empty {
        log::info!("bot_logs already seeded ({count} rows), skipping (pass --override-empty to force)");
        return Ok(());
    }

    let anchor = resolve_anchor(mins_ago, at)?;
    client
        .execute(
            "INSERT INTO bot_logs (processing_time, files_processed, file_timestamps, \
             batch_start_epoch, batch_end_epoch) VALUES (0, -1, now(), $1, $1)",
            &[&(anchor.timestamp() as f64)],
        )
        .await
        .context("failed to insert seed bot_logs row")?;
    log::info!("seeded bot_logs anchored at {anchor}");
    Ok(())
}

/// Resolves the seed row's anchor timestamp: `--mins-ago`, `--at`
/// (RFC 3339 or Unix epoch), or `now()` if neither is given.
fn resolve_anchor(mins_ago: Option<i64>, at: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    if let Some(mins) = mins_ago {
        return Ok(Utc::now() - Duration::minutes(mins));
    }
    if let Some(at) = at {
        if let Ok(dt) = DateTime::parse_from_rfc3339(at) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(epoch) = at.parse::<i64>() {
            return DateTime::from_timestamp(epoch, 0).context("epoch out of range");
        }
        anyhow::bail!("--at must be an RFC 3339 timestamp or a Unix epoch: {at}");
    }
    Ok(Utc::now())
}

/// Mirrors `tasks.py::create_ro_user`.
async fn create_ro_user(config: &Config) -> anyhow::Result<()> {
    let (Some(ro_user), Some(ro_password)) = (&config.postgres_ro_user, &config.postgres_ro_password) else {
        anyhow::bail!("POSTGRES_RO_USER and POSTGRES_RO_PASSWORD must both be set");
    };

    let client = maintenance_client(config, &config.postgres_db).await?;
    match client
        .batch_execute(&format!("CREATE USER \"{ro_user}\" WITH PASSWORD '{ro_password}'"))
        .await
    {
        Ok(()) => log::info!("created read-only user {ro_user}"),
        Err(e) if e.to_string().contains("already exists") => {
            log::info!("read-only user {ro_user} already exists");
        }
        Err(e) => return Err(e).context("failed to create read-only user"),
    }

    client
        .batch_execute(&format!(
            "GRANT CONNECT ON DATABASE \"{db}\" TO \"{ro_user}\"; \
             GRANT USAGE ON SCHEMA public TO \"{ro_user}\"; \
             GRANT SELECT ON ALL TABLES IN SCHEMA public TO \"{ro_user}\"; \
             ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT SELECT ON TABLES TO \"{ro_user}\";",
            db = config.postgres_db,
        ))
        .await
        .context("failed to grant read-only privileges")?;
    log::info!("granted read-only privileges to {ro_user}");
    Ok(())
}

/// Mirrors `tasks.py::drop_database`. Logs rather than fails on error.
async fn drop_database(config: &Config) -> anyhow::Result<()> {
    let client = maintenance_client(config, "postgres").await?;
    let drop = format!("DROP DATABASE IF EXISTS \"{}\"", config.postgres_db);
    if let Err(e) = client.batch_execute(&drop).await {
        log::error!("failed to drop database {}: {e:?}", config.postgres_db);
    } else {
        log::info!("dropped database {}", config.postgres_db);
    }
    Ok(())
}
