//! Command line interface to the bus: perform an RPC or run a named worker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use redisbus::client::{perform_rpc, Client, RpcRequest};
use redisbus::config::{BusConfig, CONFIG_FILE};
use redisbus::keys;
use redisbus::log_sink::LogHandler;
use redisbus::worker::{generate_worker_id, Worker, WorkerConfig, DEFAULT_WORKER_INTERVAL};
use redisbus::workers::WorkerFactory;

/// Generic command line interface to the redis bus.
#[derive(Debug, Parser)]
#[command(name = "redisbus", version, about)]
struct Cli {
    /// Call (RPC) to execute
    #[arg(long)]
    call: Option<String>,

    /// Wait time in seconds for RPC replies
    #[arg(long, default_value_t = 1.0)]
    wait: f64,

    /// Data for the command
    #[arg(long)]
    data: Option<String>,

    /// Data for the command (JSON formatted)
    #[arg(long)]
    jsondata: Option<String>,

    /// Redis hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Redis port
    #[arg(long)]
    port: Option<u16>,

    /// Redis database
    #[arg(long)]
    db: Option<i64>,

    /// Worker type to run, or to address for --call messages
    #[arg(long)]
    worker: Option<String>,

    /// Worker ID used to address direct calls
    #[arg(long)]
    worker_id: Option<String>,

    /// Interval in seconds to tick workers
    #[arg(long, default_value_t = DEFAULT_WORKER_INTERVAL)]
    worker_interval: f64,

    /// Path for worker file operations
    #[arg(long)]
    worker_path: Option<PathBuf>,

    /// Pattern for multicasting to workers, e.g. 10.130.*/10.130.10.13:*
    #[arg(long)]
    multicast: Option<String>,

    /// Site name to use for workers
    #[arg(long)]
    site: Option<String>,

    /// Spawning worker ID when launched from a spawner
    #[arg(long)]
    spawner: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = BusConfig::load(Path::new(CONFIG_FILE))?;

    let hostname = cli
        .hostname
        .clone()
        .unwrap_or_else(|| config.redis_hostname.clone());
    let port = cli.port.unwrap_or(config.redis_port);
    let db = cli.db.unwrap_or(config.redis_db);
    let site = cli.site.clone().unwrap_or_else(|| config.site.clone());
    let redis_url = format!("redis://{}:{}/{}", hostname, port, db);

    // The config file may supply the default worker type.
    let worker_type = cli.worker.clone().or_else(|| config.worker.clone());

    if cli.call.is_some() {
        init_console_logging(cli.verbose)?;
        info!("Connecting to redis {}:{}, db: {}", hostname, port, db);
        run_rpc(&cli, &redis_url, &site, worker_type).await
    } else if let Some(worker_type) = worker_type {
        run_worker(&cli, &config, &redis_url, &site, &worker_type).await
    } else {
        Cli::command().print_help()?;
        Ok(())
    }
}

async fn run_rpc(
    cli: &Cli,
    redis_url: &str,
    site: &str,
    worker_type: Option<String>,
) -> Result<()> {
    let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;
    let mut bus_client = Client::new(conn, site);

    let data = match (&cli.jsondata, &cli.data) {
        (Some(jsondata), _) => {
            debug!("decoding {}", jsondata);
            serde_json::from_str(jsondata).context("Failed to decode --jsondata")?
        }
        (None, Some(data)) => json!(data),
        (None, None) => Value::Null,
    };

    let request = RpcRequest {
        call: cli.call.clone().expect("checked by caller"),
        data,
        worker_id: cli.worker_id.clone(),
        worker_type,
        multicast: cli.multicast.clone(),
        wait: cli.wait,
    };

    let replies = perform_rpc(&mut bus_client, &request).await?;
    for reply in &replies {
        println!("{}", serde_json::to_string_pretty(reply)?);
    }
    Ok(())
}

async fn run_worker(
    cli: &Cli,
    config: &BusConfig,
    redis_url: &str,
    site: &str,
    worker_type: &str,
) -> Result<()> {
    let factory = WorkerFactory::new();
    let settings = config
        .workers
        .get(worker_type)
        .and_then(|section| section.as_table())
        .cloned()
        .unwrap_or_default();
    let Some(behavior) = factory.construct(worker_type, &settings) else {
        anyhow::bail!(
            "No worker registered for '{}' (known workers: {})",
            worker_type,
            factory.names().join(", ")
        );
    };

    let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;

    // The worker id names the log file and the log sink key, so it is fixed
    // before logging comes up.
    let worker_id = generate_worker_id();
    let uid_tail = worker_id.rsplit(':').next().unwrap_or_default();
    let file_prefix = format!("{}_{}.log", worker_type, uid_tail);

    let log_handler = LogHandler::new(
        keys::log_sink(worker_type, &worker_id),
        worker_id.clone(),
        conn,
    );
    let _guard = init_worker_logging(&log_handler, &file_prefix, cli.verbose)?;
    info!("worker {} logging configured", worker_id);

    let worker_config = WorkerConfig {
        site: site.to_string(),
        worker_type: worker_type.to_string(),
        worker_path: cli
            .worker_path
            .clone()
            .or_else(|| config.worker_path.clone())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from(".")),
        worker_interval: cli.worker_interval,
        spawner: cli.spawner.clone(),
        worker_id: Some(worker_id),
    };

    let mut worker = Worker::new(worker_config, behavior, client).await?;
    worker.handle().add_log_file(format!("logs/{}", file_prefix));
    worker.set_log_handler(log_handler);
    info!(
        "{} started, id: {}",
        worker.handle().behavior_name,
        worker.handle().id
    );
    worker.run().await
}

fn init_console_logging(verbose: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose)?)
        .init();
    Ok(())
}

/// Console, daily local file and Redis sink, all behind one filter.
fn init_worker_logging(
    log_handler: &LogHandler,
    file_prefix: &str,
    verbose: bool,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all("logs").context("Failed to create logs directory")?;
    let appender = tracing_appender::rolling::daily("logs", file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(verbose)?)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(log_handler.layer())
        .init();
    Ok(guard)
}

fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env().add_directive(format!("redisbus={}", level).parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_call_flags() {
        let cli = Cli::try_parse_from([
            "redisbus",
            "--call",
            "ping",
            "--jsondata",
            r#"{"hello":"world"}"#,
            "--worker-id",
            "10.0.0.1:42:abc",
            "--wait",
            "2.5",
        ])
        .unwrap();
        assert_eq!(cli.call.as_deref(), Some("ping"));
        assert_eq!(cli.worker_id.as_deref(), Some("10.0.0.1:42:abc"));
        assert_eq!(cli.wait, 2.5);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_worker_defaults() {
        let cli = Cli::try_parse_from(["redisbus", "--worker", "echo"]).unwrap();
        assert_eq!(cli.worker.as_deref(), Some("echo"));
        assert_eq!(cli.wait, 1.0);
        assert_eq!(cli.worker_interval, DEFAULT_WORKER_INTERVAL);
        assert!(cli.site.is_none());
    }

    #[test]
    fn test_cli_multicast_pattern_passthrough() {
        let cli = Cli::try_parse_from([
            "redisbus",
            "--call",
            "info",
            "--multicast",
            "10.130.*/10.130.10.13:*",
            "--site",
            "test",
        ])
        .unwrap();
        assert_eq!(cli.multicast.as_deref(), Some("10.130.*/10.130.10.13:*"));
        assert_eq!(cli.site.as_deref(), Some("test"));
    }
}
