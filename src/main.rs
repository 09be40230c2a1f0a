use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tokio_util::sync::CancellationToken;
use workpool::config::{JobConfig, LeaseConfig, Mode, ServerConfig};
use workpool::dashboard::run_dashboard;
use workpool::node::Dispatcher;
use workpool::shutdown::install_shutdown_handler;
use workpool::source::MemorySource;
use workpool::store::{KvStore, MemoryStore, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "workpool")]
#[command(version)]
#[command(about = "Hands annotation tasks to anonymous workers over HTTP")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve one annotation job
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// JSON file with the rows to annotate: {"row": {"column": "value"}}
    #[arg(long)]
    data: Option<PathBuf>,

    /// Prefix of every store key used by this job
    #[arg(long, default_value = "image_label")]
    task_key: String,

    /// How finished workers are sent back
    #[arg(long, value_enum, default_value = "standalone")]
    mode: ModeArg,

    /// Tasks each worker must finish
    #[arg(long, default_value = "100")]
    num_tasks: usize,

    /// Columns a row must have to be dispatched (comma-separated)
    #[arg(long, value_delimiter = ',')]
    required: Vec<String>,

    /// Report the share of correct results in verdicts
    #[arg(long)]
    track_correct: bool,

    /// Admin secret; a random one is generated and logged when omitted
    #[arg(long)]
    secret: Option<String>,

    /// Rebuild the work pool from --data before serving
    #[arg(long)]
    setup: bool,

    /// Data lock lifetime in seconds
    #[arg(long, default_value = "10")]
    lock_ttl: u64,

    /// Shared Redis store, e.g. redis://localhost:6379/0. Without it the pool
    /// lives in this process only and starts empty.
    #[arg(long)]
    redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Standalone,
    Amt,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Standalone => Mode::Standalone,
            ModeArg::Amt => Mode::Amt,
        }
    }
}

impl ServeArgs {
    fn into_config(self) -> Result<(ServerConfig, Vec<String>), Box<dyn std::error::Error>> {
        let listen_addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;

        let mut job = JobConfig::new(self.task_key, self.mode.into(), self.num_tasks)
            .with_track_correct(self.track_correct)
            .with_lease(LeaseConfig {
                ttl: Duration::from_secs(self.lock_ttl),
                ..LeaseConfig::default()
            });
        if let Some(secret) = self.secret {
            job = job.with_admin_secret(secret);
        }

        let config = ServerConfig {
            listen_addr,
            data_path: self.data,
            redis_url: self.redis_url,
            setup: self.setup,
            job,
        };
        Ok((config, self.required))
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config, required) = args.into_config()?;
    let shutdown = install_shutdown_handler()?;

    let source = match &config.data_path {
        Some(path) => MemorySource::from_json_file(path, required).await?,
        None => {
            if config.setup {
                tracing::warn!("--setup without --data empties the pool");
            }
            MemorySource::new().with_required(required)
        }
    };

    match config.redis_url.clone() {
        Some(url) => {
            let store = RedisStore::connect_url(&url).await?;
            if !config.setup {
                tracing::info!("--setup not given; serving the pool already in Redis");
            }
            serve(config, Arc::new(store), source, shutdown).await
        }
        None => {
            if !config.setup {
                tracing::warn!("No --redis-url and no --setup; the in-memory pool is empty");
            }
            serve(config, Arc::new(MemoryStore::new()), source, shutdown).await
        }
    }
}

async fn serve<S: KvStore>(
    config: ServerConfig,
    store: Arc<S>,
    source: MemorySource,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Arc::new(Dispatcher::new(
        config.job.clone(),
        store,
        Arc::new(source),
    ));

    if config.setup {
        match dispatcher.reset(&shutdown).await {
            Ok(report) => tracing::info!(
                rows = report.rows_added,
                skipped = report.rows_skipped,
                "Work pool ready"
            ),
            Err(workpool::PoolError::Cancelled) => {
                tracing::info!("Shutdown requested during setup");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    run_dashboard(config.listen_addr, dispatcher, shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_server(serve_args).await?;
        }
    }

    Ok(())
}
