use std::future::IntoFuture;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cronweb::config::Config;
use cronweb::controller::Controller;
use cronweb::http::{router, AppState};
use cronweb_storage::Storage;
use cronweb_worker::{HookRegistry, WebhookConfig, WorkerConfig};

#[derive(Parser)]
#[command(name = "cronweb", about = "A single-node, persistent cron-style shell job runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Run {
        #[arg(short, long, default_value = "cronweb.yaml")]
        config: PathBuf,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_worker_config(config: &Config) -> WorkerConfig {
    let webhook = match (&config.worker.webhook_url, &config.worker.webhook_secret) {
        (Some(url), Some(secret)) => Some(WebhookConfig {
            url: url.clone(),
            secret: secret.clone(),
        }),
        _ => None,
    };
    WorkerConfig {
        work_dir: config.worker.work_dir.clone(),
        times_retry: config.worker.times_retry,
        wait_retry_base: config.worker.wait_retry_base,
        webhook,
        subprocess_env: load_subprocess_env(),
    }
}

/// `.env_subprocess.json`, when present, fully replaces the subprocess
/// environment, used when running under a virtual environment.
fn load_subprocess_env() -> Option<std::collections::HashMap<String, String>> {
    let text = std::fs::read_to_string(".env_subprocess.json").ok()?;
    serde_json::from_str(&text).ok()
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    init_tracing(&config.tracing.level);

    let storage = Storage::connect(
        config
            .storage
            .db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("db_path is not valid UTF-8"))?,
        0,
    )
    .await?;

    let controller = Controller::new(
        storage,
        config.logger.log_dir.clone(),
        build_worker_config(&config),
        HookRegistry::new(),
    )
    .await?;

    let state = AppState {
        controller: controller.clone(),
        secret: config.web.secret.clone(),
    };
    let app = router(state);
    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "cronweb listening");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server.into_future() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    controller.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run(config).await,
    }
}
