use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use formrelay_contract::DEFAULT_PRODUCT_TAG;
use formrelay_gateway::{
    build_router, serve_until_shutdown, spawn_event_logger, AppState, BootConfig, LimiterConfig,
    Shutdown, SubmissionWorker,
};
use formrelay_queue::{Backoff, JobOptions, JobQueue, QueueConfig, QueueSettings};
use formrelay_sheets::{
    google::{DEFAULT_API_BASE, DEFAULT_RANGE, DEFAULT_TOKEN_URL},
    GoogleSheetsConfig, GoogleSheetsWriter, InMemorySheetWriter, ServiceAccountCredentials,
    SheetWriter,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Form submission relay daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        /// Optional TOML file with tunables; every field has a default.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Keep rows in memory instead of calling the Sheets API.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RuntimeConfig {
    http: HttpSection,
    limits: LimitsSection,
    queue: QueueSection,
    sheet: SheetSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct HttpSection {
    bind: Option<String>,
    trust_forwarded_for: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LimitsSection {
    window_secs: u64,
    form_max: u32,
    general_max: u32,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            window_secs: 15 * 60,
            form_max: 10,
            general_max: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct QueueSection {
    name: String,
    concurrency: usize,
    attempts: u32,
    backoff_ms: u64,
    lock_duration_ms: u64,
    stalled_interval_ms: u64,
    max_stalled_count: u32,
    poll_interval_ms: u64,
    drain_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            name: "form-submissions".to_string(),
            concurrency: 1,
            attempts: 3,
            backoff_ms: 2_000,
            lock_duration_ms: 30_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            poll_interval_ms: 1_000,
            drain_timeout_ms: 10_000,
        }
    }
}

impl QueueSection {
    fn settings(&self) -> QueueSettings {
        QueueSettings {
            lock_duration: Duration::from_millis(self.lock_duration_ms),
            stalled_interval: Duration::from_millis(self.stalled_interval_ms),
            max_stalled_count: self.max_stalled_count,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts.max(1),
            backoff: Backoff::Exponential {
                delay_ms: self.backoff_ms,
            },
            remove_on_complete: true,
        }
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SheetSection {
    range: String,
    product_tag: String,
    token_url: String,
    api_base: String,
}

impl Default for SheetSection {
    fn default() -> Self {
        Self {
            range: DEFAULT_RANGE.to_string(),
            product_tag: DEFAULT_PRODUCT_TAG.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded environment file"),
        Err(err) if err.not_found() => {}
        Err(err) => warn!(error = %err, "failed to read environment file"),
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, dry_run } => serve(config.as_deref(), dry_run).await,
    }
}

async fn serve(config_path: Option<&Path>, dry_run: bool) -> Result<ExitCode> {
    let boot = match BootConfig::from_env() {
        Ok(boot) => boot,
        Err(err) => {
            error!(error = %err, "startup aborted");
            return Ok(ExitCode::FAILURE);
        }
    };
    let runtime = load_runtime_config(config_path)?;

    let shutdown = Shutdown::new();
    shutdown.install_panic_hook();

    let bind = runtime
        .http
        .bind
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", boot.port));
    let socket: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid socket address {bind}"))?;
    let listener = TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    let mut queue_config = QueueConfig::new(boot.queue_url.clone(), runtime.queue.name.clone());
    queue_config.settings = runtime.queue.settings();
    queue_config.defaults = runtime.queue.job_options();
    let queue = JobQueue::connect(&queue_config)
        .await
        .context("failed to connect to the job queue")?;

    let writer = build_writer(&boot, &runtime, dry_run)?;
    spawn_event_logger(&queue);
    let worker = SubmissionWorker::new(writer, runtime.sheet.product_tag.clone());
    queue
        .process(Arc::new(worker), runtime.queue.concurrency)
        .await
        .context("failed to start queue consumers")?;

    let state = AppState::new(
        queue.clone(),
        limiter_config(LimiterConfig::form(), &runtime, runtime.limits.form_max),
        limiter_config(LimiterConfig::general(), &runtime, runtime.limits.general_max),
        boot.production,
    )
    .with_job_options(runtime.queue.job_options());
    let app = build_router(state);

    shutdown.listen_for_signals();
    info!(
        bind = %socket,
        production = boot.production,
        dry_run,
        "formrelayd listening"
    );

    let outcome =
        serve_until_shutdown(listener, app, queue, shutdown, runtime.queue.drain_timeout()).await;
    info!(
        reason = ?outcome.reason,
        drained = outcome.drained,
        "formrelayd stopped"
    );
    Ok(ExitCode::from(
        u8::try_from(outcome.exit_code()).unwrap_or(1),
    ))
}

fn load_runtime_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&source).with_context(|| format!("invalid config TOML at {}", path.display()))
}

fn build_writer(
    boot: &BootConfig,
    runtime: &RuntimeConfig,
    dry_run: bool,
) -> Result<Arc<dyn SheetWriter>> {
    if dry_run {
        warn!("dry run: rows are kept in memory and discarded on exit");
        return Ok(Arc::new(InMemorySheetWriter::new()));
    }

    let credentials = ServiceAccountCredentials::new(boot.client_email.clone(), &boot.private_key);
    let mut config = GoogleSheetsConfig::new(boot.spreadsheet_id.clone());
    config.range = runtime.sheet.range.clone();
    config.token_url = runtime.sheet.token_url.clone();
    config.api_base = runtime.sheet.api_base.clone();

    let writer = GoogleSheetsWriter::new(credentials, config)
        .context("failed to set up the Google Sheets writer")?;
    Ok(Arc::new(writer))
}

fn limiter_config(base: LimiterConfig, runtime: &RuntimeConfig, max_requests: u32) -> LimiterConfig {
    LimiterConfig {
        window: Duration::from_secs(runtime.limits.window_secs),
        max_requests,
        trust_forwarded_for: runtime.http.trust_forwarded_for,
        ..base
    }
}
