use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use formrelay_queue::JobQueue;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const ENV_CLIENT_EMAIL: &str = "GOOGLE_CLIENT_EMAIL";
pub const ENV_PRIVATE_KEY: &str = "GOOGLE_PRIVATE_KEY";
pub const ENV_SPREADSHEET_ID: &str = "SPREADSHEET_ID";
pub const ENV_QUEUE_URL: &str = "QUEUE_URL";
pub const ENV_PORT: &str = "PORT";
pub const ENV_APP_ENV: &str = "APP_ENV";

// Checked in this order; the first one missing is reported.
pub const REQUIRED_ENV: [&str; 4] = [
    ENV_CLIENT_EMAIL,
    ENV_PRIVATE_KEY,
    ENV_SPREADSHEET_ID,
    ENV_QUEUE_URL,
];

pub const DEFAULT_PORT: u16 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub client_email: String,
    pub private_key: String,
    pub spreadsheet_id: String,
    pub queue_url: String,
    pub port: u16,
    pub production: bool,
}

impl BootConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let require = |name: &'static str| present(name).ok_or(ConfigError::Missing(name));

        let client_email = require(ENV_CLIENT_EMAIL)?;
        let private_key = require(ENV_PRIVATE_KEY)?;
        let spreadsheet_id = require(ENV_SPREADSHEET_ID)?;
        let queue_url = require(ENV_QUEUE_URL)?;

        let port = match present(ENV_PORT) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|err| ConfigError::Invalid {
                name: ENV_PORT,
                reason: err.to_string(),
            })?,
            None => DEFAULT_PORT,
        };
        let production = present(ENV_APP_ENV)
            .map(|value| value.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Ok(Self {
            client_email,
            private_key,
            spreadsheet_id,
            queue_url,
            port,
            production,
        })
    }
}

impl fmt::Debug for BootConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootConfig")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("queue_url", &self.queue_url)
            .field("port", &self.port)
            .field("production", &self.production)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    Fatal,
}

#[derive(Clone)]
pub struct Shutdown {
    state: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        let first = self.state.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            info!(?reason, "shutdown requested");
        }
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.state.borrow()
    }

    pub async fn triggered(&self) -> ShutdownReason {
        let mut receiver = self.state.subscribe();
        loop {
            if let Some(reason) = *receiver.borrow_and_update() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                return ShutdownReason::Fatal;
            }
        }
    }

    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let reason = shutdown_signal().await;
            shutdown.trigger(reason);
        })
    }

    pub fn install_panic_hook(&self) {
        let shutdown = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            error!(panic = %info, "uncaught panic");
            shutdown.trigger(ShutdownReason::Fatal);
            previous(info);
        }));
    }
}

async fn shutdown_signal() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub reason: ShutdownReason,
    pub server_error: Option<String>,
    pub drained: bool,
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> i32 {
        let failed =
            self.reason == ShutdownReason::Fatal || self.server_error.is_some() || !self.drained;
        i32::from(failed)
    }
}

pub async fn serve_until_shutdown(
    listener: TcpListener,
    router: Router,
    queue: JobQueue,
    shutdown: Shutdown,
    drain_timeout: Duration,
) -> ShutdownOutcome {
    let stop = shutdown.clone();
    let served = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = stop.triggered().await;
        info!(?reason, "HTTP listener closing");
    })
    .await;

    let server_error = match served {
        Ok(()) => None,
        Err(err) => {
            error!(error = %err, "HTTP server failed");
            shutdown.trigger(ShutdownReason::Fatal);
            Some(err.to_string())
        }
    };
    info!("HTTP listener closed; draining job queue");

    let drained = queue.close(drain_timeout).await;
    if !drained {
        warn!(timeout_ms = drain_timeout.as_millis() as u64, "queue drain timed out");
    }

    ShutdownOutcome {
        reason: shutdown.reason().unwrap_or(ShutdownReason::Fatal),
        server_error,
        drained,
    }
}
