use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const FORM_MAX_REQUESTS: u32 = 10;
pub const GENERAL_MAX_REQUESTS: u32 = 100;
pub const FORM_LIMIT_MESSAGE: &str =
    "Demasiados intentos de envío de formulario. Por favor, espere 15 minutos.";
pub const GENERAL_LIMIT_MESSAGE: &str = "Demasiadas solicitudes, por favor intente más tarde.";

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub name: String,
    pub window: Duration,
    pub max_requests: u32,
    pub message: String,
    pub trust_forwarded_for: bool,
}

impl LimiterConfig {
    pub fn form() -> Self {
        Self {
            name: "form".to_string(),
            window: DEFAULT_WINDOW,
            max_requests: FORM_MAX_REQUESTS,
            message: FORM_LIMIT_MESSAGE.to_string(),
            trust_forwarded_for: false,
        }
    }

    pub fn general() -> Self {
        Self {
            name: "general".to_string(),
            window: DEFAULT_WINDOW,
            max_requests: GENERAL_MAX_REQUESTS,
            message: GENERAL_LIMIT_MESSAGE.to_string(),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

impl Admission {
    fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(ceil_secs(self.reset_after)));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RateLimitExceeded {
    pub limit: u32,
    pub retry_after: Duration,
    pub message: String,
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let retry_secs = ceil_secs(self.retry_after);
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": self.message })),
        )
            .into_response();
        let headers = response.headers_mut();
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_secs));
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(0u32));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(retry_secs));
        response
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    resets_at: Instant,
}

#[derive(Debug)]
struct Counters {
    windows: HashMap<IpAddr, Window>,
    next_sweep: Instant,
}

#[derive(Debug)]
pub struct AdmissionLimiter {
    config: LimiterConfig,
    counters: Mutex<Counters>,
}

impl AdmissionLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let next_sweep = Instant::now() + config.window;
        Self {
            config,
            counters: Mutex::new(Counters {
                windows: HashMap::new(),
                next_sweep,
            }),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn allow(&self, client: IpAddr) -> bool {
        self.check(client).is_ok()
    }

    pub fn check(&self, client: IpAddr) -> Result<Admission, RateLimitExceeded> {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> Result<Admission, RateLimitExceeded> {
        let window_length = self.config.window;
        let mut counters = self.lock_counters();

        if now >= counters.next_sweep {
            counters.windows.retain(|_, window| window.resets_at > now);
            counters.next_sweep = now + window_length;
        }

        let window = counters.windows.entry(client).or_insert(Window {
            count: 0,
            resets_at: now + window_length,
        });
        if window.resets_at <= now {
            window.count = 0;
            window.resets_at = now + window_length;
        }

        let reset_after = window.resets_at.saturating_duration_since(now);
        if window.count >= self.config.max_requests {
            return Err(RateLimitExceeded {
                limit: self.config.max_requests,
                retry_after: reset_after,
                message: self.config.message.clone(),
            });
        }

        window.count += 1;
        Ok(Admission {
            limit: self.config.max_requests,
            remaining: self.config.max_requests - window.count,
            reset_after,
        })
    }

    pub fn client_key(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        if self.config.trust_forwarded_for {
            let forwarded = headers
                .get(X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        peer.ip()
    }

    fn lock_counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| {
            warn!(limiter = %self.config.name, "limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

pub async fn enforce_admission(
    State(limiter): State<Arc<AdmissionLimiter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client = limiter.client_key(request.headers(), peer);

    match limiter.check(client) {
        Ok(admission) => {
            let mut response = next.run(request).await;
            admission.apply_headers(response.headers_mut());
            response
        }
        Err(rejected) => {
            warn!(
                limiter = %limiter.config.name,
                client = %client,
                path = %request.uri().path(),
                "rate limit exceeded"
            );
            rejected.into_response()
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
