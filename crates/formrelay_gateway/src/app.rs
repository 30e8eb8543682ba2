use std::sync::Arc;

use axum::{
    extract::{FromRequest, Request, State},
    http::{header, StatusCode, Uri},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use formrelay_contract::{validate, JobPayload, SubmissionRequest};
use formrelay_queue::{JobOptions, JobQueue};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{ApiError, ACCEPTED_MESSAGE, NOT_FOUND_MESSAGE};
use crate::limiter::{enforce_admission, AdmissionLimiter, LimiterConfig};

#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    pub job_options: JobOptions,
    pub form_limiter: Arc<AdmissionLimiter>,
    pub general_limiter: Arc<AdmissionLimiter>,
    pub expose_error_detail: bool,
}

impl AppState {
    pub fn new(
        queue: JobQueue,
        form_limits: LimiterConfig,
        general_limits: LimiterConfig,
        production: bool,
    ) -> Self {
        Self {
            queue,
            job_options: JobOptions::default(),
            form_limiter: Arc::new(AdmissionLimiter::new(form_limits)),
            general_limiter: Arc::new(AdmissionLimiter::new(general_limits)),
            expose_error_detail: !production,
        }
    }

    pub fn with_job_options(mut self, job_options: JobOptions) -> Self {
        self.job_options = job_options;
        self
    }
}

pub fn build_router(state: AppState) -> Router {
    let form_routes = Router::new()
        .route("/submit", post(submit))
        .route_layer(middleware::from_fn_with_state(
            state.form_limiter.clone(),
            enforce_admission,
        ));

    let general_routes = Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.general_limiter.clone(),
            enforce_admission,
        ));

    form_routes.merge(general_routes).with_state(state)
}

pub struct SubmissionBody(pub SubmissionRequest);

impl<S> FromRequest<S> for SubmissionBody
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let urlencoded = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"));

        if urlencoded {
            let Form(body) = Form::<SubmissionRequest>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::MalformedBody(rejection.body_text()))?;
            Ok(Self(body))
        } else {
            let Json(body) = Json::<SubmissionRequest>::from_request(req, state)
                .await
                .map_err(|rejection| ApiError::MalformedBody(rejection.body_text()))?;
            Ok(Self(body))
        }
    }
}

async fn submit(
    State(state): State<AppState>,
    SubmissionBody(request): SubmissionBody,
) -> Result<impl IntoResponse, ApiError> {
    let submission = validate(&request)?;
    let payload = JobPayload::capture(&submission);

    let job = state
        .queue
        .enqueue_with(&payload, &state.job_options)
        .await
        .map_err(|err| ApiError::enqueue(err, state.expose_error_detail))?;

    info!(job_id = %job.id, name = %submission.name(), "submission queued");
    Ok((StatusCode::OK, Json(json!({ "message": ACCEPTED_MESSAGE }))))
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "status": "live",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    let counts = if state.queue.is_closed() {
        None
    } else {
        match state.queue.counts().await {
            Ok(counts) => Some(counts),
            Err(err) => {
                warn!(error = %err, "readiness probe could not reach the queue");
                None
            }
        }
    };

    match counts {
        Some(counts) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "queue": counts,
                "timestamp": Utc::now().to_rfc3339()
            })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "timestamp": Utc::now().to_rfc3339()
            })),
        ),
    }
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    warn!(path = %uri.path(), "route not found");
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": NOT_FOUND_MESSAGE })),
    )
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        extract::{connect_info::MockConnectInfo, ConnectInfo},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use chrono::{Timelike, Utc};
    use formrelay_contract::format_submission_timestamp;
    use formrelay_queue::{Backoff, JobOptions, JobQueue, QueueConfig, QueueEvent, QueueSettings};
    use formrelay_sheets::InMemorySheetWriter;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::{build_router, AppState};
    use crate::limiter::LimiterConfig;
    use crate::worker::SubmissionWorker;

    async fn open_queue(dir: &TempDir) -> JobQueue {
        let mut config = QueueConfig::new(
            dir.path().join("queue.db").display().to_string(),
            "form-submissions",
        );
        config.settings = QueueSettings {
            poll_interval: Duration::from_millis(10),
            ..QueueSettings::default()
        };
        JobQueue::connect(&config).await.expect("connect queue")
    }

    fn app(queue: JobQueue, production: bool) -> Router {
        let state = AppState::new(queue, LimiterConfig::form(), LimiterConfig::general(), production)
            .with_job_options(JobOptions {
                backoff: Backoff::Fixed { delay_ms: 0 },
                ..JobOptions::default()
            });
        build_router(state).layer(MockConnectInfo(SocketAddr::from(([198, 51, 100, 4], 52000))))
    }

    fn submit_json(body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    #[tokio::test]
    async fn valid_submission_is_acknowledged_and_queued() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let app = app(queue.clone(), true);

        let (status, headers, body) = send(
            &app,
            submit_json(json!({"name": "  Carlos Pérez ", "phone": "+593987654321"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "Formulario recibido con éxito"}));
        assert_eq!(headers["ratelimit-limit"], "10");
        assert_eq!(headers["ratelimit-remaining"], "9");

        let job = queue.claim().await.expect("claim").expect("job queued");
        assert_eq!(job.payload["name"], "Carlos Pérez");
        assert_eq!(job.payload["phone"], "+593987654321");
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected_without_queueing() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let app = app(queue.clone(), true);

        let cases = [
            (
                json!({"name": "Ana3", "phone": "+593991234567"}),
                "El nombre debe contener solo letras y espacios, entre 2 y 50 caracteres.",
            ),
            (
                json!({"name": "Ana", "phone": "0991234567"}),
                "El número debe tener el formato: +593XXXXXXXXX",
            ),
            (json!({"name": "Ana"}), "El campo teléfono es obligatorio."),
            (json!({"phone": "+593991234567"}), "El campo nombre es obligatorio."),
        ];
        for (payload, message) in cases {
            let (status, _, body) = send(&app, submit_json(payload)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], message);
        }

        assert_eq!(queue.counts().await.expect("counts").waiting, 0);
    }

    #[tokio::test]
    async fn malformed_body_is_a_client_error() {
        let dir = TempDir::new().expect("tempdir");
        let app = app(open_queue(&dir).await, true);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"name\": "))
            .unwrap();
        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn urlencoded_form_is_accepted() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let app = app(queue.clone(), true);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("name=Ana+Mar%C3%ADa&phone=%2B593991234567"))
            .unwrap();
        let (status, _, _) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        let job = queue.claim().await.expect("claim").expect("job queued");
        assert_eq!(job.payload["name"], "Ana María");
    }

    #[tokio::test]
    async fn eleventh_submission_from_one_client_is_throttled() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let app = app(queue.clone(), true);

        for _ in 0..10 {
            let (status, _, _) = send(
                &app,
                submit_json(json!({"name": "Ana", "phone": "+593991234567"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, headers, body) = send(
            &app,
            submit_json(json!({"name": "Ana", "phone": "+593991234567"})),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body["error"],
            "Demasiados intentos de envío de formulario. Por favor, espere 15 minutos."
        );
        assert!(headers.contains_key(header::RETRY_AFTER));
        assert_eq!(queue.counts().await.expect("counts").waiting, 10);

        let request = Request::builder()
            .uri("/health/live")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK, "general routes keep their own quota");
    }

    #[tokio::test]
    async fn each_peer_has_its_own_submission_quota() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let app = app(queue.clone(), true);
        let from = |peer: SocketAddr| {
            let mut request = submit_json(json!({"name": "Ana", "phone": "+593991234567"}));
            request.extensions_mut().insert(ConnectInfo(peer));
            request
        };
        let first = SocketAddr::from(([203, 0, 113, 10], 40000));
        let second = SocketAddr::from(([203, 0, 113, 11], 40000));

        for _ in 0..10 {
            let (status, _, _) = send(&app, from(first)).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _, _) = send(&app, from(first)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, headers, _) = send(&app, from(second)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["ratelimit-remaining"], "9");
        assert_eq!(queue.counts().await.expect("counts").waiting, 11);
    }

    #[tokio::test]
    async fn enqueue_failure_hides_detail_in_production() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        queue.close(Duration::from_secs(1)).await;

        let production = app(queue.clone(), true);
        let (status, _, body) = send(
            &production,
            submit_json(json!({"name": "Ana", "phone": "+593991234567"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["error"],
            "Error al enviar los datos. Intente de nuevo más tarde."
        );

        let development = app(queue, false);
        let (status, _, body) = send(
            &development,
            submit_json(json!({"name": "Ana", "phone": "+593991234567"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"]
            .as_str()
            .is_some_and(|detail| detail.contains("closed")));
    }

    #[tokio::test]
    async fn readiness_follows_the_queue() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let app = app(queue.clone(), true);
        let ready = || Request::builder().uri("/health/ready").body(Body::empty()).unwrap();

        let (status, _, body) = send(&app, ready()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["queue"]["waiting"], 0);

        queue.close(Duration::from_secs(1)).await;
        let (status, _, body) = send(&app, ready()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn unknown_route_returns_json_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let app = app(open_queue(&dir).await, true);

        let request = Request::builder().uri("/admin").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "No encontrado"}));
    }

    #[tokio::test]
    async fn accepted_submission_lands_in_the_sheet_once() {
        let dir = TempDir::new().expect("tempdir");
        let queue = open_queue(&dir).await;
        let mut events = queue.subscribe();
        let writer = Arc::new(InMemorySheetWriter::new());
        queue
            .process(Arc::new(SubmissionWorker::new(writer.clone(), "Lipoxin")), 1)
            .await
            .expect("process");
        let app = app(queue.clone(), true);

        let before = Utc::now();
        let (status, _, body) = send(
            &app,
            submit_json(json!({"name": "Carlos Pérez", "phone": "+593987654321"})),
        )
        .await;
        let after = Utc::now();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Formulario recibido con éxito");

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(QueueEvent::Completed { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .expect("job completes");

        let rows = writer.rows();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.name, "Carlos Pérez");
        assert_eq!(row.phone, "+593987654321");
        assert_eq!(row.product_tag, "Lipoxin");

        let mut second = before.with_nanosecond(0).unwrap();
        let mut candidates = Vec::new();
        while second <= after {
            candidates.push(format_submission_timestamp(second));
            second += chrono::Duration::seconds(1);
        }
        assert!(
            candidates.contains(&row.timestamp),
            "{} not within {candidates:?}",
            row.timestamp
        );

        queue.close(Duration::from_secs(1)).await;
    }
}
