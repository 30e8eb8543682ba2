use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use formrelay_contract::AppendRecord;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::writer::{AppendReceipt, SheetWriter, WriteError};

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";
pub const DEFAULT_RANGE: &str = "Cliente!A:D";
pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ServiceAccountCredentials {
    pub client_email: String,
    pub private_key: String,
}

impl ServiceAccountCredentials {
    // Keys usually arrive through the environment with `\n` escaped.
    pub fn new(client_email: impl Into<String>, private_key: &str) -> Self {
        Self {
            client_email: client_email.into(),
            private_key: private_key.replace("\\n", "\n"),
        }
    }
}

impl fmt::Debug for ServiceAccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountCredentials")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsConfig {
    pub spreadsheet_id: String,
    pub range: String,
    pub token_url: String,
    pub api_base: String,
    pub request_timeout: Duration,
}

impl GoogleSheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            range: DEFAULT_RANGE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    #[serde(default)]
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: Option<String>,
    #[serde(default)]
    updated_rows: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

pub struct GoogleSheetsWriter {
    client: Client,
    credentials: ServiceAccountCredentials,
    config: GoogleSheetsConfig,
    session: Mutex<Option<AccessToken>>,
}

impl GoogleSheetsWriter {
    pub fn new(
        credentials: ServiceAccountCredentials,
        config: GoogleSheetsConfig,
    ) -> Result<Self, WriteError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| WriteError::Transport(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            credentials,
            config,
            session: Mutex::new(None),
        })
    }

    pub async fn invalidate_session(&self) {
        let mut session = self.session.lock().await;
        if session.take().is_some() {
            warn!(spreadsheet_id = %self.config.spreadsheet_id, "sheets session invalidated");
        }
    }

    async fn access_token(&self) -> Result<String, WriteError> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = self.fetch_token().await?;
        let value = token.value.clone();
        *session = Some(token);
        Ok(value)
    }

    async fn fetch_token(&self) -> Result<AccessToken, WriteError> {
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.as_bytes())
            .map_err(|err| WriteError::Auth(format!("invalid service account key: {err}")))?;

        let issued_at = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.credentials.client_email,
            scope: SPREADSHEETS_SCOPE,
            aud: &self.config.token_url,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| WriteError::Auth(format!("failed to sign token assertion: {err}")))?;

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| WriteError::Transport(format!("token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => WriteError::Quota(body),
                status if status.is_server_error() => {
                    WriteError::Transport(format!("token endpoint returned {status}: {body}"))
                }
                status => WriteError::Auth(format!("token endpoint returned {status}: {body}")),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| WriteError::Auth(format!("unreadable token response: {err}")))?;

        info!(client_email = %self.credentials.client_email, "sheets session established");
        Ok(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    fn append_url(&self) -> Result<Url, WriteError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|err| WriteError::Transport(format!("invalid API base URL: {err}")))?;
        let range_segment = format!("{}:append", self.config.range);
        url.path_segments_mut()
            .map_err(|_| WriteError::Transport("API base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                self.config.spreadsheet_id.as_str(),
                "values",
                range_segment.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

#[async_trait]
impl SheetWriter for GoogleSheetsWriter {
    async fn append(&self, record: &AppendRecord) -> Result<AppendReceipt, WriteError> {
        let token = self.access_token().await?;
        let url = self.append_url()?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&json!({
                "majorDimension": "ROWS",
                "values": [record.to_row()],
            }))
            .send()
            .await
            .map_err(|err| WriteError::Transport(format!("append request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    self.invalidate_session().await;
                    WriteError::Auth(format!("append returned {status}: {body}"))
                }
                StatusCode::TOO_MANY_REQUESTS => WriteError::Quota(body),
                status if status.is_server_error() => {
                    WriteError::Transport(format!("append returned {status}: {body}"))
                }
                status => WriteError::Rejected {
                    status: status.as_u16(),
                    body,
                },
            };
            return Err(error);
        }

        // The row is written once the API answers 2xx; an odd body is not a reason to retry.
        let parsed: AppendResponse = response.json().await.unwrap_or_default();
        let updates = parsed.updates.unwrap_or_default();
        debug!(
            spreadsheet_id = %self.config.spreadsheet_id,
            updated_range = ?updates.updated_range,
            updated_rows = updates.updated_rows,
            "row appended"
        );

        Ok(AppendReceipt {
            updated_range: updates.updated_range,
            updated_rows: updates.updated_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::post,
        Form, Json, Router,
    };
    use formrelay_contract::AppendRecord;
    use serde_json::{json, Value};

    use super::{GoogleSheetsConfig, GoogleSheetsWriter, ServiceAccountCredentials};
    use crate::writer::{SheetWriter, WriteError};

    const TEST_KEY: &str = include_str!("../testdata/service_account_key.pem");

    #[derive(Default)]
    struct FakeGoogle {
        token_calls: AtomicUsize,
        appends: StdMutex<Vec<RecordedAppend>>,
        scripted_statuses: StdMutex<VecDeque<u16>>,
    }

    #[derive(Debug, Clone)]
    struct RecordedAppend {
        range: String,
        authorization: String,
        query: HashMap<String, String>,
        body: Value,
    }

    async fn token(
        State(fake): State<Arc<FakeGoogle>>,
        Form(form): Form<HashMap<String, String>>,
    ) -> impl IntoResponse {
        assert_eq!(
            form.get("grant_type").map(String::as_str),
            Some("urn:ietf:params:oauth:grant-type:jwt-bearer")
        );
        assert!(form.get("assertion").is_some_and(|jwt| jwt.split('.').count() == 3));
        let call = fake.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Json(json!({
            "access_token": format!("token-{call}"),
            "expires_in": 3600,
            "token_type": "Bearer"
        }))
    }

    async fn append(
        State(fake): State<Arc<FakeGoogle>>,
        Path((_spreadsheet, range)): Path<(String, String)>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        let scripted = fake.scripted_statuses.lock().unwrap().pop_front();
        if let Some(status) = scripted {
            let status = AxumStatus::from_u16(status).unwrap();
            return (status, Json(json!({"error": {"code": status.as_u16()}}))).into_response();
        }

        fake.appends.lock().unwrap().push(RecordedAppend {
            range,
            authorization: headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
            query,
            body,
        });
        Json(json!({
            "spreadsheetId": "sheet-1",
            "updates": {"updatedRange": "Cliente!A2:D2", "updatedRows": 1}
        }))
        .into_response()
    }

    async fn start_fake() -> (Arc<FakeGoogle>, SocketAddr) {
        let fake = Arc::new(FakeGoogle::default());
        let app = Router::new()
            .route("/token", post(token))
            .route("/v4/spreadsheets/{spreadsheet}/values/{range}", post(append))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (fake, addr)
    }

    fn writer_for(addr: SocketAddr) -> GoogleSheetsWriter {
        let mut config = GoogleSheetsConfig::new("sheet-1");
        config.token_url = format!("http://{addr}/token");
        config.api_base = format!("http://{addr}");
        let escaped_key = TEST_KEY.replace('\n', "\\n");
        let credentials =
            ServiceAccountCredentials::new("relay@example.iam.gserviceaccount.com", &escaped_key);
        GoogleSheetsWriter::new(credentials, config).expect("build writer")
    }

    fn record() -> AppendRecord {
        AppendRecord {
            name: "Carlos Pérez".into(),
            phone: "+593987654321".into(),
            product_tag: "Lipoxin".into(),
            timestamp: "16/10/2026, 12:00:00 p. m.".into(),
        }
    }

    #[tokio::test]
    async fn appends_raw_row_and_reuses_session() {
        let (fake, addr) = start_fake().await;
        let writer = writer_for(addr);

        let receipt = writer.append(&record()).await.expect("first append");
        assert_eq!(receipt.updated_rows, 1);
        assert_eq!(receipt.updated_range.as_deref(), Some("Cliente!A2:D2"));
        writer.append(&record()).await.expect("second append");

        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);
        let appends = fake.appends.lock().unwrap().clone();
        assert_eq!(appends.len(), 2);
        let first = &appends[0];
        assert_eq!(first.range, "Cliente!A:D:append");
        assert_eq!(first.authorization, "Bearer token-1");
        assert_eq!(first.query.get("valueInputOption").map(String::as_str), Some("RAW"));
        assert_eq!(
            first.body["values"],
            json!([["Carlos Pérez", "+593987654321", "Lipoxin", "16/10/2026, 12:00:00 p. m."]])
        );
    }

    #[tokio::test]
    async fn rejected_session_is_rebuilt_on_next_call() {
        let (fake, addr) = start_fake().await;
        fake.scripted_statuses.lock().unwrap().push_back(401);
        let writer = writer_for(addr);

        let err = writer.append(&record()).await.expect_err("401 fails");
        assert_eq!(err.kind(), "auth");

        writer.append(&record()).await.expect("retry succeeds");
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fake.appends.lock().unwrap()[0].authorization, "Bearer token-2");
    }

    #[tokio::test]
    async fn remote_failures_map_to_write_errors() {
        let (fake, addr) = start_fake().await;
        fake.scripted_statuses
            .lock()
            .unwrap()
            .extend([429, 503, 400]);
        let writer = writer_for(addr);

        assert!(matches!(writer.append(&record()).await, Err(WriteError::Quota(_))));
        assert!(matches!(writer.append(&record()).await, Err(WriteError::Transport(_))));
        assert!(matches!(
            writer.append(&record()).await,
            Err(WriteError::Rejected { status: 400, .. })
        ));
        assert_eq!(fake.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = writer_for(addr).append(&record()).await.expect_err("no server");
        assert_eq!(err.kind(), "transport");
    }

    #[tokio::test]
    async fn malformed_key_is_auth_failure() {
        let credentials = ServiceAccountCredentials::new("relay@example.com", "not a key");
        let writer = GoogleSheetsWriter::new(credentials, GoogleSheetsConfig::new("sheet-1"))
            .expect("build writer");
        let err = writer.append(&record()).await.expect_err("bad key");
        assert!(matches!(err, WriteError::Auth(_)));
    }

    #[test]
    fn escaped_private_key_is_restored() {
        let credentials =
            ServiceAccountCredentials::new("relay@example.com", "-----BEGIN-----\\nabc\\n-----END-----");
        assert_eq!(credentials.private_key, "-----BEGIN-----\nabc\n-----END-----");
        assert!(!format!("{credentials:?}").contains("abc"));
    }
}
