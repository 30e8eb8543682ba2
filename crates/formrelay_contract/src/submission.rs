use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const SUBMISSION_TIMEZONE: Tz = chrono_tz::America::Guayaquil;

pub const DEFAULT_PRODUCT_TAG: &str = "Lipoxin";

// `es-EC` rendering, minus the `a. m.`/`p. m.` suffix which is appended by hand.
const TIMESTAMP_FORMAT: &str = "%-d/%-m/%Y, %-I:%M:%S";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl SubmissionRequest {
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            phone: Some(phone.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizedSubmission {
    name: String,
    phone: String,
}

impl SanitizedSubmission {
    pub(crate) fn new(name: String, phone: String) -> Self {
        Self { name, phone }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }
}

impl From<&SanitizedSubmission> for SubmissionRequest {
    fn from(value: &SanitizedSubmission) -> Self {
        SubmissionRequest::new(value.name.clone(), value.phone.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPayload {
    pub name: String,
    pub phone: String,
    pub timestamp: String,
}

impl JobPayload {
    pub fn capture(submission: &SanitizedSubmission) -> Self {
        Self::at(submission, Utc::now())
    }

    pub fn at(submission: &SanitizedSubmission, received_at: DateTime<Utc>) -> Self {
        Self {
            name: submission.name.clone(),
            phone: submission.phone.clone(),
            timestamp: format_submission_timestamp(received_at),
        }
    }

    pub fn into_record(self, product_tag: &str) -> AppendRecord {
        AppendRecord {
            name: self.name,
            phone: self.phone,
            product_tag: product_tag.to_string(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendRecord {
    pub name: String,
    pub phone: String,
    pub product_tag: String,
    pub timestamp: String,
}

impl AppendRecord {
    pub fn to_row(&self) -> [String; 4] {
        [
            self.name.clone(),
            self.phone.clone(),
            self.product_tag.clone(),
            self.timestamp.clone(),
        ]
    }
}

pub fn format_submission_timestamp(instant: DateTime<Utc>) -> String {
    let local = instant.with_timezone(&SUBMISSION_TIMEZONE);
    let meridiem = if local.hour() < 12 { "a. m." } else { "p. m." };
    format!("{} {meridiem}", local.format(TIMESTAMP_FORMAT))
}
