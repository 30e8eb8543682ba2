pub mod submission;
pub mod validation;

pub use submission::{
    format_submission_timestamp, AppendRecord, JobPayload,
    SanitizedSubmission, SubmissionRequest, DEFAULT_PRODUCT_TAG, SUBMISSION_TIMEZONE,
};
pub use validation::{validate, FormField, ValidationError};
