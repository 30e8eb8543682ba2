use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use thiserror::Error;
use tracing::warn;

use crate::submission::{SanitizedSubmission, SubmissionRequest};

// Letters, Latin-1 accented letters (without × and ÷) and whitespace.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-zÀ-ÖØ-öø-ÿ\s]{2,50}$").expect("name pattern compiles"));

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+593[0-9]{9}$").expect("phone pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormField {
    Name,
    Phone,
}

impl fmt::Display for FormField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormField::Name => f.write_str("nombre"),
            FormField::Phone => f.write_str("teléfono"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("El campo {0} es obligatorio.")]
    MissingField(FormField),
    #[error("El nombre debe contener solo letras y espacios, entre 2 y 50 caracteres.")]
    InvalidName,
    #[error("El número debe tener el formato: +593XXXXXXXXX")]
    InvalidPhone,
}

pub fn validate(raw: &SubmissionRequest) -> Result<SanitizedSubmission, ValidationError> {
    let name = required(raw.name.as_deref(), FormField::Name)?;
    if !NAME_PATTERN.is_match(name) {
        warn!(field = %FormField::Name, value = %name, "invalid name attempted");
        return Err(ValidationError::InvalidName);
    }

    let phone = required(raw.phone.as_deref(), FormField::Phone)?;
    if !PHONE_PATTERN.is_match(phone) {
        warn!(field = %FormField::Phone, value = %phone, "invalid phone attempted");
        return Err(ValidationError::InvalidPhone);
    }

    Ok(SanitizedSubmission::new(name.to_string(), phone.to_string()))
}

fn required(value: Option<&str>, field: FormField) -> Result<&str, ValidationError> {
    match value.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => Ok(trimmed),
        _ => {
            warn!(field = %field, "required field missing");
            Err(ValidationError::MissingField(field))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{validate, FormField, ValidationError};
    use crate::submission::SubmissionRequest;

    fn check(name: &str, phone: &str) -> Result<(String, String), ValidationError> {
        validate(&SubmissionRequest::new(name, phone))
            .map(|ok| (ok.name().to_string(), ok.phone().to_string()))
    }

    #[test]
    fn accepts_accented_names_and_trims() {
        let (name, phone) = check("  Ana María ", " +593991234567 ").expect("valid");
        assert_eq!(name, "Ana María");
        assert_eq!(phone, "+593991234567");

        assert!(check("Íñigo Ñúñez", "+593991234567").is_ok());
        assert!(check("Zoë Öztürk", "+593991234567").is_ok());
    }

    #[test]
    fn rejects_names_outside_bounds() {
        assert_eq!(check("A", "+593991234567"), Err(ValidationError::InvalidName));
        assert_eq!(check("John123", "+593991234567"), Err(ValidationError::InvalidName));
        assert_eq!(check("Ana-María", "+593991234567"), Err(ValidationError::InvalidName));
        assert_eq!(check("Ana × María", "+593991234567"), Err(ValidationError::InvalidName));

        let fifty = "a".repeat(50);
        assert!(check(&fifty, "+593991234567").is_ok());
        let fifty_one = "a".repeat(51);
        assert_eq!(check(&fifty_one, "+593991234567"), Err(ValidationError::InvalidName));

        let accented_fifty = "é".repeat(50);
        assert!(check(&accented_fifty, "+593991234567").is_ok());
    }

    #[test]
    fn phone_requires_country_code_and_nine_digits() {
        assert!(check("Ana", "+593991234567").is_ok());
        assert_eq!(check("Ana", "+59399123456"), Err(ValidationError::InvalidPhone));
        assert_eq!(check("Ana", "+5939912345678"), Err(ValidationError::InvalidPhone));
        assert_eq!(check("Ana", "0991234567"), Err(ValidationError::InvalidPhone));
        assert_eq!(check("Ana", "+593 99123456"), Err(ValidationError::InvalidPhone));
        assert_eq!(check("Ana", "+59399123456a"), Err(ValidationError::InvalidPhone));
    }

    #[test]
    fn missing_or_blank_fields_are_reported() {
        let missing_phone = SubmissionRequest {
            name: Some("Ana".into()),
            phone: None,
        };
        assert_eq!(
            validate(&missing_phone),
            Err(ValidationError::MissingField(FormField::Phone))
        );
        assert_eq!(
            check("   ", "+593991234567"),
            Err(ValidationError::MissingField(FormField::Name))
        );
    }

    #[test]
    fn name_is_checked_before_phone() {
        assert_eq!(check("A", "123"), Err(ValidationError::InvalidName));
    }

    #[test]
    fn revalidating_sanitized_value_is_stable() {
        let first = validate(&SubmissionRequest::new(" Carlos Pérez ", "+593987654321 "))
            .expect("valid");
        let second = validate(&SubmissionRequest::from(&first)).expect("still valid");
        assert_eq!(first, second);
    }

    #[test]
    fn messages_are_user_facing() {
        assert_eq!(
            ValidationError::InvalidPhone.to_string(),
            "El número debe tener el formato: +593XXXXXXXXX"
        );
        assert_eq!(
            ValidationError::MissingField(FormField::Name).to_string(),
            "El campo nombre es obligatorio."
        );
    }
}
