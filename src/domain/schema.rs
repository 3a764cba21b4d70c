//! Fixed schema for lead submissions.
//!
//! Validation walks the whole body and collects every violation instead of stopping at the
//! first one, then produces the normalized payload the lead id is derived from.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::lead::{FieldValue, LeadId, LeadPayload};
use crate::common::error::{FieldViolation, ValidationError};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@([A-Za-z0-9\-]+\.)+[A-Za-z]{2,}$").expect("valid email regex")
});

const MAX_NAME_CHARS: usize = 200;
const MAX_EMAIL_CHARS: usize = 254;
const MAX_ATTRIBUTE_KEY_CHARS: usize = 64;
const MAX_ATTRIBUTE_VALUE_CHARS: usize = 1024;
const PHONE_DIGITS: std::ops::RangeInclusive<usize> = 10..=15;

const KNOWN_KEYS: &[&str] = &["leadId", "lead_id", "name", "email", "phone", "cpf", "attributes"];

/// A submission that passed the schema, normalized and ready for id derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSubmission {
    pub lead_id: Option<LeadId>,
    pub payload: LeadPayload,
}

pub fn validate_submission(body: &Value) -> Result<ValidatedSubmission, ValidationError> {
    let Some(obj) = body.as_object() else {
        return Err(ValidationError {
            violations: vec![FieldViolation::new("$", "body must be a JSON object")],
        });
    };

    let mut violations = Vec::new();
    let mut fields = BTreeMap::new();

    for key in obj.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            violations.push(FieldViolation::new(key.clone(), "unknown field"));
        }
    }

    let present = |key: &str| obj.get(key).filter(|v| !v.is_null());
    if let (Some(camel), Some(snake)) = (present("leadId"), present("lead_id")) {
        let same = match (camel, snake) {
            (Value::String(a), Value::String(b)) => a.trim() == b.trim(),
            (a, b) => a == b,
        };
        if !same {
            violations.push(FieldViolation::new("lead_id", "conflicts with leadId"));
        }
    }

    let lead_id = match present("leadId").or_else(|| present("lead_id")) {
        None => None,
        Some(Value::String(s)) => match LeadId::parse(s) {
            Ok(id) => Some(id),
            Err(v) => {
                violations.push(v);
                None
            }
        },
        Some(_) => {
            violations.push(FieldViolation::new("leadId", "must be a string"));
            None
        }
    };

    let email_present = !matches!(obj.get("email"), None | Some(Value::Null));
    match optional_string(obj, "email", &mut violations) {
        None if !email_present => violations.push(FieldViolation::new("email", "is required")),
        None => {}
        Some(raw) => {
            let email = raw.trim().to_lowercase();
            if email.len() > MAX_EMAIL_CHARS || !EMAIL_RE.is_match(&email) {
                violations.push(FieldViolation::new("email", "is not a valid email address"));
            } else {
                fields.insert("email".to_string(), FieldValue::Text(email));
            }
        }
    }

    if let Some(raw) = optional_string(obj, "name", &mut violations) {
        let name = raw.trim();
        if name.is_empty() {
            violations.push(FieldViolation::new("name", "must not be blank"));
        } else if name.chars().count() > MAX_NAME_CHARS {
            violations.push(FieldViolation::new(
                "name",
                format!("must be at most {MAX_NAME_CHARS} characters"),
            ));
        } else {
            fields.insert("name".to_string(), FieldValue::Text(name.to_string()));
        }
    }

    if let Some(raw) = optional_string(obj, "phone", &mut violations) {
        match normalize_phone(raw) {
            Some(phone) => {
                fields.insert("phone".to_string(), FieldValue::Text(phone));
            }
            None => violations.push(FieldViolation::new(
                "phone",
                "must contain 10 to 15 digits",
            )),
        }
    }

    if let Some(raw) = optional_string(obj, "cpf", &mut violations) {
        let digits: String = raw.chars().filter(|c| !matches!(c, '.' | '-')).collect();
        if !is_valid_cpf(&digits) {
            violations.push(FieldViolation::new(
                "cpf",
                "must be a valid 11-digit CPF",
            ));
        } else {
            fields.insert("cpf".to_string(), FieldValue::Text(digits));
        }
    }

    let attributes = match obj.get("attributes") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(attrs)) => collect_attributes(attrs, &mut violations),
        Some(_) => {
            violations.push(FieldViolation::new("attributes", "must be an object"));
            BTreeMap::new()
        }
    };

    if !violations.is_empty() {
        return Err(ValidationError { violations });
    }

    Ok(ValidatedSubmission {
        lead_id,
        payload: LeadPayload { fields, attributes },
    })
}

fn optional_string<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<&'a str> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(_) => {
            violations.push(FieldViolation::new(key, "must be a string"));
            None
        }
    }
}

fn collect_attributes(
    attrs: &Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in attrs {
        let field = format!("attributes.{key}");
        if key.is_empty() || key.chars().count() > MAX_ATTRIBUTE_KEY_CHARS {
            violations.push(FieldViolation::new(
                field,
                format!("key must be 1 to {MAX_ATTRIBUTE_KEY_CHARS} characters"),
            ));
            continue;
        }
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                violations.push(FieldViolation::new(
                    field,
                    "must be a string, number or boolean",
                ));
                continue;
            }
        };
        if text.chars().count() > MAX_ATTRIBUTE_VALUE_CHARS {
            violations.push(FieldViolation::new(
                field,
                format!("must be at most {MAX_ATTRIBUTE_VALUE_CHARS} characters"),
            ));
            continue;
        }
        out.insert(key.clone(), text);
    }
    out
}

/// Keep a leading '+' and the digits; formatting characters are dropped
fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut out = String::new();
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '+' if i == 0 => out.push('+'),
            '0'..='9' => out.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }
    let digits = out.chars().filter(char::is_ascii_digit).count();
    PHONE_DIGITS.contains(&digits).then_some(out)
}

/// Brazilian taxpayer id: 11 digits, the last two are mod-11 check digits
pub fn is_valid_cpf(cpf: &str) -> bool {
    if cpf.len() != 11 || !cpf.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let digits: Vec<u32> = cpf.chars().filter_map(|c| c.to_digit(10)).collect();
    // Repeated digits pass the checksum but are never issued
    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let check = |len: usize| -> u32 {
        let sum: u32 = digits[..len]
            .iter()
            .enumerate()
            .map(|(i, d)| d * (len as u32 + 1 - i as u32))
            .sum();
        match (sum * 10) % 11 {
            10 => 0,
            d => d,
        }
    };

    check(9) == digits[9] && check(10) == digits[10]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cpf_check_digits() {
        assert!(is_valid_cpf("52998224725"));
        assert!(is_valid_cpf("11144477735"));
        assert!(!is_valid_cpf("52998224724"));
        assert!(!is_valid_cpf("11111111111"));
        assert!(!is_valid_cpf("5299822472"));
        assert!(!is_valid_cpf("5299822472a"));
    }

    #[test]
    fn test_minimal_submission() {
        let v = validate_submission(&json!({"leadId": "L1", "email": "A@B.com"})).unwrap();
        assert_eq!(v.lead_id.unwrap().as_str(), "L1");
        assert_eq!(v.payload.text("email"), Some("a@b.com"));
        assert!(v.payload.attributes.is_empty());
    }

    #[test]
    fn test_normalizes_fields() {
        let v = validate_submission(&json!({
            "name": "  Maria Silva ",
            "email": "maria@example.com",
            "phone": "+55 (11) 99999-8888",
            "cpf": "529.982.247-25",
            "attributes": {"campaign": "spring", "score": 7, "optin": true}
        }))
        .unwrap();
        assert!(v.lead_id.is_none());
        assert_eq!(v.payload.text("name"), Some("Maria Silva"));
        assert_eq!(v.payload.text("phone"), Some("+5511999998888"));
        assert_eq!(v.payload.text("cpf"), Some("52998224725"));
        assert_eq!(v.payload.attributes["score"], "7");
        assert_eq!(v.payload.attributes["optin"], "true");
    }

    #[test]
    fn test_reports_every_violation() {
        let err = validate_submission(&json!({
            "leadId": "bad id",
            "name": "   ",
            "phone": "123",
            "cpf": "12345678900",
            "attributes": {"nested": {"a": 1}},
            "surprise": 1
        }))
        .unwrap_err();
        let fields: Vec<&str> = err.violations.iter().map(|v| v.field.as_str()).collect();
        for expected in ["surprise", "leadId", "email", "name", "phone", "cpf", "attributes.nested"] {
            assert!(fields.contains(&expected), "missing violation for {expected}: {fields:?}");
        }
    }

    #[test]
    fn test_both_lead_id_spellings() {
        let err = validate_submission(&json!({"leadId": "L1", "lead_id": "L2", "email": "a@b.com"}))
            .unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "lead_id");

        let v = validate_submission(&json!({"leadId": "L1", "lead_id": " L1 ", "email": "a@b.com"}))
            .unwrap();
        assert_eq!(v.lead_id.unwrap().as_str(), "L1");

        // A null spelling does not shadow the other one
        let v = validate_submission(&json!({"leadId": null, "lead_id": "L3", "email": "a@b.com"}))
            .unwrap();
        assert_eq!(v.lead_id.unwrap().as_str(), "L3");
    }

    #[test]
    fn test_non_object_body() {
        let err = validate_submission(&json!(["a@b.com"])).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "$");
    }

    #[test]
    fn test_wrong_types() {
        let err = validate_submission(&json!({"email": 42, "leadId": 7})).unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.violations.iter().all(|v| v.message == "must be a string"));
    }
}
