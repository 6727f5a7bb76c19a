//! Declarative field validation.
//!
//! A [`ValidationSchema`] is an ordered list of `(field, rule)` pairs checked
//! against a JSON object. Every failing rule contributes exactly one
//! [`FieldError`] with a stable machine-readable code; a result is valid iff
//! no error was produced.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{PasswordConfig, UploadConfig};

lazy_static! {
    static ref EMAIL: Regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$"
    )
    .expect("valid email regex");
}

/// Stable error codes carried by [`FieldError::code`].
pub mod codes {
    pub const REQUIRED: &str = "REQUIRED";
    pub const INVALID_TYPE: &str = "INVALID_TYPE";
    pub const INVALID_EMAIL: &str = "INVALID_EMAIL";
    pub const INVALID_URL: &str = "INVALID_URL";
    pub const INVALID_UUID: &str = "INVALID_UUID";
    pub const INVALID_IP: &str = "INVALID_IP";
    pub const MIN_LENGTH: &str = "MIN_LENGTH";
    pub const MAX_LENGTH: &str = "MAX_LENGTH";
    pub const MIN_VALUE: &str = "MIN_VALUE";
    pub const MAX_VALUE: &str = "MAX_VALUE";
    pub const PATTERN_MISMATCH: &str = "PATTERN_MISMATCH";
    pub const CUSTOM_VALIDATION: &str = "CUSTOM_VALIDATION";
    pub const FILE_TOO_LARGE: &str = "FILE_TOO_LARGE";
    pub const INVALID_FILE_TYPE: &str = "INVALID_FILE_TYPE";
    pub const INVALID_FILENAME: &str = "INVALID_FILENAME";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    String,
    Number,
    Integer,
    Boolean,
    Email,
    Url,
    Uuid,
    Ipv4,
    Ipv6,
    Array,
    Object,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::String => "string",
            RuleType::Number => "number",
            RuleType::Integer => "integer",
            RuleType::Boolean => "boolean",
            RuleType::Email => "email",
            RuleType::Url => "url",
            RuleType::Uuid => "uuid",
            RuleType::Ipv4 => "ipv4",
            RuleType::Ipv6 => "ipv6",
            RuleType::Array => "array",
            RuleType::Object => "object",
        };
        f.write_str(s)
    }
}

pub type CustomCheck = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// One rule applied to one field.
#[derive(Clone)]
pub struct ValidationRule {
    pub rule_type: RuleType,
    pub required: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<Regex>,
    pub custom: Option<CustomCheck>,
    /// Replaces the generated message for every error this rule produces.
    pub message: Option<String>,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("rule_type", &self.rule_type)
            .field("required", &self.required)
            .field("min_length", &self.min_length)
            .field("max_length", &self.max_length)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("pattern", &self.pattern.as_ref().map(|p| p.as_str()))
            .field("custom", &self.custom.is_some())
            .field("message", &self.message)
            .finish()
    }
}

impl ValidationRule {
    pub fn new(rule_type: RuleType) -> Self {
        Self {
            rule_type,
            required: false,
            min_length: None,
            max_length: None,
            min: None,
            max: None,
            pattern: None,
            custom: None,
            message: None,
        }
    }

    pub fn string() -> Self {
        Self::new(RuleType::String)
    }

    pub fn number() -> Self {
        Self::new(RuleType::Number)
    }

    pub fn integer() -> Self {
        Self::new(RuleType::Integer)
    }

    pub fn boolean() -> Self {
        Self::new(RuleType::Boolean)
    }

    pub fn email() -> Self {
        Self::new(RuleType::Email)
    }

    pub fn url() -> Self {
        Self::new(RuleType::Url)
    }

    pub fn uuid() -> Self {
        Self::new(RuleType::Uuid)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min_length(mut self, n: usize) -> Self {
        self.min_length = Some(n);
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn min(mut self, v: f64) -> Self {
        self.min = Some(v);
        self
    }

    pub fn max(mut self, v: f64) -> Self {
        self.max = Some(v);
        self
    }

    pub fn pattern(mut self, re: Regex) -> Self {
        self.pattern = Some(re);
        self
    }

    pub fn custom<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(check));
        self
    }

    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }
}

/// Ordered set of field rules. Errors are reported in schema order.
#[derive(Debug, Clone, Default)]
pub struct ValidationSchema {
    fields: Vec<(String, ValidationRule)>,
}

impl ValidationSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: ValidationRule) -> Self {
        self.fields.push((name.into(), rule));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: &'static str,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<FieldError>) -> Self {
        Self { valid: errors.is_empty(), errors }
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.errors.iter().map(|e| e.code).collect()
    }
}

/// Stateless rule engine.
#[derive(Debug, Clone, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validates `data` (expected to be a JSON object) against `schema`.
    ///
    /// A non-object `data` is treated as having no fields, so only `required` rules fire.
    pub fn validate(&self, data: &Value, schema: &ValidationSchema) -> ValidationResult {
        let mut errors = Vec::new();
        for (field, rule) in &schema.fields {
            let value = data.get(field).unwrap_or(&Value::Null);
            check_field(field, value, rule, &mut errors);
        }
        ValidationResult::from_errors(errors)
    }

    /// Checks a single value against a single rule.
    pub fn validate_field(&self, field: &str, value: &Value, rule: &ValidationRule) -> ValidationResult {
        let mut errors = Vec::new();
        check_field(field, value, rule, &mut errors);
        ValidationResult::from_errors(errors)
    }
}

fn check_field(field: &str, value: &Value, rule: &ValidationRule, errors: &mut Vec<FieldError>) {
    let mut push = |code: &'static str, default_msg: String| {
        errors.push(FieldError {
            field: field.to_string(),
            message: rule.message.clone().unwrap_or(default_msg),
            code,
            value: value.clone(),
        });
    };

    let empty_string = matches!(value, Value::String(s) if s.is_empty());
    if value.is_null() || (empty_string && rule.required) {
        if rule.required {
            push(codes::REQUIRED, format!("{} is required", field));
        }
        return;
    }

    // A wrong type makes every later check meaningless
    if let Some((code, msg)) = type_error(field, value, rule.rule_type) {
        push(code, msg);
        return;
    }

    let length = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    };
    if let Some(len) = length {
        if let Some(min) = rule.min_length {
            if len < min {
                push(codes::MIN_LENGTH, format!("{} must be at least {} characters", field, min));
            }
        }
        if let Some(max) = rule.max_length {
            if len > max {
                push(codes::MAX_LENGTH, format!("{} must be at most {} characters", field, max));
            }
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = rule.min {
            if n < min {
                push(codes::MIN_VALUE, format!("{} must be at least {}", field, min));
            }
        }
        if let Some(max) = rule.max {
            if n > max {
                push(codes::MAX_VALUE, format!("{} must be at most {}", field, max));
            }
        }
    }

    if let (Some(re), Value::String(s)) = (&rule.pattern, value) {
        if !re.is_match(s) {
            push(codes::PATTERN_MISMATCH, format!("{} has an invalid format", field));
        }
    }

    if let Some(check) = &rule.custom {
        if !check(value) {
            push(codes::CUSTOM_VALIDATION, format!("{} failed custom validation", field));
        }
    }
}

fn type_error(field: &str, value: &Value, rule_type: RuleType) -> Option<(&'static str, String)> {
    let as_str = value.as_str();
    let format_check = |ok: bool, code: &'static str, what: &str| {
        if ok {
            None
        } else {
            Some((code, format!("{} must be a valid {}", field, what)))
        }
    };

    match rule_type {
        RuleType::String if as_str.is_some() => None,
        RuleType::Number if value.is_number() => None,
        RuleType::Integer if value.is_i64() || value.is_u64() => None,
        RuleType::Boolean if value.is_boolean() => None,
        RuleType::Array if value.is_array() => None,
        RuleType::Object if value.is_object() => None,
        RuleType::Email => format_check(as_str.is_some_and(is_valid_email), codes::INVALID_EMAIL, "email address"),
        RuleType::Url => format_check(as_str.is_some_and(is_valid_url), codes::INVALID_URL, "URL"),
        RuleType::Uuid => format_check(as_str.is_some_and(is_valid_uuid), codes::INVALID_UUID, "UUID"),
        RuleType::Ipv4 => format_check(as_str.is_some_and(is_valid_ipv4), codes::INVALID_IP, "IPv4 address"),
        RuleType::Ipv6 => format_check(as_str.is_some_and(is_valid_ipv6), codes::INVALID_IP, "IPv6 address"),
        other => Some((codes::INVALID_TYPE, format!("{} must be of type {}", field, other))),
    }
}

pub fn is_valid_email(s: &str) -> bool {
    s.len() <= 254 && EMAIL.is_match(s)
}

/// Absolute http(s) URL with a host.
pub fn is_valid_url(s: &str) -> bool {
    match url::Url::parse(s) {
        Ok(u) => matches!(u.scheme(), "http" | "https") && u.host_str().is_some(),
        Err(_) => false,
    }
}

pub fn is_valid_uuid(s: &str) -> bool {
    Uuid::parse_str(s).is_ok()
}

/// Dotted-quad IPv4, each octet 0-255.
pub fn is_valid_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

pub fn is_valid_ipv6(s: &str) -> bool {
    s.parse::<Ipv6Addr>().is_ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordCheck {
    pub valid: bool,
    pub errors: Vec<String>,
    /// 0 (weak) ..= 4 (strong)
    pub strength: u8,
}

/// Checks a password against the configured policy.
pub fn validate_password(password: &str, policy: &PasswordConfig) -> PasswordCheck {
    let mut errors = Vec::new();
    let len = password.chars().count();
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    if len < policy.min_length {
        errors.push(format!("Password must be at least {} characters", policy.min_length));
    }
    if policy.require_uppercase && !has_upper {
        errors.push("Password must contain an uppercase letter".to_string());
    }
    if policy.require_lowercase && !has_lower {
        errors.push("Password must contain a lowercase letter".to_string());
    }
    if policy.require_digit && !has_digit {
        errors.push("Password must contain a digit".to_string());
    }
    if policy.require_special && !has_special {
        errors.push("Password must contain a special character".to_string());
    }

    let classes = [has_upper, has_lower, has_digit, has_special].iter().filter(|b| **b).count() as u8;
    let mut strength = classes.saturating_sub(1);
    if len >= policy.min_length.max(12) + 4 {
        strength += 1;
    }
    if len < policy.min_length {
        strength = strength.min(1);
    }

    PasswordCheck { valid: errors.is_empty(), errors, strength: strength.min(4) }
}

/// Checks an upload's name, size and declared MIME type against the upload policy.
pub fn validate_upload(filename: &str, size: u64, mime_type: &str, policy: &UploadConfig) -> ValidationResult {
    let mut errors = Vec::new();

    let bad_name = filename.trim().is_empty()
        || filename.contains("..")
        || filename.contains(['/', '\\', '\0'])
        || filename.chars().count() > 255;
    if bad_name {
        errors.push(FieldError {
            field: "filename".to_string(),
            message: "Filename is empty or contains path components".to_string(),
            code: codes::INVALID_FILENAME,
            value: Value::String(filename.to_string()),
        });
    }

    if size > policy.max_size_bytes {
        errors.push(FieldError {
            field: "size".to_string(),
            message: format!("File exceeds maximum size of {} bytes", policy.max_size_bytes),
            code: codes::FILE_TOO_LARGE,
            value: Value::from(size),
        });
    }

    let mime = mime_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if !policy.allowed_mime_types.iter().any(|m| m.eq_ignore_ascii_case(&mime)) {
        errors.push(FieldError {
            field: "mime_type".to_string(),
            message: format!("File type '{}' is not allowed", mime),
            code: codes::INVALID_FILE_TYPE,
            value: Value::String(mime_type.to_string()),
        });
    }

    ValidationResult::from_errors(errors)
}
