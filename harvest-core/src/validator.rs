//! Component #7: Validator.
//!
//! Schema-checks a record's body against declared fields, and separately
//! reconciles a record against peer records from other sources for the
//! same key fields. Never panics on malformed input; every outcome is a
//! `Verdict` carrying human-readable reasons.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Suspicious,
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
}

impl CheckResult {
    fn valid() -> Self {
        Self {
            verdict: Verdict::Valid,
            reasons: Vec::new(),
        }
    }

    fn invalid(reasons: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Invalid,
            reasons,
        }
    }

    fn suspicious(reasons: Vec<String>) -> Self {
        Self {
            verdict: Verdict::Suspicious,
            reasons,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
    DateTime,
    Url,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    pub field_type: FieldType,
    #[serde(default)]
    pub min_len: Option<usize>,
    #[serde(default)]
    pub max_len: Option<usize>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            required: false,
            field_type,
            min_len: None,
            max_len: None,
            min_value: None,
            max_value: None,
            pattern: None,
            allowed_values: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<FieldSpec>,
    /// Unknown fields outside `fields` cause a reject rather than being
    /// preserved unvalidated.
    #[serde(default)]
    pub strict: bool,
}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        FieldType::Bool => value.is_boolean(),
        FieldType::DateTime => value
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false),
        FieldType::Url => value
            .as_str()
            .map(|s| url::Url::parse(s).is_ok())
            .unwrap_or(false),
        FieldType::Email => value
            .as_str()
            .map(|s| s.contains('@') && !s.starts_with('@') && !s.ends_with('@'))
            .unwrap_or(false),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

pub struct Validator {
    numeric_tolerance: f64,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            numeric_tolerance: 0.1,
        }
    }
}

impl Validator {
    pub fn new(numeric_tolerance: f64) -> Self {
        Self { numeric_tolerance }
    }

    /// Per-field schema check.
    pub fn check(&self, schema: &Schema, record: &Value) -> CheckResult {
        let Some(obj) = record.as_object() else {
            return CheckResult::invalid(vec!["record is not a JSON object".to_owned()]);
        };

        let mut reasons = Vec::new();

        for field in &schema.fields {
            let Some(value) = obj.get(&field.name) else {
                if field.required {
                    reasons.push(format!("missing required field {}", field.name));
                }
                continue;
            };

            if !type_matches(field.field_type, value) {
                reasons.push(format!(
                    "field {} does not match type {:?}",
                    field.name, field.field_type
                ));
                continue;
            }

            if let Some(s) = value.as_str() {
                if let Some(min) = field.min_len {
                    if s.len() < min {
                        reasons.push(format!("field {} shorter than {min}", field.name));
                    }
                }
                if let Some(max) = field.max_len {
                    if s.len() > max {
                        reasons.push(format!("field {} longer than {max}", field.name));
                    }
                }
                if let Some(pattern) = &field.pattern {
                    match Regex::new(pattern) {
                        Ok(re) if !re.is_match(s) => {
                            reasons.push(format!("field {} does not match pattern", field.name));
                        }
                        Err(e) => reasons.push(format!("invalid pattern for {}: {e}", field.name)),
                        _ => {}
                    }
                }
                if let Some(allowed) = &field.allowed_values {
                    if !allowed.iter().any(|a| a == s) {
                        reasons.push(format!("field {} not in allowed values", field.name));
                    }
                }
            }

            if let Some(n) = as_number(value) {
                if let Some(min) = field.min_value {
                    if n < min {
                        reasons.push(format!("field {} below minimum {min}", field.name));
                    }
                }
                if let Some(max) = field.max_value {
                    if n > max {
                        reasons.push(format!("field {} above maximum {max}", field.name));
                    }
                }
            }
        }

        if schema.strict {
            let declared: std::collections::HashSet<&str> =
                schema.fields.iter().map(|f| f.name.as_str()).collect();
            for key in obj.keys() {
                if !declared.contains(key.as_str()) {
                    reasons.push(format!("unknown field {key} in strict mode"));
                }
            }
        }

        if reasons.is_empty() {
            CheckResult::valid()
        } else {
            CheckResult::invalid(reasons)
        }
    }

    /// Cross-source reconciliation: for each key
    /// field, count how many peers agree, and derive a verdict from the
    /// overall agreement ratio.
    pub fn cross_check(
        &self,
        record: &Value,
        others: &[Value],
        key_fields: &[&str],
    ) -> CheckResult {
        if others.is_empty() {
            return CheckResult {
                verdict: Verdict::Suspicious,
                reasons: vec!["no peer records available to reconcile against".to_owned()],
            };
        }

        let Some(record_obj) = record.as_object() else {
            return CheckResult::invalid(vec!["record is not a JSON object".to_owned()]);
        };

        let mut agree = 0usize;
        let mut total = 0usize;
        let mut reasons = Vec::new();

        for field in key_fields {
            let Some(mine) = record_obj.get(*field) else {
                continue;
            };
            for other in others {
                let Some(theirs) = other.as_object().and_then(|o| o.get(*field)) else {
                    continue;
                };
                total += 1;
                if Self::fields_agree(mine, theirs, self.numeric_tolerance) {
                    agree += 1;
                } else {
                    reasons.push(format!("field {field} disagrees with a peer"));
                }
            }
        }

        if total == 0 {
            return CheckResult {
                verdict: Verdict::Suspicious,
                reasons: vec!["no comparable key fields across peers".to_owned()],
            };
        }

        let ratio = agree as f64 / total as f64;
        let verdict = if ratio >= 0.8 {
            Verdict::Valid
        } else if ratio >= 0.5 {
            Verdict::Suspicious
        } else {
            Verdict::Invalid
        };

        if verdict == Verdict::Valid {
            reasons.clear();
        }
        CheckResult { verdict, reasons }
    }

    fn fields_agree(a: &Value, b: &Value, tolerance: f64) -> bool {
        if let (Some(na), Some(nb)) = (as_number(a), as_number(b)) {
            if na == 0.0 && nb == 0.0 {
                return true;
            }
            let denom = na.abs().max(nb.abs()).max(f64::EPSILON);
            return (na - nb).abs() / denom <= tolerance;
        }
        if let (Some(sa), Some(sb)) = (a.as_str(), b.as_str()) {
            return sa.trim().eq_ignore_ascii_case(sb.trim());
        }
        a == b
    }
}
