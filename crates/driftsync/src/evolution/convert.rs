//! Type conversion engine.
//!
//! A fixed rule table keyed by (source type, target type). Rules are policy,
//! not learned: numeric widening and anything-to-string are safe, numeric
//! narrowing is risky and validated against bounds, string-to-numeric and
//! string-to-boolean are dangerous and carry a fallback value used when an
//! individual value fails to convert.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::types::SafetyLevel;
use crate::core::ColumnType;
use crate::error::{Result, SyncError};

type ConvertFn = fn(&Value) -> Result<Value>;
type ValidateFn = fn(&Value) -> bool;

/// Rule for converting between two column types.
#[derive(Clone)]
pub struct ConversionRule {
    pub source_type: ColumnType,
    pub target_type: ColumnType,
    pub safety: SafetyLevel,
    pub requires_approval: bool,
    convert: ConvertFn,
    validate: Option<ValidateFn>,
    pub fallback_value: Option<Value>,
}

impl ConversionRule {
    /// Check if a value would survive conversion under this rule.
    pub fn can_convert(&self, value: &Value) -> bool {
        match self.validate {
            Some(validate) => validate(value),
            None => true,
        }
    }

    /// Convert a value, substituting the fallback when validation fails.
    pub fn convert(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        if !self.can_convert(value) {
            if let Some(fallback) = &self.fallback_value {
                return Ok(fallback.clone());
            }
            return Err(SyncError::transformation(
                "",
                format!(
                    "cannot convert {} from {} to {}",
                    value,
                    self.source_type.as_str(),
                    self.target_type.as_str()
                ),
            ));
        }
        (self.convert)(value)
    }
}

/// Engine holding the conversion rule table.
pub struct TypeConversionEngine {
    rules: HashMap<(ColumnType, ColumnType), ConversionRule>,
}

impl Default for TypeConversionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeConversionEngine {
    pub fn new() -> Self {
        let mut engine = Self {
            rules: HashMap::new(),
        };
        engine.install_default_rules();
        engine
    }

    fn add_rule(&mut self, rule: ConversionRule) {
        debug!(
            source = rule.source_type.as_str(),
            target = rule.target_type.as_str(),
            safety = rule.safety.as_str(),
            "Registered conversion rule"
        );
        self.rules.insert((rule.source_type, rule.target_type), rule);
    }

    fn install_default_rules(&mut self) {
        use ColumnType::*;

        // Safe widening conversions
        self.add_rule(ConversionRule {
            source_type: Integer,
            target_type: Bigint,
            safety: SafetyLevel::Safe,
            requires_approval: false,
            convert: to_integer,
            validate: None,
            fallback_value: None,
        });
        self.add_rule(ConversionRule {
            source_type: Float,
            target_type: Double,
            safety: SafetyLevel::Safe,
            requires_approval: false,
            convert: to_float,
            validate: None,
            fallback_value: None,
        });
        for target in [Float, Double] {
            self.add_rule(ConversionRule {
                source_type: Integer,
                target_type: target,
                safety: SafetyLevel::Safe,
                requires_approval: false,
                convert: to_float,
                validate: None,
                fallback_value: None,
            });
        }

        // Anything to string is safe
        for source in [Integer, Bigint, Float, Double, Boolean, Timestamp, Date, Json, Binary] {
            self.add_rule(ConversionRule {
                source_type: source,
                target_type: String,
                safety: SafetyLevel::Safe,
                requires_approval: false,
                convert: to_string,
                validate: None,
                fallback_value: None,
            });
        }

        // Risky narrowing conversions
        self.add_rule(ConversionRule {
            source_type: Bigint,
            target_type: Integer,
            safety: SafetyLevel::Risky,
            requires_approval: true,
            convert: to_integer,
            validate: Some(fits_i32),
            fallback_value: None,
        });
        self.add_rule(ConversionRule {
            source_type: Double,
            target_type: Float,
            safety: SafetyLevel::Risky,
            requires_approval: true,
            convert: to_float,
            validate: Some(fits_f32),
            fallback_value: None,
        });
        self.add_rule(ConversionRule {
            source_type: Integer,
            target_type: Boolean,
            safety: SafetyLevel::Risky,
            requires_approval: true,
            convert: number_to_bool,
            validate: None,
            fallback_value: None,
        });

        // Dangerous string parsing, with fallbacks
        self.add_rule(ConversionRule {
            source_type: String,
            target_type: Integer,
            safety: SafetyLevel::Dangerous,
            requires_approval: true,
            convert: string_to_integer,
            validate: Some(is_parseable_integer),
            fallback_value: Some(json!(0)),
        });
        self.add_rule(ConversionRule {
            source_type: String,
            target_type: Float,
            safety: SafetyLevel::Dangerous,
            requires_approval: true,
            convert: string_to_float,
            validate: Some(is_parseable_float),
            fallback_value: Some(json!(0.0)),
        });
        self.add_rule(ConversionRule {
            source_type: String,
            target_type: Boolean,
            safety: SafetyLevel::Dangerous,
            requires_approval: true,
            convert: string_to_bool,
            validate: Some(is_parseable_bool),
            fallback_value: Some(json!(false)),
        });
    }

    /// Rule lookup; same-type pairs have an implicit identity rule.
    pub fn rule(&self, source: ColumnType, target: ColumnType) -> Option<&ConversionRule> {
        self.rules.get(&(source, target))
    }

    /// Whether a conversion between two types is possible at all.
    pub fn can_convert(&self, source: ColumnType, target: ColumnType) -> bool {
        source == target || self.rules.contains_key(&(source, target))
    }

    /// Safety classification for a conversion; unknown pairs are
    /// incompatible.
    pub fn conversion_safety(&self, source: ColumnType, target: ColumnType) -> SafetyLevel {
        if source == target {
            return SafetyLevel::Safe;
        }
        self.rule(source, target)
            .map(|r| r.safety)
            .unwrap_or(SafetyLevel::Incompatible)
    }

    /// Whether a conversion requires manual approval.
    pub fn requires_approval(&self, source: ColumnType, target: ColumnType) -> bool {
        if source == target {
            return false;
        }
        self.rule(source, target)
            .map(|r| r.requires_approval)
            .unwrap_or(true)
    }

    /// Convert one value.
    pub fn convert_value(
        &self,
        value: &Value,
        source: ColumnType,
        target: ColumnType,
    ) -> Result<Value> {
        if value.is_null() || source == target {
            return Ok(value.clone());
        }
        let rule = self.rule(source, target).ok_or_else(|| {
            SyncError::transformation(
                "",
                format!(
                    "no conversion rule from {} to {}",
                    source.as_str(),
                    target.as_str()
                ),
            )
        })?;
        rule.convert(value)
    }

    /// Convert a batch of values; per-value failures substitute the rule's
    /// fallback and are logged, never fatal for the batch.
    pub fn batch_convert(
        &self,
        values: &[Value],
        source: ColumnType,
        target: ColumnType,
    ) -> Result<Vec<Value>> {
        if source == target {
            return Ok(values.to_vec());
        }
        let rule = self.rule(source, target).ok_or_else(|| {
            SyncError::transformation(
                "",
                format!(
                    "no conversion rule from {} to {}",
                    source.as_str(),
                    target.as_str()
                ),
            )
        })?;

        let mut errors = 0usize;
        let converted = values
            .iter()
            .map(|v| match rule.convert(v) {
                Ok(converted) => converted,
                Err(_) => {
                    errors += 1;
                    rule.fallback_value.clone().unwrap_or(Value::Null)
                }
            })
            .collect();

        if errors > 0 {
            warn!(
                total = values.len(),
                errors,
                source = source.as_str(),
                target = target.as_str(),
                "Batch conversion completed with fallback substitutions"
            );
        }
        Ok(converted)
    }

    /// Percentage of sampled values that would fail the rule's validator.
    /// Used by the migrator to decide whether a risky or dangerous change
    /// may proceed automatically.
    pub fn estimate_data_loss(
        &self,
        values: &[Value],
        source: ColumnType,
        target: ColumnType,
    ) -> f64 {
        if values.is_empty() || source == target {
            return 0.0;
        }
        let Some(rule) = self.rule(source, target) else {
            return 100.0;
        };
        if rule.safety == SafetyLevel::Safe {
            return 0.0;
        }

        let lossy = values
            .iter()
            .filter(|v| !v.is_null() && !rule.can_convert(v))
            .count();
        (lossy as f64 / values.len() as f64) * 100.0
    }
}

// Conversion helpers

fn to_integer(value: &Value) -> Result<Value> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(json!(i))
            } else if let Some(f) = n.as_f64() {
                Ok(json!(f.trunc() as i64))
            } else {
                Err(conversion_error(value, "integer"))
            }
        }
        _ => Err(conversion_error(value, "integer")),
    }
}

fn to_float(value: &Value) -> Result<Value> {
    match value.as_f64() {
        Some(f) => Ok(json!(f)),
        None => Err(conversion_error(value, "float")),
    }
}

fn to_string(value: &Value) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    })
}

fn number_to_bool(value: &Value) -> Result<Value> {
    match value.as_i64() {
        Some(i) => Ok(json!(i != 0)),
        None => Err(conversion_error(value, "boolean")),
    }
}

fn string_to_integer(value: &Value) -> Result<Value> {
    let s = value.as_str().ok_or_else(|| conversion_error(value, "integer"))?;
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Ok(json!(i));
    }
    // Accept "123.0"-style strings the way lenient sources emit them
    trimmed
        .parse::<f64>()
        .map(|f| json!(f.trunc() as i64))
        .map_err(|_| conversion_error(value, "integer"))
}

fn string_to_float(value: &Value) -> Result<Value> {
    let s = value.as_str().ok_or_else(|| conversion_error(value, "float"))?;
    s.trim()
        .parse::<f64>()
        .map(|f| json!(f))
        .map_err(|_| conversion_error(value, "float"))
}

fn string_to_bool(value: &Value) -> Result<Value> {
    let s = value.as_str().ok_or_else(|| conversion_error(value, "boolean"))?;
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "t" | "y" => Ok(json!(true)),
        "false" | "0" | "no" | "off" | "f" | "n" => Ok(json!(false)),
        _ => Err(conversion_error(value, "boolean")),
    }
}

fn conversion_error(value: &Value, target: &str) -> SyncError {
    SyncError::transformation("", format!("cannot convert {} to {}", value, target))
}

// Validators

fn fits_i32(value: &Value) -> bool {
    match value.as_i64() {
        Some(i) => i32::try_from(i).is_ok(),
        None => value.is_null(),
    }
}

fn fits_f32(value: &Value) -> bool {
    match value.as_f64() {
        Some(f) => f.is_finite() && (f == 0.0 || f.abs() <= f32::MAX as f64),
        None => value.is_null(),
    }
}

fn is_parseable_integer(value: &Value) -> bool {
    string_to_integer(value).is_ok()
}

fn is_parseable_float(value: &Value) -> bool {
    string_to_float(value).is_ok()
}

fn is_parseable_bool(value: &Value) -> bool {
    string_to_bool(value).is_ok()
}

/// Floating-point comparison helper for `Number` values in tests.
#[cfg(test)]
fn as_f64(n: &serde_json::Number) -> f64 {
    n.as_f64().unwrap()
}
