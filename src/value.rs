//! Property value coercion.
//!
//! Every semantic type has one canonical `serde_json::Value` form. Assignments
//! are coerced strictly, hydrated columns leniently (drivers report booleans as
//! integers, decimals as floats, JSON as text).

use crate::schema::{ColumnType, PropertyDef};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{json, Value};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Current time in canonical timestamp form
pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Coerce an assigned value into the property's canonical form
pub fn coerce(property: &PropertyDef, value: Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match &property.column_type {
        ColumnType::Integer | ColumnType::Reference(_) => to_integer(&value).map(Value::from),
        ColumnType::Float => {
            let number = to_float(&value)?;
            Ok(json!(round_decimals(number, property.decimals)))
        }
        ColumnType::Boolean => to_bool(&value).map(Value::Bool),
        ColumnType::Text => {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => return Err(format!("expected text, got {}", other)),
            };
            if let Some(length) = property.length {
                if text.chars().count() > length as usize {
                    return Err(format!("longer than {} characters", length));
                }
            }
            Ok(Value::String(text))
        }
        ColumnType::Timestamp => {
            let s = expect_str(&value, "timestamp")?;
            parse_timestamp(s)
                .map(|ts| Value::String(ts.format(TIMESTAMP_FORMAT).to_string()))
                .ok_or_else(|| format!("'{}' is not a timestamp", s))
        }
        ColumnType::Date => {
            let s = expect_str(&value, "date")?;
            parse_date(s)
                .map(|d| Value::String(d.format(DATE_FORMAT).to_string()))
                .ok_or_else(|| format!("'{}' is not a date", s))
        }
        ColumnType::Time => {
            let s = expect_str(&value, "time")?;
            parse_time(s)
                .map(|t| Value::String(t.format(TIME_FORMAT).to_string()))
                .ok_or_else(|| format!("'{}' is not a time", s))
        }
        ColumnType::Json => Ok(value),
    }
}

/// Normalize a value read from a column. Never fails; unparseable input is kept as read.
pub fn from_column(property: &PropertyDef, raw: Value) -> Value {
    if property.column_type == ColumnType::Json {
        return match raw {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        };
    }

    match coerce(property, raw.clone()) {
        Ok(value) => value,
        Err(reason) => {
            tracing::warn!(property = %property.name, %reason, "column value kept as read");
            raw
        }
    }
}

/// Value handed to the driver for a property's column
pub fn to_param(property: &PropertyDef, value: &Value) -> Value {
    match (&property.column_type, value) {
        (_, Value::Null) => Value::Null,
        (ColumnType::Json, v) => Value::String(v.to_string()),
        (_, v) => v.clone(),
    }
}

fn expect_str<'a>(value: &'a Value, kind: &str) -> Result<&'a str, String> {
    value
        .as_str()
        .map(str::trim)
        .ok_or_else(|| format!("expected {} string, got {}", kind, value))
}

fn to_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                    _ => Err(format!("{} is not an integer", n)),
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", s)),
        other => Err(format!("expected integer, got {}", other)),
    }
}

fn to_float(value: &Value) -> Result<f64, String> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(format!("{} is not a number", value)),
    }
}

fn to_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{} is not a boolean", n)),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" => Ok(true),
            "0" | "false" | "f" | "" => Ok(false),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        other => Err(format!("expected boolean, got {}", other)),
    }
}

fn round_decimals(value: f64, decimals: Option<u32>) -> f64 {
    match decimals {
        Some(d) => {
            let factor = 10f64.powi(d as i32);
            (value * factor).round() / factor
        }
        None => value,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts.with_nanosecond_truncated());
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc).naive_utc().with_nanosecond_truncated());
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(s, format).ok())
}

trait TruncateNanos {
    fn with_nanosecond_truncated(self) -> Self;
}

impl TruncateNanos for NaiveDateTime {
    fn with_nanosecond_truncated(self) -> Self {
        use chrono::Timelike;
        self.with_nanosecond(0).unwrap_or(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_rounding() {
        let net = PropertyDef::float("net").length(14).decimals(2);
        assert_eq!(coerce(&net, json!(99.95)).unwrap(), json!(99.95));
        assert_eq!(coerce(&net, json!(99.949)).unwrap(), json!(99.95));
        assert_eq!(coerce(&net, json!("12.5")).unwrap(), json!(12.5));
        assert!(coerce(&net, json!("twelve")).is_err());
    }

    #[test]
    fn test_integer_and_reference() {
        let count = PropertyDef::integer("count");
        assert_eq!(coerce(&count, json!(3)).unwrap(), json!(3));
        assert_eq!(coerce(&count, json!(3.0)).unwrap(), json!(3));
        assert_eq!(coerce(&count, json!(" 42 ")).unwrap(), json!(42));
        assert!(coerce(&count, json!(3.5)).is_err());
        assert!(coerce(&count, json!(true)).is_err());

        let customer = PropertyDef::reference("customer", "Customer");
        assert_eq!(coerce(&customer, Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_text_length() {
        let code = PropertyDef::text("code").length(3);
        assert_eq!(coerce(&code, json!("abc")).unwrap(), json!("abc"));
        assert!(coerce(&code, json!("abcd")).is_err());
        assert_eq!(coerce(&code, json!(12)).unwrap(), json!("12"));
    }

    #[test]
    fn test_dates_and_times() {
        let date = PropertyDef::date("date");
        assert_eq!(coerce(&date, json!("2024-03-01")).unwrap(), json!("2024-03-01"));
        assert_eq!(
            coerce(&date, json!("2024-03-01 10:20:30")).unwrap(),
            json!("2024-03-01")
        );
        assert!(coerce(&date, json!("03/01/2024")).is_err());

        let at = PropertyDef::timestamp("at");
        assert_eq!(
            coerce(&at, json!("2024-03-01T10:20:30.250")).unwrap(),
            json!("2024-03-01 10:20:30")
        );
        assert_eq!(
            coerce(&at, json!("2024-03-01T10:20:30+02:00")).unwrap(),
            json!("2024-03-01 08:20:30")
        );

        let time = PropertyDef::time("opens");
        assert_eq!(coerce(&time, json!("09:30")).unwrap(), json!("09:30:00"));
    }

    #[test]
    fn test_from_column_is_lenient() {
        let active = PropertyDef::boolean("active");
        assert_eq!(from_column(&active, json!(1)), json!(true));

        let meta = PropertyDef::json("meta");
        assert_eq!(from_column(&meta, json!("{\"a\":[1,2]}")), json!({"a": [1, 2]}));
        assert_eq!(from_column(&meta, json!("not json")), json!("not json"));

        let code = PropertyDef::text("code").length(2);
        assert_eq!(from_column(&code, json!("legacy")), json!("legacy"));
    }

    #[test]
    fn test_to_param() {
        let meta = PropertyDef::json("meta");
        assert_eq!(to_param(&meta, &json!({"a": 1})), json!("{\"a\":1}"));
        assert_eq!(to_param(&meta, &Value::Null), Value::Null);

        let net = PropertyDef::float("net");
        assert_eq!(to_param(&net, &json!(1.5)), json!(1.5));
    }
}
