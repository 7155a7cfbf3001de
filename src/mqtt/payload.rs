use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use super::BrokerError;

/// JSON value with first class date and time variants.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<PayloadValue>),
    Object(BTreeMap<String, PayloadValue>),
    DateTime(DateTime<FixedOffset>),
    NaiveDateTime(NaiveDateTime),
    Date(NaiveDate),
}

/// What `decode` does with JSON strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Strings in ISO-8601 form become `DateTime`, `NaiveDateTime` or `Date`.
    Datetimes,
    /// Every string stays a string.
    None,
}

impl PayloadValue {
    pub fn object() -> Self {
        return PayloadValue::Object(BTreeMap::new());
    }

    /// Adds a field when `self` is an object, ignored otherwise.
    pub fn insert(&mut self, key: &str, value: impl Into<PayloadValue>) {
        if let PayloadValue::Object(map) = self {
            map.insert(key.to_string(), value.into());
        }
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        match self {
            PayloadValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            PayloadValue::Null => Value::Null,
            PayloadValue::Bool(b) => Value::Bool(*b),
            PayloadValue::Integer(i) => Value::Number(Number::from(*i)),
            PayloadValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            PayloadValue::String(s) => Value::String(s.clone()),
            PayloadValue::Array(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            PayloadValue::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                Value::Object(out)
            }
            PayloadValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
            PayloadValue::NaiveDateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            PayloadValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn from_json(value: Value, coercion: Coercion) -> Self {
        match value {
            Value::Null => PayloadValue::Null,
            Value::Bool(b) => PayloadValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return PayloadValue::Integer(i);
                }
                /* u64 beyond i64::MAX and real floats */
                PayloadValue::Float(n.as_f64().unwrap_or(f64::NAN))
            }
            Value::String(s) => match coercion {
                Coercion::Datetimes => coerce_datetime(s),
                Coercion::None => PayloadValue::String(s),
            },
            Value::Array(items) => {
                PayloadValue::Array(items.into_iter().map(|v| PayloadValue::from_json(v, coercion)).collect())
            }
            Value::Object(map) => PayloadValue::Object(
                map.into_iter().map(|(k, v)| (k, PayloadValue::from_json(v, coercion))).collect(),
            ),
        }
    }
}

fn coerce_datetime(s: String) -> PayloadValue {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return PayloadValue::DateTime(dt);
    }
    if let Ok(dt) = s.parse::<NaiveDateTime>() {
        return PayloadValue::NaiveDateTime(dt);
    }
    if let Ok(d) = s.parse::<NaiveDate>() {
        return PayloadValue::Date(d);
    }
    PayloadValue::String(s)
}

/// Serialises a value to UTF-8 JSON, temporal variants as ISO-8601 text.
pub fn encode(value: &PayloadValue) -> Vec<u8> {
    return value.to_json().to_string().into_bytes();
}

pub fn decode(bytes: &[u8], coercion: Coercion) -> Result<PayloadValue, BrokerError> {
    let value: Value = serde_json::from_slice(bytes)?;
    Ok(PayloadValue::from_json(value, coercion))
}

/// Body of a publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(PayloadValue),
    Raw(Vec<u8>),
}

impl Payload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Json(value) => encode(&value),
            Payload::Raw(bytes) => bytes,
        }
    }
}

impl From<PayloadValue> for Payload {
    fn from(value: PayloadValue) -> Self {
        Payload::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        PayloadValue::Bool(v)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        PayloadValue::Integer(v)
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        PayloadValue::Float(v)
    }
}

impl From<&str> for PayloadValue {
    fn from(v: &str) -> Self {
        PayloadValue::String(v.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(v: String) -> Self {
        PayloadValue::String(v)
    }
}

impl From<DateTime<FixedOffset>> for PayloadValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        PayloadValue::DateTime(v)
    }
}

impl From<DateTime<Utc>> for PayloadValue {
    fn from(v: DateTime<Utc>) -> Self {
        PayloadValue::DateTime(v.fixed_offset())
    }
}

impl From<NaiveDate> for PayloadValue {
    fn from(v: NaiveDate) -> Self {
        PayloadValue::Date(v)
    }
}

impl<T: Into<PayloadValue>> From<Option<T>> for PayloadValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => PayloadValue::Null,
        }
    }
}

impl<T: Into<PayloadValue>> From<Vec<T>> for PayloadValue {
    fn from(v: Vec<T>) -> Self {
        PayloadValue::Array(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> PayloadValue {
        let mut value = PayloadValue::object();
        value.insert("name", "meter");
        value.insert("count", 42i64);
        value.insert("energy", 1234.56);
        value.insert("online", true);
        value.insert("error", PayloadValue::Null);
        let ts = FixedOffset::east_opt(3600).unwrap().with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        value.insert("ts", ts);
        value
    }

    #[test]
    fn test_round_trip_with_coercion() {
        let value = sample();
        let decoded = decode(&encode(&value), Coercion::Datetimes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_datetime_is_iso_text_on_the_wire() {
        let text = String::from_utf8(encode(&sample())).unwrap();
        assert!(text.contains("\"ts\":\"2024-03-01T12:30:05+01:00\""));
    }

    #[test]
    fn test_no_coercion_keeps_strings() {
        let decoded = decode(br#"{"ts":"2024-03-01T12:30:05Z","d":"2024-03-01"}"#, Coercion::None).unwrap();
        assert_eq!(decoded.get("ts"), Some(&PayloadValue::from("2024-03-01T12:30:05Z")));
        assert_eq!(decoded.get("d"), Some(&PayloadValue::from("2024-03-01")));
    }

    #[test]
    fn test_naive_and_date_coercion() {
        let decoded = decode(br#"["2024-03-01T12:30:05", "2024-03-01", "hello", "12"]"#, Coercion::Datetimes).unwrap();
        let naive = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(12, 30, 5).unwrap();
        assert_eq!(
            decoded,
            PayloadValue::Array(vec![
                PayloadValue::NaiveDateTime(naive),
                PayloadValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
                PayloadValue::from("hello"),
                PayloadValue::from("12"),
            ])
        );
    }

    #[test]
    fn test_numbers() {
        let decoded = decode(b"[1, -2, 2.5, 18446744073709551615]", Coercion::Datetimes).unwrap();
        assert_eq!(
            decoded,
            PayloadValue::Array(vec![
                PayloadValue::Integer(1),
                PayloadValue::Integer(-2),
                PayloadValue::Float(2.5),
                PayloadValue::Float(18446744073709551615.0),
            ])
        );
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(decode(b"{not json", Coercion::Datetimes), Err(BrokerError::Payload(_))));
    }

    #[test]
    fn test_raw_payload_is_untouched() {
        let raw = Payload::Raw(vec![0xff, 0x00, 0x01]);
        assert_eq!(raw.into_bytes(), vec![0xff, 0x00, 0x01]);
        assert_eq!(Payload::from(PayloadValue::Integer(7)).into_bytes(), b"7".to_vec());
    }
}
