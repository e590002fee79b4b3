//! Record and value types.
//!
//! A [`Record`] is an ordered list of named, typed fields, one vessel-tracking
//! message. Records travel through the pipeline as newline-delimited JSON; the
//! field order read from the input is the order written to every output.

use std::fmt;
use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(Record),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Truthiness: null, false, zero, and empty strings/lists/maps are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Timestamp(_) => true,
            Value::List(items) => !items.is_empty(),
            Value::Map(record) => !record.is_empty(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// RFC 3339 rendering used for timestamps on the wire and in keys of
/// non-formatted contexts.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Check that a strftime pattern only uses specifiers chrono understands.
pub fn is_valid_time_format(pattern: &str) -> bool {
    !StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error))
}

/// Format a timestamp with a strftime pattern; `None` if the pattern is invalid.
pub fn format_time(ts: &DateTime<Utc>, pattern: &str) -> Option<String> {
    let items: Vec<Item<'_>> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return None;
    }
    let mut out = String::new();
    write!(out, "{}", ts.format_with_items(items.iter())).ok()?;
    Some(out)
}

fn format_float(f: f64, out: &mut fmt::Formatter<'_>) -> fmt::Result {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        write!(out, "{f:.1}")
    } else {
        write!(out, "{f}")
    }
}

/// The natural string form of a value: strings are unquoted, whole floats
/// keep one decimal (`10.0`), containers render as JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => format_float(*x, f),
            Value::Str(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{}", format_timestamp(ts)),
            Value::List(_) | Value::Map(_) => match serde_json::to_string(self) {
                Ok(json) => write!(f, "{json}"),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

/// An ordered mapping from field name to value.
///
/// Field lookup is linear; messages carry a few dozen fields at most.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from `(name, value)` pairs, keeping their order.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.set(k, v);
        }
        record
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a field, replacing it in place if present, appending otherwise.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Convert string values of the named fields to timestamps where they
    /// parse as RFC 3339. Unparseable strings are left alone.
    pub fn promote_timestamps(&mut self, time_fields: &[String]) {
        for (name, value) in self.fields.iter_mut() {
            if !time_fields.iter().any(|f| f == name) {
                continue;
            }
            if let Value::Str(s) = value
                && let Ok(ts) = DateTime::parse_from_rfc3339(s)
            {
                *value = Value::Timestamp(ts.with_timezone(&Utc));
            }
        }
    }

    /// Decode one JSON-lines record.
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn to_json(&self) -> String {
        // Serializing a Record into a String cannot fail: keys are strings and
        // every Value variant has a JSON form.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
            Value::List(items) => items.serialize(serializer),
            Value::Map(record) => record.serialize(serializer),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> Result<Value, E> {
        Ok(Value::Int(i))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<Value, E> {
        Ok(i64::try_from(u).map_or(Value::Float(u as f64), Value::Int))
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> Result<Value, E> {
        Ok(Value::Float(f))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::Str(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::Str(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Value, A::Error> {
        RecordVisitor.visit_map(map).map(Value::Map)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = Record;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Record, A::Error> {
        let mut record = Record::new();
        while let Some((k, v)) = map.next_entry::<String, Value>()? {
            record.set(k, v);
        }
        Ok(record)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RecordVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_field_order_preserved() {
        let record = Record::from_json(r#"{"zeta": 1, "alpha": "a", "mid": 2.5}"#).unwrap();
        let names: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(record.to_json(), r#"{"zeta":1,"alpha":"a","mid":2.5}"#);
    }

    #[test]
    fn test_json_types() {
        let record =
            Record::from_json(r#"{"s":"x","i":-4,"f":1.5,"b":true,"n":null,"l":[1,"a"],"m":{"k":2}}"#)
                .unwrap();
        assert_eq!(record.get("s"), Some(&Value::Str("x".into())));
        assert_eq!(record.get("i"), Some(&Value::Int(-4)));
        assert_eq!(record.get("f"), Some(&Value::Float(1.5)));
        assert_eq!(record.get("b"), Some(&Value::Bool(true)));
        assert_eq!(record.get("n"), Some(&Value::Null));
        assert_eq!(
            record.get("l"),
            Some(&Value::List(vec![Value::Int(1), Value::Str("a".into())]))
        );
        assert_eq!(
            record.get("m"),
            Some(&Value::Map(Record::from_pairs([("k", 2i64)])))
        );
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(Record::from_json("[1, 2]").is_err());
        assert!(Record::from_json("42").is_err());
        assert!(Record::from_json("{broken").is_err());
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut record = Record::from_pairs([("a", 1i64), ("b", 2i64)]);
        record.set("a", 10i64);
        record.set("c", 3i64);
        assert_eq!(record.to_json(), r#"{"a":10,"b":2,"c":3}"#);
    }

    #[test]
    fn test_promote_timestamps() {
        let mut record = Record::from_json(
            r#"{"timestamp":"2014-03-05T10:20:30Z","eta":"2014-03-05T10:20:30Z","bad":"x"}"#,
        )
        .unwrap();
        record.promote_timestamps(&["timestamp".to_string(), "bad".to_string()]);
        let expected = Utc.with_ymd_and_hms(2014, 3, 5, 10, 20, 30).unwrap();
        assert_eq!(record.get("timestamp"), Some(&Value::Timestamp(expected)));
        assert!(matches!(record.get("eta"), Some(Value::Str(_))));
        assert_eq!(record.get("bad"), Some(&Value::Str("x".into())));
        assert_eq!(
            record.to_json(),
            r#"{"timestamp":"2014-03-05T10:20:30Z","eta":"2014-03-05T10:20:30Z","bad":"x"}"#
        );
    }

    #[test]
    fn test_format_time() {
        let ts = Utc.with_ymd_and_hms(2014, 3, 5, 10, 20, 30).unwrap();
        assert_eq!(format_time(&ts, "%Y-%m-%d").as_deref(), Some("2014-03-05"));
        assert_eq!(format_time(&ts, "%Y%m%d%H").as_deref(), Some("2014030510"));
        assert_eq!(format_time(&ts, "%Q"), None);
        assert!(is_valid_time_format("%Y-%m"));
        assert!(!is_valid_time_format("%Y-%"));
    }

    #[test]
    fn test_display_natural_form() {
        assert_eq!(Value::Str("123".into()).to_string(), "123");
        assert_eq!(Value::Int(7).to_string(), "7");
        assert_eq!(Value::Float(10.0).to_string(), "10.0");
        assert_eq!(Value::Float(1.25).to_string(), "1.25");
        assert_eq!(Value::Bool(false).to_string(), "false");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Float(0.1).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }
}
