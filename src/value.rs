use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde_json::Value as JsonValue;

/// Comparable view of a JSON value with type-aware ordering.
///
/// Ascending type order: null < numbers < strings < documents < arrays
/// < booleans < dates. Integers and floats compare numerically, and date-like
/// strings are held as millisecond timestamps so they compare chronologically.
#[derive(Debug, Clone)]
pub enum OrdValue {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Document(Vec<(String, OrdValue)>),
    Array(Vec<OrdValue>),
    Boolean(bool),
    DateTime(i64), // millis since epoch
}

impl OrdValue {
    fn type_rank(&self) -> u8 {
        match self {
            OrdValue::Null => 0,
            OrdValue::Integer(_) | OrdValue::Float(_) => 1,
            OrdValue::String(_) => 2,
            OrdValue::Document(_) => 3,
            OrdValue::Array(_) => 4,
            OrdValue::Boolean(_) => 5,
            OrdValue::DateTime(_) => 6,
        }
    }

    /// Convert a JSON value into its comparable form.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => OrdValue::Null,
            JsonValue::Bool(b) => OrdValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    OrdValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    OrdValue::Float(f)
                } else {
                    OrdValue::Null
                }
            }
            JsonValue::String(s) => Self::parse_string(s),
            JsonValue::Array(items) => OrdValue::Array(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => OrdValue::Document(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn parse_string(s: &str) -> Self {
        // Only strings shaped like YYYY-MM-DD... are candidates for date parsing.
        let b = s.as_bytes();
        if b.len() < 10
            || !b[..4].iter().all(u8::is_ascii_digit)
            || b[4] != b'-'
            || !b[5].is_ascii_digit()
            || !b[6].is_ascii_digit()
        {
            return OrdValue::String(s.to_string());
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return OrdValue::DateTime(dt.timestamp_millis());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return OrdValue::DateTime(dt.and_utc().timestamp_millis());
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
            return OrdValue::DateTime(dt.and_utc().timestamp_millis());
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return OrdValue::DateTime(dt.and_utc().timestamp_millis());
            }
        }
        OrdValue::String(s.to_string())
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // -0.0 == 0.0; NaN falls back to the total order so sorting stays consistent.
    a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
}

/// 2^63, the first float above every i64.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Exact integer/float comparison; `i as f64` would round past 2^53.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return cmp_f64(i as f64, f);
    }
    if f >= I64_BOUND {
        return Ordering::Less;
    }
    if f < -I64_BOUND {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    i.cmp(&(whole as i64))
        .then_with(|| cmp_f64(0.0, f - whole))
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use OrdValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Integer(b)) => cmp_int_float(*b, *a).reverse(),
            (Float(a), Float(b)) => cmp_f64(*a, *b),
            (String(a), String(b)) => a.cmp(b),
            (Document(a), Document(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Array(a), Array(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrdValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrdValue {}

impl Hash for OrdValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            OrdValue::Null => {}
            OrdValue::Integer(i) => i.hash(state),
            // Whole floats hash like the equal integer so `1` and `1.0` share a bucket.
            OrdValue::Float(f) => {
                if f.fract() == 0.0 && *f >= -I64_BOUND && *f < I64_BOUND {
                    (*f as i64).hash(state)
                } else {
                    f.to_bits().hash(state)
                }
            }
            OrdValue::String(s) => s.hash(state),
            OrdValue::Document(fields) => {
                for (k, v) in fields {
                    k.hash(state);
                    v.hash(state);
                }
            }
            OrdValue::Array(items) => items.hash(state),
            OrdValue::Boolean(b) => b.hash(state),
            OrdValue::DateTime(ms) => ms.hash(state),
        }
    }
}

/// Convert an f64 result back to JSON, keeping whole numbers integral.
pub fn number_to_value(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        JsonValue::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// Short type label used in error messages.
pub fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "document",
    }
}

/// Truthiness used by conditional expressions: `false`, `null` and zero are false.
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}
