use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered string-keyed map used for objects, node configs and namespaces
pub type Map = BTreeMap<String, Value>;

/// Dynamic value type shared by inputs, node outputs, variables and configs.
///
/// Serializes as plain JSON (no type tags) so a context snapshot is an
/// ordinary JSON document. Integers are kept apart from floats so ids
/// beyond 2^53 survive a snapshot round trip; the two compare equal when
/// numerically equal.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(Map),
}

impl Value {
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Integer text parses to [`Value::Int`], other numeric text to
    /// [`Value::Float`]
    pub fn parse_number(text: &str) -> Option<Value> {
        let text = text.trim();
        text.parse::<i64>()
            .map(Value::Int)
            .ok()
            .or_else(|| text.parse::<f64>().ok().map(Value::Float))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Key lookup on objects, index lookup on arrays
    pub fn get(&self, segment: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// JavaScript-style truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    /// Empty string, empty collection or null
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Lenient numeric view: numbers, numeric strings and booleans
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Convert to a declared type (`string`, `number`, `boolean`, or
    /// `object`/`array`/`structure` from JSON text). Values that cannot be
    /// converted are returned unchanged.
    pub fn coerce(self, declared: &str) -> Value {
        match (declared, self) {
            (_, Value::Null) => Value::Null,
            ("string", Value::String(s)) => Value::String(s),
            ("string", other) => Value::String(other.to_string()),
            ("number", value) if value.is_number() => value,
            ("number", Value::String(s)) => Value::parse_number(&s).unwrap_or(Value::String(s)),
            ("number", Value::Bool(b)) => Value::Int(b as i64),
            ("boolean", Value::String(s)) => Value::Bool(s.trim().eq_ignore_ascii_case("true")),
            ("boolean", value) => Value::Bool(value.is_truthy()),
            ("object" | "array" | "structure", Value::String(s)) => {
                Value::from_json_str(&s).unwrap_or(Value::String(s))
            }
            (_, value) => value,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => number_to_json(*n),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Parse JSON text into a value
    pub fn from_json_str(text: &str) -> Result<Value, serde_json::Error> {
        serde_json::from_str::<serde_json::Value>(text).map(Value::from)
    }

    /// Compact JSON rendering
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => {
                f.fract() == 0.0 && *i as f64 == *f && (*f as i64) == *i
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

/// Strings render raw, integral numbers without a fraction, everything else as JSON
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", number_to_json(*n)),
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        match j {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        v.to_json()
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_as_plain_json() {
        let value = Value::object([("y", Value::from(10)), ("name", Value::from("a"))]);
        assert_eq!(serde_json::to_value(&value).unwrap(), json!({"y": 10, "name": "a"}));
    }

    #[test]
    fn display_keeps_integers_integral() {
        assert_eq!(Value::from(3.0).to_string(), "3");
        assert_eq!(Value::from(2.5).to_string(), "2.5");
        assert_eq!(Value::from("x").to_string(), "x");
    }

    #[test]
    fn coerce_follows_declared_type() {
        assert_eq!(Value::from("42").coerce("number"), Value::from(42));
        assert_eq!(Value::from(7).coerce("string"), Value::from("7"));
        assert_eq!(Value::from("TRUE").coerce("boolean"), Value::from(true));
        assert_eq!(Value::from("[1,2]").coerce("structure"), Value::from(json!([1, 2])));
        assert_eq!(Value::from("abc").coerce("number"), Value::from("abc"));
    }

    #[test]
    fn large_integers_round_trip_exactly() {
        let value = Value::from(json!({"orderId": 9007199254740993_i64}));
        assert_eq!(value.get("orderId"), Some(&Value::Int(9_007_199_254_740_993)));

        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"orderId":9007199254740993}"#);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get("orderId").and_then(Value::as_i64), Some(9_007_199_254_740_993));
        assert_ne!(back.get("orderId"), Some(&Value::Int(9_007_199_254_740_992)));
        assert_eq!(Value::from("9007199254740993").coerce("number"), Value::Int(9_007_199_254_740_993));
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert_eq!(Value::from(10), Value::from(10.0));
        assert_ne!(Value::from(10), Value::from(10.5));
        assert_eq!(Value::from(json!({"y": 10})), Value::object([("y", Value::from(10.0))]));
        assert_eq!(Value::from(2.5).coerce("number"), Value::Float(2.5));
    }

    #[test]
    fn get_indexes_arrays() {
        let value = Value::from(json!({"items": [1, 2, 3]}));
        assert_eq!(value.get("items").and_then(|v| v.get("1")), Some(&Value::from(2)));
        assert_eq!(value.get("items").and_then(|v| v.get("9")), None);
    }
}
