//! Tagged representation of decoded Cairo values.
//!
//! Replaces the "anything goes" JSON fields of loosely typed decoders with a
//! closed set of shapes matching the primitive parse table. Struct fields keep
//! their ABI declaration order through serialization.

use primitive_types::U256;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// A decoded Cairo value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `felt252`, `ContractAddress`, `ClassHash` and raw `ByteArray` words,
    /// rendered as normalized hex strings.
    Felt(String),
    /// `u8` through `u128`.
    Uint(u128),
    /// `u256`, reassembled from its `(lo, hi)` limbs.
    Uint256(U256),
    /// `i8` through `i128`.
    Int(i128),
    Bool(bool),
    Array(Vec<Value>),
    /// Struct fields in ABI declaration order.
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// Appends a field, wrapping non-struct values into a single-field struct
    /// first so callers can always augment decoded output.
    pub fn push_field(self, name: &str, value: Value) -> Value {
        let mut fields = match self {
            Value::Struct(fields) => fields,
            other => vec![("value".to_string(), other)],
        };
        fields.push((name.to_string(), value));
        Value::Struct(fields)
    }

    /// Converts into a `serde_json::Value` (struct order preserved only in
    /// serialized output, not in the JSON object representation).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Felt(v) => serializer.serialize_str(v),
            Value::Uint(v) => {
                // JSON numbers top out at u64 in most consumers; larger u128
                // values are rendered as decimal strings.
                if let Ok(small) = u64::try_from(*v) {
                    serializer.serialize_u64(small)
                } else {
                    serializer.serialize_str(&v.to_string())
                }
            }
            Value::Uint256(v) => v.serialize(serializer),
            Value::Int(v) => {
                if let Ok(small) = i64::try_from(*v) {
                    serializer.serialize_i64(small)
                } else {
                    serializer.serialize_str(&v.to_string())
                }
            }
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Struct(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (name, value) in fields {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
        }
    }
}
