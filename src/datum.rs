//! Dynamically typed column values.
//!
//! OVSDB rows are bags of column values whose shape is only known at
//! runtime. A [`Datum`] holds one such value in the RFC 7047 JSON notation:
//! atoms are plain JSON scalars, while sets, maps and UUIDs use the
//! two-element `["tag", payload]` arrays.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use uuid::Uuid;

use crate::error::DecodeError;

/// A single column value.
///
/// # Examples
///
/// ```
/// use vrswatch::Datum;
///
/// let addr = Datum::from("10.0.0.5");
/// assert_eq!(addr.as_str(), Some("10.0.0.5"));
///
/// let unset = Datum::empty_set();
/// assert!(unset.is_empty_set());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    /// String atom.
    String(String),
    /// Integer atom.
    Integer(i64),
    /// Real atom.
    Real(f64),
    /// Boolean atom.
    Boolean(bool),
    /// `["uuid", ...]`.
    Uuid(Uuid),
    /// `["named-uuid", ...]`, only meaningful inside a transaction.
    NamedUuid(String),
    /// `["set", [...]]`.
    Set(Vec<Datum>),
    /// `["map", [[k, v], ...]]`.
    Map(Vec<(Datum, Datum)>),
}

impl Datum {
    /// An empty set, which is how OVSDB encodes an unset optional column.
    #[must_use]
    pub const fn empty_set() -> Self {
        Self::Set(Vec::new())
    }

    /// True for the empty set, the encoding of an unset optional column.
    #[must_use]
    pub fn is_empty_set(&self) -> bool {
        match self {
            Self::Set(v) => v.is_empty(),
            _ => false,
        }
    }

    /// The string, if this is a string atom.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub const fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Boolean(_) => "boolean",
            Self::Uuid(_) => "uuid",
            Self::NamedUuid(_) => "named-uuid",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
        }
    }

    /// Decode a value from its OVSDB JSON notation.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        match value {
            serde_json::Value::String(s) => Ok(Self::String(s.clone())),
            serde_json::Value::Bool(b) => Ok(Self::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else {
                    n.as_f64()
                        .map(Self::Real)
                        .ok_or_else(|| DecodeError::malformed(format!("unrepresentable number {n}")))
                }
            }
            serde_json::Value::Array(items) => Self::from_tagged(items),
            other => Err(DecodeError::malformed(format!("unexpected JSON value {other}"))),
        }
    }

    fn from_tagged(items: &[serde_json::Value]) -> Result<Self, DecodeError> {
        let [tag, payload] = items else {
            return Err(DecodeError::malformed(format!(
                "tagged value must have 2 elements, got {}",
                items.len()
            )));
        };
        let Some(tag) = tag.as_str() else {
            return Err(DecodeError::malformed("tag must be a string"));
        };

        match tag {
            "uuid" => {
                let s = payload
                    .as_str()
                    .ok_or_else(|| DecodeError::malformed("uuid payload must be a string"))?;
                let id = Uuid::parse_str(s)
                    .map_err(|e| DecodeError::malformed(format!("invalid uuid '{s}': {e}")))?;
                Ok(Self::Uuid(id))
            }
            "named-uuid" => payload
                .as_str()
                .map(|s| Self::NamedUuid(s.to_string()))
                .ok_or_else(|| DecodeError::malformed("named-uuid payload must be a string")),
            "set" => {
                let elems = payload
                    .as_array()
                    .ok_or_else(|| DecodeError::malformed("set payload must be an array"))?;
                elems.iter().map(Self::from_json).collect::<Result<Vec<_>, _>>().map(Self::Set)
            }
            "map" => {
                let pairs = payload
                    .as_array()
                    .ok_or_else(|| DecodeError::malformed("map payload must be an array"))?;
                let mut out = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    match pair.as_array().map(Vec::as_slice) {
                        Some([k, v]) => out.push((Self::from_json(k)?, Self::from_json(v)?)),
                        _ => return Err(DecodeError::malformed("map entries must be [key, value] pairs")),
                    }
                }
                Ok(Self::Map(out))
            }
            other => Err(DecodeError::malformed(format!("unknown tag '{other}'"))),
        }
    }

    /// Encode the value in OVSDB JSON notation.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(v) => json!(v),
            Self::Integer(v) => json!(v),
            Self::Real(v) => json!(v),
            Self::Boolean(v) => json!(v),
            Self::Uuid(v) => json!(["uuid", v.to_string()]),
            Self::NamedUuid(v) => json!(["named-uuid", v]),
            Self::Set(v) => json!(["set", v.iter().map(Self::to_json).collect::<Vec<_>>()]),
            Self::Map(v) => json!([
                "map",
                v.iter().map(|(k, val)| json!([k.to_json(), val.to_json()])).collect::<Vec<_>>()
            ]),
        }
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v:?}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::NamedUuid(v) => write!(f, "@{v}"),
            Self::Set(v) => write!(f, "set[{}]", v.len()),
            Self::Map(v) => write!(f, "map[{}]", v.len()),
        }
    }
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Datum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(&raw).map_err(serde::de::Error::custom)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<Uuid> for Datum {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}
