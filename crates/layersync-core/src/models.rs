//! Data models for layersync
//!
//! Defines the identifiers, attribute values, and the two feature
//! representations the adapter moves between: the host's `LocalFeature`
//! and the remote `points` row (`RemoteFeature`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Get the underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a layer in the remote `layers` table
    LayerId
);

uuid_id!(
    /// Server-side identifier of a feature (the `points.id` column)
    RemoteId
);

/// Host-assigned feature identifier
///
/// Only valid for the lifetime of a host session or file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A dynamically typed scalar attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Read a JSON value into an attribute value
    ///
    /// Arrays and objects are not scalar; they are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Int(i),
                None => n
                    .as_f64()
                    .map(AttributeValue::Float)
                    .unwrap_or(AttributeValue::Null),
            },
            Value::String(s) => AttributeValue::Text(s.clone()),
            other => AttributeValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => write!(f, "NULL"),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Float(x) => write!(f, "{}", x),
            AttributeValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(x: f64) -> Self {
        AttributeValue::Float(x)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

/// Declared type of a layer attribute, as named in the remote schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeType {
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "str")]
    Text,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "time")]
    Time,
    #[serde(rename = "datetime")]
    DateTime,
}

impl AttributeType {
    /// The neutral value of this type
    pub fn null_value(&self) -> AttributeValue {
        match self {
            AttributeType::Bool => AttributeValue::Bool(false),
            AttributeType::Int => AttributeValue::Int(0),
            AttributeType::Float => AttributeValue::Float(0.0),
            AttributeType::Text => AttributeValue::Text(String::new()),
            AttributeType::Date => AttributeValue::Text("1970-01-01".to_string()),
            AttributeType::Time => AttributeValue::Text("00:00:00".to_string()),
            AttributeType::DateTime => AttributeValue::Text("1970-01-01 00:00:00".to_string()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Bool => "bool",
            AttributeType::Int => "int",
            AttributeType::Float => "float",
            AttributeType::Text => "str",
            AttributeType::Date => "date",
            AttributeType::Time => "time",
            AttributeType::DateTime => "datetime",
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(AttributeType::Bool),
            "int" => Ok(AttributeType::Int),
            "float" => Ok(AttributeType::Float),
            "str" | "text" => Ok(AttributeType::Text),
            "date" => Ok(AttributeType::Date),
            "time" => Ok(AttributeType::Time),
            "datetime" => Ok(AttributeType::DateTime),
            other => Err(format!("unknown attribute type '{}'", other)),
        }
    }
}

/// One entry of a layer's attribute schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    /// Schema-declared default, used when a row lacks the attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<AttributeValue>,
}

impl LayerAttribute {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<AttributeValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// The value a missing attribute resolves to
    pub fn resolved_default(&self) -> AttributeValue {
        self.default.clone().unwrap_or(AttributeValue::Null)
    }
}

/// A 3-D point in the layer's spatial reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Compare coordinates to 8 decimal places
    pub fn approx_eq(&self, other: &Point3) -> bool {
        const EPS: f64 = 1e-8;
        (self.x - other.x).abs() < EPS
            && (self.y - other.y).abs() < EPS
            && (self.z - other.z).abs() < EPS
    }
}

/// A feature as the host application sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFeature {
    pub local_id: Option<LocalId>,
    /// Remote identifier embedded in host-side metadata, if synced before
    pub remote_id: Option<RemoteId>,
    pub geometry: Point3,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl LocalFeature {
    pub fn new(geometry: Point3) -> Self {
        Self {
            local_id: None,
            remote_id: None,
            geometry,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_local_id(mut self, id: LocalId) -> Self {
        self.local_id = Some(id);
        self
    }

    pub fn with_remote_id(mut self, id: RemoteId) -> Self {
        self.remote_id = Some(id);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// Same geometry (8 decimals) and same attributes
    pub fn same_content(&self, other: &LocalFeature) -> bool {
        self.geometry.approx_eq(&other.geometry) && self.attributes == other.attributes
    }
}

/// A row of the remote `points` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFeature {
    pub id: RemoteId,
    pub layer_id: LayerId,
    /// GeoJSON object or hex-encoded EWKB, depending on the channel
    pub geom: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attributes: Map<String, Value>,
    /// Feature of the parent layer this row was copied from
    #[serde(default)]
    pub parent_id: Option<RemoteId>,
}

/// A row of the remote `layers` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub id: LayerId,
    pub name: String,
    #[serde(default = "default_geometry_type")]
    pub geometry_type: String,
    pub srid: i32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attributes: Vec<LayerAttribute>,
    #[serde(default)]
    pub parent_id: Option<LayerId>,
    #[serde(default)]
    pub temporary: bool,
}

impl LayerInfo {
    pub fn new(name: impl Into<String>, srid: i32) -> Self {
        Self {
            id: LayerId::new(),
            name: name.into(),
            geometry_type: default_geometry_type(),
            srid,
            attributes: Vec::new(),
            parent_id: None,
            temporary: false,
        }
    }

    pub fn with_attribute(mut self, attribute: LayerAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn is_sub_layer(&self) -> bool {
        self.parent_id.is_some()
    }

    pub fn attribute(&self, name: &str) -> Option<&LayerAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

fn default_geometry_type() -> String {
    "point".to_string()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
