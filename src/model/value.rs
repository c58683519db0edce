// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Values flowing through FHIRPath evaluation and mapping execution

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::Node;

/// An ordered FHIRPath collection
pub type Collection = Vec<FhirPathValue>;

/// Quantity value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// Numeric value
    pub value: Decimal,
    /// UCUM unit code
    pub unit: String,
}

impl Quantity {
    /// Create a new quantity
    pub fn new(value: Decimal, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.value, self.unit)
    }
}

/// Core value type.
///
/// Dates and times keep their ISO 8601 text so partial precision such as
/// `2020-01` survives a round trip.
#[derive(Debug, Clone)]
pub enum FhirPathValue {
    /// Boolean value
    Boolean(bool),
    /// Integer value (64-bit signed)
    Integer(i64),
    /// Decimal value with arbitrary precision
    Decimal(Decimal),
    /// String value
    String(String),
    /// Date, possibly partial
    Date(String),
    /// Date and time, possibly partial
    DateTime(String),
    /// Time of day
    Time(String),
    /// Quantity
    Quantity(Quantity),
    /// Element of a host tree
    Node(Node),
}

impl FhirPathValue {
    /// Convenience constructor for strings
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// FHIR type name of the value
    pub fn type_name(&self) -> String {
        match self {
            Self::Boolean(_) => "boolean".into(),
            Self::Integer(_) => "integer".into(),
            Self::Decimal(_) => "decimal".into(),
            Self::String(_) => "string".into(),
            Self::Date(_) => "date".into(),
            Self::DateTime(_) => "dateTime".into(),
            Self::Time(_) => "time".into(),
            Self::Quantity(_) => "Quantity".into(),
            Self::Node(node) => node.type_name(),
        }
    }

    /// The node behind this value, if any
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Primitive content: the value itself, or the value held by a node
    pub fn primitive(&self) -> Option<FhirPathValue> {
        match self {
            Self::Node(node) => node.value(),
            other => Some(other.clone()),
        }
    }

    /// True when the value carries primitive content
    pub fn has_primitive(&self) -> bool {
        match self {
            Self::Node(node) => node.has_value(),
            _ => true,
        }
    }

    /// Text form of the primitive content
    pub fn as_string(&self) -> Option<String> {
        match self.primitive()? {
            Self::Boolean(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::String(s) | Self::Date(s) | Self::DateTime(s) | Self::Time(s) => Some(s),
            Self::Quantity(q) => Some(q.to_string()),
            Self::Node(_) => None,
        }
    }

    /// Boolean content, if the value is boolean
    pub fn as_boolean(&self) -> Option<bool> {
        match self.primitive()? {
            Self::Boolean(b) => Some(b),
            _ => None,
        }
    }

    /// Integer content, if the value is an integer
    pub fn as_integer(&self) -> Option<i64> {
        match self.primitive()? {
            Self::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Numeric content widened to decimal
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self.primitive()? {
            Self::Integer(i) => Some(Decimal::from(i)),
            Self::Decimal(d) => Some(d),
            _ => None,
        }
    }

    /// Primitive value for a JSON scalar, typed by `type_name` when known
    pub fn from_json_scalar(value: &Value, type_name: &str) -> Option<Self> {
        let parsed = match value {
            Value::Bool(b) => Self::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64().filter(|_| type_name != "decimal") {
                    Self::Integer(i)
                } else {
                    Self::Decimal(Decimal::from_str(&n.to_string()).ok()?)
                }
            }
            Value::String(s) => match type_name {
                "date" => Self::Date(s.clone()),
                "dateTime" | "instant" => Self::DateTime(s.clone()),
                "time" => Self::Time(s.clone()),
                "integer" | "positiveInt" | "unsignedInt" | "integer64" => {
                    s.parse().map(Self::Integer).unwrap_or_else(|_| Self::String(s.clone()))
                }
                "decimal" => Decimal::from_str(s)
                    .map(Self::Decimal)
                    .unwrap_or_else(|_| Self::String(s.clone())),
                "boolean" => match s.as_str() {
                    "true" => Self::Boolean(true),
                    "false" => Self::Boolean(false),
                    _ => Self::String(s.clone()),
                },
                _ => Self::String(s.clone()),
            },
            _ => return None,
        };
        Some(parsed)
    }

    /// JSON form of the value
    pub fn to_json(&self) -> Value {
        match self {
            Self::Boolean(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Decimal(d) => serde_json::Number::from_str(&d.to_string())
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(d.to_string())),
            Self::String(s) | Self::Date(s) | Self::DateTime(s) | Self::Time(s) => {
                Value::String(s.clone())
            }
            Self::Quantity(q) => serde_json::json!({
                "value": Self::Decimal(q.value).to_json(),
                "unit": q.unit,
                "system": "http://unitsofmeasure.org",
                "code": q.unit,
            }),
            Self::Node(node) => node.to_json(None),
        }
    }
}

/// Structural equality; nodes compare by content
impl PartialEq for FhirPathValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Decimal(a), Self::Decimal(b)) => a == b,
            (Self::String(a), Self::String(b))
            | (Self::Date(a), Self::Date(b))
            | (Self::DateTime(a), Self::DateTime(b))
            | (Self::Time(a), Self::Time(b)) => a == b,
            (Self::Quantity(a), Self::Quantity(b)) => a == b,
            (Self::Node(a), Self::Node(b)) => a.deep_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for FhirPathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_string() {
            Some(text) => f.write_str(&text),
            None => write!(f, "{}", self.type_name()),
        }
    }
}

impl From<bool> for FhirPathValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for FhirPathValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for FhirPathValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FhirPathValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Node> for FhirPathValue {
    fn from(value: Node) -> Self {
        Self::Node(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_typing_follows_declared_type() {
        assert_eq!(
            FhirPathValue::from_json_scalar(&json!("2020-01"), "date"),
            Some(FhirPathValue::Date("2020-01".into()))
        );
        assert_eq!(
            FhirPathValue::from_json_scalar(&json!(3), "decimal"),
            Some(FhirPathValue::Decimal(Decimal::from(3)))
        );
        assert_eq!(
            FhirPathValue::from_json_scalar(&json!(3), "integer"),
            Some(FhirPathValue::Integer(3))
        );
        assert_eq!(FhirPathValue::from_json_scalar(&json!({}), "string"), None);
    }

    #[test]
    fn primitive_node_exposes_value() {
        let node = Node::primitive("string", FhirPathValue::string("abc"));
        let value = FhirPathValue::Node(node);
        assert_eq!(value.as_string().as_deref(), Some("abc"));
        assert_eq!(value.type_name(), "string");
        assert!(value.has_primitive());
    }

    #[test]
    fn decimal_json_keeps_digits() {
        let value = FhirPathValue::Decimal(Decimal::new(1050, 2));
        assert_eq!(value.to_json(), json!(10.50));
    }
}
