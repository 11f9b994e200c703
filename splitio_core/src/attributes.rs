use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a map of user-supplied attributes keyed by attribute name.
///
/// # Examples
/// ```
/// # use splitio_core::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium".to_owned(), true.into()),
///     ("plan".to_owned(), "gold".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of a user attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`,
/// `bool`, and `Vec<String>`.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    #[from(ignore)]
    String(String),
    /// A numerical value. Dates are represented as epoch milliseconds.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A list of strings, used by set matchers.
    List(Vec<String>),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> AttributeValue {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> AttributeValue {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> AttributeValue {
        AttributeValue::Number(value as f64)
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric coercion used by numeric and date matchers. Numeric strings
    /// are accepted; booleans are rejected to avoid `true` silently becoming 1.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            AttributeValue::String(s) => match s.to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Set coercion used by set matchers: a list of strings, or a single
    /// string treated as a one-element set.
    pub fn as_string_set(&self) -> Option<Vec<&str>> {
        match self {
            AttributeValue::List(values) => Some(values.iter().map(String::as_str).collect()),
            AttributeValue::String(s) => Some(vec![s.as_str()]),
            _ => None,
        }
    }
}
