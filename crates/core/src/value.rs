//! Declarative value specifications.
//!
//! A task description assigns each target parameter either a literal or
//! a small object describing how to draw the value at mutation time:
//!
//! ```json
//! 42
//! {"type": "random_range", "min": 0.5, "max": 10.5}
//! {"type": "random_choice", "choices": ["a", "b", "c"]}
//! {"type": "weighted_choice", ...}   // extension tag, see the registry
//! ```
//!
//! Anything without a `"type"` key is a literal. Objects with an
//! unrecognized `"type"` become [`ValueSpec::Custom`] and are resolved
//! through the registry; an unregistered tag is a hard error at
//! resolution time, never a silent fallback.

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};

use crate::task::ConfigError;

/// The built-in spec tags.
pub const TAG_RANDOM_RANGE: &str = "random_range";
pub const TAG_RANDOM_CHOICE: &str = "random_choice";

/// A declarative value specification, resolved to a concrete scalar by
/// [`crate::resolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSpec {
    /// A literal, used unchanged.
    Fixed(Value),
    /// Uniform draw from `[min, max]`. Two integer bounds yield an
    /// integer; a float bound yields a float.
    RandomRange { min: Number, max: Number },
    /// Uniform draw from an ordered, non-empty choice list.
    RandomChoice(Vec<Value>),
    /// An extension tag with its raw parameter map, dispatched through
    /// the value registry.
    Custom {
        tag: String,
        params: IndexMap<String, Value>,
    },
}

impl ValueSpec {
    /// Parse the wire shape used by task descriptions.
    pub fn from_wire(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(obj) = value else {
            return Ok(Self::Fixed(value));
        };

        let Some(tag) = obj.get("type").and_then(Value::as_str).map(str::to_owned) else {
            // An object without a "type" key is a literal (e.g. a link
            // input like {"node": "4"}); pass it through.
            return Ok(Self::Fixed(Value::Object(obj)));
        };

        match tag.as_str() {
            TAG_RANDOM_RANGE => {
                let min = require_number(&obj, "min", &tag)?;
                let max = require_number(&obj, "max", &tag)?;
                Ok(Self::RandomRange { min, max })
            }
            TAG_RANDOM_CHOICE => {
                let choices = match obj.get("choices") {
                    Some(Value::Array(items)) => items.clone(),
                    _ => {
                        return Err(ConfigError::ValueSpec(format!(
                            "\"{tag}\" requires a \"choices\" list"
                        )))
                    }
                };
                Ok(Self::RandomChoice(choices))
            }
            _ => {
                let params = obj
                    .into_iter()
                    .filter(|(key, _)| key != "type")
                    .collect();
                Ok(Self::Custom { tag, params })
            }
        }
    }
}

fn require_number(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    tag: &str,
) -> Result<Number, ConfigError> {
    match obj.get(field) {
        Some(Value::Number(n)) => Ok(n.clone()),
        _ => Err(ConfigError::ValueSpec(format!(
            "\"{tag}\" requires a numeric \"{field}\" field"
        ))),
    }
}

impl<'de> Deserialize<'de> for ValueSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Self::from_wire(raw).map_err(D::Error::custom)
    }
}
