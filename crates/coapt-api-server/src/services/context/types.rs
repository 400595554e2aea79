use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const MAX_PRICE: u64 = 100_000_000;
pub const MAX_BEDROOMS: u32 = 20;
pub const MAX_BATHROOMS: f64 = 20.0;

/// Errors raised when a context enters the system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("context is not a valid search context: {0}")]
    Malformed(String),

    #[error("{field} must not exceed {max}")]
    OutOfRange { field: &'static str, max: String },

    #[error("{min_field} cannot be greater than {max_field}")]
    InvertedRange {
        min_field: &'static str,
        max_field: &'static str,
    },

    #[error("{0} must be a finite, non-negative number")]
    NotFinite(&'static str),
}

/// Sequence-valued context field.
///
/// On the wire a plain array means "append to what is already known", while
/// `{"replace": [...]}` overwrites the accumulated values outright.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqField {
    pub values: Vec<String>,
    pub replace: bool,
}

impl SeqField {
    pub fn append<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            replace: false,
        }
    }

    pub fn replacing<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            replace: true,
        }
    }

    /// Nothing to contribute to a merge and nothing to serialize.
    pub fn is_unset(&self) -> bool {
        self.values.is_empty() && !self.replace
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeqWire {
    Append(Vec<String>),
    Replace { replace: Vec<String> },
}

impl Serialize for SeqField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.replace {
            let mut map = serializer.serialize_map(Some(1))?;
            map.serialize_entry("replace", &self.values)?;
            map.end()
        } else {
            self.values.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for SeqField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<SeqWire>::deserialize(deserializer)? {
            None => Ok(SeqField::default()),
            Some(SeqWire::Append(values)) => Ok(SeqField::append(values)),
            Some(SeqWire::Replace { replace }) => Ok(SeqField::replacing(replace)),
        }
    }
}

/// Accumulated search filters for one conversation thread.
///
/// Known filters are typed fields; anything else a client or extractor sends
/// survives untouched in `extra`. Keys sent as an explicit `null` land in
/// `cleared` and erase the prior value when merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighborhood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borough: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zipcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_bathrooms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_sqft: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sqft: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_fee: Option<bool>,
    #[serde(default, skip_serializing_if = "SeqField::is_unset")]
    pub tags: SeqField,
    #[serde(default, skip_serializing_if = "SeqField::is_unset")]
    pub amenities: SeqField,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    #[serde(skip)]
    pub cleared: BTreeSet<String>,
}

impl SearchContext {
    /// Decode and validate a client-supplied JSON context.
    ///
    /// `null` and `{}` both yield an empty context. A key whose value is
    /// `null` is recorded in `cleared`.
    pub fn from_value(value: Value) -> Result<Self, ContextError> {
        let cleared: BTreeSet<String> = match &value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map
                .iter()
                .filter(|(_, v)| v.is_null())
                .map(|(k, _)| k.clone())
                .collect(),
            _ => return Err(ContextError::Malformed("expected a JSON object".to_string())),
        };
        let mut ctx: SearchContext =
            serde_json::from_value(value).map_err(|e| ContextError::Malformed(e.to_string()))?;
        ctx.extra.retain(|_, v| !v.is_null());
        ctx.cleared = cleared;
        ctx.validate()?;
        Ok(ctx)
    }

    /// Whether this context asks for `key` (wire name) to be erased.
    pub fn clears(&self, key: &str) -> bool {
        self.cleared.contains(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Object(Default::default()))
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default() || self.to_value().as_object().is_some_and(|m| m.is_empty())
    }

    /// Range checks shared by the HTTP boundary and the validation stage.
    pub fn validate(&self) -> Result<(), ContextError> {
        for (field, value) in [("minPrice", self.min_price), ("maxPrice", self.max_price)] {
            if value.is_some_and(|v| v > MAX_PRICE) {
                return Err(ContextError::OutOfRange {
                    field,
                    max: MAX_PRICE.to_string(),
                });
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(ContextError::InvertedRange {
                    min_field: "minPrice",
                    max_field: "maxPrice",
                });
            }
        }

        if self.bedrooms.is_some_and(|b| b > MAX_BEDROOMS) {
            return Err(ContextError::OutOfRange {
                field: "bedrooms",
                max: MAX_BEDROOMS.to_string(),
            });
        }

        if let Some(baths) = self.min_bathrooms {
            if !baths.is_finite() || baths < 0.0 {
                return Err(ContextError::NotFinite("minBathrooms"));
            }
            if baths > MAX_BATHROOMS {
                return Err(ContextError::OutOfRange {
                    field: "minBathrooms",
                    max: MAX_BATHROOMS.to_string(),
                });
            }
        }

        if let (Some(min), Some(max)) = (self.min_sqft, self.max_sqft) {
            if min > max {
                return Err(ContextError::InvertedRange {
                    min_field: "minSqft",
                    max_field: "maxSqft",
                });
            }
        }

        Ok(())
    }
}
