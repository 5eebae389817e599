//! Request and response envelope of the property-lookup service.
//!
//! The engine never performs the lookup itself; callers fetch a property, decode the
//! body with [`LookupResponse::from_body`] and pass the resulting record to
//! [`SyncCoordinator::save`](crate::sync::SyncCoordinator::save).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collection::{parse_coordinate, SavedProperty};

/// Body of a lookup request. `debug` is always requested so saved records keep the
/// raw parcel data locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parcel: Option<String>,
    pub debug: bool,
}

impl LookupRequest {
    pub fn new(url: Option<String>, address: Option<String>, parcel: Option<String>) -> Self {
        let non_blank = |value: Option<String>| value.filter(|text| !text.trim().is_empty());
        Self {
            url: non_blank(url),
            address: non_blank(address),
            parcel: non_blank(parcel),
            debug: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.address.is_none() && self.parcel.is_none()
    }
}

/// Failure reported by the lookup service in an `{ "error": .. }` body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupError {
    pub message: String,
    pub details: Option<String>,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{} ({details})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for LookupError {}

/// Decoded lookup result: a property (possibly empty) and an optional warning to
/// surface next to it.
#[derive(Clone, Debug, PartialEq)]
pub struct LookupResponse {
    pub property: Option<SavedProperty>,
    pub warning: Option<String>,
}

impl LookupResponse {
    /// Decodes a response body. The body is either `{ "error" }`, `{ "warning" }`
    /// with optional `data`, `{ "data" }`, or the property object itself.
    pub fn from_body(body: Value) -> Result<Self, LookupError> {
        let Value::Object(mut fields) = body else {
            return Err(LookupError {
                message: "Lookup response is not a JSON object".to_string(),
                details: None,
            });
        };

        if let Some(error) = fields.get("error").and_then(Value::as_str) {
            return Err(LookupError {
                message: error.to_string(),
                details: fields
                    .get("details")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        let warning = match fields.remove("warning") {
            Some(Value::String(text)) => Some(text),
            _ => None,
        };

        let payload = match fields.remove("data") {
            Some(data) => data,
            None if warning.is_some() && fields.is_empty() => Value::Null,
            None => Value::Object(fields),
        };

        let property = match payload {
            Value::Object(map) if !map.is_empty() => {
                let mut property = SavedProperty::new(map);
                property.derive_coordinates();
                Some(property)
            }
            _ => None,
        };

        Ok(Self { property, warning })
    }
}

/// Reads `parcel_raw[0].centroid_latitude/centroid_longitude` from a debug payload.
pub fn centroid_from_debug(debug: &Value) -> Option<(f64, f64)> {
    let first = debug.get("parcel_raw")?.as_array()?.first()?;
    let raw: &Map<String, Value> = first.as_object()?;
    let lat = raw.get("centroid_latitude").and_then(parse_coordinate)?;
    let lon = raw.get("centroid_longitude").and_then(parse_coordinate)?;
    Some((lat, lon))
}
