//! Saved property records and the ordered collection the engine synchronizes.
//!
//! Records are open-ended JSON objects. The engine only interprets `id`,
//! `saved_at`, `debug`, `lat` and `lon`; everything else is carried untouched.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::lookup::centroid_from_debug;

pub const ID_FIELD: &str = "id";
pub const SAVED_AT_FIELD: &str = "saved_at";
pub const DEBUG_FIELD: &str = "debug";
pub const LAT_FIELD: &str = "lat";
pub const LON_FIELD: &str = "lon";

/// Map centre used when no saved record carries coordinates (San Francisco).
pub const DEFAULT_MAP_CENTER: (f64, f64) = (37.7749, -122.4194);

/// Record identifier. Generated ids are epoch milliseconds; callers may bring their own
/// numbers or strings. Equality is strict: `5` and `"5"` are different ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyId {
    Number(i64),
    Text(String),
}

impl PropertyId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Some(PropertyId::Number(int))
                } else {
                    number
                        .as_f64()
                        .filter(|float| float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                        .map(|float| PropertyId::Number(float as i64))
                }
            }
            Value::String(text) => Some(PropertyId::Text(text.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            PropertyId::Number(int) => Value::Number(Number::from(*int)),
            PropertyId::Text(text) => Value::String(text.clone()),
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            PropertyId::Number(int) => Some(*int),
            PropertyId::Text(_) => None,
        }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyId::Number(int) => write!(f, "{int}"),
            PropertyId::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for PropertyId {
    fn from(value: i64) -> Self {
        PropertyId::Number(value)
    }
}

impl From<&str> for PropertyId {
    fn from(value: &str) -> Self {
        PropertyId::Text(value.to_string())
    }
}

impl From<String> for PropertyId {
    fn from(value: String) -> Self {
        PropertyId::Text(value)
    }
}

impl Serialize for PropertyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyId::Number(int) => serializer.serialize_i64(*int),
            PropertyId::Text(text) => serializer.serialize_str(text),
        }
    }
}

impl<'de> Deserialize<'de> for PropertyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        PropertyId::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom("property id must be an integer or a string"))
    }
}

/// One saved property: a JSON object with a few well-known fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SavedProperty(Map<String, Value>);

impl SavedProperty {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Accepts JSON objects only.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<PropertyId> {
        self.0.get(ID_FIELD).and_then(PropertyId::from_value)
    }

    pub fn set_id(&mut self, id: &PropertyId) {
        self.0.insert(ID_FIELD.to_string(), id.to_value());
    }

    pub fn saved_at(&self) -> Option<&str> {
        self.0.get(SAVED_AT_FIELD).and_then(Value::as_str)
    }

    pub fn set_saved_at(&mut self, timestamp: impl Into<String>) {
        self.0
            .insert(SAVED_AT_FIELD.to_string(), Value::String(timestamp.into()));
    }

    pub fn debug(&self) -> Option<&Value> {
        self.0.get(DEBUG_FIELD)
    }

    pub fn has_debug(&self) -> bool {
        self.0.contains_key(DEBUG_FIELD)
    }

    /// Copy safe to send to the remote store, which rejects the keys found in raw
    /// debug payloads.
    pub fn without_debug(&self) -> Self {
        let mut fields = self.0.clone();
        fields.remove(DEBUG_FIELD);
        Self(fields)
    }

    /// `(lat, lon)` when both are present as numbers or numeric strings.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat = self.0.get(LAT_FIELD).and_then(coordinate)?;
        let lon = self.0.get(LON_FIELD).and_then(coordinate)?;
        Some((lat, lon))
    }

    /// Copies the parcel centroid out of `debug` into `lat`/`lon` when the record has
    /// no coordinates yet. Returns whether coordinates were added.
    pub fn derive_coordinates(&mut self) -> bool {
        if self.coordinates().is_some() {
            return false;
        }
        let Some((lat, lon)) = self.debug().and_then(centroid_from_debug) else {
            return false;
        };
        let (Some(lat), Some(lon)) = (Number::from_f64(lat), Number::from_f64(lon)) else {
            return false;
        };
        self.0.insert(LAT_FIELD.to_string(), Value::Number(lat));
        self.0.insert(LON_FIELD.to_string(), Value::Number(lon));
        true
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for SavedProperty {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|float| float.is_finite())
}

pub(crate) fn parse_coordinate(value: &Value) -> Option<f64> {
    coordinate(value)
}

/// Ordered collection of saved properties, in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SavedCollection(Vec<SavedProperty>);

impl SavedCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a collection as the remote store returns it.
    ///
    /// `null` and empty values are absent. Arrays may contain `null` holes, and sparse
    /// arrays come back as objects keyed by index; both are read in index order.
    /// Entries that are not objects are skipped.
    pub fn from_remote_value(value: Value) -> Option<Self> {
        let entries: Vec<Value> = match value {
            Value::Null => return None,
            Value::Array(items) => items,
            Value::Object(map) => {
                let mut indexed: Vec<(u64, Value)> = Vec::with_capacity(map.len());
                let mut keyed: Vec<(String, Value)> = Vec::new();
                for (key, entry) in map {
                    match key.parse::<u64>() {
                        Ok(index) => indexed.push((index, entry)),
                        Err(_) => keyed.push((key, entry)),
                    }
                }
                indexed.sort_by_key(|(index, _)| *index);
                keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
                indexed
                    .into_iter()
                    .map(|(_, entry)| entry)
                    .chain(keyed.into_iter().map(|(_, entry)| entry))
                    .collect()
            }
            _ => return None,
        };
        if entries.is_empty() {
            return None;
        }
        Some(Self(
            entries
                .into_iter()
                .filter_map(SavedProperty::from_value)
                .collect(),
        ))
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.0.iter().cloned().map(SavedProperty::into_value).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SavedProperty> {
        self.0.iter()
    }

    pub fn records(&self) -> &[SavedProperty] {
        &self.0
    }

    pub fn ids(&self) -> Vec<PropertyId> {
        self.0.iter().filter_map(SavedProperty::id).collect()
    }

    pub fn get(&self, id: &PropertyId) -> Option<&SavedProperty> {
        self.0
            .iter()
            .find(|record| record.id().as_ref() == Some(id))
    }

    pub fn push(&mut self, record: SavedProperty) {
        self.0.push(record);
    }

    /// Appends `record`, or replaces the record that already has its id in place.
    pub fn upsert(&mut self, record: SavedProperty) {
        let position = record
            .id()
            .and_then(|id| self.0.iter().position(|existing| existing.id() == Some(id.clone())));
        match position {
            Some(index) => self.0[index] = record,
            None => self.0.push(record),
        }
    }

    /// Removes every record with `id`. Returns whether anything was removed.
    pub fn remove_by_id(&mut self, id: &PropertyId) -> bool {
        let before = self.0.len();
        self.0.retain(|record| record.id().as_ref() != Some(id));
        self.0.len() != before
    }

    pub fn without_debug(&self) -> Self {
        Self(self.0.iter().map(SavedProperty::without_debug).collect())
    }

    pub fn has_debug(&self) -> bool {
        self.0.iter().any(SavedProperty::has_debug)
    }

    /// Copies `debug` from records of `local` with the same id onto records that lack
    /// it. The remote store never holds `debug`, so a collection read back from it
    /// would otherwise drop the local annotations.
    pub fn carry_debug_from(&mut self, local: &SavedCollection) {
        for record in self.0.iter_mut().filter(|record| !record.has_debug()) {
            let Some(id) = record.id() else {
                continue;
            };
            if let Some(debug) = local.get(&id).and_then(SavedProperty::debug) {
                record.insert(DEBUG_FIELD, debug.clone());
            }
        }
    }

    pub fn max_numeric_id(&self) -> Option<i64> {
        self.0
            .iter()
            .filter_map(|record| record.id().and_then(|id| id.as_number()))
            .max()
    }

    /// Mean of the records' coordinates, or [`DEFAULT_MAP_CENTER`].
    pub fn map_center(&self) -> (f64, f64) {
        let points: Vec<(f64, f64)> = self.0.iter().filter_map(SavedProperty::coordinates).collect();
        if points.is_empty() {
            return DEFAULT_MAP_CENTER;
        }
        let count = points.len() as f64;
        let (lat_sum, lon_sum) = points
            .iter()
            .fold((0.0, 0.0), |(lat, lon), (p_lat, p_lon)| (lat + p_lat, lon + p_lon));
        (lat_sum / count, lon_sum / count)
    }
}

impl From<Vec<SavedProperty>> for SavedCollection {
    fn from(records: Vec<SavedProperty>) -> Self {
        Self(records)
    }
}

impl FromIterator<SavedProperty> for SavedCollection {
    fn from_iter<I: IntoIterator<Item = SavedProperty>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SavedCollection {
    type Item = SavedProperty;
    type IntoIter = std::vec::IntoIter<SavedProperty>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SavedCollection {
    type Item = &'a SavedProperty;
    type IntoIter = std::slice::Iter<'a, SavedProperty>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Hands out record ids that never repeat within a process, even for saves in the
/// same millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<i64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, now_millis: i64, collection: &SavedCollection) -> PropertyId {
        let mut last = self.last.lock().unwrap();
        let floor = collection
            .max_numeric_id()
            .map_or(i64::MIN, |max| max.saturating_add(1));
        let id = now_millis.max(last.saturating_add(1)).max(floor);
        *last = id;
        PropertyId::Number(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> SavedProperty {
        SavedProperty::from_value(value).unwrap()
    }

    #[test]
    fn remote_values_decode_leniently() {
        assert_eq!(SavedCollection::from_remote_value(Value::Null), None);
        assert_eq!(SavedCollection::from_remote_value(json!([])), None);

        let from_array =
            SavedCollection::from_remote_value(json!([{"id": 1}, null, 7, {"id": 2}])).unwrap();
        assert_eq!(from_array.ids(), vec![PropertyId::Number(1), PropertyId::Number(2)]);

        let from_sparse =
            SavedCollection::from_remote_value(json!({"10": {"id": "b"}, "2": {"id": "a"}}))
                .unwrap();
        assert_eq!(from_sparse.ids(), vec![PropertyId::from("a"), PropertyId::from("b")]);
    }

    #[test]
    fn ids_compare_strictly() {
        let mut collection: SavedCollection =
            vec![record(json!({"id": 5})), record(json!({"id": "5"}))].into();
        assert!(collection.remove_by_id(&PropertyId::Number(5)));
        assert_eq!(collection.ids(), vec![PropertyId::from("5")]);
        assert!(!collection.remove_by_id(&PropertyId::Number(5)));
    }

    #[test]
    fn float_encoded_ids_are_numbers() {
        assert_eq!(
            PropertyId::from_value(&json!(1_700_000_000_000.0_f64)),
            Some(PropertyId::Number(1_700_000_000_000))
        );
        assert_eq!(PropertyId::from_value(&json!(1.5)), None);
        assert_eq!(PropertyId::from_value(&json!(true)), None);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut collection: SavedCollection =
            vec![record(json!({"id": 1, "v": "a"})), record(json!({"id": 2}))].into();
        collection.upsert(record(json!({"id": 1, "v": "b"})));
        collection.upsert(record(json!({"id": 3})));
        assert_eq!(
            collection.to_value(),
            json!([{"id": 1, "v": "b"}, {"id": 2}, {"id": 3}])
        );
    }

    #[test]
    fn without_debug_strips_every_record() {
        let collection: SavedCollection = vec![
            record(json!({"id": 1, "debug": {"parcel_raw": []}})),
            record(json!({"id": 2})),
        ]
        .into();
        assert!(collection.has_debug());
        let stripped = collection.without_debug();
        assert!(!stripped.has_debug());
        assert_eq!(stripped.to_value(), json!([{"id": 1}, {"id": 2}]));
    }

    #[test]
    fn debug_is_carried_over_by_id() {
        let local: SavedCollection = vec![
            record(json!({"id": 1, "debug": {"source": "lookup"}})),
            record(json!({"id": 2, "debug": {"source": "other"}})),
        ]
        .into();
        let mut remote: SavedCollection =
            vec![record(json!({"id": 3})), record(json!({"id": 1}))].into();
        remote.carry_debug_from(&local);
        assert_eq!(
            remote.to_value(),
            json!([{"id": 3}, {"id": 1, "debug": {"source": "lookup"}}])
        );
    }

    #[test]
    fn coordinates_are_derived_from_parcel_centroid() {
        let mut property = record(json!({
            "id": 1,
            "debug": {"parcel_raw": [{"centroid_latitude": "37.76", "centroid_longitude": "-122.42"}]}
        }));
        assert!(property.derive_coordinates());
        assert_eq!(property.coordinates(), Some((37.76, -122.42)));
        assert!(!property.derive_coordinates());
    }

    #[test]
    fn map_center_averages_or_defaults() {
        assert_eq!(SavedCollection::new().map_center(), DEFAULT_MAP_CENTER);
        let collection: SavedCollection = vec![
            record(json!({"lat": 37.0, "lon": -122.0})),
            record(json!({"lat": "38.0", "lon": "-123.0"})),
            record(json!({"lat": null})),
        ]
        .into();
        assert_eq!(collection.map_center(), (37.5, -122.5));
    }

    #[test]
    fn id_generator_is_monotonic_within_a_millisecond() {
        let generator = IdGenerator::new();
        let collection: SavedCollection = vec![record(json!({"id": 100}))].into();
        assert_eq!(generator.next_id(50, &collection), PropertyId::Number(101));
        assert_eq!(generator.next_id(50, &collection), PropertyId::Number(102));
        assert_eq!(generator.next_id(500, &collection), PropertyId::Number(500));
        assert_eq!(generator.next_id(500, &SavedCollection::new()), PropertyId::Number(501));
    }
}
