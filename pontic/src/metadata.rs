//! # Metadata wrapper
//!
//! A case-insensitive multimap from header keys to ordered value sequences.
//! Keys are normalized to lowercase on every mutation, which is the form the
//! channel expects at the boundary. The same shape is used for request
//! headers, response headers and trailers; this wrapper only adds method
//! surface on top.
use std::str::FromStr;
use tonic::metadata::{
    KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue,
    errors::{InvalidMetadataKey, InvalidMetadataValue},
};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("set requires a key and at least one value")]
    MissingValues,
    #[error("invalid metadata key '{key}': '{source}'")]
    InvalidKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("invalid metadata value for key '{key}': '{source}'")]
    InvalidValue {
        key: String,
        source: InvalidMetadataValue,
    },
}

/// Case-insensitive ordered multimap of header/trailer pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, Vec<String>)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any prior values for the key. At least one value is
    /// required; passing none is the "too few arguments" misuse and fails.
    pub fn set<I, V>(&mut self, key: &str, values: I) -> Result<(), MetadataError>
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(MetadataError::MissingValues);
        }
        let key = key.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((key, values)),
        }
        Ok(())
    }

    /// First value for the key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, vs)| vs.first())
            .map(String::as_str)
    }

    /// All values for the key in insertion order; empty if absent.
    pub fn get_all(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, vs)| vs.clone())
            .unwrap_or_default()
    }

    /// Removes the key. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.len() != before
    }

    /// Invokes the callback once per (value, key) pair, including one
    /// invocation per value of a multi-valued key.
    pub fn for_each(&self, mut f: impl FnMut(&str, &str)) {
        for (key, values) in &self.entries {
            for value in values {
                f(value, key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends the other mapping's values onto this one, key by key.
    pub fn merge(&mut self, other: &Metadata) {
        for (key, values) in &other.entries {
            match self.entries.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => existing.extend(values.iter().cloned()),
                None => self.entries.push((key.clone(), values.clone())),
            }
        }
    }

    /// Plain-object view: each property holds the ordered value sequence.
    pub fn to_object(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, values) in &self.entries {
            map.insert(
                key.clone(),
                serde_json::Value::Array(
                    values
                        .iter()
                        .map(|v| serde_json::Value::String(v.clone()))
                        .collect(),
                ),
            );
        }
        serde_json::Value::Object(map)
    }

    /// Defensive plain-object ingestion: a non-object yields empty metadata
    /// rather than an error, and per-key values that are not arrays of
    /// strings are skipped.
    pub fn from_object(value: &serde_json::Value) -> Self {
        let mut metadata = Self::new();
        let Some(map) = value.as_object() else {
            return metadata;
        };
        for (key, entry) in map {
            let Some(values) = entry.as_array() else {
                continue;
            };
            let strings: Option<Vec<String>> = values
                .iter()
                .map(|v| v.as_str().map(str::to_owned))
                .collect();
            if let Some(strings) = strings
                && !strings.is_empty()
            {
                let _ = metadata.set(key, strings);
            }
        }
        metadata
    }

    /// Conversion to the channel form. Invalid keys or values are reported
    /// per entry, mirroring how request building surfaces them.
    pub fn to_tonic(&self) -> Result<MetadataMap, MetadataError> {
        let mut map = MetadataMap::new();
        for (key, values) in &self.entries {
            let parsed_key = MetadataKey::from_str(key).map_err(|source| {
                MetadataError::InvalidKey {
                    key: key.clone(),
                    source,
                }
            })?;
            for value in values {
                let parsed_value = MetadataValue::from_str(value).map_err(|source| {
                    MetadataError::InvalidValue {
                        key: key.clone(),
                        source,
                    }
                })?;
                map.append(parsed_key.clone(), parsed_value);
            }
        }
        Ok(map)
    }

    /// Conversion from the channel form. Binary-keyed entries have no string
    /// rendering and are skipped.
    pub fn from_tonic(map: &MetadataMap) -> Self {
        let mut metadata = Self::new();
        for entry in map.iter() {
            if let KeyAndValueRef::Ascii(key, value) = entry
                && let Ok(value) = value.to_str()
            {
                let key = key.as_str().to_string();
                match metadata.entries.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, existing)) => existing.push(value.to_string()),
                    None => metadata.entries.push((key, vec![value.to_string()])),
                }
            }
        }
        metadata
    }
}

/// Strips the grpc pseudo-entries the transport mixes into response
/// metadata; they are not user-visible headers.
pub(crate) fn without_transport_entries(metadata: &Metadata) -> Metadata {
    let mut filtered = metadata.clone();
    for key in ["grpc-status", "grpc-message", "grpc-encoding", "content-type"] {
        filtered.delete(key);
    }
    filtered
}
