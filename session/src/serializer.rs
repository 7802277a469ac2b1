//! Session map serialization.
//!
//! Session data is a flat map of string keys to JSON values. Plain values are
//! stored structurally, so any `serde` type round-trips without type metadata on
//! the wire. Types that need a stable identity can implement [`SessionValue`] and
//! be registered in a [`TypeRegistry`]; they are stored in an envelope
//! `{"$type": TAG, "value": ...}` that is validated against the registry on load.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// In-memory representation of the session data
pub type SessionMap = HashMap<String, Value>;

/// Envelope field holding the registered type tag
pub const TYPE_FIELD: &str = "$type";
/// Envelope field holding the wrapped value
pub const VALUE_FIELD: &str = "value";

/// Errors raised while (de)serializing session data
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("Failed encoding session data: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed decoding session data: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unknown session value type: {0}")]
    UnknownType(String),

    #[error("Invalid value for session type {tag}: {source}")]
    InvalidValue {
        tag: String,
        source: serde_json::Error,
    },

    #[error("Session value type already registered: {0}")]
    DuplicateTag(String),

    #[error("Plain session values may not carry the reserved `{0}` field")]
    ReservedField(&'static str),

    #[error("Session key {key} holds a {found} value, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: String,
    },
}

/// A custom type stored in the session under a stable tag.
///
/// ```
/// use hs_session::SessionValue;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Cart {
///     items: Vec<u32>,
/// }
///
/// impl SessionValue for Cart {
///     const TAG: &'static str = "shop.cart";
/// }
/// ```
pub trait SessionValue: Serialize + DeserializeOwned {
    const TAG: &'static str;
}

type Validator = fn(&Value) -> Result<(), serde_json::Error>;

fn validate_as<T: SessionValue>(value: &Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<T>(value.clone()).map(|_| ())
}

/// Registry of custom session value types, populated at startup.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    validators: HashMap<&'static str, Validator>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `T::TAG`. Registering two types under one tag fails.
    pub fn register<T: SessionValue>(&mut self) -> Result<(), SerializeError> {
        if self.validators.contains_key(T::TAG) {
            return Err(SerializeError::DuplicateTag(T::TAG.to_string()));
        }
        self.validators.insert(T::TAG, validate_as::<T>);
        Ok(())
    }

    /// Builder-style variant of [`TypeRegistry::register`]
    pub fn with<T: SessionValue>(mut self) -> Result<Self, SerializeError> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.validators.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    fn validate(&self, tag: &str, value: &Value) -> Result<(), SerializeError> {
        let validator = self
            .validators
            .get(tag)
            .ok_or_else(|| SerializeError::UnknownType(tag.to_string()))?;
        validator(value).map_err(|source| SerializeError::InvalidValue {
            tag: tag.to_string(),
            source,
        })
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.validators.keys().collect();
        tags.sort();
        f.debug_struct("TypeRegistry").field("tags", &tags).finish()
    }
}

/// Converts session maps to bytes and back.
#[derive(Clone, Debug, Default)]
pub struct Serializer {
    registry: Arc<TypeRegistry>,
}

impl Serializer {
    pub fn new(registry: TypeRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn serialize(&self, map: &SessionMap) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(map).map_err(SerializeError::Encode)
    }

    /// Parses bytes produced by [`Serializer::serialize`], checking every tagged
    /// value against the registry.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<SessionMap, SerializeError> {
        let map: SessionMap = serde_json::from_slice(bytes).map_err(SerializeError::Decode)?;
        for value in map.values() {
            if let Some((tag, inner)) = unwrap_envelope(value) {
                self.registry.validate(tag, inner)?;
            }
        }
        Ok(map)
    }

    /// Converts a plain value into its stored form.
    pub(crate) fn to_plain<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value, SerializeError> {
        let value = serde_json::to_value(value).map_err(SerializeError::Encode)?;
        if unwrap_envelope(&value).is_some() {
            return Err(SerializeError::ReservedField(TYPE_FIELD));
        }
        Ok(value)
    }

    /// Wraps a registered value into its tagged envelope.
    pub(crate) fn to_tagged<T: SessionValue>(&self, value: &T) -> Result<Value, SerializeError> {
        if !self.registry.contains(T::TAG) {
            return Err(SerializeError::UnknownType(T::TAG.to_string()));
        }
        let inner = serde_json::to_value(value).map_err(SerializeError::Encode)?;
        let mut envelope = Map::with_capacity(2);
        envelope.insert(TYPE_FIELD.to_string(), Value::String(T::TAG.to_string()));
        envelope.insert(VALUE_FIELD.to_string(), inner);
        Ok(Value::Object(envelope))
    }
}

/// Splits a tagged envelope into `(tag, value)`; `None` for plain values.
pub(crate) fn unwrap_envelope(value: &Value) -> Option<(&str, &Value)> {
    let object = value.as_object()?;
    let tag = object.get(TYPE_FIELD)?.as_str()?;
    let inner = object.get(VALUE_FIELD)?;
    (object.len() == 2).then_some((tag, inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    impl SessionValue for Profile {
        const TAG: &'static str = "test.profile";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OtherProfile {
        id: u64,
    }

    impl SessionValue for OtherProfile {
        const TAG: &'static str = "test.profile";
    }

    fn serializer() -> Serializer {
        Serializer::new(TypeRegistry::new().with::<Profile>().unwrap())
    }

    #[test]
    fn test_round_trip_plain_and_tagged_values() {
        let serializer = serializer();
        let mut map = SessionMap::new();
        map.insert("blah".to_string(), serializer.to_plain("camilo").unwrap());
        map.insert("count".to_string(), serializer.to_plain(&3u32).unwrap());
        map.insert(
            "profile".to_string(),
            serializer
                .to_tagged(&Profile {
                    name: "ana".to_string(),
                    visits: 2,
                })
                .unwrap(),
        );

        let bytes = serializer.serialize(&map).unwrap();
        let decoded = serializer.deserialize(&bytes).unwrap();

        assert_eq!(decoded, map);
        assert_eq!(decoded["blah"], json!("camilo"));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let bytes = serde_json::to_vec(&json!({
            "cart": { "$type": "shop.cart", "value": { "items": [] } }
        }))
        .unwrap();

        let result = serializer().deserialize(&bytes);
        assert!(matches!(result, Err(SerializeError::UnknownType(tag)) if tag == "shop.cart"));
    }

    #[test]
    fn test_invalid_tagged_payload_is_rejected() {
        let bytes = serde_json::to_vec(&json!({
            "profile": { "$type": "test.profile", "value": { "name": 7 } }
        }))
        .unwrap();

        let result = serializer().deserialize(&bytes);
        assert!(matches!(result, Err(SerializeError::InvalidValue { .. })));
    }

    #[test]
    fn test_corrupt_bytes_fail_to_decode() {
        let result = serializer().deserialize(b"{not json");
        assert!(matches!(result, Err(SerializeError::Decode(_))));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = TypeRegistry::new();
        registry.register::<Profile>().unwrap();

        let result = registry.register::<OtherProfile>();
        assert!(matches!(result, Err(SerializeError::DuplicateTag(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregistered_type_cannot_be_tagged() {
        let serializer = Serializer::default();
        let result = serializer.to_tagged(&Profile {
            name: "x".to_string(),
            visits: 0,
        });
        assert!(matches!(result, Err(SerializeError::UnknownType(_))));
    }

    #[test]
    fn test_plain_value_may_not_look_like_an_envelope() {
        let result = serializer().to_plain(&json!({ "$type": "test.profile", "value": 1 }));
        assert!(matches!(result, Err(SerializeError::ReservedField(_))));

        // Objects that merely contain the field are fine.
        let value = serializer()
            .to_plain(&json!({ "$type": "x", "value": 1, "extra": true }))
            .unwrap();
        assert!(unwrap_envelope(&value).is_none());
    }
}
