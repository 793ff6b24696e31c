use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::{Uuid, Variant, Version};

/// Why a basket key was rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("basket key is not a UUID: {0}")]
    Malformed(String),
    #[error("basket key is not a version-4 UUID: {0}")]
    WrongVersion(String),
}

/// Client-supplied basket identifier. Always a canonical (lower-case,
/// hyphenated) RFC 4122 version-4 UUID.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BasketKey(String);

impl BasketKey {
    /// Validate and canonicalize a raw key.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let uuid = Uuid::parse_str(raw.trim()).map_err(|_| KeyError::Malformed(raw.to_owned()))?;
        if uuid.get_version() != Some(Version::Random) || uuid.get_variant() != Variant::RFC4122 {
            return Err(KeyError::WrongVersion(raw.to_owned()));
        }
        Ok(Self(uuid.hyphenated().to_string()))
    }

    /// Fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BasketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BasketKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for BasketKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for BasketKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Row id of an item. Serialized as a bare integer.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope identifier chosen by whoever sends the message.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V4: &str = "3f2504e0-4f89-41d3-9a0c-0305e82c3301";

    #[test]
    fn accepts_v4() {
        let key = BasketKey::parse(V4).unwrap();
        assert_eq!(key.as_str(), V4);
    }

    #[test]
    fn canonicalizes_case() {
        let key = BasketKey::parse(&V4.to_uppercase()).unwrap();
        assert_eq!(key.as_str(), V4);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(BasketKey::parse("sample-basket"), Err(KeyError::Malformed(_))));
        assert!(matches!(BasketKey::parse(""), Err(KeyError::Malformed(_))));
    }

    #[test]
    fn rejects_other_versions() {
        let v7 = Uuid::now_v7().to_string();
        assert!(matches!(BasketKey::parse(&v7), Err(KeyError::WrongVersion(_))));

        // version 1
        let v1 = "c232ab00-9414-11ec-b3c8-9e6bdeced846";
        assert!(matches!(BasketKey::parse(v1), Err(KeyError::WrongVersion(_))));

        // version nibble 4 but NCS variant
        let bad_variant = "3f2504e0-4f89-41d3-0a0c-0305e82c3301";
        assert!(matches!(BasketKey::parse(bad_variant), Err(KeyError::WrongVersion(_))));
    }

    #[test]
    fn generated_keys_validate() {
        let key = BasketKey::generate();
        assert!(BasketKey::parse(key.as_str()).is_ok());
        assert_ne!(key, BasketKey::generate());
    }

    #[test]
    fn deserialize_validates() {
        let ok: Result<BasketKey, _> = serde_json::from_str(&format!("\"{V4}\""));
        assert!(ok.is_ok());
        let bad: Result<BasketKey, _> = serde_json::from_str("\"not-a-key\"");
        assert!(bad.is_err());
    }

    #[test]
    fn item_id_is_bare_integer() {
        assert_eq!(serde_json::to_string(&ItemId(42)).unwrap(), "42");
    }

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
        assert_eq!(MessageId::from_raw("m-1").as_str(), "m-1");
    }
}
