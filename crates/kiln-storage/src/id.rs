use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::StorageError;

/// SHA-256 content hash identifying a blob in an [`ObjectStore`](crate::ObjectStore).
///
/// The all-zero id is reserved as the "empty" sentinel returned when an input
/// cannot be resolved. It never matches a real hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; ObjectId::LEN]);

impl ObjectId {
  pub const LEN: usize = 32;

  pub const EMPTY: ObjectId = ObjectId([0; ObjectId::LEN]);

  pub const fn from_raw(bytes: [u8; ObjectId::LEN]) -> Self {
    Self(bytes)
  }

  /// Hash a blob.
  pub fn of(data: &[u8]) -> Self {
    let mut builder = ObjectIdBuilder::new();
    builder.update(data);
    builder.finish()
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::EMPTY
  }

  pub fn as_bytes(&self) -> &[u8; ObjectId::LEN] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in &self.0 {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Debug for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ObjectId({})", self)
  }
}

impl FromStr for ObjectId {
  type Err = StorageError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || StorageError::InvalidObjectId {
      value: s.to_string(),
    };

    if s.len() != ObjectId::LEN * 2 || !s.is_ascii() {
      return Err(invalid());
    }

    let mut bytes = [0u8; ObjectId::LEN];
    for (i, byte) in bytes.iter_mut().enumerate() {
      *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(Self(bytes))
  }
}

impl Serialize for ObjectId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ObjectId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
  }
}

/// Incremental hasher producing an [`ObjectId`].
///
/// Variable-length fields are length-prefixed so that adjacent fields cannot
/// alias each other.
#[derive(Clone, Default)]
pub struct ObjectIdBuilder {
  hasher: Sha256,
}

impl ObjectIdBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed raw bytes.
  pub fn update(&mut self, data: &[u8]) -> &mut Self {
    self.hasher.update(data);
    self
  }

  /// Feed a length-prefixed string.
  pub fn write_str(&mut self, value: &str) -> &mut Self {
    self.hasher.update((value.len() as u64).to_le_bytes());
    self.hasher.update(value.as_bytes());
    self
  }

  pub fn write_u32(&mut self, value: u32) -> &mut Self {
    self.hasher.update(value.to_le_bytes());
    self
  }

  pub fn write_id(&mut self, id: &ObjectId) -> &mut Self {
    self.hasher.update(id.as_bytes());
    self
  }

  pub fn finish(self) -> ObjectId {
    ObjectId(self.hasher.finalize().into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hex_parse_roundtrip() {
    let id = ObjectId::of(b"hello");
    let parsed: ObjectId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(
      id.to_string(),
      "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
  }

  #[test]
  fn test_invalid_hex_rejected() {
    assert!("abc".parse::<ObjectId>().is_err());
    assert!("zz".repeat(32).parse::<ObjectId>().is_err());
  }

  #[test]
  fn test_empty_sentinel() {
    assert!(ObjectId::EMPTY.is_empty());
    assert!(!ObjectId::of(b"").is_empty());
  }

  #[test]
  fn test_length_prefix_prevents_aliasing() {
    let mut a = ObjectIdBuilder::new();
    a.write_str("ab").write_str("c");
    let mut b = ObjectIdBuilder::new();
    b.write_str("a").write_str("bc");
    assert_ne!(a.finish(), b.finish());
  }
}
