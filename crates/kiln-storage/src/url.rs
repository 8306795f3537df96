use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::StorageError;

/// Where a logical path lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UrlType {
  /// A file on disk, hashed through the version tracker.
  File,
  /// An object produced earlier in the same build.
  Internal,
  /// A path under a mounted virtual provider.
  Virtual,
}

impl UrlType {
  pub fn scheme(&self) -> &'static str {
    match self {
      UrlType::File => "file",
      UrlType::Internal => "internal",
      UrlType::Virtual => "virtual",
    }
  }
}

/// Typed logical path identifying a build input or output.
///
/// Rendered as `<scheme>:<path>`, e.g. `internal:/textures/stone`. The string
/// form is also the serialized form so urls can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectUrl {
  pub url_type: UrlType,
  pub path: String,
}

impl ObjectUrl {
  pub fn new(url_type: UrlType, path: impl Into<String>) -> Self {
    Self {
      url_type,
      path: path.into(),
    }
  }

  pub fn file(path: impl Into<String>) -> Self {
    Self::new(UrlType::File, path)
  }

  pub fn internal(path: impl Into<String>) -> Self {
    Self::new(UrlType::Internal, path)
  }

  pub fn virtual_path(path: impl Into<String>) -> Self {
    Self::new(UrlType::Virtual, path)
  }
}

impl fmt::Display for ObjectUrl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.url_type.scheme(), self.path)
  }
}

impl FromStr for ObjectUrl {
  type Err = StorageError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || StorageError::InvalidUrl {
      value: s.to_string(),
    };

    let (scheme, path) = s.split_once(':').ok_or_else(invalid)?;
    let url_type = match scheme {
      "file" => UrlType::File,
      "internal" => UrlType::Internal,
      "virtual" => UrlType::Virtual,
      _ => return Err(invalid()),
    };
    if path.is_empty() {
      return Err(invalid());
    }
    Ok(Self::new(url_type, path))
  }
}

impl Serialize for ObjectUrl {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for ObjectUrl {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  #[test]
  fn test_parse_keeps_colons_in_path() {
    let url: ObjectUrl = "file:C:/assets/a.png".parse().unwrap();
    assert_eq!(url.url_type, UrlType::File);
    assert_eq!(url.path, "C:/assets/a.png");
  }

  #[test]
  fn test_unknown_scheme_rejected() {
    assert!("http://x".parse::<ObjectUrl>().is_err());
    assert!("internal:".parse::<ObjectUrl>().is_err());
    assert!("no-scheme".parse::<ObjectUrl>().is_err());
  }

  #[test]
  fn test_url_as_json_map_key() {
    let mut map = BTreeMap::new();
    map.insert(ObjectUrl::internal("/a"), 1);
    let json = serde_json::to_string(&map).unwrap();
    assert_eq!(json, r#"{"internal:/a":1}"#);
    let back: BTreeMap<ObjectUrl, i32> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, map);
  }
}
