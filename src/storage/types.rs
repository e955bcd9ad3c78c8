//! type-safe wrapper around git object ids for the object layer.

use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;

use git2::{ObjectType, Oid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A content-addressed reference to an immutable block of bytes.
///
/// The address is the git blob hash of the content, so the same bytes always
/// produce the same reference no matter which object store holds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub(crate) Oid);

impl ObjectRef {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// raw Oid (for internal use only)
    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// compute the reference the given bytes would be stored under
    pub fn for_content(bytes: &[u8]) -> Result<Self, git2::Error> {
        Oid::hash_object(ObjectType::Blob, bytes).map(ObjectRef)
    }

    /// parse an ObjectRef from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(ObjectRef)
    }

    /// short form of the reference
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectRef {
    type Err = git2::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_address_is_stable() {
        let a = ObjectRef::for_content(b"hello").unwrap();
        let b = ObjectRef::for_content(b"hello").unwrap();
        let c = ObjectRef::for_content(b"world").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        // git's well-known blob hash for "hello"
        assert_eq!(a.to_string(), "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0");
        assert_eq!(a.short(), "b6fc4c6");
    }

    #[test]
    fn test_serde_as_hex() {
        let r = ObjectRef::for_content(b"hello").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0\"");
        let back: ObjectRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ObjectRef::from_hex("not-hex").is_err());
        assert!("b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0".parse::<ObjectRef>().is_ok());
    }
}
