//! Object keys and the placeholder naming convention.
//!
//! Keys are always `/`-separated, relative (no leading `/`) and free of `..`,
//! empty segments, backslashes and control characters. Directory prefixes are
//! plain strings ending in `/` and are not represented by [`ObjectKey`].

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Prefix shared by every placeholder object name.
pub const PLACEHOLDER_PREFIX: &str = ".keep";

/// Prefix of in-flight writes on disk; never listed.
pub const TEMP_PREFIX: &str = ".tmp-";

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid object key `{0}`")]
pub struct InvalidKey(pub String);

/// A validated key of a stored blob, e.g. `t1/reports/q1.csv`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Validate a raw key.
    ///
    /// Rejects keys that are empty, too long, absolute, contain `.`/`..` or
    /// empty segments, backslashes or control characters.
    pub fn parse(raw: &str) -> Result<Self, InvalidKey> {
        let invalid = || InvalidKey(raw.to_string());

        if raw.is_empty() || raw.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return Err(invalid());
        }
        if raw
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        file_name_of(&self.0)
    }

    /// Directory prefix holding this key, with trailing `/` (empty at top level).
    pub fn parent_prefix(&self) -> &str {
        match self.0.rfind('/') {
            Some(pos) => &self.0[..=pos],
            None => "",
        }
    }

    pub fn is_placeholder(&self) -> bool {
        is_placeholder_key(&self.0)
    }

    /// Mint a fresh placeholder key inside `dir_prefix` (which must end in `/`).
    pub fn placeholder_in(dir_prefix: &str) -> Result<Self, InvalidKey> {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::parse(&format!("{}{}_{}", dir_prefix, PLACEHOLDER_PREFIX, &suffix[..8]))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Last `/`-separated segment of a key or path.
pub fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// True when the key's final segment is a placeholder marker.
pub fn is_placeholder_key(key: &str) -> bool {
    file_name_of(key).starts_with(PLACEHOLDER_PREFIX)
}

/// Lower-cased extension without the dot, or an empty string.
pub fn file_type_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_nested_keys() {
        let key = ObjectKey::parse("t1/reports/q1.csv").unwrap();
        assert_eq!(key.file_name(), "q1.csv");
        assert_eq!(key.parent_prefix(), "t1/reports/");
        assert!(!key.is_placeholder());
    }

    #[test]
    fn parse_rejects_traversal_and_malformed_keys() {
        for raw in [
            "",
            "/abs/key",
            "dir/",
            "a//b",
            "a/../b",
            "a/./b",
            "..",
            "a\\b",
            "a/b\u{7}",
        ] {
            assert!(ObjectKey::parse(raw).is_err(), "accepted {raw:?}");
        }
        assert!(ObjectKey::parse(&"x".repeat(MAX_OBJECT_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn invalid_key_names_the_key() {
        let err = ObjectKey::parse("a//b").unwrap_err();
        assert_eq!(err, InvalidKey("a//b".into()));
        assert_eq!(err.to_string(), "invalid object key `a//b`");
    }

    #[test]
    fn placeholders_get_unique_hex_suffixes() {
        let a = ObjectKey::placeholder_in("t1/docs/").unwrap();
        let b = ObjectKey::placeholder_in("t1/docs/").unwrap();
        assert_ne!(a, b);
        assert!(a.is_placeholder());
        assert_eq!(a.parent_prefix(), "t1/docs/");
        let suffix = a.file_name().strip_prefix(".keep_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn file_type_uses_last_extension() {
        assert_eq!(file_type_of("q1.CSV"), "csv");
        assert_eq!(file_type_of("archive.tar.gz"), "gz");
        assert_eq!(file_type_of("README"), "");
        assert_eq!(file_type_of(".bashrc"), "");
    }
}
