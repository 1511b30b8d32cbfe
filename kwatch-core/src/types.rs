//! Identity and change-notification types shared by every kwatch crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// The object kind a key, notification or binding belongs to (`pod`,
/// `deployment`, ...). Always stored lowercase so config lookups and bindings
/// agree regardless of how the kind was spelled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindTag(pub String);

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for KindTag {
    fn from(s: String) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

impl From<&str> for KindTag {
    fn from(s: &str) -> Self {
        Self(s.to_ascii_lowercase())
    }
}

/// Stable identity of an observed object within its kind.
///
/// Namespaced objects render as `namespace/name`, cluster-scoped objects as
/// `name`. An empty namespace is treated as cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_owned),
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => self.name.fmt(f),
        }
    }
}

/// Returned when a string cannot be parsed as an [`ObjectKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid object key '{0}': expected 'name' or 'namespace/name'")]
pub struct ParseKeyError(pub String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) if !name.is_empty() => Ok(Self::cluster(name)),
            (Some(ns), Some(name), None) if !name.is_empty() => Ok(Self::new(Some(ns), name)),
            _ => Err(ParseKeyError(s.to_owned())),
        }
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = ParseKeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ---------------------------------------------------------------------------
// Change kinds
// ---------------------------------------------------------------------------

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Fold a newer change into a pending one for the same key.
    ///
    /// The latest change wins, except that an object created and then
    /// updated before anyone saw it is still a creation.
    pub fn merge(self, newer: ChangeKind) -> ChangeKind {
        match (self, newer) {
            (ChangeKind::Created, ChangeKind::Updated) => ChangeKind::Created,
            (_, newer) => newer,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Created => write!(f, "created"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single detected change, as handed to a handler. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub key: ObjectKey,
    pub kind: ChangeKind,
    pub kind_tag: KindTag,
}

impl ChangeNotification {
    pub fn new(key: ObjectKey, kind: ChangeKind, kind_tag: KindTag) -> Self {
        Self {
            key,
            kind,
            kind_tag,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
