//! The accessor capability every observed object type must provide.
//!
//! The engine never inspects concrete object types. Whatever a source adapter
//! produces only has to say where it lives, what it is called, when it was
//! created and which revision it is.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ObjectKey;

/// Uniform metadata access for observed objects.
pub trait Resource: Clone + Send + Sync + 'static {
    fn namespace(&self) -> Option<&str>;

    fn name(&self) -> &str;

    /// When the object was created on the remote side, if known.
    fn creation_timestamp(&self) -> Option<DateTime<Utc>>;

    /// Opaque revision marker; changes whenever the object changes.
    fn resource_version(&self) -> &str;

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

/// A schemaless object: metadata plus an arbitrary JSON payload.
///
/// Used by fixture replay and by callers that do not want a typed model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl GenericObject {
    pub fn new(namespace: Option<&str>, name: &str, resource_version: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_owned),
            name: name.to_owned(),
            resource_version: resource_version.to_owned(),
            created_at: None,
            labels: BTreeMap::new(),
            data: serde_json::Value::Null,
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

impl Resource for GenericObject {
    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn creation_timestamp(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn resource_version(&self) -> &str {
        &self.resource_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derives_from_metadata() {
        let obj = GenericObject::new(Some("ns"), "a", "1");
        assert_eq!(obj.key(), ObjectKey::namespaced("ns", "a"));

        let cluster = GenericObject::new(None, "node", "1");
        assert_eq!(cluster.key().to_string(), "node");
    }

    #[test]
    fn generic_object_parses_minimal_yaml() {
        let obj: GenericObject =
            serde_yaml::from_str("name: web\nnamespace: prod\nresource_version: \"7\"\n")
                .expect("parse");
        assert_eq!(obj.key().to_string(), "prod/web");
        assert_eq!(obj.resource_version(), "7");
        assert!(obj.creation_timestamp().is_none());
    }

    #[test]
    fn payload_survives_json_round_trip() {
        let obj = GenericObject::new(Some("prod"), "web", "3")
            .with_data(serde_json::json!({"replicas": 3, "image": "web:1.2"}));
        let json = serde_json::to_string(&obj).expect("serialize");
        let back: GenericObject = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, obj);
        assert_eq!(back.data["replicas"], 3);

        let bare = serde_json::to_value(GenericObject::new(None, "node", "1")).expect("serialize");
        assert!(bare.get("data").is_none());
    }
}
