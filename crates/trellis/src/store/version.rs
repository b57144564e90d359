//! Content-addressed row versions.
//!
//! A row's `version` is a checksum of its JSON form with meta fields
//! stripped, rendered as a UUID: SHA-1 (UUID v5) by default, MD5
//! (UUID v3) or a random UUID selectable. Equal non-meta fields yield
//! equal versions on both sides of the link, which is what the sync
//! protocol's idempotence checks rely on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use trellis_api::{Error, Result, META_FIELDS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionAlgorithm {
    #[default]
    Sha1,
    Md5,
    Uuid,
}

impl VersionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionAlgorithm::Sha1 => "sha1",
            VersionAlgorithm::Md5 => "md5",
            VersionAlgorithm::Uuid => "uuid",
        }
    }
}

impl fmt::Display for VersionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha1" => Ok(VersionAlgorithm::Sha1),
            "md5" => Ok(VersionAlgorithm::Md5),
            "uuid" => Ok(VersionAlgorithm::Uuid),
            other => Err(Error::Config(format!("unknown version algorithm '{other}'"))),
        }
    }
}

/// Checksums an entity's JSON object form.
///
/// Meta fields and the nested `attributes` list are stripped first:
/// attributes are rows of their own with their own versions, and meta
/// fields must never feed back into the checksum they accompany.
pub fn entity_checksum(entity: &Map<String, Value>, algorithm: VersionAlgorithm) -> String {
    let mut entity = entity.clone();
    for field in META_FIELDS {
        entity.remove(*field);
    }
    entity.remove("attributes");

    let mut bytes = Vec::new();
    write_canonical(&Value::Object(entity), &mut bytes);

    match algorithm {
        VersionAlgorithm::Sha1 => Uuid::new_v5(&Uuid::nil(), &bytes).to_string(),
        VersionAlgorithm::Md5 => Uuid::new_v3(&Uuid::nil(), &bytes).to_string(),
        VersionAlgorithm::Uuid => Uuid::new_v4().to_string(),
    }
}

/// Checksums any serializable entity; the entity must serialize to a
/// JSON object.
pub fn checksum_of<T: Serialize>(entity: &T, algorithm: VersionAlgorithm) -> Result<String> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(entity_checksum(&map, algorithm)),
        Ok(_) => Err(Error::SerializationFailed(
            "entity did not serialize to a JSON object".into(),
        )),
        Err(e) => Err(Error::SerializationFailed(e.to_string())),
    }
}

// Canonical JSON: object keys sorted at every level, no whitespace.
// Checksums must not depend on serializer map ordering.
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(
                    serde_json::to_string(key).expect("string is serializable").as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[*key], out);
            }
            out.push(b'}');
        }
        Value::Array(values) => {
            out.push(b'[');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(v, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(
            serde_json::to_string(scalar)
                .expect("scalar is serializable")
                .as_bytes(),
        ),
    }
}
