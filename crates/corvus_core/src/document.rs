//! Documents and their versioning metadata.

use crate::types::{Etag, TxId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored document: an opaque payload plus versioning metadata.
///
/// The store never interprets `data` except when feeding index map
/// functions, which see it parsed as JSON with the document key injected
/// under [`crate::types::DOCUMENT_ID_FIELD`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Unique key within the database.
    pub key: String,
    /// Current version tag, replaced on every successful write.
    pub etag: Etag,
    /// Opaque payload bytes.
    #[serde(with = "serde_bytes_b64")]
    pub data: Vec<u8>,
    /// Caller-supplied metadata stored alongside the payload.
    pub metadata: serde_json::Map<String, Value>,
    /// Transaction currently holding a shadow write on this key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<TxId>,
}

impl Document {
    /// Creates a document with a fresh etag and no lock.
    #[must_use]
    pub fn new(key: impl Into<String>, data: Vec<u8>, metadata: serde_json::Map<String, Value>) -> Self {
        Self {
            key: key.into(),
            etag: Etag::generate(),
            data,
            metadata,
            locked_by: None,
        }
    }

    /// Parses the payload as JSON and injects the document key, producing
    /// the value handed to map functions.
    ///
    /// # Errors
    ///
    /// Returns the parse error when the payload is not valid JSON.
    pub fn to_indexable(&self) -> serde_json::Result<Value> {
        let mut value: Value = serde_json::from_slice(&self.data)?;
        if let Value::Object(ref mut map) = value {
            map.insert(
                crate::types::DOCUMENT_ID_FIELD.to_string(),
                Value::String(self.key.clone()),
            );
        }
        Ok(value)
    }
}

/// Outcome of a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Key the document was stored under, generated when absent.
    pub key: String,
    /// Etag assigned to the new version.
    pub etag: Etag,
}

/// Base64 representation for payload bytes inside JSON log records.
mod serde_bytes_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_has_no_lock() {
        let doc = Document::new("users/1", b"{}".to_vec(), serde_json::Map::new());
        assert!(doc.locked_by.is_none());
        assert_eq!(doc.key, "users/1");
    }

    #[test]
    fn indexable_value_carries_document_id() {
        let doc = Document::new("users/1", br#"{"name":"marta"}"#.to_vec(), serde_json::Map::new());
        let value = doc.to_indexable().unwrap();
        assert_eq!(value["__document_id"], "users/1");
        assert_eq!(value["name"], "marta");
    }

    #[test]
    fn non_json_payload_fails_to_index() {
        let doc = Document::new("blobs/1", vec![0xff, 0xfe], serde_json::Map::new());
        assert!(doc.to_indexable().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let mut meta = serde_json::Map::new();
        meta.insert("owner".into(), Value::String("corvus".into()));
        let doc = Document::new("k", vec![1, 2, 3], meta);
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
