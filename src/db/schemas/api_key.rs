//! API key document schema
//!
//! Keys are issued by the management API (not part of this service); the
//! broker only reads them to authenticate hosts and scope pages.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for API keys
pub const API_KEY_COLLECTION: &str = "api_keys";

/// API key document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ApiKeyDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Stable identifier referenced by pages, hosts and sessions
    pub api_key_id: String,

    /// Owning organization
    pub organization_id: String,

    /// Human-readable name for the key
    pub name: String,

    /// SHA-256 hex digest of the plaintext key
    pub key_hash: String,

    /// Whether the key is active
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Digest used to look a presented key up without storing it
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

impl ApiKeyDoc {
    /// Create a new API key document from a plaintext key
    pub fn new(api_key_id: String, organization_id: String, name: String, key: &str) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            api_key_id,
            organization_id,
            name,
            key_hash: hash_api_key(key),
            is_active: true,
        }
    }
}

impl IntoIndexes for ApiKeyDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "api_key_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("api_key_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "key_hash": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("key_hash_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ApiKeyDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
