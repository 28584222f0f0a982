//! Session document schema
//!
//! Binds one client attachment to one page and one host instance. Sessions
//! are hard-deleted on CloseSession.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for sessions
pub const SESSION_COLLECTION: &str = "sessions";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SessionDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    pub session_id: String,

    pub organization_id: String,

    pub user_id: String,

    pub api_key_id: String,

    pub page_id: String,

    pub host_instance_id: String,
}

impl SessionDoc {
    pub fn new(
        session_id: String,
        organization_id: String,
        user_id: String,
        api_key_id: String,
        page_id: String,
        host_instance_id: String,
    ) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            session_id,
            organization_id,
            user_id,
            api_key_id,
            page_id,
            host_instance_id,
        }
    }
}

impl IntoIndexes for SessionDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "session_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("session_id_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "host_instance_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("host_instance_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for SessionDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
