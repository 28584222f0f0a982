//! Page document schema
//!
//! The page set for an API key is whatever its hosts most recently declared;
//! it is reconciled on every InitializeHost. Page IDs are only unique within
//! one API key.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for pages
pub const PAGE_COLLECTION: &str = "pages";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PageDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Identifier declared by the host
    pub page_id: String,

    pub api_key_id: String,

    pub organization_id: String,

    pub name: String,

    pub route: String,

    /// Position vector used for navigation ordering
    #[serde(default)]
    pub path: Vec<i32>,
}

impl PageDoc {
    /// True when the host-declared fields match
    pub fn same_declaration(&self, other: &PageDoc) -> bool {
        self.name == other.name && self.route == other.route && self.path == other.path
    }
}

impl IntoIndexes for PageDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "api_key_id": 1, "page_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("api_key_page_unique".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "page_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("page_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for PageDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
