//! Host instance document schema
//!
//! One row per running process of a customer's backend SDK. The ID is chosen
//! by the host at connect time. `status` is written by InitializeHost and by
//! the liveness supervisor. A host may reconnect to any replica, so every
//! status write is fenced by `owner_epoch`.

use bson::{doc, oid::ObjectId, DateTime, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for host instances
pub const HOST_INSTANCE_COLLECTION: &str = "host_instances";

/// Host instance status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Unknown,
    /// Connected and answering pings
    Online,
    /// Connected but the last ping failed
    Unreachable,
    /// Dropped by its supervisor or never reconnected
    Offline,
    /// Reserved for a graceful-shutdown hook; no broker path produces it
    ShuttingDown,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Unreachable => "unreachable",
            Self::Offline => "offline",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host instance document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct HostInstanceDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Identity chosen by the host process
    pub instance_id: String,

    pub organization_id: String,

    /// Credential the host authenticated with
    pub api_key_id: String,

    pub sdk_name: String,

    pub sdk_version: String,

    #[serde(default)]
    pub status: HostStatus,

    /// When `status` last changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<DateTime>,

    /// Connection that last initialized this host, as `<node_id>:<connection_id>`.
    /// Status writes from an older connection are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_epoch: Option<String>,
}

impl HostInstanceDoc {
    pub fn new(instance_id: String, organization_id: String, api_key_id: String) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            instance_id,
            organization_id,
            api_key_id,
            sdk_name: String::new(),
            sdk_version: String::new(),
            status: HostStatus::Unknown,
            status_changed_at: None,
            owner_epoch: None,
        }
    }

    /// Set the status, stamping the change time when it actually changes
    pub fn set_status(&mut self, status: HostStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Some(DateTime::now());
        }
        self.metadata.touch();
    }

    /// Whether a status write fenced by `owner` may apply to this row
    pub fn owned_by(&self, owner: Option<&str>) -> bool {
        match owner {
            Some(owner) => self.owner_epoch.as_deref() == Some(owner),
            None => true,
        }
    }
}

impl IntoIndexes for HostInstanceDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "instance_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("instance_id_unique".to_string())
                        .build(),
                ),
            ),
            // Candidate listing for host selection
            (
                doc! { "api_key_id": 1, "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("api_key_status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for HostInstanceDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
