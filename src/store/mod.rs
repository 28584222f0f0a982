//! Persistence collaborators consumed by the protocol handler
//!
//! `Store` covers single-row reads and the liveness status write. Multi-row
//! writes go through a `StoreTx` obtained from [`Store::begin`]; dropping a
//! transaction without calling `commit` rolls it back.

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::db::schemas::{ApiKeyDoc, HostInstanceDoc, HostStatus, PageDoc, SessionDoc};
use crate::types::Result;

// ============================================================================
// Store Traits (for dependency injection)
// ============================================================================

/// Read access plus the asynchronous host status update
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// API key by its stable ID
    async fn api_key(&self, api_key_id: &str) -> Result<Option<ApiKeyDoc>>;

    /// API key by the plaintext key a host presented
    async fn api_key_by_key(&self, presented: &str) -> Result<Option<ApiKeyDoc>>;

    async fn host_instance(&self, instance_id: &str) -> Result<Option<HostInstanceDoc>>;

    /// Every host instance that authenticated with this key
    async fn host_instances(&self, api_key_id: &str) -> Result<Vec<HostInstanceDoc>>;

    /// Set a host's status. With `owner` given, only a row whose
    /// `owner_epoch` still equals it is written. Returns false when nothing
    /// matched.
    async fn update_host_instance_status(
        &self,
        instance_id: &str,
        status: HostStatus,
        owner: Option<&str>,
    ) -> Result<bool>;

    /// Page declared under one API key
    async fn page(&self, api_key_id: &str, page_id: &str) -> Result<Option<PageDoc>>;

    /// Every page declared under this ID, across API keys
    async fn pages_by_id(&self, page_id: &str) -> Result<Vec<PageDoc>>;

    async fn pages(&self, api_key_id: &str) -> Result<Vec<PageDoc>>;

    async fn session(&self, session_id: &str) -> Result<Option<SessionDoc>>;

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// Transaction-scoped reads and writes
#[async_trait::async_trait]
pub trait StoreTx: Send {
    async fn host_instance(&mut self, instance_id: &str) -> Result<Option<HostInstanceDoc>>;

    async fn insert_host_instance(&mut self, host: HostInstanceDoc) -> Result<()>;

    /// Replace the row with the same `instance_id`
    async fn update_host_instance(&mut self, host: HostInstanceDoc) -> Result<()>;

    async fn pages(&mut self, api_key_id: &str) -> Result<Vec<PageDoc>>;

    async fn insert_pages(&mut self, pages: Vec<PageDoc>) -> Result<()>;

    /// Replace each row with the same `(api_key_id, page_id)`
    async fn update_pages(&mut self, pages: Vec<PageDoc>) -> Result<()>;

    async fn delete_pages(&mut self, api_key_id: &str, page_ids: Vec<String>) -> Result<()>;

    async fn session(&mut self, session_id: &str) -> Result<Option<SessionDoc>>;

    async fn insert_session(&mut self, session: SessionDoc) -> Result<()>;

    /// Hard delete. Returns false when the row was already gone.
    async fn delete_session(&mut self, session_id: &str) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
