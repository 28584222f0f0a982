//! In-process store used by dev mode and tests
//!
//! Transactions are serialised: `begin` takes the table lock for the life of
//! the transaction and works on a staged copy that `commit` writes back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Store, StoreTx};
use crate::db::schemas::{
    hash_api_key, ApiKeyDoc, HostInstanceDoc, HostStatus, Metadata, PageDoc, SessionDoc,
};
use crate::types::{PorticoError, Result};

#[derive(Debug, Clone, Default)]
struct Tables {
    api_keys: HashMap<String, ApiKeyDoc>,
    host_instances: HashMap<String, HostInstanceDoc>,
    /// Keyed by `(api_key_id, page_id)`
    pages: BTreeMap<(String, String), PageDoc>,
    sessions: HashMap<String, SessionDoc>,
}

fn page_key(api_key_id: &str, page_id: &str) -> (String, String) {
    (api_key_id.to_string(), page_id.to_string())
}

impl Tables {
    fn pages_for(&self, api_key_id: &str) -> Vec<PageDoc> {
        self.pages
            .values()
            .filter(|p| p.api_key_id == api_key_id)
            .cloned()
            .collect()
    }
}

/// Memory-backed [`Store`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an API key; returns its ID
    pub async fn seed_api_key(&self, api_key_id: &str, organization_id: &str, key: &str) -> String {
        let doc = ApiKeyDoc::new(
            api_key_id.to_string(),
            organization_id.to_string(),
            api_key_id.to_string(),
            key,
        );
        self.tables
            .lock()
            .await
            .api_keys
            .insert(api_key_id.to_string(), doc);
        api_key_id.to_string()
    }

    /// Insert a page directly, bypassing host reconciliation
    pub async fn seed_page(&self, page: PageDoc) {
        self.tables
            .lock()
            .await
            .pages
            .insert(page_key(&page.api_key_id, &page.page_id), page);
    }

    pub async fn session_count(&self) -> usize {
        self.tables.lock().await.sessions.len()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn api_key(&self, api_key_id: &str) -> Result<Option<ApiKeyDoc>> {
        Ok(self.tables.lock().await.api_keys.get(api_key_id).cloned())
    }

    async fn api_key_by_key(&self, presented: &str) -> Result<Option<ApiKeyDoc>> {
        let key_hash = hash_api_key(presented);
        Ok(self
            .tables
            .lock()
            .await
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash && k.is_active)
            .cloned())
    }

    async fn host_instance(&self, instance_id: &str) -> Result<Option<HostInstanceDoc>> {
        Ok(self
            .tables
            .lock()
            .await
            .host_instances
            .get(instance_id)
            .cloned())
    }

    async fn host_instances(&self, api_key_id: &str) -> Result<Vec<HostInstanceDoc>> {
        let tables = self.tables.lock().await;
        let mut hosts: Vec<HostInstanceDoc> = tables
            .host_instances
            .values()
            .filter(|h| h.api_key_id == api_key_id)
            .cloned()
            .collect();
        hosts.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(hosts)
    }

    async fn update_host_instance_status(
        &self,
        instance_id: &str,
        status: HostStatus,
        owner: Option<&str>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.host_instances.get_mut(instance_id) {
            Some(host) if host.owned_by(owner) => {
                host.set_status(status);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn page(&self, api_key_id: &str, page_id: &str) -> Result<Option<PageDoc>> {
        Ok(self
            .tables
            .lock()
            .await
            .pages
            .get(&page_key(api_key_id, page_id))
            .cloned())
    }

    async fn pages_by_id(&self, page_id: &str) -> Result<Vec<PageDoc>> {
        Ok(self
            .tables
            .lock()
            .await
            .pages
            .values()
            .filter(|p| p.page_id == page_id)
            .cloned()
            .collect())
    }

    async fn pages(&self, api_key_id: &str) -> Result<Vec<PageDoc>> {
        Ok(self.tables.lock().await.pages_for(api_key_id))
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionDoc>> {
        Ok(self.tables.lock().await.sessions.get(session_id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait::async_trait]
impl StoreTx for MemoryTx {
    async fn host_instance(&mut self, instance_id: &str) -> Result<Option<HostInstanceDoc>> {
        Ok(self.staged.host_instances.get(instance_id).cloned())
    }

    async fn insert_host_instance(&mut self, mut host: HostInstanceDoc) -> Result<()> {
        if self.staged.host_instances.contains_key(&host.instance_id) {
            return Err(PorticoError::Database(format!(
                "Duplicate host instance {}",
                host.instance_id
            )));
        }
        host.metadata = Metadata::new();
        self.staged
            .host_instances
            .insert(host.instance_id.clone(), host);
        Ok(())
    }

    async fn update_host_instance(&mut self, mut host: HostInstanceDoc) -> Result<()> {
        match self.staged.host_instances.get_mut(&host.instance_id) {
            Some(existing) => {
                host.metadata.touch();
                *existing = host;
                Ok(())
            }
            None => Err(PorticoError::NotFound(format!(
                "Host instance {}",
                host.instance_id
            ))),
        }
    }

    async fn pages(&mut self, api_key_id: &str) -> Result<Vec<PageDoc>> {
        Ok(self.staged.pages_for(api_key_id))
    }

    async fn insert_pages(&mut self, pages: Vec<PageDoc>) -> Result<()> {
        for mut page in pages {
            let key = page_key(&page.api_key_id, &page.page_id);
            if self.staged.pages.contains_key(&key) {
                return Err(PorticoError::Database(format!(
                    "Duplicate page {}",
                    page.page_id
                )));
            }
            page.metadata = Metadata::new();
            self.staged.pages.insert(key, page);
        }
        Ok(())
    }

    async fn update_pages(&mut self, pages: Vec<PageDoc>) -> Result<()> {
        for mut page in pages {
            let existing = self
                .staged
                .pages
                .get_mut(&page_key(&page.api_key_id, &page.page_id))
                .ok_or_else(|| PorticoError::NotFound(format!("Page {}", page.page_id)))?;
            page.metadata.touch();
            *existing = page;
        }
        Ok(())
    }

    async fn delete_pages(&mut self, api_key_id: &str, page_ids: Vec<String>) -> Result<()> {
        for page_id in page_ids {
            self.staged.pages.remove(&page_key(api_key_id, &page_id));
        }
        Ok(())
    }

    async fn session(&mut self, session_id: &str) -> Result<Option<SessionDoc>> {
        Ok(self.staged.sessions.get(session_id).cloned())
    }

    async fn insert_session(&mut self, mut session: SessionDoc) -> Result<()> {
        if self.staged.sessions.contains_key(&session.session_id) {
            return Err(PorticoError::Database(format!(
                "Duplicate session {}",
                session.session_id
            )));
        }
        session.metadata = Metadata::new();
        self.staged
            .sessions
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn delete_session(&mut self, session_id: &str) -> Result<bool> {
        Ok(self.staged.sessions.remove(session_id).is_some())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
