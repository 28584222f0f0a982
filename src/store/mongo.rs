//! MongoDB-backed store
//!
//! Multi-document writes run inside a `ClientSession` transaction, so the
//! deployment must be a replica set. Dropping a `MongoTx` without commit
//! lets the driver abort the transaction.

use bson::{doc, DateTime};
use mongodb::ClientSession;
use tracing::debug;

use super::{Store, StoreTx};
use crate::db::schemas::{
    hash_api_key, ApiKeyDoc, HostInstanceDoc, HostStatus, PageDoc, SessionDoc,
    API_KEY_COLLECTION, HOST_INSTANCE_COLLECTION, PAGE_COLLECTION, SESSION_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::types::{PorticoError, Result};

#[derive(Clone)]
struct Collections {
    api_keys: MongoCollection<ApiKeyDoc>,
    host_instances: MongoCollection<HostInstanceDoc>,
    pages: MongoCollection<PageDoc>,
    sessions: MongoCollection<SessionDoc>,
}

/// [`Store`] over the four broker collections
#[derive(Clone)]
pub struct MongoStore {
    client: MongoClient,
    collections: Collections,
}

impl MongoStore {
    /// Open every collection, creating indexes as needed
    pub async fn new(client: MongoClient) -> Result<Self> {
        let collections = Collections {
            api_keys: client.collection(API_KEY_COLLECTION).await?,
            host_instances: client.collection(HOST_INSTANCE_COLLECTION).await?,
            pages: client.collection(PAGE_COLLECTION).await?,
            sessions: client.collection(SESSION_COLLECTION).await?,
        };
        Ok(Self {
            client,
            collections,
        })
    }
}

#[async_trait::async_trait]
impl Store for MongoStore {
    async fn api_key(&self, api_key_id: &str) -> Result<Option<ApiKeyDoc>> {
        self.collections
            .api_keys
            .find_one(doc! { "api_key_id": api_key_id })
            .await
    }

    async fn api_key_by_key(&self, presented: &str) -> Result<Option<ApiKeyDoc>> {
        self.collections
            .api_keys
            .find_one(doc! { "key_hash": hash_api_key(presented), "is_active": true })
            .await
    }

    async fn host_instance(&self, instance_id: &str) -> Result<Option<HostInstanceDoc>> {
        self.collections
            .host_instances
            .find_one(doc! { "instance_id": instance_id })
            .await
    }

    async fn host_instances(&self, api_key_id: &str) -> Result<Vec<HostInstanceDoc>> {
        self.collections
            .host_instances
            .find_many(doc! { "api_key_id": api_key_id })
            .await
    }

    async fn update_host_instance_status(
        &self,
        instance_id: &str,
        status: HostStatus,
        owner: Option<&str>,
    ) -> Result<bool> {
        let now = DateTime::now();
        let mut filter = doc! { "instance_id": instance_id };
        if let Some(owner) = owner {
            filter.insert("owner_epoch", owner);
        }
        let matched = self
            .collections
            .host_instances
            .update_one(
                filter,
                doc! {
                    "$set": {
                        "status": status.as_str(),
                        "status_changed_at": now,
                        "metadata.updated_at": now,
                    }
                },
            )
            .await?;
        debug!(host_instance_id = %instance_id, status = %status, matched, "Host status written");
        Ok(matched > 0)
    }

    async fn page(&self, api_key_id: &str, page_id: &str) -> Result<Option<PageDoc>> {
        self.collections
            .pages
            .find_one(doc! { "api_key_id": api_key_id, "page_id": page_id })
            .await
    }

    async fn pages_by_id(&self, page_id: &str) -> Result<Vec<PageDoc>> {
        self.collections
            .pages
            .find_many(doc! { "page_id": page_id })
            .await
    }

    async fn pages(&self, api_key_id: &str) -> Result<Vec<PageDoc>> {
        self.collections
            .pages
            .find_many(doc! { "api_key_id": api_key_id })
            .await
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionDoc>> {
        self.collections
            .sessions
            .find_one(doc! { "session_id": session_id })
            .await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let session = self.client.begin_transaction().await?;
        Ok(Box::new(MongoTx {
            session,
            collections: self.collections.clone(),
        }))
    }
}

struct MongoTx {
    session: ClientSession,
    collections: Collections,
}

#[async_trait::async_trait]
impl StoreTx for MongoTx {
    async fn host_instance(&mut self, instance_id: &str) -> Result<Option<HostInstanceDoc>> {
        self.collections
            .host_instances
            .find_one_in(&mut self.session, doc! { "instance_id": instance_id })
            .await
    }

    async fn insert_host_instance(&mut self, host: HostInstanceDoc) -> Result<()> {
        self.collections
            .host_instances
            .insert_many_in(&mut self.session, vec![host])
            .await
    }

    async fn update_host_instance(&mut self, host: HostInstanceDoc) -> Result<()> {
        let filter = doc! { "instance_id": &host.instance_id };
        let instance_id = host.instance_id.clone();
        let matched = self
            .collections
            .host_instances
            .replace_one_in(&mut self.session, filter, host)
            .await?;
        if matched == 0 {
            return Err(PorticoError::NotFound(format!("Host instance {}", instance_id)));
        }
        Ok(())
    }

    async fn pages(&mut self, api_key_id: &str) -> Result<Vec<PageDoc>> {
        self.collections
            .pages
            .find_many_in(&mut self.session, doc! { "api_key_id": api_key_id })
            .await
    }

    async fn insert_pages(&mut self, pages: Vec<PageDoc>) -> Result<()> {
        self.collections
            .pages
            .insert_many_in(&mut self.session, pages)
            .await
    }

    async fn update_pages(&mut self, pages: Vec<PageDoc>) -> Result<()> {
        for page in pages {
            let filter = doc! { "api_key_id": &page.api_key_id, "page_id": &page.page_id };
            let page_id = page.page_id.clone();
            let matched = self
                .collections
                .pages
                .replace_one_in(&mut self.session, filter, page)
                .await?;
            if matched == 0 {
                return Err(PorticoError::NotFound(format!("Page {}", page_id)));
            }
        }
        Ok(())
    }

    async fn delete_pages(&mut self, api_key_id: &str, page_ids: Vec<String>) -> Result<()> {
        if page_ids.is_empty() {
            return Ok(());
        }
        self.collections
            .pages
            .delete_many_in(
                &mut self.session,
                doc! { "api_key_id": api_key_id, "page_id": { "$in": page_ids } },
            )
            .await?;
        Ok(())
    }

    async fn session(&mut self, session_id: &str) -> Result<Option<SessionDoc>> {
        self.collections
            .sessions
            .find_one_in(&mut self.session, doc! { "session_id": session_id })
            .await
    }

    async fn insert_session(&mut self, session: SessionDoc) -> Result<()> {
        self.collections
            .sessions
            .insert_many_in(&mut self.session, vec![session])
            .await
    }

    async fn delete_session(&mut self, session_id: &str) -> Result<bool> {
        let deleted = self
            .collections
            .sessions
            .delete_many_in(&mut self.session, doc! { "session_id": session_id })
            .await?;
        Ok(deleted > 0)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.session
            .commit_transaction()
            .await
            .map_err(|e| PorticoError::Database(format!("Commit failed: {}", e)))
    }
}
