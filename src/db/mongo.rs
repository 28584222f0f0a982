//! MongoDB client and typed collection wrapper

use bson::{doc, Document};
use futures_util::TryStreamExt;
use mongodb::{options::IndexOptions, Client, ClientSession, Collection, IndexModel};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::db::schemas::Metadata;
use crate::types::{PorticoError, Result};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and verify the deployment answers a ping
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast instead of hanging on an unreachable deployment
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| PorticoError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| PorticoError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection, creating its indexes
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    /// Start a session with an open transaction
    pub async fn begin_transaction(&self) -> Result<ClientSession> {
        let mut session = self
            .client
            .start_session()
            .await
            .map_err(|e| PorticoError::Database(format!("Failed to start session: {}", e)))?;
        session
            .start_transaction()
            .await
            .map_err(|e| PorticoError::Database(format!("Failed to start transaction: {}", e)))?;
        Ok(session)
    }

    /// Get the database name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing
///
/// Every operation has a plain form and a `_in` form bound to a
/// transaction's `ClientSession`.
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    /// Create a new collection and apply indexes
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<()> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| PorticoError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| PorticoError::Database(format!("Find failed: {}", e)))
    }

    /// Find many documents by filter
    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>> {
        let cursor = self
            .inner
            .find(filter)
            .await
            .map_err(|e| PorticoError::Database(format!("Find failed: {}", e)))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| PorticoError::Database(format!("Cursor read failed: {}", e)))
    }

    /// Apply an update document to one match
    pub async fn update_one(&self, filter: Document, update: Document) -> Result<u64> {
        let result = self
            .inner
            .update_one(filter, update)
            .await
            .map_err(|e| PorticoError::Database(format!("Update failed: {}", e)))?;
        Ok(result.matched_count)
    }

    /// Find one document inside a transaction
    pub async fn find_one_in(
        &self,
        session: &mut ClientSession,
        filter: Document,
    ) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .session(&mut *session)
            .await
            .map_err(|e| PorticoError::Database(format!("Find failed: {}", e)))
    }

    /// Find many documents inside a transaction
    pub async fn find_many_in(
        &self,
        session: &mut ClientSession,
        filter: Document,
    ) -> Result<Vec<T>> {
        let mut cursor = self
            .inner
            .find(filter)
            .session(&mut *session)
            .await
            .map_err(|e| PorticoError::Database(format!("Find failed: {}", e)))?;

        cursor
            .stream(&mut *session)
            .try_collect()
            .await
            .map_err(|e| PorticoError::Database(format!("Cursor read failed: {}", e)))
    }

    /// Insert documents inside a transaction, stamping metadata
    pub async fn insert_many_in(&self, session: &mut ClientSession, mut items: Vec<T>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        for item in items.iter_mut() {
            *item.mut_metadata() = Metadata::new();
        }

        self.inner
            .insert_many(items)
            .session(&mut *session)
            .await
            .map_err(|e| PorticoError::Database(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    /// Replace one matching document inside a transaction
    pub async fn replace_one_in(
        &self,
        session: &mut ClientSession,
        filter: Document,
        mut item: T,
    ) -> Result<u64> {
        item.mut_metadata().touch();

        let result = self
            .inner
            .replace_one(filter, item)
            .session(&mut *session)
            .await
            .map_err(|e| PorticoError::Database(format!("Replace failed: {}", e)))?;
        Ok(result.matched_count)
    }

    /// Hard delete every match inside a transaction
    pub async fn delete_many_in(&self, session: &mut ClientSession, filter: Document) -> Result<u64> {
        let result = self
            .inner
            .delete_many(filter)
            .session(&mut *session)
            .await
            .map_err(|e| PorticoError::Database(format!("Delete failed: {}", e)))?;
        Ok(result.deleted_count)
    }
}
