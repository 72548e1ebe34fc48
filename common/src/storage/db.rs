use std::ops::Deref;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use super::types::StoredObject;

/// Shared handle to the backing SurrealDB instance. Cheap to clone; row
/// access goes through the typed helpers below, state transitions live on
/// the entity types as conditional queries.
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let client = connect(address).await?;
        client.signin(Root { username, password }).await?;
        client.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client })
    }

    pub async fn ensure_initialized(&self) -> Result<(), Error> {
        self.build_indexes().await
    }

    pub async fn build_indexes(&self) -> Result<(), Error> {
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_document_status ON document FIELDS status")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_document_project ON document FIELDS project_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_project_owner ON project FIELDS owner_id")
            .await?;

        Ok(())
    }

    /// Inserts a row under its type's table, keyed by the row id.
    pub async fn save<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.create((T::TABLE, item.id())).content(item).await
    }

    /// Fetches one row by id.
    pub async fn load<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.select((T::TABLE, id)).await
    }

    /// Fetches every row of the type's table.
    pub async fn load_all<T>(&self) -> Result<Vec<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.select(T::TABLE).await
    }

    /// Deletes one row by id, returning it when it existed.
    pub async fn remove<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client.delete((T::TABLE, id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// In-memory instance backing the state-machine and service tests.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let client = connect("mem://").await?;
        client.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client })
    }
}
