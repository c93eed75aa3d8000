//! Persisted registrations: webhook groups and replication domains.
//!
//! Stored as JSON documents keyed by name, so the storage layout does not
//! have to follow every field added to [`Group`] or [`ReplicationDomain`].
//! Where the documents live is a [`RegistrationStore`]: the cursor SQLite
//! file for a single node, or Redis so every node of a cluster sees the
//! same registrations.
//!
//! Readers that only need lookups depend on the [`GroupSource`] and
//! [`DomainSource`] traits.

use crate::cursor::execute_with_retry;
use crate::error::{BoxFuture, HubError, Result};
use crate::model::{Group, ReplicationDomain};
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Lookup of stored groups.
pub trait GroupSource: Send + Sync + 'static {
    fn get_group(&self, name: &str) -> BoxFuture<'_, Option<Group>>;
}

/// Lookup of stored replication domains.
pub trait DomainSource: Send + Sync + 'static {
    fn domains(&self) -> BoxFuture<'_, Vec<ReplicationDomain>>;
}

/// Kind of registration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Groups,
    Domains,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Groups => "groups",
            Self::Domains => "domains",
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Groups => "groups",
            Self::Domains => "replication_domains",
        }
    }
}

/// Named JSON documents, one namespace per [`Collection`].
pub trait RegistrationStore: Send + Sync + 'static {
    /// Store `body` under `name` unless the name is taken.
    ///
    /// Returns `false` if it was.
    fn insert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, bool>;
    fn upsert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, ()>;
    fn get(&self, collection: Collection, name: &str) -> BoxFuture<'_, Option<String>>;
    /// Every document of `collection`, ordered by name.
    fn list(&self, collection: Collection) -> BoxFuture<'_, Vec<String>>;
    /// Returns `true` if a document was removed.
    fn remove(&self, collection: Collection, name: &str) -> BoxFuture<'_, bool>;
}

/// Registrations in SQLite, normally the cursor database.
pub struct SqliteRegistrations {
    pool: SqlitePool,
}

impl SqliteRegistrations {
    /// Create the tables on `pool` if missing.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        for collection in [Collection::Groups, Collection::Domains] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    name TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                collection.table()
            ))
            .execute(&pool)
            .await?;
        }
        Ok(Self { pool })
    }
}

impl RegistrationStore for SqliteRegistrations {
    fn insert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (name, body, updated_at) VALUES (?, ?, ?)",
            collection.table()
        );
        let name = name.to_string();
        let body = body.to_string();
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let result = execute_with_retry("registration_insert", || async {
                sqlx::query(&sql)
                    .bind(&name)
                    .bind(&body)
                    .bind(now)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn upsert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, ()> {
        let sql = format!(
            r#"
            INSERT INTO {} (name, body, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            collection.table()
        );
        let name = name.to_string();
        let body = body.to_string();
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            execute_with_retry("registration_upsert", || async {
                sqlx::query(&sql)
                    .bind(&name)
                    .bind(&body)
                    .bind(now)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(())
        })
    }

    fn get(&self, collection: Collection, name: &str) -> BoxFuture<'_, Option<String>> {
        let sql = format!("SELECT body FROM {} WHERE name = ?", collection.table());
        let name = name.to_string();
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as(&sql)
                .bind(&name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|(body,)| body))
        })
    }

    fn list(&self, collection: Collection) -> BoxFuture<'_, Vec<String>> {
        let sql = format!("SELECT body FROM {} ORDER BY name", collection.table());
        Box::pin(async move {
            let rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(|(body,)| body).collect())
        })
    }

    fn remove(&self, collection: Collection, name: &str) -> BoxFuture<'_, bool> {
        let sql = format!("DELETE FROM {} WHERE name = ?", collection.table());
        let name = name.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("registration_remove", || async {
                sqlx::query(&sql).bind(&name).execute(pool).await
            })
            .await?;
            Ok(result.rows_affected() > 0)
        })
    }
}

/// Registrations in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistrations {
    docs: Mutex<BTreeMap<(Collection, String), String>>,
}

impl MemoryRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<(Collection, String), String>> {
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RegistrationStore for MemoryRegistrations {
    fn insert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, bool> {
        let inserted = {
            let mut docs = self.docs();
            let slot = (collection, name.to_string());
            if docs.contains_key(&slot) {
                false
            } else {
                docs.insert(slot, body.to_string());
                true
            }
        };
        Box::pin(async move { Ok(inserted) })
    }

    fn upsert(&self, collection: Collection, name: &str, body: &str) -> BoxFuture<'_, ()> {
        self.docs()
            .insert((collection, name.to_string()), body.to_string());
        Box::pin(async { Ok(()) })
    }

    fn get(&self, collection: Collection, name: &str) -> BoxFuture<'_, Option<String>> {
        let body = self.docs().get(&(collection, name.to_string())).cloned();
        Box::pin(async move { Ok(body) })
    }

    fn list(&self, collection: Collection) -> BoxFuture<'_, Vec<String>> {
        let bodies: Vec<String> = self
            .docs()
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|(_, body)| body.clone())
            .collect();
        Box::pin(async move { Ok(bodies) })
    }

    fn remove(&self, collection: Collection, name: &str) -> BoxFuture<'_, bool> {
        let removed = self.docs().remove(&(collection, name.to_string())).is_some();
        Box::pin(async move { Ok(removed) })
    }
}

/// Typed access to stored groups and replication domains.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn RegistrationStore>,
}

impl Registry {
    /// SQLite registrations on `pool`, creating the tables if missing.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = SqliteRegistrations::new(pool).await?;
        Ok(Self::with_store(Arc::new(store)))
    }

    pub fn with_store(store: Arc<dyn RegistrationStore>) -> Self {
        Self { store }
    }

    /// Private in-memory registry.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self::with_store(Arc::new(MemoryRegistrations::new())))
    }

    /// Insert a group. Fails with `Conflict` if the name is taken.
    pub async fn insert_group(&self, group: &Group) -> Result<()> {
        let body = encode(group)?;
        if !self.store.insert(Collection::Groups, &group.name, &body).await? {
            return Err(HubError::Conflict("Groups are immutable".into()));
        }
        info!(group = %group.name, "Stored group");
        Ok(())
    }

    pub async fn find_group(&self, name: &str) -> Result<Option<Group>> {
        let body = self.store.get(Collection::Groups, name).await?;
        body.map(|body| decode(&body)).transpose()
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let bodies = self.store.list(Collection::Groups).await?;
        bodies.iter().map(|body| decode(body)).collect()
    }

    /// Returns `true` if a group was removed.
    pub async fn delete_group(&self, name: &str) -> Result<bool> {
        let removed = self.store.remove(Collection::Groups, name).await?;
        debug!(group = %name, removed, "Deleted group");
        Ok(removed)
    }

    /// Insert or replace a domain.
    pub async fn put_domain(&self, domain: &ReplicationDomain) -> Result<()> {
        let body = encode(domain)?;
        self.store
            .upsert(Collection::Domains, &domain.domain, &body)
            .await?;
        info!(domain = %domain.domain, channels = domain.exclude_except.len(), "Stored replication domain");
        Ok(())
    }

    pub async fn find_domain(&self, domain: &str) -> Result<Option<ReplicationDomain>> {
        let body = self.store.get(Collection::Domains, domain).await?;
        body.map(|body| decode(&body)).transpose()
    }

    pub async fn list_domains(&self) -> Result<Vec<ReplicationDomain>> {
        let bodies = self.store.list(Collection::Domains).await?;
        bodies.iter().map(|body| decode(body)).collect()
    }

    pub async fn delete_domain(&self, domain: &str) -> Result<bool> {
        self.store.remove(Collection::Domains, domain).await
    }
}

impl GroupSource for Registry {
    fn get_group(&self, name: &str) -> BoxFuture<'_, Option<Group>> {
        let name = name.to_string();
        Box::pin(async move { self.find_group(&name).await })
    }
}

impl DomainSource for Registry {
    fn domains(&self) -> BoxFuture<'_, Vec<ReplicationDomain>> {
        Box::pin(self.list_domains())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| HubError::Internal(format!("encode: {}", e)))
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| HubError::Internal(format!("decode: {}", e)))
}
