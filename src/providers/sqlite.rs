use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use super::{InstanceData, InstanceStore, InstanceValue, OwnerId, ProviderError, SaveCommand, names};
use crate::transaction::{Enlistment, Transaction};

/// SQLite-backed instance store.
///
/// Lock ownership lives in the `instances` row. Owner liveness is tracked in
/// `lock_owners` with a lease deadline, so the locks of a crashed host become
/// reclaimable once its lease lapses.
#[derive(Debug, Clone)]
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

/// Convert sqlx error to ProviderError with appropriate retry classification
fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
    let error_msg = e.to_string();

    if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
        return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
    }

    if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
        return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
    }

    if error_msg.contains("connection") || error_msg.contains("timeout") {
        return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
    }

    ProviderError::retryable(operation, error_msg)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn timestamp_after(duration: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

fn parse_id(operation: &str, raw: &str) -> Result<Uuid, ProviderError> {
    Uuid::parse_str(raw).map_err(|e| ProviderError::permanent(operation, format!("invalid id {raw}: {e}")))
}

/// Split instance data into (readable, write-only) JSON documents.
fn encode_data(data: &InstanceData) -> Result<(String, String), ProviderError> {
    let (write_only, readable): (InstanceData, InstanceData) =
        data.iter().map(|(k, v)| (k.clone(), v.clone())).partition(|(_, v)| v.is_write_only());
    Ok((serde_json::to_string(&readable)?, serde_json::to_string(&write_only)?))
}

fn decode_data(operation: &str, raw: &str) -> Result<InstanceData, ProviderError> {
    serde_json::from_str::<InstanceData>(raw)
        .map_err(|e| ProviderError::permanent(operation, format!("corrupt instance data: {e}")))
}

impl SqliteInstanceStore {
    /// Open (or create) a store at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new();
        options = if is_memory {
            // Every connection to ":memory:" is its own database; keep exactly one alive.
            options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(5)
        };
        let pool = options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(url = %database_url, "sqlite instance store ready");
        Ok(Self { pool })
    }

    /// Convenience: a private in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lock_owners (
                owner_id TEXT PRIMARY KEY,
                lease_expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                owner_id TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                write_only_data TEXT NOT NULL DEFAULT '{}',
                is_runnable INTEGER NOT NULL DEFAULT 0,
                has_state INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_runnable ON instances(is_runnable, has_state)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Current lock holder of an instance, if any.
    pub async fn lock_owner(&self, instance: Uuid) -> Result<Option<OwnerId>, ProviderError> {
        let row = sqlx::query("SELECT owner_id FROM instances WHERE instance_id = ?")
            .bind(instance.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_to_provider_error("lock_owner", e))?;
        match row.and_then(|r| r.try_get::<Option<String>, _>("owner_id").ok().flatten()) {
            Some(raw) => Ok(Some(parse_id("lock_owner", &raw)?)),
            None => Ok(None),
        }
    }

    /// Ids of instances with stored runtime state.
    pub async fn instance_ids(&self) -> Result<Vec<Uuid>, ProviderError> {
        let rows = sqlx::query("SELECT instance_id FROM instances WHERE has_state = 1 ORDER BY instance_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_to_provider_error("instance_ids", e))?;
        rows.iter()
            .map(|r| {
                let raw: String = r.try_get("instance_id").map_err(|e| sqlx_to_provider_error("instance_ids", e))?;
                parse_id("instance_ids", &raw)
            })
            .collect()
    }

    async fn require_live_owner(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        operation: &str,
        owner: OwnerId,
    ) -> Result<(), ProviderError> {
        let live = sqlx::query("SELECT 1 FROM lock_owners WHERE owner_id = ? AND lease_expires_at > ?")
            .bind(owner.to_string())
            .bind(now_millis())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| sqlx_to_provider_error(operation, e))?;
        if live.is_none() {
            return Err(ProviderError::owner_not_found(operation, owner));
        }
        Ok(())
    }

    /// Take the instance lock for `owner`, creating a placeholder row if needed.
    async fn acquire_in_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        operation: &str,
        owner: OwnerId,
        instance: Uuid,
    ) -> Result<(), ProviderError> {
        Self::require_live_owner(tx, operation, owner).await?;
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, owner_id, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(instance_id) DO UPDATE SET owner_id = excluded.owner_id
            WHERE instances.owner_id IS NULL
               OR instances.owner_id = excluded.owner_id
               OR instances.owner_id NOT IN (SELECT owner_id FROM lock_owners WHERE lease_expires_at > ?3)
            "#,
        )
        .bind(instance.to_string())
        .bind(owner.to_string())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| sqlx_to_provider_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(ProviderError::instance_locked(operation, instance));
        }
        Ok(())
    }

    async fn read_in_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        operation: &str,
        instance: Uuid,
    ) -> Result<Option<InstanceData>, ProviderError> {
        let row = sqlx::query("SELECT data, has_state FROM instances WHERE instance_id = ?")
            .bind(instance.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| sqlx_to_provider_error(operation, e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let has_state: bool = row.try_get("has_state").map_err(|e| sqlx_to_provider_error(operation, e))?;
        if !has_state {
            return Ok(None);
        }
        let raw: String = row.try_get("data").map_err(|e| sqlx_to_provider_error(operation, e))?;
        decode_data(operation, &raw).map(Some)
    }
}

struct SqliteWrite {
    pool: SqlitePool,
    owner: OwnerId,
    instance: Uuid,
    command: Option<SaveCommand>,
}

#[async_trait]
impl Enlistment for SqliteWrite {
    async fn commit(&mut self) -> Result<(), ProviderError> {
        let Some(command) = self.command.take() else {
            return Ok(());
        };
        let op = "save_instance";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_to_provider_error(op, e))?;

        SqliteInstanceStore::require_live_owner(&mut tx, op, self.owner).await?;
        let holder: Option<String> = sqlx::query("SELECT owner_id FROM instances WHERE instance_id = ?")
            .bind(self.instance.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| sqlx_to_provider_error(op, e))?
            .and_then(|r| r.try_get::<Option<String>, _>("owner_id").ok().flatten());
        if holder.as_deref() != Some(self.owner.to_string().as_str()) {
            return Err(ProviderError::instance_locked(op, self.instance));
        }

        if command.complete {
            sqlx::query("DELETE FROM instances WHERE instance_id = ?")
                .bind(self.instance.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| sqlx_to_provider_error(op, e))?;
        } else {
            let (data, write_only) = encode_data(&command.data)?;
            let owner = (!command.unlock).then(|| self.owner.to_string());
            sqlx::query(
                r#"
                UPDATE instances
                SET data = ?, write_only_data = ?, is_runnable = ?, has_state = ?, owner_id = ?, updated_at = ?
                WHERE instance_id = ?
                "#,
            )
            .bind(data)
            .bind(write_only)
            .bind(command.runnable)
            .bind(command.data.contains_key(names::WORKFLOW))
            .bind(owner)
            .bind(now_millis())
            .bind(self.instance.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_to_provider_error(op, e))?;
        }

        tx.commit().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        debug!(instance = %self.instance, complete = command.complete, "instance write committed");
        Ok(())
    }

    async fn rollback(&mut self) {
        self.command = None;
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn create_owner(&self, lease: Duration) -> Result<OwnerId, ProviderError> {
        let owner = Uuid::new_v4();
        sqlx::query("INSERT INTO lock_owners (owner_id, lease_expires_at, created_at) VALUES (?, ?, ?)")
            .bind(owner.to_string())
            .bind(timestamp_after(lease))
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_to_provider_error("create_owner", e))?;
        debug!(owner = %owner, "created lock owner");
        Ok(owner)
    }

    async fn renew_owner(&self, owner: OwnerId, lease: Duration) -> Result<(), ProviderError> {
        let result = sqlx::query("UPDATE lock_owners SET lease_expires_at = ? WHERE owner_id = ?")
            .bind(timestamp_after(lease))
            .bind(owner.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_to_provider_error("renew_owner", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::owner_not_found("renew_owner", owner));
        }
        Ok(())
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError> {
        let op = "delete_owner";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        sqlx::query("UPDATE instances SET owner_id = NULL WHERE owner_id = ?")
            .bind(owner.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_to_provider_error(op, e))?;
        sqlx::query("DELETE FROM lock_owners WHERE owner_id = ?")
            .bind(owner.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| sqlx_to_provider_error(op, e))?;
        tx.commit().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        Ok(())
    }

    async fn lock_instance(&self, owner: OwnerId, instance: Uuid) -> Result<(), ProviderError> {
        let op = "lock_instance";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        Self::acquire_in_tx(&mut tx, op, owner, instance).await?;
        tx.commit().await.map_err(|e| sqlx_to_provider_error(op, e))
    }

    async fn save_instance(
        &self,
        owner: OwnerId,
        instance: Uuid,
        command: SaveCommand,
        tx: &Transaction,
    ) -> Result<(), ProviderError> {
        self.lock_instance(owner, instance).await?;
        tx.enlist(Box::new(SqliteWrite {
            pool: self.pool.clone(),
            owner,
            instance,
            command: Some(command),
        }))
        .map_err(|e| ProviderError::permanent("save_instance", e.to_string()))
    }

    async fn load_instance(&self, owner: OwnerId, instance: Uuid) -> Result<InstanceData, ProviderError> {
        let op = "load_instance";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        if Self::read_in_tx(&mut tx, op, instance).await?.is_none() {
            return Err(ProviderError::instance_not_found(op, instance));
        }
        Self::acquire_in_tx(&mut tx, op, owner, instance).await?;
        let data = Self::read_in_tx(&mut tx, op, instance)
            .await?
            .ok_or_else(|| ProviderError::instance_not_found(op, instance))?;
        tx.commit().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        Ok(data)
    }

    async fn try_load_runnable(&self, owner: OwnerId) -> Result<Option<(Uuid, InstanceData)>, ProviderError> {
        let op = "try_load_runnable";
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        Self::require_live_owner(&mut tx, op, owner).await?;
        let row = sqlx::query(
            r#"
            SELECT instance_id FROM instances
            WHERE is_runnable = 1 AND has_state = 1
              AND (owner_id IS NULL
                   OR owner_id = ?1
                   OR owner_id NOT IN (SELECT owner_id FROM lock_owners WHERE lease_expires_at > ?2))
            ORDER BY updated_at, instance_id
            LIMIT 1
            "#,
        )
        .bind(owner.to_string())
        .bind(now_millis())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| sqlx_to_provider_error(op, e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("instance_id").map_err(|e| sqlx_to_provider_error(op, e))?;
        let instance = parse_id(op, &raw)?;
        Self::acquire_in_tx(&mut tx, op, owner, instance).await?;
        let data = Self::read_in_tx(&mut tx, op, instance)
            .await?
            .ok_or_else(|| ProviderError::instance_not_found(op, instance))?;
        tx.commit().await.map_err(|e| sqlx_to_provider_error(op, e))?;
        Ok(Some((instance, data)))
    }

    async fn unlock_instance(&self, owner: OwnerId, instance: Uuid) -> Result<(), ProviderError> {
        sqlx::query("UPDATE instances SET owner_id = NULL WHERE instance_id = ? AND owner_id = ?")
            .bind(instance.to_string())
            .bind(owner.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_to_provider_error("unlock_instance", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_split_keeps_write_only_apart() {
        let mut data = InstanceData::new();
        data.insert("visible".into(), InstanceValue::new(json!(1)));
        data.insert("hidden".into(), InstanceValue::write_only(json!(2)));
        let (readable, write_only) = encode_data(&data).unwrap();
        let readable = decode_data("test", &readable).unwrap();
        let write_only = decode_data("test", &write_only).unwrap();
        assert!(readable.contains_key("visible") && !readable.contains_key("hidden"));
        assert!(write_only.contains_key("hidden"));
    }

    #[test]
    fn busy_errors_are_retryable() {
        let err = sqlx_to_provider_error("save_instance", sqlx::Error::Protocol("database is locked".into()));
        assert!(err.is_retryable());
        let err = sqlx_to_provider_error("save_instance", sqlx::Error::Protocol("UNIQUE constraint failed".into()));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn lock_is_exclusive_between_live_owners() {
        let store = SqliteInstanceStore::new_in_memory().await.unwrap();
        let a = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let b = store.create_owner(Duration::from_secs(30)).await.unwrap();
        let id = Uuid::new_v4();
        store.lock_instance(a, id).await.unwrap();
        let err = store.lock_instance(b, id).await.unwrap_err();
        assert!(matches!(err.kind, crate::providers::ProviderErrorKind::InstanceLocked(_)));

        store.unlock_instance(a, id).await.unwrap();
        store.lock_instance(b, id).await.unwrap();
        assert_eq!(store.lock_owner(id).await.unwrap(), Some(b));
    }
}
