//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{UserRepo, VaultRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UserRepo + VaultRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    #[allow(dead_code)] // advisory; SQLite cannot cancel running statements
    query_timeout_secs: u64,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(60);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetadataError::Config(format!("{}: {e}", parent.display())))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single writer connection avoids "database is locked" under concurrency.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout_secs,
        };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "SQLite metadata store opened");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Repository implementations for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use pinfold_core::VaultKey;
    use time::OffsetDateTime;

    impl SqliteStore {
        async fn hosting_users(&self, key: &str) -> MetadataResult<Vec<String>> {
            let users = sqlx::query_scalar::<_, String>(
                "SELECT user_id FROM vault_hosting_users WHERE vault_key = ? ORDER BY added_at, user_id",
            )
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
            Ok(users)
        }
    }

    #[async_trait]
    impl UserRepo for SqliteStore {
        async fn create_user(&self, user: &UserRow) -> MetadataResult<()> {
            if self.get_user(&user.id).await?.is_some() {
                return Err(MetadataError::AlreadyExists(format!(
                    "user id {} already exists",
                    user.id
                )));
            }
            if self.get_user_by_username(&user.username).await?.is_some() {
                return Err(MetadataError::AlreadyExists(format!(
                    "username '{}' already exists",
                    user.username
                )));
            }

            sqlx::query(
                r#"
                INSERT INTO users (id, username, email, disk_usage, disk_quota, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(user.disk_usage)
            .bind(user.disk_quota)
            .bind(user.created_at)
            .bind(user.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_user(&self, user_id: &str) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_user_by_username(&self, username: &str) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_users(&self) -> MetadataResult<Vec<UserRow>> {
            let rows = sqlx::query_as::<_, UserRow>("SELECT * FROM users ORDER BY username")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn update_user_disk_usage(
            &self,
            user_id: &str,
            disk_usage: u64,
        ) -> MetadataResult<()> {
            let result =
                sqlx::query("UPDATE users SET disk_usage = ?, updated_at = ? WHERE id = ?")
                    .bind(to_db(disk_usage))
                    .bind(OffsetDateTime::now_utc())
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        }

        async fn set_user_disk_quota(
            &self,
            user_id: &str,
            quota: Option<u64>,
        ) -> MetadataResult<()> {
            let result =
                sqlx::query("UPDATE users SET disk_quota = ?, updated_at = ? WHERE id = ?")
                    .bind(quota.map(to_db))
                    .bind(OffsetDateTime::now_utc())
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        }

        async fn add_user_vault(
            &self,
            user_id: &str,
            key: &VaultKey,
            name: Option<&str>,
        ) -> MetadataResult<()> {
            if self.get_user(user_id).await?.is_none() {
                return Err(MetadataError::NotFound(format!("user {user_id}")));
            }

            sqlx::query(
                r#"
                INSERT INTO user_vaults (user_id, vault_key, name, added_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (user_id, vault_key)
                DO UPDATE SET name = COALESCE(excluded.name, user_vaults.name)
                "#,
            )
            .bind(user_id)
            .bind(key.to_hex())
            .bind(name)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn remove_user_vault(&self, user_id: &str, key: &VaultKey) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM user_vaults WHERE user_id = ? AND vault_key = ?")
                .bind(user_id)
                .bind(key.to_hex())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_user_vaults(&self, user_id: &str) -> MetadataResult<Vec<UserVaultRow>> {
            let rows = sqlx::query_as::<_, UserVaultRow>(
                "SELECT * FROM user_vaults WHERE user_id = ? ORDER BY added_at, vault_key",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl VaultRepo for SqliteStore {
        async fn get_vault(&self, key: &VaultKey) -> MetadataResult<Option<VaultRow>> {
            let hex = key.to_hex();
            let row = sqlx::query_as::<_, VaultRow>("SELECT * FROM vaults WHERE key = ?")
                .bind(&hex)
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(mut row) => {
                    row.hosting_users = self.hosting_users(&hex).await?;
                    Ok(Some(row))
                }
                None => Ok(None),
            }
        }

        async fn list_vault_keys(&self) -> MetadataResult<Vec<VaultKey>> {
            let keys = sqlx::query_scalar::<_, String>("SELECT key FROM vaults ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
            keys.iter().map(|k| parse_key(k)).collect()
        }

        async fn update_vault(
            &self,
            key: &VaultKey,
            update: &VaultUpdate,
        ) -> MetadataResult<VaultRow> {
            let stats = update.stats;
            let result = sqlx::query(
                r#"
                UPDATE vaults SET
                    name = COALESCE(?, name),
                    owner_name = COALESCE(?, owner_name),
                    disk_usage = COALESCE(?, disk_usage),
                    num_blocks = COALESCE(?, num_blocks),
                    num_downloaded_blocks = COALESCE(?, num_downloaded_blocks),
                    num_bytes = COALESCE(?, num_bytes),
                    num_files = COALESCE(?, num_files),
                    updated_at = ?
                WHERE key = ?
                "#,
            )
            .bind(&update.name)
            .bind(&update.owner_name)
            .bind(update.disk_usage.map(to_db))
            .bind(stats.map(|s| to_db(s.num_blocks)))
            .bind(stats.map(|s| to_db(s.num_downloaded_blocks)))
            .bind(stats.map(|s| to_db(s.num_bytes)))
            .bind(stats.map(|s| to_db(s.num_files)))
            .bind(OffsetDateTime::now_utc())
            .bind(key.to_hex())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("vault {key}")));
            }
            self.get_vault(key)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("vault {key}")))
        }

        async fn delete_vault(&self, key: &VaultKey) -> MetadataResult<bool> {
            let hex = key.to_hex();
            // Hosting rows and the dead marker go with the record.
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM vault_hosting_users WHERE vault_key = ?")
                .bind(&hex)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM dead_vaults WHERE vault_key = ?")
                .bind(&hex)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM vaults WHERE key = ?")
                .bind(&hex)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        }

        async fn add_hosting_user(
            &self,
            key: &VaultKey,
            user_id: &str,
            details: &HostingDetails,
        ) -> MetadataResult<VaultRow> {
            let hex = key.to_hex();
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO vaults (key, created_at, updated_at) VALUES (?, ?, ?) ON CONFLICT (key) DO NOTHING",
            )
            .bind(&hex)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let existing = sqlx::query_scalar::<_, String>(
                "SELECT user_id FROM vault_hosting_users WHERE vault_key = ?",
            )
            .bind(&hex)
            .fetch_all(&mut *tx)
            .await?;

            // One hosting user per vault for now; the transaction rolls back on drop.
            if existing.iter().any(|existing| existing != user_id) {
                return Err(MetadataError::AlreadyHosted { key: hex });
            }

            sqlx::query(
                r#"
                INSERT INTO vault_hosting_users (vault_key, user_id, added_at)
                VALUES (?, ?, ?)
                ON CONFLICT (vault_key, user_id) DO NOTHING
                "#,
            )
            .bind(&hex)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE vaults SET name = COALESCE(?, name), owner_name = ?, updated_at = ? WHERE key = ?",
            )
            .bind(&details.name)
            .bind(&details.owner_name)
            .bind(now)
            .bind(&hex)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM dead_vaults WHERE vault_key = ?")
                .bind(&hex)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            self.get_vault(key)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("vault {key}")))
        }

        async fn remove_hosting_user(
            &self,
            key: &VaultKey,
            user_id: &str,
        ) -> MetadataResult<usize> {
            let hex = key.to_hex();
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM vault_hosting_users WHERE vault_key = ? AND user_id = ?")
                .bind(&hex)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;

            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM vault_hosting_users WHERE vault_key = ?",
            )
            .bind(&hex)
            .fetch_one(&mut *tx)
            .await?;

            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM vaults WHERE key = ?)")
                    .bind(&hex)
                    .fetch_one(&mut *tx)
                    .await?;

            if remaining == 0 && exists {
                sqlx::query(
                    "INSERT INTO dead_vaults (vault_key, marked_at) VALUES (?, ?) ON CONFLICT (vault_key) DO NOTHING",
                )
                .bind(&hex)
                .bind(OffsetDateTime::now_utc())
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(usize::try_from(remaining).unwrap_or(0))
        }

        async fn list_dead_vault_keys(&self) -> MetadataResult<Vec<VaultKey>> {
            let keys = sqlx::query_scalar::<_, String>(
                "SELECT vault_key FROM dead_vaults ORDER BY marked_at, vault_key",
            )
            .fetch_all(&self.pool)
            .await?;
            keys.iter().map(|k| parse_key(k)).collect()
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT,
    disk_usage INTEGER NOT NULL DEFAULT 0,
    disk_quota INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_vaults (
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    vault_key TEXT NOT NULL,
    name TEXT,
    added_at TEXT NOT NULL,
    PRIMARY KEY (user_id, vault_key)
);

CREATE INDEX IF NOT EXISTS idx_user_vaults_key ON user_vaults(vault_key);

CREATE TABLE IF NOT EXISTS vaults (
    key TEXT PRIMARY KEY,
    name TEXT,
    owner_name TEXT,
    disk_usage INTEGER,
    num_blocks INTEGER NOT NULL DEFAULT 0,
    num_downloaded_blocks INTEGER NOT NULL DEFAULT 0,
    num_bytes INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_hosting_users (
    vault_key TEXT NOT NULL REFERENCES vaults(key) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (vault_key, user_id)
);

CREATE INDEX IF NOT EXISTS idx_vault_hosting_users_user ON vault_hosting_users(user_id);

CREATE TABLE IF NOT EXISTS dead_vaults (
    vault_key TEXT PRIMARY KEY REFERENCES vaults(key) ON DELETE CASCADE,
    marked_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostingDetails, UserRow, VaultUpdate};
    use pinfold_core::{VaultKey, VaultStats};

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("metadata.db"), None)
            .await
            .unwrap();
        (temp, store)
    }

    fn key(byte: u8) -> VaultKey {
        VaultKey::from_bytes([byte; 32])
    }

    fn hosting(owner: &str) -> HostingDetails {
        HostingDetails {
            name: Some("photos".to_string()),
            owner_name: owner.to_string(),
        }
    }

    #[tokio::test]
    async fn create_user_rejects_duplicates() {
        let (_temp, store) = open_store().await;
        store.create_user(&UserRow::new("u1", "alice")).await.unwrap();

        let dup_id = store.create_user(&UserRow::new("u1", "bob")).await;
        assert!(matches!(dup_id, Err(MetadataError::AlreadyExists(_))));

        let dup_name = store.create_user(&UserRow::new("u2", "alice")).await;
        assert!(matches!(dup_name, Err(MetadataError::AlreadyExists(_))));

        let found = store.get_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert_eq!(found.disk_quota_bytes(), None);
    }

    #[tokio::test]
    async fn user_vault_list_roundtrip() {
        let (_temp, store) = open_store().await;
        store.create_user(&UserRow::new("u1", "alice")).await.unwrap();

        store.add_user_vault("u1", &key(1), Some("one")).await.unwrap();
        store.add_user_vault("u1", &key(2), None).await.unwrap();
        // Re-adding without a name keeps the previous one.
        store.add_user_vault("u1", &key(1), None).await.unwrap();

        let vaults = store.list_user_vaults("u1").await.unwrap();
        assert_eq!(vaults.len(), 2);
        let first = vaults.iter().find(|v| v.key().unwrap() == key(1)).unwrap();
        assert_eq!(first.name.as_deref(), Some("one"));

        assert!(store.remove_user_vault("u1", &key(1)).await.unwrap());
        assert!(!store.remove_user_vault("u1", &key(1)).await.unwrap());

        let missing = store.add_user_vault("nobody", &key(3), None).await;
        assert!(matches!(missing, Err(MetadataError::NotFound(_))));
    }

    #[tokio::test]
    async fn disk_usage_and_quota_updates() {
        let (_temp, store) = open_store().await;
        store.create_user(&UserRow::new("u1", "alice")).await.unwrap();

        store.update_user_disk_usage("u1", 4096).await.unwrap();
        store.set_user_disk_quota("u1", Some(8192)).await.unwrap();
        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.disk_usage_bytes(), 4096);
        assert_eq!(user.disk_quota_bytes(), Some(8192));

        store.set_user_disk_quota("u1", None).await.unwrap();
        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.disk_quota_bytes(), None);

        let missing = store.update_user_disk_usage("ghost", 1).await;
        assert!(matches!(missing, Err(MetadataError::NotFound(_))));
    }

    #[tokio::test]
    async fn hosted_vault_accounting_updates() {
        let (_temp, store) = open_store().await;
        let k = key(9);

        store.add_hosting_user(&k, "u1", &hosting("a")).await.unwrap();
        let fresh = store.get_vault(&k).await.unwrap().unwrap();
        assert_eq!(fresh.disk_usage_bytes(), None);
        assert!(fresh.stats().is_empty());
        assert_eq!(fresh.hosting_users, vec!["u1".to_string()]);

        let stats = VaultStats {
            num_blocks: 10,
            num_downloaded_blocks: 4,
            num_bytes: 1000,
            num_files: 2,
        };
        store
            .update_vault(&k, &VaultUpdate::stats(stats))
            .await
            .unwrap();
        let row = store
            .update_vault(&k, &VaultUpdate::disk_usage(2048))
            .await
            .unwrap();
        assert_eq!(row.stats(), stats);
        assert_eq!(row.disk_usage_bytes(), Some(2048));

        let missing = store
            .update_vault(&key(10), &VaultUpdate::disk_usage(1))
            .await;
        assert!(matches!(missing, Err(MetadataError::NotFound(_))));
    }

    #[tokio::test]
    async fn second_hosting_user_is_rejected() {
        let (_temp, store) = open_store().await;
        let k = key(4);

        let row = store
            .add_hosting_user(&k, "u1", &hosting("alice"))
            .await
            .unwrap();
        assert_eq!(row.hosting_users, vec!["u1".to_string()]);
        assert_eq!(row.owner_name.as_deref(), Some("alice"));

        // Same user again is fine.
        store
            .add_hosting_user(&k, "u1", &hosting("alice"))
            .await
            .unwrap();

        let err = store
            .add_hosting_user(&k, "u2", &hosting("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadyHosted { .. }));

        let row = store.get_vault(&k).await.unwrap().unwrap();
        assert_eq!(row.hosting_users, vec!["u1".to_string()]);
        assert_eq!(row.owner_name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn dead_vaults_are_tracked_incrementally() {
        let (_temp, store) = open_store().await;
        let k = key(5);
        let live = key(6);

        store.add_hosting_user(&k, "u1", &hosting("alice")).await.unwrap();
        store
            .add_hosting_user(&live, "u1", &hosting("alice"))
            .await
            .unwrap();
        assert!(store.list_dead_vault_keys().await.unwrap().is_empty());

        assert_eq!(store.remove_hosting_user(&k, "u1").await.unwrap(), 0);
        assert_eq!(store.list_dead_vault_keys().await.unwrap(), vec![k]);

        // Hosting again revives it.
        store.add_hosting_user(&k, "u2", &hosting("bob")).await.unwrap();
        assert!(store.list_dead_vault_keys().await.unwrap().is_empty());

        store.remove_hosting_user(&k, "u2").await.unwrap();
        assert!(store.delete_vault(&k).await.unwrap());
        assert!(store.list_dead_vault_keys().await.unwrap().is_empty());
        assert!(store.get_vault(&k).await.unwrap().is_none());
        assert!(!store.delete_vault(&k).await.unwrap());

        let keys = store.list_vault_keys().await.unwrap();
        assert_eq!(keys, vec![live]);
    }

    #[tokio::test]
    async fn removing_from_unknown_vault_does_not_mark_dead() {
        let (_temp, store) = open_store().await;
        assert_eq!(store.remove_hosting_user(&key(7), "u1").await.unwrap(), 0);
        assert!(store.list_dead_vault_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vault_keys_are_listed_in_order() {
        let (_temp, store) = open_store().await;
        store.add_hosting_user(&key(2), "u1", &hosting("a")).await.unwrap();
        store.add_hosting_user(&key(1), "u2", &hosting("b")).await.unwrap();

        let keys = store.list_vault_keys().await.unwrap();
        assert_eq!(keys, vec![key(1), key(2)]);
        let first = store.get_vault(&key(1)).await.unwrap().unwrap();
        assert_eq!(first.hosting_users, vec!["u2".to_string()]);
    }
}
