use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

const DEVICE_COLUMNS: &str = r#"
    id, name, version,
    interval_secs AS interval,
    actuator_on AS actuator_state,
    threshold, image_ref
"#;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    device_locks: IdLocks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    /// Bumped by one whenever `interval` or `actuator_state` change value.
    pub version: i64,
    /// Reporting interval in seconds.
    pub interval: i64,
    pub actuator_state: bool,
    /// Moisture percentage at or below which the plant wants water.
    pub threshold: Option<i64>,
    pub image_ref: Option<String>,
}

/// Fields a device (or the UI on its behalf) pushes on every config write.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceUpdate {
    pub name: String,
    pub interval: i64,
    pub actuator_state: bool,
    #[serde(default)]
    pub threshold: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SubscriptionRow {
    pub id: String,
    /// Opaque JSON delivery descriptor, stored as received.
    pub payload: String,
    /// Unix seconds of the last bulk delivery attempt.
    pub last_notified: Option<i64>,
}

/// One async mutex per device id so the read-back after an upsert always
/// observes that upsert's own write.
#[derive(Clone, Default)]
struct IdLocks(Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>);

impl IdLocks {
    fn for_id(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(id.to_string()).or_default().clone()
    }

    /// Remove `id`'s entry when the map holds the only reference left.
    fn prune(&self, id: &str) {
        let mut map = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// Prunes the id's lock entry on drop, including on error or cancellation.
/// Must be declared before the lock handle so it drops after it.
struct PruneOnDrop<'a> {
    locks: &'a IdLocks,
    id: &'a str,
}

impl Drop for PruneOnDrop<'_> {
    fn drop(&mut self) {
        self.locks.prune(self.id);
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/garden-hub/garden.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database lives only as long as its connections, so
        // keep exactly one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self {
            pool,
            device_locks: IdLocks::default(),
        })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Device registry
    // ----------------------------

    pub async fn get_device(&self, id: &str) -> Result<Option<DeviceConfig>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?");
        sqlx::query_as::<_, DeviceConfig>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_device failed")
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceConfig>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id");
        sqlx::query_as::<_, DeviceConfig>(&sql)
            .fetch_all(&self.pool)
            .await
            .context("list_devices failed")
    }

    /// Create the device at version 1, or overwrite its name, interval,
    /// actuator state and threshold. The version goes up by exactly one
    /// when interval or actuator state differ from what is stored. The
    /// image reference is never touched here.
    ///
    /// Returns the stored config and whether it was newly created.
    pub async fn upsert_device(&self, id: &str, u: &DeviceUpdate) -> Result<(DeviceConfig, bool)> {
        let _prune = PruneOnDrop {
            locks: &self.device_locks,
            id,
        };
        let lock = self.device_locks.for_id(id);
        let _guard = lock.lock().await;

        let created = sqlx::query(
            r#"
            INSERT INTO devices (id, name, version, interval_secs, actuator_on, threshold)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&u.name)
        .bind(u.interval)
        .bind(u.actuator_state)
        .bind(u.threshold)
        .execute(&self.pool)
        .await
        .context("upsert_device insert failed")?
        .rows_affected()
            == 1;

        if !created {
            // SET expressions see the pre-update row, so the comparison and
            // the increment happen in one atomic statement.
            sqlx::query(
                r#"
                UPDATE devices SET
                  version = version + CASE
                    WHEN interval_secs != ? OR actuator_on != ? THEN 1
                    ELSE 0
                  END,
                  name = ?,
                  interval_secs = ?,
                  actuator_on = ?,
                  threshold = ?
                WHERE id = ?
                "#,
            )
            .bind(u.interval)
            .bind(u.actuator_state)
            .bind(&u.name)
            .bind(u.interval)
            .bind(u.actuator_state)
            .bind(u.threshold)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("upsert_device update failed")?;
        }

        let device = self
            .get_device(id)
            .await?
            .ok_or_else(|| anyhow!("device '{id}' missing right after upsert"))?;
        Ok((device, created))
    }

    /// Update only the image reference. `None` when the device is unknown.
    pub async fn set_image_reference(
        &self,
        id: &str,
        image_ref: &str,
    ) -> Result<Option<DeviceConfig>> {
        let updated = sqlx::query("UPDATE devices SET image_ref = ? WHERE id = ?")
            .bind(image_ref)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("set_image_reference failed")?
            .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.get_device(id).await
    }

    // ----------------------------
    // Push subscriptions
    // ----------------------------

    /// Store `payload` under `id`, replacing any previous blob wholesale.
    /// Returns true when the subscription did not exist before.
    pub async fn put_subscription(&self, id: &str, payload: &str) -> Result<bool> {
        let created = sqlx::query(
            r#"
            INSERT INTO subscriptions (id, payload, last_notified)
            VALUES (?, ?, NULL)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("put_subscription insert failed")?
        .rows_affected()
            == 1;

        if !created {
            sqlx::query("UPDATE subscriptions SET payload = ? WHERE id = ?")
                .bind(payload)
                .bind(id)
                .execute(&self.pool)
                .await
                .context("put_subscription update failed")?;
        }
        Ok(created)
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_subscription failed")?
            .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn get_subscription(&self, id: &str) -> Result<Option<SubscriptionRow>> {
        sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, payload, last_notified FROM subscriptions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_subscription failed")
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<SubscriptionRow>> {
        sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, payload, last_notified FROM subscriptions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("list_subscriptions failed")
    }

    /// Atomically stamp `last_notified = now` if the previous stamp is at
    /// least `min_gap_secs` old (or absent). True means the caller owns this
    /// delivery window and should attempt the send.
    pub async fn claim_notification_slot(
        &self,
        id: &str,
        now: i64,
        min_gap_secs: i64,
    ) -> Result<bool> {
        let claimed = sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_notified = ?
            WHERE id = ?
              AND (last_notified IS NULL OR last_notified <= ?)
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(now - min_gap_secs)
        .execute(&self.pool)
        .await
        .context("claim_notification_slot failed")?
        .rows_affected();
        Ok(claimed == 1)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
