use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Persisted definition of one device, enough to reconstruct it through the
/// device factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_type: String,
    pub device_id: String,
    pub display_name: String,
    pub parameters: BTreeMap<String, String>,
    pub custom_identifiers: BTreeMap<String, String>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/power-relay/power-relay.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database gets its own empty
        // database, so those pools are pinned to a single connection that
        // never gets recycled.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device definitions
    // ----------------------------

    pub async fn upsert_device(&self, d: &DeviceRecord) -> Result<()> {
        let parameters = serde_json::to_string(&d.parameters)?;
        let custom_identifiers = serde_json::to_string(&d.custom_identifiers)?;
        sqlx::query(
            r#"
            INSERT INTO devices (
              device_type, device_id, display_name, parameters, custom_identifiers
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_type, device_id) DO UPDATE SET
              display_name=excluded.display_name,
              parameters=excluded.parameters,
              custom_identifiers=excluded.custom_identifiers
            "#,
        )
        .bind(d.device_type.as_str())
        .bind(d.device_id.as_str())
        .bind(d.display_name.as_str())
        .bind(parameters)
        .bind(custom_identifiers)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn load_devices(&self) -> Result<Vec<DeviceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT device_type, device_id, display_name, parameters, custom_identifiers
            FROM devices
            ORDER BY device_type, device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_devices failed")?;

        rows.iter().map(device_from_row).collect()
    }

    pub async fn load_devices_by_type(&self, device_type: &str) -> Result<Vec<DeviceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT device_type, device_id, display_name, parameters, custom_identifiers
            FROM devices
            WHERE device_type = ?
            ORDER BY device_id
            "#,
        )
        .bind(device_type)
        .fetch_all(&self.pool)
        .await
        .context("load_devices_by_type failed")?;

        rows.iter().map(device_from_row).collect()
    }
}

fn device_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DeviceRecord> {
    let device_id: String = row.try_get("device_id")?;
    let parameters: String = row.try_get("parameters")?;
    let custom_identifiers: String = row.try_get("custom_identifiers")?;
    Ok(DeviceRecord {
        device_type: row.try_get("device_type")?,
        display_name: row.try_get("display_name")?,
        parameters: serde_json::from_str(&parameters)
            .with_context(|| format!("device '{device_id}': bad parameters json"))?,
        custom_identifiers: serde_json::from_str(&custom_identifiers)
            .with_context(|| format!("device '{device_id}': bad custom_identifiers json"))?,
        device_id,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
