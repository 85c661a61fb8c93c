use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway::GatewayDirectory;
use proto::{DatabaseError, GatewayId, GatewayStatus, RegistryError};
use sqlx::{Row, sqlite::SqlitePool};
use tracing::{debug, info};

/// A registered gateway as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRecord {
    pub gateway_id: GatewayId,
    pub name: Option<String>,
    pub status: GatewayStatus,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed gateway/device registry
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    /// Open (or create) the SQLite database and run migrations
    pub async fn open(db_url: &str) -> Result<Self, DatabaseError> {
        let url = if db_url.starts_with('~') {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen('~', &home, 1)
        } else {
            db_url.to_string()
        };

        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        let migrations_dir =
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        migrator
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Gateway registry opened: {url}");
        Ok(Self { pool })
    }

    /// Registers a gateway (offline until it reports in). Re-registering
    /// only updates the name.
    pub async fn register_gateway(
        &self,
        gateway: &GatewayId,
        name: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO gateways (gateway_id, name, status, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(gateway_id) DO UPDATE SET name = excluded.name, updated_at = excluded.updated_at",
        )
        .bind(gateway.as_str())
        .bind(name)
        .bind(GatewayStatus::Offline.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        debug!("Registered gateway: {gateway}");
        Ok(())
    }

    /// Registers a device behind an already registered gateway.
    pub async fn register_device(
        &self,
        gateway: &GatewayId,
        device_id: &str,
    ) -> Result<(), DatabaseError> {
        if !self.exists(gateway).await? {
            return Err(DatabaseError::NotFound(format!("gateway {gateway}")));
        }
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO devices (device_id, gateway_id, status, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(device_id) DO UPDATE SET gateway_id = excluded.gateway_id, updated_at = excluded.updated_at",
        )
        .bind(device_id)
        .bind(gateway.as_str())
        .bind(GatewayStatus::Offline.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(())
    }

    /// All registered gateways ordered by id.
    pub async fn list_gateways(&self) -> Result<Vec<GatewayRecord>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT gateway_id, name, status, updated_at FROM gateways ORDER BY gateway_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        let gateways = rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                let updated_at: String = row.get("updated_at");
                GatewayRecord {
                    gateway_id: GatewayId::from(row.get::<String, _>("gateway_id")),
                    name: row.get("name"),
                    status: GatewayStatus::from_str(&status).unwrap_or(GatewayStatus::Offline),
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect();
        Ok(gateways)
    }

    /// Stored status of a device, if the device is known.
    pub async fn device_status(
        &self,
        device_id: &str,
    ) -> Result<Option<GatewayStatus>, DatabaseError> {
        let row = sqlx::query("SELECT status FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(row.and_then(|row| GatewayStatus::from_str(&row.get::<String, _>("status")).ok()))
    }

    async fn exists(&self, gateway: &GatewayId) -> Result<bool, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM gateways WHERE gateway_id = ?")
            .bind(gateway.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(row.get::<i64, _>("count") > 0)
    }
}

#[async_trait]
impl GatewayDirectory for SqliteDirectory {
    async fn gateway_exists(&self, gateway: &GatewayId) -> Result<bool, RegistryError> {
        self.exists(gateway)
            .await
            .map_err(|e| RegistryError::Lookup(e.to_string()))
    }

    async fn update_gateway_status(
        &self,
        gateway: &GatewayId,
        status: GatewayStatus,
    ) -> Result<(), RegistryError> {
        let update = |e: sqlx::Error| RegistryError::Update(e.to_string());
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(update)?;

        let updated = sqlx::query("UPDATE gateways SET status = ?, updated_at = ? WHERE gateway_id = ?")
            .bind(status.as_str())
            .bind(&now)
            .bind(gateway.as_str())
            .execute(&mut *tx)
            .await
            .map_err(update)?
            .rows_affected();

        if status == GatewayStatus::Offline {
            sqlx::query("UPDATE devices SET status = ?, updated_at = ? WHERE gateway_id = ?")
                .bind(GatewayStatus::Offline.as_str())
                .bind(&now)
                .bind(gateway.as_str())
                .execute(&mut *tx)
                .await
                .map_err(update)?;
        }
        tx.commit().await.map_err(update)?;

        if updated == 0 {
            debug!("Status {status} for unregistered gateway {gateway} ignored");
        } else {
            debug!("Gateway {gateway} is now {status}");
        }
        Ok(())
    }

    async fn update_device_status(
        &self,
        gateway: &GatewayId,
        device_id: &str,
        status: GatewayStatus,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO devices (device_id, gateway_id, status, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(device_id) DO UPDATE SET gateway_id = excluded.gateway_id, \
             status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(device_id)
        .bind(gateway.as_str())
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| RegistryError::Update(e.to_string()))?;
        Ok(())
    }
}
