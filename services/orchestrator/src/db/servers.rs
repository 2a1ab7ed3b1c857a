//! Server metadata cache.
//!
//! One row per machine known to the orchestrator. The vmid column is only
//! written once the hypervisor has confirmed the machine exists.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};

use super::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Deleting,
    Error,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Error => "error",
        }
    }

    /// Map a hypervisor power state onto a record status.
    pub fn from_power_state(state: &str) -> Self {
        match state {
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleting" => Ok(Self::Deleting),
            "error" => Ok(Self::Error),
            other => Err(DbError::Decode(format!("unknown server status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: i64,
    pub name: String,
    pub vmid: Option<u32>,
    pub status: ServerStatus,
    pub ip_address: Option<String>,
    pub role: Option<String>,
    pub firewall_group: Option<String>,
    pub os_type: Option<String>,
    pub cpu: u32,
    /// MiB.
    pub memory: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let vmid: Option<i32> = row.try_get("vmid")?;
        let cpu: i32 = row.try_get("cpu")?;
        let memory: i64 = row.try_get("memory")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            vmid: vmid.and_then(|v| u32::try_from(v).ok()),
            status: status
                .parse()
                .map_err(|e: DbError| sqlx::Error::Decode(Box::new(e)))?,
            ip_address: row.try_get("ip_address")?,
            role: row.try_get("role")?,
            firewall_group: row.try_get("firewall_group")?,
            os_type: row.try_get("os_type")?,
            cpu: u32::try_from(cpu).unwrap_or_default(),
            memory: u64::try_from(memory).unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Input for inserting a record.
#[derive(Debug, Clone)]
pub struct NewServerRecord {
    pub name: String,
    pub vmid: Option<u32>,
    pub status: ServerStatus,
    pub ip_address: Option<String>,
    pub role: Option<String>,
    pub firewall_group: Option<String>,
    pub os_type: Option<String>,
    pub cpu: u32,
    pub memory: u64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with [`DbError::Duplicate`] on a name clash.
    async fn insert(&self, record: NewServerRecord) -> Result<ServerRecord, DbError>;

    async fn get(&self, name: &str) -> Result<Option<ServerRecord>, DbError>;

    /// All records ordered by name.
    async fn list(&self) -> Result<Vec<ServerRecord>, DbError>;

    async fn exists(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.get(name).await?.is_some())
    }

    /// Returns false if no record matched.
    async fn set_status(&self, name: &str, status: ServerStatus) -> Result<bool, DbError>;

    /// Returns false if no record matched.
    async fn set_role(&self, name: &str, role: Option<&str>) -> Result<bool, DbError>;

    /// Returns false if no record matched.
    async fn delete(&self, name: &str) -> Result<bool, DbError>;

    async fn health_check(&self) -> Result<(), DbError>;
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, vmid, status, ip_address, role, firewall_group,
           os_type, cpu, memory, created_at, updated_at
    FROM servers
"#;

#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn insert(&self, record: NewServerRecord) -> Result<ServerRecord, DbError> {
        sqlx::query_as::<_, ServerRecord>(
            r#"
            INSERT INTO servers (
                name, vmid, status, ip_address, role, firewall_group, os_type, cpu, memory
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, name, vmid, status, ip_address, role, firewall_group,
                      os_type, cpu, memory, created_at, updated_at
            "#,
        )
        .bind(&record.name)
        .bind(record.vmid.map(|v| v as i32))
        .bind(record.status.as_str())
        .bind(&record.ip_address)
        .bind(&record.role)
        .bind(&record.firewall_group)
        .bind(&record.os_type)
        .bind(record.cpu as i32)
        .bind(record.memory as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, &record.name))
    }

    async fn get(&self, name: &str) -> Result<Option<ServerRecord>, DbError> {
        sqlx::query_as::<_, ServerRecord>(&format!("{SELECT_COLUMNS} WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, DbError> {
        sqlx::query_as::<_, ServerRecord>(&format!("{SELECT_COLUMNS} ORDER BY name"))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)
    }

    async fn set_status(&self, name: &str, status: ServerStatus) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE servers SET status = $2, updated_at = now()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_role(&self, name: &str, role: Option<&str>) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE servers SET role = $2, updated_at = now()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(role)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, name: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM servers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            ServerStatus::Pending,
            ServerStatus::Creating,
            ServerStatus::Running,
            ServerStatus::Stopped,
            ServerStatus::Deleting,
            ServerStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ServerStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ServerStatus>().is_err());
    }

    #[test]
    fn test_status_from_power_state() {
        assert_eq!(ServerStatus::from_power_state("running"), ServerStatus::Running);
        assert_eq!(ServerStatus::from_power_state("stopped"), ServerStatus::Stopped);
        assert_eq!(ServerStatus::from_power_state("paused"), ServerStatus::Pending);
    }
}
