// ABOUTME: MySQL metadata queries for the remote and local endpoints
// ABOUTME: Connection probes, schema listing, name safety checks and local schema administration

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use std::fmt;
use std::time::Duration;

use crate::config::{Config, EndpointConfig};
use crate::error::SyncError;
use crate::models::{ConnectionProbe, DatabaseDescriptor};

/// Schemas that belong to the server itself and are never synced
pub const SYSTEM_SCHEMAS: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

const MAX_IDENTIFIER_LEN: usize = 64;

const SENSITIVE_NAMES: [&str; 8] = [
    "production",
    "prod",
    "live",
    "master",
    "main",
    "root",
    "admin",
    "system",
];

const LIST_DATABASES_SQL: &str = r#"
    SELECT
        CAST(s.SCHEMA_NAME AS CHAR(64)) AS db_name,
        CAST(COALESCE(
            (SELECT SUM(t.DATA_LENGTH + t.INDEX_LENGTH)
             FROM information_schema.TABLES t
             WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME), 0) AS UNSIGNED) AS db_size,
        CAST(
            (SELECT COUNT(*)
             FROM information_schema.TABLES t
             WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME) AS UNSIGNED) AS tables_count,
        CAST(
            (SELECT UNIX_TIMESTAMP(MIN(t.CREATE_TIME))
             FROM information_schema.TABLES t
             WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME) AS SIGNED) AS created_at
    FROM information_schema.SCHEMATA s
    WHERE s.SCHEMA_NAME NOT IN ('information_schema', 'performance_schema', 'mysql', 'sys')
    ORDER BY s.SCHEMA_NAME
"#;

const DATABASE_INFO_SQL: &str = r#"
    SELECT
        CAST(s.SCHEMA_NAME AS CHAR(64)) AS db_name,
        CAST(COALESCE(
            (SELECT SUM(t.DATA_LENGTH + t.INDEX_LENGTH)
             FROM information_schema.TABLES t
             WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME), 0) AS UNSIGNED) AS db_size,
        CAST(
            (SELECT COUNT(*)
             FROM information_schema.TABLES t
             WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME) AS UNSIGNED) AS tables_count,
        CAST(
            (SELECT UNIX_TIMESTAMP(MIN(t.CREATE_TIME))
             FROM information_schema.TABLES t
             WHERE t.TABLE_SCHEMA = s.SCHEMA_NAME) AS SIGNED) AS created_at
    FROM information_schema.SCHEMATA s
    WHERE s.SCHEMA_NAME = ?
"#;

type SchemaRow = (String, u64, u64, Option<i64>);

/// Which configured server a query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Remote,
    Local,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Side::Remote => f.write_str("remote"),
            Side::Local => f.write_str("local"),
        }
    }
}

/// Read-only metadata access for both endpoints
#[async_trait]
pub trait DatabaseInspector: Send + Sync {
    /// Never fails: connection problems are reported in the probe itself
    async fn test_connection(&self, side: Side) -> ConnectionProbe;

    async fn list_databases(&self, side: Side) -> Result<Vec<DatabaseDescriptor>>;

    async fn database_exists(&self, name: &str, side: Side) -> Result<bool>;

    /// Fails with [`SyncError::NotFound`] when the schema does not exist
    async fn get_database_info(&self, name: &str, side: Side) -> Result<DatabaseDescriptor>;
}

/// Mutations applied to the local server before a restore
#[async_trait]
pub trait SchemaAdmin: Send + Sync {
    /// Kill sessions using `name`; returns how many were terminated
    async fn kill_sessions(&self, name: &str) -> Result<usize>;

    async fn drop_database(&self, name: &str) -> Result<()>;

    async fn create_database(&self, name: &str) -> Result<()>;

    /// MySQL Shell's loader needs `local_infile` on the server
    async fn enable_local_infile(&self) -> Result<()>;
}

/// Check that a database name is safe to dump, drop and recreate
///
/// Rejects empty names, names longer than 64 characters, names containing
/// whitespace or path separators, and the server's own system schemas
/// (compared case-insensitively).
///
/// # Examples
///
/// ```
/// # use dbsync::inspector::validate_database_name;
/// assert!(validate_database_name("my_app_db").is_ok());
/// assert!(validate_database_name("information_schema").is_err());
/// assert!(validate_database_name("MySQL").is_err());
/// ```
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Validation("database name cannot be empty".to_string()).into());
    }

    if name.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(SyncError::Validation(format!(
            "database name too long (max {} characters)",
            MAX_IDENTIFIER_LEN
        ))
        .into());
    }

    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
        return Err(SyncError::Validation(format!(
            "database name '{}' contains invalid characters",
            name
        ))
        .into());
    }

    if SYSTEM_SCHEMAS.iter().any(|s| s.eq_ignore_ascii_case(name)) {
        return Err(
            SyncError::Validation(format!("cannot sync system database '{}'", name)).into(),
        );
    }

    Ok(())
}

/// Names that usually mean a production database; worth an extra warning
pub fn is_sensitive_name(name: &str) -> bool {
    SENSITIVE_NAMES
        .iter()
        .chain(SYSTEM_SCHEMAS.iter())
        .any(|s| s.eq_ignore_ascii_case(name))
}

/// Backtick-quote an identifier for use in DDL
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Inspector backed by live `mysql_async` connections
///
/// Every call opens a short-lived connection; nothing is pooled because a
/// sync touches each server only a handful of times.
pub struct MySqlInspector {
    remote: EndpointConfig,
    local: EndpointConfig,
    connect_timeout: Duration,
}

impl MySqlInspector {
    pub fn new(config: &Config) -> Self {
        Self {
            remote: config.remote.clone(),
            local: config.local.clone(),
            connect_timeout: config.dump.connect_timeout(),
        }
    }

    fn endpoint(&self, side: Side) -> &EndpointConfig {
        match side {
            Side::Remote => &self.remote,
            Side::Local => &self.local,
        }
    }

    async fn connect(&self, side: Side) -> Result<Conn> {
        let endpoint = self.endpoint(side);
        let password = (!endpoint.password.is_empty()).then(|| endpoint.password.clone());
        let opts = OptsBuilder::default()
            .ip_or_hostname(endpoint.host.clone())
            .tcp_port(endpoint.port)
            .user(Some(endpoint.user.clone()))
            .pass(password)
            .prefer_socket(false);

        tracing::debug!("Connecting to {} server {}", side, endpoint.label());

        match tokio::time::timeout(self.connect_timeout, Conn::new(opts)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(SyncError::Connectivity(format!(
                "failed to connect to {} server {}: {}",
                side,
                endpoint.label(),
                e
            ))
            .into()),
            Err(_) => Err(SyncError::Connectivity(format!(
                "timed out after {}s connecting to {} server {}",
                self.connect_timeout.as_secs(),
                side,
                endpoint.label()
            ))
            .into()),
        }
    }
}

async fn close(conn: Conn) {
    if let Err(e) = conn.disconnect().await {
        tracing::debug!("Ignoring error while closing MySQL connection: {}", e);
    }
}

fn descriptor_from_row((name, size_bytes, table_count, created): SchemaRow) -> DatabaseDescriptor {
    DatabaseDescriptor {
        name,
        size_bytes,
        table_count,
        created_at: created.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
    }
}

#[async_trait]
impl DatabaseInspector for MySqlInspector {
    async fn test_connection(&self, side: Side) -> ConnectionProbe {
        let endpoint = self.endpoint(side);
        let mut probe = ConnectionProbe {
            host: endpoint.host.clone(),
            port: endpoint.port,
            user: endpoint.user.clone(),
            connected: false,
            server_version: None,
            error: None,
        };

        let mut conn = match self.connect(side).await {
            Ok(conn) => conn,
            Err(e) => {
                probe.error = Some(format!("{:#}", e));
                return probe;
            }
        };

        match conn.query_first::<String, _>("SELECT VERSION()").await {
            Ok(version) => {
                probe.connected = true;
                probe.server_version = version;
            }
            Err(e) => probe.error = Some(format!("failed to get server version: {}", e)),
        }

        close(conn).await;
        probe
    }

    async fn list_databases(&self, side: Side) -> Result<Vec<DatabaseDescriptor>> {
        let mut conn = self.connect(side).await?;
        let rows: Vec<SchemaRow> = conn
            .query(LIST_DATABASES_SQL)
            .await
            .with_context(|| format!("Failed to query databases on {} server", side))?;
        close(conn).await;

        Ok(rows.into_iter().map(descriptor_from_row).collect())
    }

    async fn database_exists(&self, name: &str, side: Side) -> Result<bool> {
        let mut conn = self.connect(side).await?;
        let count: Option<u64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?",
                (name,),
            )
            .await
            .with_context(|| format!("Failed to check whether '{}' exists", name))?;
        close(conn).await;

        Ok(count.unwrap_or(0) > 0)
    }

    async fn get_database_info(&self, name: &str, side: Side) -> Result<DatabaseDescriptor> {
        let mut conn = self.connect(side).await?;
        let row: Option<SchemaRow> = conn
            .exec_first(DATABASE_INFO_SQL, (name,))
            .await
            .with_context(|| format!("Failed to get info for database '{}'", name))?;
        close(conn).await;

        match row {
            Some(row) => Ok(descriptor_from_row(row)),
            None => Err(SyncError::NotFound(format!(
                "database '{}' not found on {} server",
                name, side
            ))
            .into()),
        }
    }
}

#[async_trait]
impl SchemaAdmin for MySqlInspector {
    async fn kill_sessions(&self, name: &str) -> Result<usize> {
        let mut conn = self.connect(Side::Local).await?;
        let ids: Vec<u64> = conn
            .exec(
                "SELECT ID FROM information_schema.PROCESSLIST WHERE DB = ? AND ID <> CONNECTION_ID()",
                (name,),
            )
            .await
            .with_context(|| format!("Failed to list sessions using '{}'", name))?;

        let mut killed = 0;
        for id in ids {
            match conn.query_drop(format!("KILL {}", id)).await {
                Ok(()) => killed += 1,
                // The session may have ended on its own in the meantime
                Err(e) => tracing::warn!("Could not kill session {}: {}", id, e),
            }
        }
        close(conn).await;

        Ok(killed)
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut conn = self.connect(Side::Local).await?;
        conn.query_drop(format!("DROP DATABASE IF EXISTS {}", quote_identifier(name)))
            .await
            .with_context(|| format!("Failed to drop local database '{}'", name))?;
        close(conn).await;
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let mut conn = self.connect(Side::Local).await?;
        conn.query_drop(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_identifier(name)
        ))
        .await
        .with_context(|| format!("Failed to create local database '{}'", name))?;
        close(conn).await;
        Ok(())
    }

    async fn enable_local_infile(&self) -> Result<()> {
        let mut conn = self.connect(Side::Local).await?;
        conn.query_drop("SET GLOBAL local_infile = 1")
            .await
            .context("Failed to enable local_infile on local server")?;
        close(conn).await;
        Ok(())
    }
}
