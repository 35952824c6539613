// ABOUTME: Data structures describing databases, probes and sync outcomes
// ABOUTME: These are serialized to JSON for --json output

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseDescriptor {
    pub name: String,
    pub size_bytes: u64,
    pub table_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionProbe {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one sync attempt
///
/// Built through [`SyncResult::succeeded`] or [`SyncResult::failed`] so that a
/// failed result always carries an error message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub database_name: String,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
    #[serde(rename = "dump_duration_ms", serialize_with = "as_millis")]
    pub dump_duration: Duration,
    #[serde(rename = "restore_duration_ms", serialize_with = "as_millis")]
    pub restore_duration: Duration,
    pub dump_size_bytes: u64,
    pub table_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

pub struct SyncTimings {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total: Duration,
    pub dump: Duration,
    pub restore: Duration,
}

impl SyncResult {
    pub fn succeeded(
        database_name: &str,
        dump_size_bytes: u64,
        table_count: u64,
        timings: SyncTimings,
    ) -> Self {
        Self {
            success: true,
            database_name: database_name.to_string(),
            total_duration: timings.total,
            dump_duration: timings.dump,
            restore_duration: timings.restore,
            dump_size_bytes,
            table_count,
            error: None,
            start_time: timings.start_time,
            end_time: timings.end_time,
        }
    }

    /// Result for an attempt that ended in `err`
    pub fn failed(database_name: &str, start_time: DateTime<Utc>, err: &anyhow::Error) -> Self {
        let end_time = Utc::now();
        let mut message = format!("{:#}", err);
        if message.trim().is_empty() {
            message = "sync failed for an unknown reason".to_string();
        }
        Self {
            success: false,
            database_name: database_name.to_string(),
            total_duration: (end_time - start_time).to_std().unwrap_or_default(),
            dump_duration: Duration::ZERO,
            restore_duration: Duration::ZERO,
            dump_size_bytes: 0,
            table_count: 0,
            error: Some(message),
            start_time,
            end_time,
        }
    }

    /// Checks the success/error invariant
    pub fn is_consistent(&self) -> bool {
        if self.success {
            self.error.is_none()
        } else {
            self.error.as_deref().is_some_and(|e| !e.trim().is_empty())
        }
    }
}

/// What a sync would do, shown before the user confirms
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub database_name: String,
    pub size_bytes: u64,
    pub table_count: u64,
    pub will_replace_existing: bool,
}

/// Dry-run report
#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub method: String,
    pub summary: PlanSummary,
    pub result: SyncResult,
    pub commands: Vec<String>,
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> SyncTimings {
        let start_time = Utc::now();
        SyncTimings {
            start_time,
            end_time: start_time + chrono::Duration::seconds(3),
            total: Duration::from_millis(3_000),
            dump: Duration::from_millis(1_200),
            restore: Duration::from_millis(1_750),
        }
    }

    #[test]
    fn test_succeeded_result_is_consistent() {
        let result = SyncResult::succeeded("shop", 52_428_800, 12, timings());
        assert!(result.success);
        assert!(result.is_consistent());
        assert!(result.total_duration >= result.dump_duration + result.restore_duration);
    }

    #[test]
    fn test_failed_result_carries_error_chain() {
        let err = anyhow::anyhow!("mysqldump exited with status 2").context("dump creation failed");
        let result = SyncResult::failed("shop", Utc::now(), &err);
        assert!(!result.success);
        assert!(result.is_consistent());
        assert_eq!(
            result.error.as_deref(),
            Some("dump creation failed: mysqldump exited with status 2")
        );
    }

    #[test]
    fn test_failed_result_never_has_empty_error() {
        let err = anyhow::anyhow!("");
        let result = SyncResult::failed("shop", Utc::now(), &err);
        assert!(result.is_consistent());
    }

    #[test]
    fn test_sync_result_json_uses_millis() {
        let result = SyncResult::succeeded("shop", 1024, 3, timings());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["total_duration_ms"], 3000);
        assert_eq!(json["dump_duration_ms"], 1200);
        assert_eq!(json["table_count"], 3);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_probe_json_skips_missing_fields() {
        let probe = ConnectionProbe {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            connected: true,
            server_version: Some("8.0.36".to_string()),
            error: None,
        };
        let json = serde_json::to_value(&probe).unwrap();
        assert_eq!(json["server_version"], "8.0.36");
        assert!(json.get("error").is_none());
    }
}
