// ABOUTME: Drives one sync through validate, dump, restore and cleanup
// ABOUTME: Tracks the phase machine, guarantees artifact cleanup and builds dry-run plans

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::inspector::Side;
use crate::models::{PlanSummary, SyncPlan, SyncResult, SyncTimings};
use crate::strategy::{ArtifactGuard, DumpStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Validating,
    Dumping,
    Restoring,
    Cleanup,
    Done,
    Failed,
}

impl SyncPhase {
    /// Whether `next` may follow `self`
    ///
    /// The happy path is strictly linear; `Failed` is reachable from any
    /// phase that has not already finished.
    pub fn can_advance_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match next {
            Failed => !matches!(self, Done | Failed),
            _ => matches!(
                (self, next),
                (Idle, Validating)
                    | (Validating, Dumping)
                    | (Dumping, Restoring)
                    | (Restoring, Cleanup)
                    | (Cleanup, Done)
            ),
        }
    }
}

/// Runs one strategy end to end
pub struct SyncOrchestrator<'a, S: DumpStrategy + ?Sized> {
    strategy: &'a S,
    history: Vec<SyncPhase>,
}

impl<'a, S: DumpStrategy + ?Sized> SyncOrchestrator<'a, S> {
    pub fn new(strategy: &'a S) -> Self {
        Self {
            strategy,
            history: vec![SyncPhase::Idle],
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.history.last().copied().unwrap_or(SyncPhase::Idle)
    }

    pub fn history(&self) -> &[SyncPhase] {
        &self.history
    }

    fn advance(&mut self, next: SyncPhase) {
        let current = self.phase();
        debug_assert!(
            current.can_advance_to(next),
            "illegal phase change {:?} -> {:?}",
            current,
            next
        );
        debug!("Sync phase {:?} -> {:?}", current, next);
        self.history.push(next);
    }

    fn fail(&mut self, err: anyhow::Error, stage: &'static str) -> anyhow::Error {
        self.advance(SyncPhase::Failed);
        err.context(stage)
    }

    /// Validate, dump, restore, then remove the artifact whatever happened
    ///
    /// No step is retried. A failed restore leaves the local schema as the
    /// restore tool left it.
    pub async fn run(&mut self, database: &str) -> Result<SyncResult> {
        let method = self.strategy.method();
        let start_time = Utc::now();
        let started = Instant::now();
        info!("Starting {} sync of '{}'", method, database);

        self.advance(SyncPhase::Validating);
        if let Err(e) = self.strategy.validate(database).await {
            return Err(self.fail(e, "validation failed"));
        }

        self.advance(SyncPhase::Dumping);
        let dump_started = Instant::now();
        let (dump_result, artifact) = match self.strategy.create_dump(database, false).await {
            Ok((result, Some(artifact))) => (result, artifact),
            Ok((_, None)) => {
                let err = SyncError::Io("dump finished without producing an artifact".to_string());
                return Err(self.fail(err.into(), "dump creation failed"));
            }
            Err(e) => return Err(self.fail(e, "dump creation failed")),
        };
        let dump_duration = dump_started.elapsed();
        let cleanup = ArtifactGuard::new(artifact);
        info!(
            "Dump of '{}' finished in {:.1}s",
            database,
            dump_duration.as_secs_f64()
        );

        self.advance(SyncPhase::Restoring);
        let restore_started = Instant::now();
        let restored = self
            .strategy
            .restore_dump(cleanup.artifact(), database, false)
            .await;
        let restore_duration = restore_started.elapsed();
        let total_duration = started.elapsed();
        let end_time = Utc::now();

        self.advance(SyncPhase::Cleanup);
        cleanup.cleanup();

        if let Err(e) = restored {
            return Err(self.fail(e, "dump restoration failed"));
        }

        self.verify_table_count(database, dump_result.table_count).await;
        self.advance(SyncPhase::Done);
        info!(
            "Sync of '{}' completed in {:.1}s",
            database,
            total_duration.as_secs_f64()
        );

        Ok(SyncResult::succeeded(
            database,
            dump_result.dump_size_bytes,
            dump_result.table_count,
            SyncTimings {
                start_time,
                end_time,
                total: total_duration,
                dump: dump_duration,
                restore: restore_duration,
            },
        ))
    }

    async fn verify_table_count(&self, database: &str, expected: u64) {
        let inspector = &self.strategy.context().inspector;
        match inspector.get_database_info(database, Side::Local).await {
            Ok(info) if info.table_count == expected => {
                debug!("Local '{}' has all {} tables", database, expected);
            }
            Ok(info) => warn!(
                "Local '{}' has {} tables after restore, source had {}",
                database, info.table_count, expected
            ),
            Err(e) => debug!("Skipping table count check for '{}': {:#}", database, e),
        }
    }
}

/// Source size and whether a local schema would be replaced
///
/// A failed local existence check is reported as "no existing schema"
/// rather than aborting the plan.
pub async fn plan_summary<S: DumpStrategy + ?Sized>(
    strategy: &S,
    database: &str,
) -> Result<PlanSummary> {
    let ctx = strategy.context();
    let info = ctx.source_info(database).await?;
    let will_replace_existing = match ctx.inspector.database_exists(database, Side::Local).await {
        Ok(exists) => exists,
        Err(e) => {
            warn!("Could not check local database '{}': {:#}", database, e);
            false
        }
    };

    Ok(PlanSummary {
        database_name: database.to_string(),
        size_bytes: info.size_bytes,
        table_count: info.table_count,
        will_replace_existing,
    })
}

/// Validate and describe a sync without changing anything
pub async fn plan<S: DumpStrategy + ?Sized>(strategy: &S, database: &str) -> Result<SyncPlan> {
    strategy
        .validate(database)
        .await
        .context("validation failed")?;
    let (result, _) = strategy
        .create_dump(database, true)
        .await
        .context("dry run failed")?;
    let summary = plan_summary(strategy, database).await?;

    Ok(SyncPlan {
        method: strategy.method().to_string(),
        summary,
        result,
        commands: strategy.planned_commands(database),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMethod;
    use crate::process::ToolOutput;
    use crate::strategy::{build_strategy, NativeStrategy};
    use crate::testing::{test_context, FakeDatabase, FakeRunner};
    use std::sync::Arc;

    fn kind(err: &anyhow::Error) -> Option<&'static str> {
        SyncError::find(err).map(SyncError::kind)
    }

    fn scratch_is_empty(dir: &std::path::Path) -> bool {
        std::fs::read_dir(dir).map(|d| d.count() == 0).unwrap_or(true)
    }

    #[test]
    fn test_phase_transitions() {
        use SyncPhase::*;
        assert!(Idle.can_advance_to(Validating));
        assert!(Restoring.can_advance_to(Cleanup));
        assert!(Cleanup.can_advance_to(Failed));
        assert!(Dumping.can_advance_to(Failed));
        assert!(!Idle.can_advance_to(Dumping));
        assert!(!Validating.can_advance_to(Restoring));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Validating));
    }

    #[tokio::test]
    async fn test_happy_path_native_sync() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 52_428_800, 12));
        let runner = Arc::new(FakeRunner::new().restoring_into(db.clone()));
        let native = NativeStrategy::new(test_context(db.clone(), runner.clone(), dir.path()));

        let mut orchestrator = SyncOrchestrator::new(&native);
        let result = orchestrator.run("shop").await.unwrap();

        assert!(result.success);
        assert!(result.is_consistent());
        assert_eq!(result.table_count, 12);
        assert!(result.total_duration >= result.dump_duration + result.restore_duration);
        assert_eq!(
            orchestrator.history(),
            &[
                SyncPhase::Idle,
                SyncPhase::Validating,
                SyncPhase::Dumping,
                SyncPhase::Restoring,
                SyncPhase::Cleanup,
                SyncPhase::Done
            ]
        );
        assert!(scratch_is_empty(dir.path()));
        assert_eq!(db.local_table_count("shop"), Some(12));
    }

    #[tokio::test]
    async fn test_missing_source_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 1024, 1));
        let runner = Arc::new(FakeRunner::new());

        for method in [SyncMethod::Native, SyncMethod::Container, SyncMethod::Shell] {
            let strategy = build_strategy(method, test_context(db.clone(), runner.clone(), dir.path()));
            let err = strategy.execute_sync("missing_db").await.unwrap_err();
            assert_eq!(kind(&err), Some("not_found"), "method {}", method);
            assert!(format!("{:#}", err).starts_with("validation failed"));
        }
        assert_eq!(runner.call_count(), 0);
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_system_schema_rejected_before_any_query() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().unreachable(Side::Remote));
        let runner = Arc::new(FakeRunner::new());
        let strategy = build_strategy(
            SyncMethod::Shell,
            test_context(db, runner.clone(), dir.path()),
        );

        let err = strategy.execute_sync("information_schema").await.unwrap_err();
        assert_eq!(kind(&err), Some("validation"));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_local_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            FakeDatabase::new()
                .with_remote("shop", 1024, 1)
                .unreachable(Side::Local),
        );
        let runner = Arc::new(FakeRunner::new());
        let native = NativeStrategy::new(test_context(db, runner.clone(), dir.path()));

        let mut orchestrator = SyncOrchestrator::new(&native);
        let err = orchestrator.run("shop").await.unwrap_err();
        assert_eq!(kind(&err), Some("connectivity"));
        assert_eq!(orchestrator.phase(), SyncPhase::Failed);
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_failure_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 4096, 3));
        let runner = Arc::new(FakeRunner::new().failing_tool(
            "mysql",
            ToolOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "ERROR 1064 (42000): syntax error".to_string(),
            },
        ));
        let native = NativeStrategy::new(test_context(db, runner, dir.path()));

        let mut orchestrator = SyncOrchestrator::new(&native);
        let err = orchestrator.run("shop").await.unwrap_err();

        assert_eq!(kind(&err), Some("tool_failed"));
        assert!(format!("{:#}", err).starts_with("dump restoration failed"));
        assert_eq!(
            &orchestrator.history()[3..],
            &[SyncPhase::Restoring, SyncPhase::Cleanup, SyncPhase::Failed]
        );
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_dump_failure_reports_stage() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 4096, 3));
        let runner = Arc::new(FakeRunner::new().failing_tool(
            "mysqldump",
            ToolOutput {
                status: Some(2),
                stdout: String::new(),
                stderr: "Access denied".to_string(),
            },
        ));
        let native = NativeStrategy::new(test_context(db.clone(), runner, dir.path()));

        let err = native.execute_sync("shop").await.unwrap_err();
        assert!(format!("{:#}", err).starts_with("dump creation failed"));
        assert!(scratch_is_empty(dir.path()));
        assert!(db.admin_calls().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_sync_gives_same_local_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 4096, 7));
        let runner = Arc::new(FakeRunner::new().restoring_into(db.clone()));

        for method in [SyncMethod::Native, SyncMethod::Container, SyncMethod::Shell] {
            let strategy = build_strategy(method, test_context(db.clone(), runner.clone(), dir.path()));
            strategy.execute_sync("shop").await.unwrap();
            let first = db.local_table_count("shop");
            strategy.execute_sync("shop").await.unwrap();
            assert_eq!(db.local_table_count("shop"), first, "method {}", method);
            assert_eq!(first, Some(7));
        }
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_plan_launches_nothing_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            FakeDatabase::new()
                .with_remote("shop", 52_428_800, 12)
                .with_local("shop", 1024, 2),
        );

        for method in [SyncMethod::Native, SyncMethod::Container, SyncMethod::Shell] {
            let runner = Arc::new(FakeRunner::new().listing_containers(&["running_sync_container"]));
            let strategy = build_strategy(method, test_context(db.clone(), runner.clone(), dir.path()));
            let plan = plan(strategy.as_ref(), "shop").await.unwrap();

            assert_eq!(plan.method, method.to_string());
            assert_eq!(plan.summary.size_bytes, 52_428_800);
            assert_eq!(plan.summary.table_count, 12);
            assert!(plan.summary.will_replace_existing);
            assert_eq!(plan.commands.len(), 2);
            assert!(plan.commands.iter().all(|c| !c.contains("secret")));
            assert_eq!(runner.launched_count(), 0, "method {}", method);
            for call in runner.calls() {
                let first = call.get_args().first().cloned().unwrap_or_default();
                assert!(first != "rm" && first != "ps", "method {} ran {}", method, call);
            }
        }
        assert!(db.admin_calls().is_empty());
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_plan_for_new_local_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 52_428_800, 12));

        for method in [SyncMethod::Native, SyncMethod::Container, SyncMethod::Shell] {
            let runner = Arc::new(FakeRunner::new());
            let strategy = build_strategy(method, test_context(db.clone(), runner.clone(), dir.path()));
            let plan = plan(strategy.as_ref(), "shop").await.unwrap();

            assert!(!plan.summary.will_replace_existing, "method {}", method);
            assert_eq!(plan.summary.size_bytes, 52_428_800);
            assert_eq!(plan.summary.table_count, 12);
            assert_eq!(runner.launched_count(), 0);
        }
        assert!(!db.database_exists_sync("shop", Side::Local));
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_unreachable_remote_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            FakeDatabase::new()
                .with_remote("shop", 1024, 1)
                .unreachable(Side::Remote),
        );

        for method in [SyncMethod::Native, SyncMethod::Container, SyncMethod::Shell] {
            let runner = Arc::new(FakeRunner::new());
            let strategy = build_strategy(method, test_context(db.clone(), runner.clone(), dir.path()));
            let err = strategy.execute_sync("shop").await.unwrap_err();

            assert_eq!(kind(&err), Some("connectivity"), "method {}", method);
            assert!(format!("{:#}", err).starts_with("validation failed"));
            assert_eq!(runner.call_count(), 0, "method {}", method);
        }
        assert!(db.admin_calls().is_empty());
        assert!(scratch_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_plan_summary_tolerates_local_failure() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(
            FakeDatabase::new()
                .with_remote("shop", 2048, 4)
                .unreachable(Side::Local),
        );
        let native = NativeStrategy::new(test_context(db, Arc::new(FakeRunner::new()), dir.path()));

        let summary = plan_summary(&native, "shop").await.unwrap();
        assert!(!summary.will_replace_existing);
        assert_eq!(summary.table_count, 4);
    }

    #[tokio::test]
    async fn test_cancelled_sync_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(FakeDatabase::new().with_remote("shop", 4096, 3));
        let runner = Arc::new(FakeRunner::new().cancelling_tool("mysql"));
        let ctx = test_context(db, runner, dir.path());
        let native = NativeStrategy::new(ctx);

        let err = native.execute_sync("shop").await.unwrap_err();
        assert_eq!(kind(&err), Some("cancelled"));
        assert!(scratch_is_empty(dir.path()));
    }
}
