use crate::dump::{DumpLayout, TableFiles, ViewFile};
use crate::executor::{Connector, ExecError, StatementExecutor};
use crate::progress::{report_progress, Progress};
use crate::statements::{fit_statement, quote_ident, retarget, split_statements};
use branchdump_core::{RestoreConfig, RestoreError, Result, TableFailure, TableSteps};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a run will touch, resolved from the configuration and the dump
/// listing before any connection is made.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Selected tables in lexicographic order.
    pub tables: Vec<TableFiles>,
    pub views: Vec<ViewFile>,
    pub steps: TableSteps,
    /// Dump database names rewritten to the destination in statements.
    pub retarget_from: Vec<String>,
}

impl RestorePlan {
    pub fn build(config: &RestoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = DumpLayout::scan(&config.source_dir)?;
        layout.check_destination(&config.database, config.allow_different_destination)?;

        let steps = config.steps();
        let tables = layout.select_tables(&config.tables);
        for skipped in layout.tables.iter().filter(|t| !config.tables.contains(&t.name)) {
            debug!(table = %skipped.name, "table outside the requested range, skipping");
        }
        let views = if steps.restores_views() {
            layout.select_views(&config.tables)
        } else {
            Vec::new()
        };
        if tables.is_empty() && views.is_empty() {
            return Err(RestoreError::Validation(format!(
                "no tables in {} fall within the requested range",
                layout.dir.display()
            )));
        }
        if steps.create_schema {
            if let Some(table) = tables.iter().find(|t| t.schema.is_none()) {
                return Err(RestoreError::Validation(format!(
                    "table {} has data files but no schema file",
                    table.name
                )));
            }
        }

        let retarget_from = layout
            .databases
            .iter()
            .filter(|db| db.as_str() != config.database)
            .cloned()
            .collect();

        Ok(Self {
            tables,
            views,
            steps,
            retarget_from,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    pub tables_restored: Vec<String>,
    pub failed_tables: Vec<TableFailure>,
    pub views_restored: Vec<String>,
    pub failed_views: Vec<TableFailure>,
    pub statements: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

enum TableError {
    /// The server rejected a statement; only this table is affected.
    Statement(String),
    /// The session failed; the run cannot continue.
    Fatal(RestoreError),
    Cancelled,
}

#[derive(Default)]
struct WorkerReport {
    restored: Vec<String>,
    failed: Vec<TableFailure>,
    fatal: Option<RestoreError>,
}

struct Shared {
    config: Arc<RestoreConfig>,
    plan: Arc<RestorePlan>,
    progress: Arc<Progress>,
    queue: Mutex<VecDeque<TableFiles>>,
}

impl Shared {
    fn detail(&self, file: &Path, table: &str, what: &str) {
        if self.config.show_details {
            info!(table, file = %file.display(), "restoring {}", what);
        } else {
            debug!(table, file = %file.display(), "restoring {}", what);
        }
    }

    fn prepare(&self, sql: String) -> Vec<String> {
        let mut sql = sql;
        for from in &self.plan.retarget_from {
            let replaced = match retarget(&sql, from, &self.config.database) {
                Cow::Owned(rewritten) => Some(rewritten),
                Cow::Borrowed(_) => None,
            };
            if let Some(rewritten) = replaced {
                sql = rewritten;
            }
        }
        fit_statement(sql, self.config.max_query_size)
    }

    async fn execute(
        &self,
        worker: usize,
        exec: &mut dyn StatementExecutor,
        sql: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TableError> {
        // Stop between statements, never inside one.
        if cancel.is_cancelled() {
            return Err(TableError::Cancelled);
        }
        match exec.execute(sql).await {
            Ok(_) => {
                self.progress.statement_applied(worker, sql.len());
                Ok(())
            }
            Err(ExecError::Statement(msg)) => Err(TableError::Statement(msg)),
            Err(ExecError::Connection(msg)) => Err(TableError::Fatal(RestoreError::Connection(msg))),
        }
    }

    async fn run_file(
        &self,
        worker: usize,
        exec: &mut dyn StatementExecutor,
        path: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TableError> {
        let sql = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TableError::Statement(format!("cannot read {}: {}", path.display(), e)))?;
        for statement in split_statements(&sql) {
            for piece in self.prepare(statement) {
                self.execute(worker, exec, &piece, cancel).await?;
            }
        }
        Ok(())
    }

    async fn restore_table(
        &self,
        worker: usize,
        exec: &mut dyn StatementExecutor,
        table: &TableFiles,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TableError> {
        let steps = self.plan.steps;
        if steps.drop_existing {
            let drop = format!("DROP TABLE IF EXISTS {}", quote_ident(&table.name));
            self.execute(worker, exec, &drop, cancel).await?;
        }
        if steps.create_schema {
            if let Some(schema) = &table.schema {
                self.detail(schema, &table.name, "schema");
                self.run_file(worker, exec, schema, cancel).await?;
            }
        }
        if steps.load_data {
            for chunk in &table.data {
                self.detail(chunk, &table.name, "data");
                self.run_file(worker, exec, chunk, cancel).await?;
            }
        }
        Ok(())
    }
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    let mut session: Option<Box<dyn StatementExecutor>> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(table) = shared.queue.lock().pop_front() else {
            break;
        };
        if session.is_none() {
            match connector.connect().await {
                Ok(exec) => session = Some(exec),
                Err(e) => {
                    report.fatal = Some(e);
                    break;
                }
            }
        }
        let Some(exec) = session.as_mut() else {
            break;
        };

        shared.progress.start_table(worker, &table.name);
        let started = Instant::now();
        match shared.restore_table(worker, exec.as_mut(), &table, &cancel).await {
            Ok(()) => {
                shared.progress.finish_table(worker, false);
                info!(table = %table.name, worker, elapsed = ?started.elapsed(), "table restored");
                report.restored.push(table.name);
            }
            Err(TableError::Statement(error)) => {
                shared.progress.finish_table(worker, true);
                warn!(table = %table.name, worker, "table failed to restore: {}", error);
                report.failed.push(TableFailure {
                    table: table.name,
                    error,
                });
            }
            Err(TableError::Cancelled) => {
                debug!(table = %table.name, worker, "worker stopped before finishing table");
                break;
            }
            Err(TableError::Fatal(e)) => {
                report.fatal = Some(e);
                break;
            }
        }
    }

    if let Some(session) = session {
        session.close().await;
    }
    report
}

/// Runs a restore plan over a pool of workers.
pub struct Loader {
    config: Arc<RestoreConfig>,
    connector: Arc<dyn Connector>,
    progress: Arc<Progress>,
}

impl Loader {
    pub fn new(config: RestoreConfig, connector: Arc<dyn Connector>) -> Self {
        let progress = Arc::new(Progress::new(config.workers));
        Self {
            config: Arc::new(config),
            connector,
            progress,
        }
    }

    /// Live counters, readable while the run is in progress.
    pub fn progress(&self) -> Arc<Progress> {
        self.progress.clone()
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RestoreSummary> {
        let plan = RestorePlan::build(&self.config)?;
        self.run_plan(plan, cancel).await
    }

    /// Restores every table in `plan`, then its views.
    ///
    /// Tables that fail with a server error are reported in the summary and the
    /// run continues. A lost session stops every worker. Cancellation lets each
    /// worker finish its current statement and yields `Cancelled` unless every
    /// table had already been restored or failed.
    pub async fn run_plan(&self, plan: RestorePlan, cancel: CancellationToken) -> Result<RestoreSummary> {
        let started = Instant::now();
        let plan = Arc::new(plan);
        self.progress.set_total(plan.tables.len());
        info!(
            tables = plan.tables.len(),
            views = plan.views.len(),
            workers = self.config.workers,
            "starting restore"
        );

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            plan: plan.clone(),
            progress: self.progress.clone(),
            queue: Mutex::new(plan.tables.iter().cloned().collect()),
        });
        let stop_reporter = CancellationToken::new();
        let reporter = tokio::spawn(report_progress(
            self.progress.clone(),
            self.config.poll_interval(),
            stop_reporter.clone(),
        ));

        let result = self.run_tables_and_views(&shared, &cancel).await;
        stop_reporter.cancel();
        let _ = reporter.await;

        let mut summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                if e.is_cancelled() {
                    info!(
                        completed = self.progress.snapshot().tables_completed,
                        "restore cancelled; completed tables are kept"
                    );
                }
                return Err(e);
            }
        };

        let snapshot = self.progress.snapshot();
        summary.statements = snapshot.statements;
        summary.bytes = snapshot.bytes;
        summary.elapsed = started.elapsed();

        if !plan.tables.is_empty() && summary.tables_restored.is_empty() {
            return Err(RestoreError::Statement {
                failures: summary.failed_tables,
            });
        }
        info!(
            restored = summary.tables_restored.len(),
            failed = summary.failed_tables.len(),
            views = summary.views_restored.len(),
            elapsed = ?summary.elapsed,
            "restore finished"
        );
        Ok(summary)
    }

    async fn run_tables_and_views(&self, shared: &Arc<Shared>, cancel: &CancellationToken) -> Result<RestoreSummary> {
        let abort = cancel.child_token();
        let workers = self.config.workers.max(1).min(shared.plan.tables.len());
        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(run_worker(worker, shared.clone(), self.connector.clone(), abort.clone()));
        }

        let mut summary = RestoreSummary::default();
        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => WorkerReport {
                    fatal: Some(RestoreError::Connection(format!("loader worker failed: {}", e))),
                    ..Default::default()
                },
            };
            summary.tables_restored.extend(report.restored);
            summary.failed_tables.extend(report.failed);
            if let Some(e) = report.fatal {
                if fatal.is_none() {
                    warn!("stopping all workers: {}", e);
                    abort.cancel();
                    fatal = Some(e);
                }
            }
        }

        // A cancel that lands after the last table is done leaves nothing undone.
        let finished = summary.tables_restored.len() + summary.failed_tables.len();
        if cancel.is_cancelled() && finished < shared.plan.tables.len() {
            return Err(RestoreError::Cancelled);
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        summary.tables_restored.sort();
        summary.failed_tables.sort_by(|a, b| a.table.cmp(&b.table));

        if !shared.plan.views.is_empty() {
            let (restored, failed) = self.restore_views(shared, cancel).await?;
            summary.views_restored = restored;
            summary.failed_views = failed;
        }
        Ok(summary)
    }

    async fn restore_views(
        &self,
        shared: &Shared,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, Vec<TableFailure>)> {
        let mut exec = self.connector.connect().await?;
        let mut restored = Vec::new();
        let mut failed = Vec::new();
        let mut outcome = Ok(());

        for view in &shared.plan.views {
            shared.detail(&view.path, &view.name, "view");
            match shared.run_file(0, exec.as_mut(), &view.path, cancel).await {
                Ok(()) => restored.push(view.name.clone()),
                Err(TableError::Statement(error)) => {
                    warn!(view = %view.name, "view failed to restore: {}", error);
                    failed.push(TableFailure {
                        table: view.name.clone(),
                        error,
                    });
                }
                Err(TableError::Cancelled) => {
                    outcome = Err(RestoreError::Cancelled);
                    break;
                }
                Err(TableError::Fatal(e)) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        exec.close().await;
        outcome.map(|()| (restored, failed))
    }
}
