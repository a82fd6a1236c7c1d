use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// What one worker is doing right now.
#[derive(Debug, Default)]
struct WorkerSlot {
    table: Mutex<Option<String>>,
    /// Bytes of the current table's statement stream already applied.
    offset: AtomicU64,
}

/// Run-wide counters. Workers update them, any task may read a snapshot.
#[derive(Debug)]
pub struct Progress {
    started: Instant,
    tables_total: AtomicUsize,
    tables_completed: AtomicUsize,
    tables_failed: AtomicUsize,
    bytes: AtomicU64,
    statements: AtomicU64,
    workers: Vec<WorkerSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub tables_total: usize,
    pub tables_completed: usize,
    pub tables_failed: usize,
    /// Tables currently held by a worker, in worker order.
    pub in_flight: Vec<String>,
    pub bytes: u64,
    pub statements: u64,
    pub elapsed: Duration,
}

impl Progress {
    pub fn new(workers: usize) -> Self {
        Self {
            started: Instant::now(),
            tables_total: AtomicUsize::new(0),
            tables_completed: AtomicUsize::new(0),
            tables_failed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            statements: AtomicU64::new(0),
            workers: (0..workers).map(|_| WorkerSlot::default()).collect(),
        }
    }

    pub(crate) fn set_total(&self, tables: usize) {
        self.tables_total.store(tables, Ordering::Relaxed);
    }

    pub(crate) fn start_table(&self, worker: usize, table: &str) {
        if let Some(slot) = self.workers.get(worker) {
            *slot.table.lock() = Some(table.to_string());
            slot.offset.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn statement_applied(&self, worker: usize, bytes: usize) {
        self.statements.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Some(slot) = self.workers.get(worker) {
            slot.offset.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn finish_table(&self, worker: usize, failed: bool) {
        if let Some(slot) = self.workers.get(worker) {
            *slot.table.lock() = None;
        }
        if failed {
            self.tables_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tables_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bytes applied by `worker` for the table it is restoring.
    pub fn worker_offset(&self, worker: usize) -> Option<u64> {
        self.workers.get(worker).map(|slot| slot.offset.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            tables_total: self.tables_total.load(Ordering::Relaxed),
            tables_completed: self.tables_completed.load(Ordering::Relaxed),
            tables_failed: self.tables_failed.load(Ordering::Relaxed),
            in_flight: self
                .workers
                .iter()
                .filter_map(|slot| slot.table.lock().clone())
                .collect(),
            bytes: self.bytes.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tables restored, {} in flight, {} failed, {} statements, {:.1} MiB in {:.1}s",
            self.tables_completed,
            self.tables_total,
            self.in_flight.len(),
            self.tables_failed,
            self.statements,
            self.bytes as f64 / (1024.0 * 1024.0),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Logs a progress line every `every` until `cancel` fires.
pub async fn report_progress(progress: Arc<Progress>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let snapshot = progress.snapshot();
                info!(
                    completed = snapshot.tables_completed,
                    total = snapshot.tables_total,
                    in_flight = ?snapshot.in_flight,
                    bytes = snapshot.bytes,
                    "{}", snapshot
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_workers() {
        let progress = Progress::new(2);
        progress.set_total(3);
        progress.start_table(0, "accounts");
        progress.start_table(1, "logs");
        progress.statement_applied(0, 100);
        progress.statement_applied(1, 50);
        progress.statement_applied(1, 50);

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.in_flight, vec!["accounts", "logs"]);
        assert_eq!(snapshot.bytes, 200);
        assert_eq!(snapshot.statements, 3);
        assert_eq!(progress.worker_offset(1), Some(100));

        progress.finish_table(0, false);
        progress.finish_table(1, true);
        let snapshot = progress.snapshot();
        assert!(snapshot.in_flight.is_empty());
        assert_eq!(snapshot.tables_completed, 1);
        assert_eq!(snapshot.tables_failed, 1);
        assert!(snapshot.to_string().starts_with("1/3 tables restored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let reporter = tokio::spawn(report_progress(
            Arc::new(Progress::new(1)),
            Duration::from_secs(10),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        reporter.await.unwrap();
    }
}
