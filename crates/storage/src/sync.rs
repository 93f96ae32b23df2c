//! Background synchronization between the local store and the remote
//! replica. One cycle walks Pulling -> Pushing -> Reconciling; cursors
//! advance only after the work they describe has committed, so a crashed
//! cycle re-does already-applied work instead of corrupting either side.

use crate::backend::StoreBackend;
use crate::cache::CacheScope;
use crate::records::{self, RecordStore};
use crate::remote::RemoteReplica;
use chrono::{DateTime, Utc};
use pagevault_core::types::{format_ts, CapturedArtifact, NewAuditEntry};
use pagevault_core::{Error, Result, SyncConfig};
use rusqlite::params;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

const SYNC_TABLE: &str = "artifacts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Pushing,
    Reconciling,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// Progress events, one per completed unit of sync work. Consumers subscribe
/// instead of handing the service a callback.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    Pulled { applied: usize },
    Pushed { sent: usize },
    ConflictResolved { id: String, winner: ConflictWinner },
    CycleFailed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub pending_push: u64,
    pub pending_pull: u64,
}

/// Per-table replication watermarks. `last_pulled` is the remote change
/// sequence, `last_pushed` the local `updated_at` high-water mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub last_pulled: String,
    pub last_pushed: String,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts: usize,
}

struct PendingConflict {
    local: CapturedArtifact,
    remote: CapturedArtifact,
}

pub struct SyncService {
    records: RecordStore,
    remote: Arc<dyn RemoteReplica>,
    interval: Duration,
    batch_size: u32,
    cursor: Mutex<SyncCursor>,
    phase: Mutex<SyncPhase>,
    health: Mutex<SyncHealth>,
    cycle_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    wake: Notify,
    stop_wake: Notify,
    stopped: AtomicBool,
}

impl SyncService {
    pub fn new(
        records: RecordStore,
        remote: Arc<dyn RemoteReplica>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let cursor = load_cursor(records.backend())?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            records,
            remote,
            interval: config.interval(),
            batch_size: config.batch_size.max(1),
            cursor: Mutex::new(cursor),
            phase: Mutex::new(SyncPhase::Idle),
            health: Mutex::new(SyncHealth::default()),
            cycle_lock: tokio::sync::Mutex::new(()),
            events,
            wake: Notify::new(),
            stop_wake: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        *lock_recover(&self.phase)
    }

    pub fn health(&self) -> SyncHealth {
        lock_recover(&self.health).clone()
    }

    pub fn cursor(&self) -> SyncCursor {
        lock_recover(&self.cursor).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Ask for a cycle outside the schedule. A trigger while a cycle is
    /// running coalesces into one follow-up run.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_wake.notify_one();
    }

    /// Drive the fixed schedule until `stop()`. The on-demand trigger shares
    /// the same loop, so at most one cycle is ever in flight.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Sync service started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = self.stop_wake.notified() => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                info!("Sync service stopped");
                return;
            }
            if let Err(e) = self.sync_now().await {
                warn!(error = %e, "Sync cycle failed; will retry next tick");
            }
        }
    }

    /// Run one full cycle. Errors mark the cycle failed and leave local
    /// state authoritative; the next tick retries.
    pub async fn sync_now(&self) -> Result<CycleReport> {
        let _guard = self.cycle_lock.lock().await;
        let outcome = self.cycle_inner().await;
        match &outcome {
            Ok(report) => {
                let pending_push = match self.records.pending_push_count(&self.cursor().last_pushed)
                {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Pending-push recount failed");
                        lock_recover(&self.health).pending_push
                    }
                };
                let pending_pull = match self.remote.count_changes(&self.cursor().last_pulled).await
                {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Pending-pull probe failed");
                        lock_recover(&self.health).pending_pull
                    }
                };
                {
                    let mut health = lock_recover(&self.health);
                    health.last_success = Some(Utc::now());
                    health.consecutive_failures = 0;
                    health.pending_push = pending_push;
                    health.pending_pull = pending_pull;
                }
                self.set_phase(SyncPhase::Idle);
                debug!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    conflicts = report.conflicts,
                    "Sync cycle completed"
                );
            }
            Err(e) => {
                self.set_phase(SyncPhase::Failed);
                lock_recover(&self.health).consecutive_failures += 1;
                self.emit(SyncEvent::CycleFailed {
                    error: e.to_string(),
                });
                self.set_phase(SyncPhase::Idle);
            }
        }
        outcome
    }

    async fn cycle_inner(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.set_phase(SyncPhase::Pulling);
        let conflicts = self.pull(&mut report).await?;

        self.set_phase(SyncPhase::Pushing);
        self.push(&mut report).await?;

        self.set_phase(SyncPhase::Reconciling);
        self.reconcile(conflicts, &mut report).await?;

        Ok(report)
    }

    /// Fetch remote changes strictly after the pull cursor and apply them
    /// locally. Rows also modified locally since the last push are held back
    /// as conflicts for the reconcile phase. The cursor advance is the last
    /// statement of each batch transaction.
    async fn pull(&self, report: &mut CycleReport) -> Result<Vec<PendingConflict>> {
        let mut conflicts = Vec::new();
        loop {
            let (after, push_watermark) = {
                let cursor = lock_recover(&self.cursor);
                (cursor.last_pulled.clone(), cursor.last_pushed.clone())
            };
            let changes = self.remote.fetch_changes(&after, self.batch_size).await?;
            if changes.is_empty() {
                break;
            }
            let batch_len = changes.len();
            let max_seq = changes.iter().map(|c| c.seq).max().unwrap_or(0).to_string();

            let mut scopes = Vec::new();
            let mut applied = 0usize;
            let backend = self.records.backend().clone();
            backend.with_transaction(|conn| {
                for change in &changes {
                    let local = records::get_in_tx(conn, &change.artifact.id)?;
                    match local {
                        Some(local) if local == change.artifact => {}
                        Some(local) if format_ts(&local.updated_at) > push_watermark => {
                            conflicts.push(PendingConflict {
                                local,
                                remote: change.artifact.clone(),
                            });
                        }
                        _ => {
                            records::upsert_in_tx(conn, &change.artifact)?;
                            scopes.push(CacheScope::of_record(&change.artifact));
                            applied += 1;
                        }
                    }
                }
                save_cursor_in_tx(conn, Some(&max_seq), None)
            })?;

            lock_recover(&self.cursor).last_pulled = max_seq;
            for scope in &scopes {
                self.records.cache().invalidate(scope);
            }
            report.pulled += applied;
            self.emit(SyncEvent::Pulled { applied });

            if batch_len < self.batch_size as usize {
                break;
            }
        }
        Ok(conflicts)
    }

    /// Transmit local rows modified after the push cursor. The cursor only
    /// advances once the remote write succeeded, so a crash between the two
    /// re-sends an idempotent batch.
    async fn push(&self, report: &mut CycleReport) -> Result<()> {
        loop {
            let after = lock_recover(&self.cursor).last_pushed.clone();
            let batch = self.records.modified_since(&after, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            self.remote.upsert_batch(&batch).await?;

            let max_ts = batch
                .iter()
                .map(|a| format_ts(&a.updated_at))
                .max()
                .unwrap_or(after);
            self.records.backend().with_transaction(|conn| {
                save_cursor_in_tx(conn, None, Some(&max_ts))
            })?;
            lock_recover(&self.cursor).last_pushed = max_ts;

            report.pushed += batch_len;
            self.emit(SyncEvent::Pushed { sent: batch_len });

            if batch_len < self.batch_size as usize {
                break;
            }
        }
        Ok(())
    }

    /// Resolve rows modified on both sides by last-write-wins on the
    /// record's own timestamp; equal timestamps fall back to content-hash
    /// ordering. Every resolution leaves an audit note.
    async fn reconcile(
        &self,
        conflicts: Vec<PendingConflict>,
        report: &mut CycleReport,
    ) -> Result<()> {
        for PendingConflict { local, remote } in conflicts {
            let winner = if remote.updated_at > local.updated_at {
                ConflictWinner::Remote
            } else if remote.updated_at < local.updated_at {
                ConflictWinner::Local
            } else if remote.hash == local.hash {
                // Same content and timestamp on both sides; nothing to merge.
                continue;
            } else if remote.hash > local.hash {
                ConflictWinner::Remote
            } else {
                ConflictWinner::Local
            };

            let (kept, discarded) = match winner {
                ConflictWinner::Remote => (&remote, &local),
                ConflictWinner::Local => (&local, &remote),
            };

            if winner == ConflictWinner::Remote {
                self.records
                    .backend()
                    .with_transaction(|conn| records::upsert_in_tx(conn, &remote))?;
                self.records.cache().invalidate(&CacheScope::of_record(&remote));
            }
            // The push phase already sent the losing local copy; restore the
            // winner on the replica so both sides converge this cycle.
            self.remote.upsert_batch(std::slice::from_ref(kept)).await?;

            self.records.append_audit(NewAuditEntry {
                instance_id: kept.instance_id.clone(),
                tenant_id: kept.tenant_id.clone(),
                user_id: kept.user_id.clone(),
                tool_name: "sync.reconcile".to_string(),
                input_summary: format!("artifact {} modified on both sides", kept.id),
                result_summary: format!(
                    "kept {:?} copy updated at {}, discarded copy updated at {}",
                    winner,
                    format_ts(&kept.updated_at),
                    format_ts(&discarded.updated_at)
                ),
                error: None,
                duration_ms: 0,
            })?;

            info!(id = %kept.id, winner = ?winner, "Sync conflict resolved");
            self.emit(SyncEvent::ConflictResolved {
                id: kept.id.clone(),
                winner,
            });
            report.conflicts += 1;
        }
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        *lock_recover(&self.phase) = phase;
        self.emit(SyncEvent::PhaseChanged(phase));
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn load_cursor(backend: &StoreBackend) -> Result<SyncCursor> {
    backend.with_transaction(|conn| {
        conn.execute(
            "INSERT OR IGNORE INTO sync_cursors (table_name, last_pulled, last_pushed)
             VALUES (?1, '', '')",
            params![SYNC_TABLE],
        )
        .map_err(|e| Error::Storage(format!("Cursor init failed: {}", e)))?;
        conn.query_row(
            "SELECT last_pulled, last_pushed FROM sync_cursors WHERE table_name = ?1",
            params![SYNC_TABLE],
            |row| {
                Ok(SyncCursor {
                    last_pulled: row.get(0)?,
                    last_pushed: row.get(1)?,
                })
            },
        )
        .map_err(|e| Error::Storage(format!("Cursor load failed: {}", e)))
    })
}

fn save_cursor_in_tx(
    conn: &rusqlite::Connection,
    last_pulled: Option<&str>,
    last_pushed: Option<&str>,
) -> Result<()> {
    if let Some(pulled) = last_pulled {
        conn.execute(
            "UPDATE sync_cursors SET last_pulled = ?1 WHERE table_name = ?2",
            params![pulled, SYNC_TABLE],
        )
        .map_err(|e| Error::Storage(format!("Cursor save failed: {}", e)))?;
    }
    if let Some(pushed) = last_pushed {
        conn.execute(
            "UPDATE sync_cursors SET last_pushed = ?1 WHERE table_name = ?2",
            params![pushed, SYNC_TABLE],
        )
        .map_err(|e| Error::Storage(format!("Cursor save failed: {}", e)))?;
    }
    Ok(())
}
