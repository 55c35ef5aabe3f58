use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{MemoryStore, Store, StoreError, StoreRecord};

enum WalCommand {
    Append {
        record: StoreRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<StoreRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that arrive while a flush is pending share one fsync:
/// block for the first append, drain whatever else is queued, flush once, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { record, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(StoreRecord, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch.iter().try_for_each(|(record, _)| wal.append_buffered(record));
    // Flush even after a failed append so buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// `MemoryStore` made durable by a write-ahead log.
///
/// Every write is appended and fsynced before it becomes visible. `maintain`
/// rewrites the log as a snapshot once enough appends have accumulated.
pub struct DurableStore {
    inner: MemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    compact_threshold: u64,
    /// Writers share it; compaction takes it exclusively so no append lands
    /// between the snapshot and the log swap.
    gate: RwLock<()>,
}

impl DurableStore {
    /// Replay `path` and start the background writer. Must be called inside a Tokio runtime.
    pub fn open(path: &Path, compact_threshold: u64) -> io::Result<Self> {
        let records = Wal::replay(path)?;
        let replayed = records.len();
        let wal = Wal::open(path)?;

        let inner = MemoryStore::new();
        for record in records {
            inner.apply(record);
        }
        info!("replayed {replayed} records from {}", path.display());

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            inner,
            wal_tx,
            compact_threshold,
            gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, record: &StoreRecord) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn persist(&self, record: StoreRecord) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        self.wal_append(&record).await?;
        self.inner.apply(record);
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the log with only the records needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;
        let records = self.inner.snapshot();
        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        info!("compacted WAL to {count} records");
        Ok(())
    }
}

#[async_trait]
impl Store for DurableStore {
    async fn put_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        self.persist(StoreRecord::Resource(resource.clone())).await
    }

    async fn get_resource(&self, id: Ulid) -> Result<Option<Resource>, StoreError> {
        self.inner.get_resource(id).await
    }

    async fn list_resources(&self) -> Result<Vec<Resource>, StoreError> {
        self.inner.list_resources().await
    }

    async fn put_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.persist(StoreRecord::Reservation(reservation.clone())).await
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        self.inner.get_reservation(id).await
    }

    async fn overlapping_reservations(
        &self,
        resource_id: Ulid,
        span: Span,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.inner.overlapping_reservations(resource_id, span).await
    }

    async fn reservations_with_status(
        &self,
        status: ReservationStatus,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.inner.reservations_with_status(status).await
    }

    async fn put_waitlist_entry(&self, entry: &WaitlistEntry) -> Result<(), StoreError> {
        self.persist(StoreRecord::Waitlist(entry.clone())).await
    }

    async fn get_waitlist_entry(&self, id: Ulid) -> Result<Option<WaitlistEntry>, StoreError> {
        self.inner.get_waitlist_entry(id).await
    }

    async fn waitlist_for_resource(&self, resource_id: Ulid) -> Result<Vec<WaitlistEntry>, StoreError> {
        self.inner.waitlist_for_resource(resource_id).await
    }

    async fn open_waitlist_entries(&self) -> Result<Vec<WaitlistEntry>, StoreError> {
        self.inner.open_waitlist_entries().await
    }

    async fn put_rule(&self, rule: &RecurrenceRule) -> Result<(), StoreError> {
        self.persist(StoreRecord::Rule(rule.clone())).await
    }

    async fn get_rule(&self, id: Ulid) -> Result<Option<RecurrenceRule>, StoreError> {
        self.inner.get_rule(id).await
    }

    async fn list_rules(&self) -> Result<Vec<RecurrenceRule>, StoreError> {
        self.inner.list_rules().await
    }

    async fn put_notification(&self, job: &NotificationJob) -> Result<(), StoreError> {
        self.persist(StoreRecord::Notification(job.clone())).await
    }

    async fn get_notification(&self, id: Ulid) -> Result<Option<NotificationJob>, StoreError> {
        self.inner.get_notification(id).await
    }

    async fn notifications_with_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<NotificationJob>, StoreError> {
        self.inner.notifications_with_status(status).await
    }

    async fn delete_notification(&self, id: Ulid) -> Result<(), StoreError> {
        self.persist(StoreRecord::NotificationDeleted(id)).await
    }

    async fn maintain(&self) -> Result<(), StoreError> {
        if self.appends_since_compact().await >= self.compact_threshold {
            self.compact().await?;
        }
        Ok(())
    }
}
