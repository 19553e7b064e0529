// ========== Run Recorder ==========

use async_trait::async_trait;
use func_lib::{FnError, FnResult, FunctionId, RunRecord, RunStatus};
use log::{debug, warn};
use rusqlite::params;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::meta_db::{map_db_err, MetaDb};

#[async_trait]
pub trait RunRecordSink: Send + Sync {
    async fn write(&self, record: RunRecord) -> FnResult<()>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunRecorderStats {
    pub accepted: u64,
    pub dropped: u64,
    pub failed: u64,
    pub written: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    written: AtomicU64,
}

/// Best-effort invocation log. `record` never waits: when the queue is full
/// the record is dropped and counted.
pub struct RunRecorder {
    sender: Mutex<Option<mpsc::Sender<RunRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl RunRecorder {
    /// Spawns the drain task on the current tokio runtime.
    pub fn start(sink: Arc<dyn RunRecordSink>, queue_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<RunRecord>(queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        let worker = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                let trace_id = record.trace_id.clone();
                match sink.write(record).await {
                    Ok(()) => {
                        worker_counters.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("write run record {} failed: {}", trace_id, err);
                    }
                }
            }
            debug!("run recorder drained");
        });

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    /// Returns false if the record was dropped.
    pub fn record(&self, record: RunRecord) -> bool {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.as_ref().cloned(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("run recorder closed, dropping record {}", record.trace_id);
            return false;
        };
        match sender.try_send(record) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("run record queue full, dropping record {}", record.trace_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("run recorder closed, dropping record {}", record.trace_id);
                false
            }
        }
    }

    pub fn stats(&self) -> RunRecorderStats {
        RunRecorderStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting records and waits until the queue is drained.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);
        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!("run recorder worker failed: {}", err);
            }
        }
    }
}

pub struct DbRunRecordSink {
    db: Arc<MetaDb>,
}

impl DbRunRecordSink {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    /// Newest first.
    pub async fn list_by_function(
        &self,
        function_id: FunctionId,
        limit: u32,
    ) -> FnResult<Vec<RunRecord>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT function_id, runner_id, trace_id, request, response, status,
                            message, start_ts, end_ts, cost_ms
                         FROM run_records WHERE function_id = ?1 ORDER BY id DESC LIMIT ?2",
                    )
                    .map_err(map_db_err)?;
                let rows = stmt
                    .query_map(params![function_id, limit as i64], |row| {
                        Ok((
                            RunRecord {
                                function_id: row.get(0)?,
                                runner_id: row.get(1)?,
                                trace_id: row.get(2)?,
                                request: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                                response: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                                status: RunStatus::Success,
                                message: row.get(6)?,
                                start_ts: row.get::<_, i64>(7)? as u64,
                                end_ts: row.get::<_, i64>(8)? as u64,
                                cost_ms: row.get::<_, i64>(9)? as u64,
                            },
                            row.get::<_, String>(5)?,
                        ))
                    })
                    .map_err(map_db_err)?;
                let mut records = Vec::new();
                for row in rows {
                    let (mut record, status) = row.map_err(map_db_err)?;
                    record.status = RunStatus::parse(&status)?;
                    records.push(record);
                }
                Ok(records)
            })
            .await
    }
}

#[async_trait]
impl RunRecordSink for DbRunRecordSink {
    async fn write(&self, record: RunRecord) -> FnResult<()> {
        self.db
            .with_conn(move |conn| {
                let changed = conn
                    .execute(
                        "INSERT INTO run_records
                            (function_id, runner_id, trace_id, request, response, status,
                             message, start_ts, end_ts, cost_ms)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            record.function_id,
                            record.runner_id,
                            record.trace_id,
                            record.request,
                            record.response,
                            record.status.as_str(),
                            record.message,
                            record.start_ts as i64,
                            record.end_ts as i64,
                            record.cost_ms as i64
                        ],
                    )
                    .map_err(map_db_err)?;
                if changed != 1 {
                    return Err(FnError::DbError("run record not inserted".to_string()));
                }
                Ok(())
            })
            .await
    }
}
