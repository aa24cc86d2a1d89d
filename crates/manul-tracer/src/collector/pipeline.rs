//! Write pipeline between the traced transport and the store
//!
//! Finished traces are queued without blocking the request path, batched by
//! size or age and written to SQLite in one transaction per batch. Session
//! events are applied after the pending batch so totals see every trace.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::db::SqliteStore;
use crate::error::{Error, Result};
use crate::models::TraceRecord;

use super::sink::TraceSink;

enum Event {
    Trace(Box<TraceRecord>),
    SessionActivity(String),
    EndSession {
        session_id: String,
        ended_at: DateTime<Utc>,
    },
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Batching writer implementing [`TraceSink`]
pub struct Pipeline {
    config: CollectorConfig,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    store: SqliteStore,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl Pipeline {
    /// Create a pipeline writing to `store`. Nothing is written until
    /// [`Pipeline::start`] runs.
    pub fn new(config: &CollectorConfig, store: SqliteStore) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));

        Self {
            config: config.clone(),
            tx,
            rx: Mutex::new(Some(rx)),
            store,
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Store the pipeline writes to
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Run the processing loop until [`Pipeline::shutdown`] is called
    pub async fn start(&self) {
        let mut rx = {
            let mut guard = self.rx.lock();
            match guard.take() {
                Some(rx) => rx,
                None => {
                    error!("Pipeline already started");
                    return;
                }
            }
        };

        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<TraceRecord> = Vec::with_capacity(batch_size);
        let mut flush_interval = interval(self.config.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            batch_size,
            flush_interval = %humantime::format_duration(self.config.flush_interval),
            "Pipeline started"
        );

        loop {
            tokio::select! {
                Some(event) = rx.recv() => match event {
                    Event::Trace(trace) => {
                        batch.push(*trace);
                        if batch.len() >= batch_size {
                            self.flush_batch(&mut batch).await;
                        }
                    }
                    Event::SessionActivity(session_id) => {
                        self.flush_batch(&mut batch).await;
                        match self.store.update_session_activity(&session_id).await {
                            Ok(true) => {}
                            Ok(false) => debug!(session_id = %session_id, "Session activity for unknown session"),
                            Err(e) => error!(session_id = %session_id, error = %e, "Failed to update session activity"),
                        }
                    }
                    Event::EndSession { session_id, ended_at } => {
                        self.flush_batch(&mut batch).await;
                        if let Err(e) = self.store.end_session(&session_id, ended_at).await {
                            error!(session_id = %session_id, error = %e, "Failed to end session");
                        }
                    }
                    Event::Flush(ack) => {
                        self.flush_batch(&mut batch).await;
                        let _ = ack.send(());
                    }
                    Event::Shutdown(ack) => {
                        self.flush_batch(&mut batch).await;
                        info!("Pipeline stopped");
                        let _ = ack.send(());
                        break;
                    }
                },

                _ = flush_interval.tick() => {
                    self.flush_batch(&mut batch).await;
                }

                else => {
                    self.flush_batch(&mut batch).await;
                    info!("Pipeline stopped");
                    break;
                }
            }
        }
    }

    /// Write everything queued so far
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Event::Flush(ack))
            .await
            .map_err(|_| Error::sink("pipeline is not running"))?;
        done.await
            .map_err(|_| Error::sink("pipeline stopped before flushing"))
    }

    /// Write everything queued, then stop the loop. Later events are rejected.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (ack, done) = oneshot::channel();
        self.tx
            .send(Event::Shutdown(ack))
            .await
            .map_err(|_| Error::sink("pipeline is not running"))?;
        done.await
            .map_err(|_| Error::sink("pipeline stopped before shutting down"))
    }

    /// Get pipeline statistics
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queue_capacity: self.tx.capacity(),
            queue_max_capacity: self.config.buffer_size.max(1),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::sink("pipeline is shut down"));
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::sink("pipeline queue is full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::sink("pipeline is not running"))
            }
        }
    }

    async fn flush_batch(&self, batch: &mut Vec<TraceRecord>) {
        if batch.is_empty() {
            return;
        }

        let size = batch.len() as u64;
        debug!(size, "Flushing trace batch");

        match self.store.persist_batch(batch).await {
            Ok(written) => {
                self.counters
                    .persisted
                    .fetch_add(written as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(size, Ordering::Relaxed);
                error!(size, error = %e, "Failed to persist trace batch");
                // write trace by trace so only the bad records are lost
                self.retry_individually(batch).await;
            }
        }

        batch.clear();
    }

    async fn retry_individually(&self, batch: &[TraceRecord]) {
        for trace in batch {
            match self.store.persist_trace(trace).await {
                Ok(()) => {
                    self.counters.failed.fetch_sub(1, Ordering::Relaxed);
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(trace_id = %trace.trace_id, error = %e, "Dropping trace"),
            }
        }
    }
}

impl TraceSink for Pipeline {
    fn persist(&self, trace: &TraceRecord) -> Result<()> {
        self.enqueue(Event::Trace(Box::new(trace.clone())))
    }

    fn update_session_activity(&self, session_id: &str) -> Result<()> {
        self.enqueue(Event::SessionActivity(session_id.to_string()))
    }

    fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<()> {
        self.enqueue(Event::EndSession {
            session_id: session_id.to_string(),
            ended_at,
        })
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    /// Current queue capacity (available slots)
    pub queue_capacity: usize,
    /// Maximum queue capacity
    pub queue_max_capacity: usize,
    /// Events accepted into the queue
    pub enqueued: u64,
    /// Events rejected because the queue was full or closed
    pub dropped: u64,
    /// Traces written to the store
    pub persisted: u64,
    /// Traces that could not be written
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn pipeline(config: CollectorConfig) -> Arc<Pipeline> {
        let store = SqliteStore::connect_url("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Arc::new(Pipeline::new(&config, store))
    }

    fn spawn(pipeline: &Arc<Pipeline>) -> tokio::task::JoinHandle<()> {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.start().await })
    }

    fn trace(session_id: &str, tokens: i64) -> TraceRecord {
        let mut trace = TraceRecord::new(session_id);
        trace.request_timestamp = Some(Utc::now());
        trace.total_tokens = Some(tokens);
        trace.mark_completed();
        trace
    }

    #[tokio::test]
    async fn test_flush_writes_queued_traces() {
        let pipeline = pipeline(CollectorConfig::default()).await;
        let handle = spawn(&pipeline);

        let first = trace("s1", 5);
        pipeline.persist(&first).unwrap();
        pipeline.persist(&trace("s1", 7)).unwrap();
        pipeline.update_session_activity("s1").unwrap();
        pipeline.flush().await.unwrap();

        assert!(pipeline.store().get_trace(&first.trace_id).await.unwrap().is_some());
        let session = pipeline.store().get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.total_requests, 2);
        assert_eq!(session.total_tokens, 12);

        let stats = pipeline.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.persisted, 2);
        assert_eq!(stats.failed, 0);

        pipeline.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_flushes_partial_batch() {
        let config = CollectorConfig {
            flush_interval: Duration::from_millis(20),
            ..CollectorConfig::default()
        };
        let pipeline = pipeline(config).await;
        let handle = spawn(&pipeline);

        let queued = trace("s1", 1);
        pipeline.persist(&queued).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(pipeline.store().get_trace(&queued.trace_id).await.unwrap().is_some());
        pipeline.shutdown().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_rejects_later_events() {
        let pipeline = pipeline(CollectorConfig::default()).await;
        let handle = spawn(&pipeline);

        let queued = trace("s1", 1);
        pipeline.persist(&queued).unwrap();
        pipeline.end_session("s1", Utc::now()).unwrap();
        pipeline.shutdown().await.unwrap();
        handle.await.unwrap();

        let session = pipeline.store().get_session("s1").await.unwrap().unwrap();
        assert!(session.ended_at.is_some());
        assert!(pipeline.store().get_trace(&queued.trace_id).await.unwrap().is_some());

        assert!(matches!(pipeline.persist(&trace("s1", 1)), Err(Error::Sink(_))));
        assert_eq!(pipeline.stats().dropped, 1);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let config = CollectorConfig {
            buffer_size: 1,
            ..CollectorConfig::default()
        };
        let pipeline = pipeline(config).await;

        pipeline.persist(&trace("s1", 1)).unwrap();
        let err = pipeline.persist(&trace("s1", 1)).unwrap_err();

        assert!(err.to_string().contains("full"));
        assert_eq!(pipeline.stats().dropped, 1);
        assert_eq!(pipeline.stats().queue_capacity, 0);
    }
}
