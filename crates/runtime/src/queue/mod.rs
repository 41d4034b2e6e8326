//! Durable job queue driver
//!
//! At-least-once delivery: a dequeued job stays invisible until it is acked;
//! if the visibility timeout lapses without an ack the job is re-delivered.
//! Priorities are advisory, FIFO within a priority level. Delayed enqueues
//! are promoted by a background task with roughly one-second accuracy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::config::QueueConfig;
use crate::types::{JobId, JobPayload, Priority};

/// Queue driver errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("job not found in queue: {job_id}")]
    UnknownJob { job_id: JobId },

    #[error("queue is shutting down")]
    ShuttingDown,
}

/// Options controlling how a job is enqueued
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub delay: Option<Duration>,
}

/// Queue driver operations
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Make a job available for dequeue, optionally after a delay.
    async fn enqueue(
        &self,
        job_id: JobId,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<(), QueueError>;

    /// Pop the next ready job for a worker. The job must be acked or nacked
    /// before `visibility_timeout` elapses or it is re-delivered.
    async fn dequeue(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<(JobId, JobPayload)>, QueueError>;

    /// Acknowledge successful handling; removes the job from the queue.
    async fn ack(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Return a job to the queue, optionally after a delay.
    async fn nack(&self, job_id: JobId, requeue_delay: Option<Duration>) -> Result<(), QueueError>;

    /// Number of jobs currently waiting (ready or delayed).
    async fn len(&self) -> Result<usize, QueueError>;

    /// 1-based position of a waiting job, 0 when not waiting.
    async fn position(&self, job_id: JobId) -> Result<usize, QueueError>;

    /// Remove a job that has not been dequeued yet. Returns false when the
    /// job is already in flight or unknown.
    async fn cancel_queued(&self, job_id: JobId) -> Result<bool, QueueError>;

    /// Attach metadata visible to status queries.
    async fn set_meta(&self, job_id: JobId, key: &str, value: Value) -> Result<(), QueueError>;

    /// Read back job metadata.
    async fn get_meta(&self, job_id: JobId) -> Result<Option<serde_json::Map<String, Value>>, QueueError>;

    /// Number of jobs currently dequeued and unacked.
    async fn in_flight(&self) -> Result<usize, QueueError>;
}

struct QueueEntry {
    payload: JobPayload,
    priority: Priority,
    seq: u64,
}

struct InFlightEntry {
    worker_id: String,
    deadline: Instant,
}

/// In-process queue driver
pub struct InMemoryQueue {
    entries: DashMap<JobId, QueueEntry>,
    ready: Mutex<[VecDeque<JobId>; 3]>,
    delayed: Mutex<Vec<(Instant, JobId)>>,
    in_flight: DashMap<JobId, InFlightEntry>,
    meta: DashMap<JobId, serde_json::Map<String, Value>>,
    seq: AtomicU64,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<parking_lot::RwLock<bool>>,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        let queue = Arc::new(Self {
            entries: DashMap::new(),
            ready: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            delayed: Mutex::new(Vec::new()),
            in_flight: DashMap::new(),
            meta: DashMap::new(),
            seq: AtomicU64::new(0),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(parking_lot::RwLock::new(true)),
        });

        queue.clone().start_promotion_loop(config.promotion_interval);
        queue
    }

    /// Promote delayed jobs whose wake time passed and re-deliver expired
    /// in-flight jobs.
    fn start_promotion_loop(self: Arc<Self>, period: Duration) {
        let queue = self;
        let shutdown_notify = queue.shutdown_notify.clone();
        let is_running = queue.is_running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*is_running.read() {
                            break;
                        }
                        queue.promote_due();
                        queue.redeliver_expired();
                    }
                    _ = shutdown_notify.notified() => {
                        break;
                    }
                }
            }
        });
    }

    fn promote_due(&self) {
        let now = Instant::now();
        let due: Vec<JobId> = {
            let mut delayed = self.delayed.lock();
            let (ready, pending): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|(wake, _)| *wake <= now);
            *delayed = pending;
            ready.into_iter().map(|(_, id)| id).collect()
        };
        for job_id in due {
            self.push_ready(job_id);
        }
    }

    fn redeliver_expired(&self) {
        let now = Instant::now();
        let expired: Vec<JobId> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for job_id in expired {
            if self.in_flight.remove(&job_id).is_some() {
                tracing::warn!("Job {} visibility expired, re-delivering", job_id);
                self.push_ready(job_id);
            }
        }
    }

    fn push_ready(&self, job_id: JobId) {
        if let Some(entry) = self.entries.get(&job_id) {
            let slot = entry.priority as usize;
            self.ready.lock()[slot].push_back(job_id);
        }
    }

    fn check_running(&self) -> Result<(), QueueError> {
        if *self.is_running.read() {
            Ok(())
        } else {
            Err(QueueError::ShuttingDown)
        }
    }

    pub fn shutdown(&self) {
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();
    }
}

#[async_trait]
impl QueueDriver for InMemoryQueue {
    async fn enqueue(
        &self,
        job_id: JobId,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        self.check_running()?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            job_id,
            QueueEntry {
                payload,
                priority: options.priority,
                seq,
            },
        );

        match options.delay {
            Some(delay) if !delay.is_zero() => {
                self.delayed.lock().push((Instant::now() + delay, job_id));
                tracing::debug!("Enqueued job {} with delay {:?}", job_id, delay);
            }
            _ => {
                self.push_ready(job_id);
                tracing::debug!("Enqueued job {} at priority {:?}", job_id, options.priority);
            }
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<(JobId, JobPayload)>, QueueError> {
        self.check_running()?;

        let job_id = {
            let mut ready = self.ready.lock();
            // High before normal before low
            [Priority::High, Priority::Normal, Priority::Low]
                .iter()
                .find_map(|p| ready[*p as usize].pop_front())
        };

        let Some(job_id) = job_id else {
            return Ok(None);
        };

        let Some(entry) = self.entries.get(&job_id) else {
            // Entry vanished under a concurrent cancel; skip it.
            return Ok(None);
        };
        let payload = entry.payload.clone();
        drop(entry);

        self.in_flight.insert(
            job_id,
            InFlightEntry {
                worker_id: worker_id.to_string(),
                deadline: Instant::now() + visibility_timeout,
            },
        );

        tracing::debug!("Worker {} dequeued job {}", worker_id, job_id);
        Ok(Some((job_id, payload)))
    }

    async fn ack(&self, job_id: JobId) -> Result<(), QueueError> {
        if self.in_flight.remove(&job_id).is_none() {
            return Err(QueueError::UnknownJob { job_id });
        }
        self.entries.remove(&job_id);
        self.meta.remove(&job_id);
        Ok(())
    }

    async fn nack(&self, job_id: JobId, requeue_delay: Option<Duration>) -> Result<(), QueueError> {
        if self.in_flight.remove(&job_id).is_none() {
            return Err(QueueError::UnknownJob { job_id });
        }
        match requeue_delay {
            Some(delay) if !delay.is_zero() => {
                self.delayed.lock().push((Instant::now() + delay, job_id));
            }
            _ => self.push_ready(job_id),
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let ready: usize = self.ready.lock().iter().map(|q| q.len()).sum();
        Ok(ready + self.delayed.lock().len())
    }

    async fn position(&self, job_id: JobId) -> Result<usize, QueueError> {
        let ready = self.ready.lock();
        let mut position = 0;
        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            for queued in ready[priority as usize].iter() {
                position += 1;
                if *queued == job_id {
                    return Ok(position);
                }
            }
        }
        Ok(0)
    }

    async fn cancel_queued(&self, job_id: JobId) -> Result<bool, QueueError> {
        if self.in_flight.contains_key(&job_id) {
            return Ok(false);
        }
        let mut removed = false;
        {
            let mut ready = self.ready.lock();
            for queue in ready.iter_mut() {
                let before = queue.len();
                queue.retain(|id| *id != job_id);
                removed |= queue.len() != before;
            }
        }
        {
            let mut delayed = self.delayed.lock();
            let before = delayed.len();
            delayed.retain(|(_, id)| *id != job_id);
            removed |= delayed.len() != before;
        }
        if removed {
            self.entries.remove(&job_id);
            self.meta.remove(&job_id);
        }
        Ok(removed)
    }

    async fn set_meta(&self, job_id: JobId, key: &str, value: Value) -> Result<(), QueueError> {
        self.meta
            .entry(job_id)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_meta(&self, job_id: JobId) -> Result<Option<serde_json::Map<String, Value>>, QueueError> {
        Ok(self.meta.get(&job_id).map(|m| m.clone()))
    }

    async fn in_flight(&self) -> Result<usize, QueueError> {
        Ok(self.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(ingest: &str) -> JobPayload {
        JobPayload::new(ingest, "project-1", "file-1")
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let (a, b) = (JobId::new(), JobId::new());
        queue.enqueue(a, payload("a"), EnqueueOptions::default()).await.unwrap();
        queue.enqueue(b, payload("b"), EnqueueOptions::default()).await.unwrap();

        let (first, _) = queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        let (second, _) = queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
    }

    #[tokio::test]
    async fn test_high_priority_dequeued_first() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let (low, high) = (JobId::new(), JobId::new());
        queue
            .enqueue(low, payload("low"), EnqueueOptions { priority: Priority::Low, delay: None })
            .await
            .unwrap();
        queue
            .enqueue(high, payload("high"), EnqueueOptions { priority: Priority::High, delay: None })
            .await
            .unwrap();

        let (first, _) = queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first, high);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_not_immediately_visible() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let id = JobId::new();
        queue
            .enqueue(
                id,
                payload("delayed"),
                EnqueueOptions { priority: Priority::Normal, delay: Some(Duration::from_secs(30)) },
            )
            .await
            .unwrap();

        assert!(queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_job_promoted_after_wake_time() {
        let queue = InMemoryQueue::new(QueueConfig {
            promotion_interval: Duration::from_millis(20),
            ..QueueConfig::default()
        });
        let id = JobId::new();
        queue
            .enqueue(
                id,
                payload("delayed"),
                EnqueueOptions { priority: Priority::Normal, delay: Some(Duration::from_millis(50)) },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let dequeued = queue.dequeue("w1", Duration::from_secs(60)).await.unwrap();
        assert!(dequeued.is_some());
    }

    #[tokio::test]
    async fn test_unacked_job_redelivered_after_visibility_timeout() {
        let queue = InMemoryQueue::new(QueueConfig {
            promotion_interval: Duration::from_millis(20),
            ..QueueConfig::default()
        });
        let id = JobId::new();
        queue.enqueue(id, payload("x"), EnqueueOptions::default()).await.unwrap();

        let first = queue.dequeue("w1", Duration::from_millis(40)).await.unwrap();
        assert!(first.is_some());
        assert!(queue.dequeue("w2", Duration::from_secs(60)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let redelivered = queue.dequeue("w2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(redelivered.map(|(id, _)| id), Some(id));
    }

    #[tokio::test]
    async fn test_ack_removes_job() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let id = JobId::new();
        queue.enqueue(id, payload("x"), EnqueueOptions::default()).await.unwrap();
        queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        queue.ack(id).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_only_before_dequeue() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let id = JobId::new();
        queue.enqueue(id, payload("x"), EnqueueOptions::default()).await.unwrap();
        assert!(queue.cancel_queued(id).await.unwrap());

        let id2 = JobId::new();
        queue.enqueue(id2, payload("y"), EnqueueOptions::default()).await.unwrap();
        queue.dequeue("w1", Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(!queue.cancel_queued(id2).await.unwrap());
    }

    #[tokio::test]
    async fn test_position_reflects_queue_order() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let (a, b) = (JobId::new(), JobId::new());
        queue.enqueue(a, payload("a"), EnqueueOptions::default()).await.unwrap();
        queue.enqueue(b, payload("b"), EnqueueOptions::default()).await.unwrap();

        assert_eq!(queue.position(a).await.unwrap(), 1);
        assert_eq!(queue.position(b).await.unwrap(), 2);
        assert_eq!(queue.position(JobId::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let queue = InMemoryQueue::new(QueueConfig::default());
        let id = JobId::new();
        queue.enqueue(id, payload("x"), EnqueueOptions::default()).await.unwrap();
        queue.set_meta(id, "progress_pct", json!(25.0)).await.unwrap();

        let meta = queue.get_meta(id).await.unwrap().unwrap();
        assert_eq!(meta.get("progress_pct"), Some(&json!(25.0)));
    }
}
