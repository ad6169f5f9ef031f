//! Bounded worker pools for fetch and checksum jobs.
//!
//! Each pool accepts jobs FIFO through an unbounded submission queue and runs
//! at most `concurrency` of them at once: a single dispatcher task drains the
//! queue in order, acquiring a semaphore permit per job before spawning it,
//! so start order matches enqueue order. Completion callbacks run exactly
//! once, after the job has finished, failed or been cancelled.

use crate::error::PrecacheError;
use futures::future::BoxFuture;
use irobot_core::Datatype;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// How a job ended.
#[derive(Debug)]
pub enum JobOutcome {
    Finished,
    Failed(PrecacheError),
    Cancelled,
}

/// Completion callback, invoked exactly once per accepted job.
pub type CompletionFn = Box<dyn FnOnce(JobOutcome) -> BoxFuture<'static, ()> + Send>;

/// A unit of work bound for a pool.
///
/// Jobs identify their entity by id only; the work future re-resolves any
/// state it needs through the manager.
pub struct Job {
    pub entity_id: i64,
    pub datatype: Datatype,
    /// Payload size, used for queue pricing by the ETA estimator.
    pub bytes: u64,
    pub cancel: CancellationToken,
    pub work: BoxFuture<'static, Result<(), PrecacheError>>,
    pub on_complete: CompletionFn,
}

/// Handle to a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    cancel: CancellationToken,
}

impl JobHandle {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// A job currently executing.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub entity_id: i64,
    pub bytes: u64,
    pub started_at: OffsetDateTime,
}

/// A job accepted but not yet started, in FIFO position.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub entity_id: i64,
    pub bytes: u64,
}

/// Point-in-time view of a pool's queue, consumed by the ETA estimator.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub concurrency: usize,
    pub running: Vec<RunningJob>,
    pub queued: Vec<QueuedJob>,
}

#[derive(Default)]
struct PoolState {
    queued: VecDeque<(u64, QueuedJob)>,
    running: Vec<(u64, RunningJob)>,
}

/// A bounded FIFO executor for one job channel.
pub struct WorkerPool {
    name: &'static str,
    concurrency: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<(u64, Job)>>>,
    state: Arc<Mutex<PoolState>>,
    seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: &'static str, concurrency: usize) -> Self {
        assert!(concurrency > 0);

        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, Job)>();
        let state = Arc::new(Mutex::new(PoolState::default()));
        let permits = Arc::new(Semaphore::new(concurrency));

        let dispatcher_state = state.clone();
        tokio::spawn(async move {
            while let Some((seq, job)) = rx.recv().await {
                // Acquiring before spawning both bounds concurrency and keeps
                // job start order FIFO. The semaphore is never closed.
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };

                let Job {
                    entity_id,
                    bytes,
                    cancel,
                    work,
                    on_complete,
                    ..
                } = job;

                if cancel.is_cancelled() {
                    dispatcher_state.lock().expect("pool state lock").queued.retain(|(s, _)| *s != seq);
                    on_complete(JobOutcome::Cancelled).await;
                    continue;
                }

                {
                    let mut state = dispatcher_state.lock().expect("pool state lock");
                    state.queued.retain(|(s, _)| *s != seq);
                    state.running.push((
                        seq,
                        RunningJob {
                            entity_id,
                            bytes,
                            started_at: OffsetDateTime::now_utc(),
                        },
                    ));
                }

                let task_state = dispatcher_state.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => JobOutcome::Cancelled,
                        result = work => match result {
                            Ok(()) => JobOutcome::Finished,
                            Err(PrecacheError::Cancelled) => JobOutcome::Cancelled,
                            Err(e) => JobOutcome::Failed(e),
                        },
                    };

                    task_state.lock().expect("pool state lock").running.retain(|(s, _)| *s != seq);
                    drop(permit);
                    on_complete(outcome).await;
                });
            }
        });

        Self {
            name,
            concurrency,
            tx: Mutex::new(Some(tx)),
            state,
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue a job without blocking. Fails only after shutdown.
    pub fn submit(&self, job: Job) -> Result<JobHandle, PrecacheError> {
        let handle = JobHandle {
            cancel: job.cancel.clone(),
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        self.state.lock().expect("pool state lock").queued.push_back((
            seq,
            QueuedJob {
                entity_id: job.entity_id,
                bytes: job.bytes,
            },
        ));

        let sent = self
            .tx
            .lock()
            .expect("pool sender lock")
            .as_ref()
            .ok_or(PrecacheError::PoolClosed)
            .and_then(|tx| tx.send((seq, job)).map_err(|_| PrecacheError::PoolClosed));

        if let Err(e) = sent {
            self.state.lock().expect("pool state lock").queued.retain(|(s, _)| *s != seq);
            return Err(e);
        }

        tracing::debug!(pool = self.name, seq, "job accepted");
        Ok(handle)
    }

    /// Stop accepting work. Queued jobs drain; running jobs finish.
    pub fn shutdown(&self) {
        self.tx.lock().expect("pool sender lock").take();
    }

    /// Jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.state.lock().expect("pool state lock").running.len()
    }

    /// Snapshot the queue for the ETA estimator.
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().expect("pool state lock");
        QueueSnapshot {
            concurrency: self.concurrency,
            running: state.running.iter().map(|(_, job)| job.clone()).collect(),
            queued: state.queued.iter().map(|(_, job)| job.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irobot_core::Datatype;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn job(
        entity_id: i64,
        work: BoxFuture<'static, Result<(), PrecacheError>>,
        on_complete: CompletionFn,
    ) -> Job {
        Job {
            entity_id,
            datatype: Datatype::Data,
            bytes: 100,
            cancel: CancellationToken::new(),
            work,
            on_complete,
        }
    }

    #[tokio::test]
    async fn executes_in_fifo_order() {
        let pool = WorkerPool::new("test", 1);
        let (tx, mut rx) = unbounded_channel::<i64>();

        for id in 0..5 {
            let tx = tx.clone();
            pool.submit(job(
                id,
                Box::pin(async move {
                    tx.send(id).unwrap();
                    Ok(())
                }),
                Box::new(|_| Box::pin(async {})),
            ))
            .unwrap();
        }

        for expected in 0..5 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let pool = Arc::new(WorkerPool::new("test", 2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = unbounded_channel::<()>();

        for id in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            let done = done_tx.clone();
            pool.submit(job(
                id,
                Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
                Box::new(move |_| {
                    let done = done.clone();
                    Box::pin(async move {
                        done.send(()).unwrap();
                    })
                }),
            ))
            .unwrap();
        }

        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn callback_reports_failure_and_cancellation() {
        let pool = WorkerPool::new("test", 1);
        let (tx, mut rx) = unbounded_channel::<&'static str>();

        let failed_tx = tx.clone();
        pool.submit(job(
            1,
            Box::pin(async { Err(PrecacheError::Upstream("boom".to_string())) }),
            Box::new(move |outcome| {
                let tx = failed_tx.clone();
                Box::pin(async move {
                    let label = match outcome {
                        JobOutcome::Failed(_) => "failed",
                        _ => "other",
                    };
                    tx.send(label).unwrap();
                })
            }),
        ))
        .unwrap();
        assert_eq!(rx.recv().await, Some("failed"));

        // Cancelled before execution starts: park a blocker on the single
        // worker so the next job stays queued while we cancel it
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        pool.submit(job(
            2,
            Box::pin(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            }),
            Box::new(|_| Box::pin(async {})),
        ))
        .unwrap();
        started_rx.await.unwrap();

        let cancelled_tx = tx.clone();
        let cancelled_job = Job {
            entity_id: 3,
            datatype: Datatype::Data,
            bytes: 100,
            cancel: CancellationToken::new(),
            work: Box::pin(async {
                panic!("cancelled job must never execute");
            }),
            on_complete: Box::new(move |outcome| {
                let tx = cancelled_tx.clone();
                Box::pin(async move {
                    let label = match outcome {
                        JobOutcome::Cancelled => "cancelled",
                        _ => "other",
                    };
                    tx.send(label).unwrap();
                })
            }),
        };
        let handle = pool.submit(cancelled_job).unwrap();
        handle.cancel();
        release_tx.send(()).unwrap();
        assert_eq!(rx.recv().await, Some("cancelled"));
    }

    #[tokio::test]
    async fn snapshot_tracks_running_and_queued() {
        let pool = WorkerPool::new("test", 1);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        pool.submit(job(
            1,
            Box::pin(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            }),
            Box::new(|_| Box::pin(async {})),
        ))
        .unwrap();
        pool.submit(job(2, Box::pin(async { Ok(()) }), Box::new(|_| Box::pin(async {}))))
            .unwrap();

        started_rx.await.unwrap();
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.concurrency, 1);
        assert_eq!(snapshot.running.len(), 1);
        assert_eq!(snapshot.running[0].entity_id, 1);
        assert_eq!(snapshot.queued.len(), 1);
        assert_eq!(snapshot.queued[0].entity_id, 2);

        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new("test", 1);
        pool.shutdown();

        let err = pool
            .submit(job(1, Box::pin(async { Ok(()) }), Box::new(|_| Box::pin(async {}))))
            .unwrap_err();
        assert!(matches!(err, PrecacheError::PoolClosed));
    }
}
