/// Progress Notifier - Tail a Job Record as Events
///
/// One polling task per subscriber reads the job record at a fixed
/// interval and pushes typed events into a channel:
/// - `Log` carries only the log growth since the previous poll
/// - `Status` on every poll
/// - `Complete` once, when the job is terminal, then the stream ends
/// - `Error` for an unknown job, then the stream ends
///
/// The first poll only records where the log stands; history before the
/// subscription is not replayed (the `Complete` snapshot carries it).
/// Every stream ends with `Closed`. Dropping the stream aborts the task;
/// the grading run is never affected.

use crate::metrics;
use grader_common::{GradingJob, JobStatus, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Log(String),
    Status { status: JobStatus, score: Option<u32> },
    Complete(Box<GradingJob>),
    Error { message: String },
    Closed,
}

impl ProgressEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Log(_) => "log",
            ProgressEvent::Status { .. } => "status",
            ProgressEvent::Complete(_) => "complete",
            ProgressEvent::Error { .. } => "error",
            ProgressEvent::Closed => "closed",
        }
    }
}

#[derive(Clone)]
pub struct ProgressNotifier {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
    max_lifetime: Duration,
}

impl ProgressNotifier {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration, max_lifetime: Duration) -> Self {
        Self {
            store,
            // A zero period would make the interval timer panic
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            max_lifetime,
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> ProgressStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(tail_job(
            Arc::clone(&self.store),
            job_id,
            self.poll_interval,
            self.max_lifetime,
            tx,
        ));
        metrics::stream_opened();

        ProgressStream {
            rx,
            task: task.abort_handle(),
        }
    }
}

/// Receiving end of one subscription
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
    task: AbortHandle,
}

impl ProgressStream {
    /// Next event; `None` after `Closed` has been received
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        self.task.abort();
        metrics::stream_closed();
    }
}

async fn tail_job(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    poll_interval: Duration,
    max_lifetime: Duration,
    tx: mpsc::Sender<ProgressEvent>,
) {
    poll_job(store.as_ref(), job_id, poll_interval, max_lifetime, &tx).await;
    let _ = tx.send(ProgressEvent::Closed).await;
}

/// Poll until terminal, not found, lifetime expiry or receiver gone
async fn poll_job(
    store: &dyn JobStore,
    job_id: Uuid,
    poll_interval: Duration,
    max_lifetime: Duration,
    tx: &mpsc::Sender<ProgressEvent>,
) {
    let deadline = tokio::time::sleep(max_lifetime);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seen_len: Option<usize> = None;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                debug!(job_id = %job_id, "Progress stream reached its lifetime");
                return;
            }
            _ = ticker.tick() => {}
        }

        let job = match store.get(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                let _ = tx
                    .send(ProgressEvent::Error {
                        message: format!("Job {} not found", job_id),
                    })
                    .await;
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Progress poll failed");
                continue;
            }
        };

        if let Some(previous) = seen_len {
            if job.log.len() > previous {
                if let Some(suffix) = job.log.get(previous..) {
                    if tx.send(ProgressEvent::Log(suffix.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
        seen_len = Some(job.log.len());

        let status = ProgressEvent::Status {
            status: job.status,
            score: job.score,
        };
        if tx.send(status).await.is_err() {
            return;
        }

        if job.status.is_terminal() {
            let _ = tx.send(ProgressEvent::Complete(Box::new(job))).await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grader_common::types::GradeOutcome;
    use grader_common::MemoryJobStore;

    async fn drain(stream: &mut ProgressStream) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    fn notifier(store: Arc<MemoryJobStore>, max_lifetime: Duration) -> ProgressNotifier {
        ProgressNotifier::new(store, Duration::from_millis(20), max_lifetime)
    }

    #[tokio::test]
    async fn test_unknown_job_is_single_error() {
        let store = Arc::new(MemoryJobStore::new());
        let mut stream = notifier(store, Duration::from_secs(5)).subscribe(Uuid::new_v4());

        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "error");
        assert_eq!(events[1], ProgressEvent::Closed);
    }

    #[tokio::test]
    async fn test_mid_run_observer_sees_only_new_log() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = GradingJob::new(Uuid::new_v4());
        store.create(&job).await.unwrap();
        job.mark_running().unwrap();
        job.append_log("[PHASE] Initializing grading environment...");
        store.put(&job).await.unwrap();

        let mut stream = notifier(store.clone(), Duration::from_secs(5)).subscribe(job.id);
        tokio::time::sleep(Duration::from_millis(60)).await;

        job.append_log("[PHASE] Sending submission to sandbox...");
        store.put(&job).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        job.append_log("[PHASE] Grading complete.");
        job.complete(GradeOutcome {
            passed: true,
            score: 100,
            visible_results: Vec::new(),
            hidden_results: Vec::new(),
            style_violations: Vec::new(),
        })
        .unwrap();
        store.put(&job).await.unwrap();

        let events = drain(&mut stream).await;

        let log: String = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Log(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            log,
            "[PHASE] Sending submission to sandbox...\n[PHASE] Grading complete.\n"
        );

        let completes: Vec<_> = events.iter().filter(|e| e.name() == "complete").collect();
        assert_eq!(completes.len(), 1);
        match completes[0] {
            ProgressEvent::Complete(snapshot) => {
                assert_eq!(snapshot.status, JobStatus::Passed);
                assert_eq!(snapshot.score, Some(100));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // complete is the last payload event
        assert_eq!(events[events.len() - 2].name(), "complete");
        assert_eq!(events.last(), Some(&ProgressEvent::Closed));
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::Status {
                status: JobStatus::Running,
                score: None
            }
        )));
    }

    #[tokio::test]
    async fn test_terminal_job_completes_immediately() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = GradingJob::new(Uuid::new_v4());
        store.create(&job).await.unwrap();
        job.mark_running().unwrap();
        job.mark_error("sandbox failure: cannot reach container engine").unwrap();
        store.put(&job).await.unwrap();

        let mut stream = notifier(store, Duration::from_secs(5)).subscribe(job.id);
        let events = drain(&mut stream).await;

        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["status", "complete", "closed"]);
    }

    #[tokio::test]
    async fn test_lifetime_expiry_ends_without_complete() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = GradingJob::new(Uuid::new_v4());
        store.create(&job).await.unwrap();
        job.mark_running().unwrap();
        store.put(&job).await.unwrap();

        let mut stream = notifier(store, Duration::from_millis(150)).subscribe(job.id);
        let events = drain(&mut stream).await;

        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.name() != "complete"));
        assert_eq!(events.last(), Some(&ProgressEvent::Closed));
    }
}
