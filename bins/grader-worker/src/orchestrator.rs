/// Grading Orchestrator - Job State Machine
///
/// **Responsibility:**
/// Own the job record for the duration of one grading run and move it
/// through `pending → running → {passed | failed | error}`.
///
/// **Critical Properties:**
/// - The run task is the only writer of its job record
/// - Every phase line is persisted as it happens, so observers can tail it
/// - Any failure (validation, sandbox, panic) ends in `error`, never stuck
///   in `running`
/// - Submission never waits on the run
///
/// Runs are tracked in a JoinSet so shutdown can drain them. Runs still
/// going when the grace period ends are aborted and their records are
/// moved to `error`.

use crate::engine::ContainerRuntime;
use crate::executor::{GradeObserver, GradeRequest, Grader};
use crate::metrics;
use async_trait::async_trait;
use futures_util::FutureExt;
use grader_common::{GradingJob, JobStatus, JobStore, StoreError};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(100);
const SHUTDOWN_MESSAGE: &str = "grader shutting down before the run finished";

/// Ids of jobs whose run has not yet persisted a terminal record
type InFlight = Arc<StdMutex<HashSet<Uuid>>>;

pub struct Orchestrator<R: ContainerRuntime> {
    store: Arc<dyn JobStore>,
    grader: Arc<Grader<R>>,
    tasks: Mutex<JoinSet<()>>,
    in_flight: InFlight,
}

impl<R: ContainerRuntime> Orchestrator<R> {
    pub fn new(store: Arc<dyn JobStore>, grader: Arc<Grader<R>>) -> Self {
        Self {
            store,
            grader,
            tasks: Mutex::new(JoinSet::new()),
            in_flight: Arc::default(),
        }
    }

    pub fn grader(&self) -> &Arc<Grader<R>> {
        &self.grader
    }

    /// Create a pending job and dispatch its run in the background
    pub async fn submit(&self, request: GradeRequest) -> Result<GradingJob, StoreError> {
        let job = GradingJob::new(Uuid::new_v4());
        self.store.create(&job).await?;
        metrics::record_submission_accepted();
        info!(job_id = %job.id, archive_bytes = request.archive.len(), "Submission accepted");

        let store = Arc::clone(&self.store);
        let grader = Arc::clone(&self.grader);
        let pending = job.clone();
        let in_flight = Arc::clone(&self.in_flight);
        lock_in_flight(&in_flight).insert(job.id);

        let mut tasks = self.tasks.lock().await;
        // Reap runs that already finished
        while let Some(Some(_)) = tasks.join_next().now_or_never() {}
        tasks.spawn(run_job(store, grader, pending, request, in_flight));

        Ok(job)
    }

    pub async fn lookup(&self, id: &Uuid) -> Result<Option<GradingJob>, StoreError> {
        self.store.get(id).await
    }

    /// Wait up to `grace` for in-flight runs, then abort the rest and
    /// record them as `error`
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = self.tasks.lock().await;
        let in_flight = tasks.len();
        if in_flight == 0 {
            return;
        }

        info!(in_flight, grace_secs = grace.as_secs(), "Draining grading runs");
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Grading task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(remaining = tasks.len(), "Grace period elapsed; aborting grading runs");
            tasks.abort_all();
            // Wait for the aborted futures to be dropped so no run writes after us
            while tasks.join_next().await.is_some() {}
            self.fail_abandoned().await;
        }
    }

    /// Move every job whose run was aborted to `error`
    async fn fail_abandoned(&self) {
        let abandoned: Vec<Uuid> = lock_in_flight(&self.in_flight).drain().collect();

        for id in abandoned {
            let mut job = match self.store.get(&id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(job_id = %id, error = %e, "Failed to load aborted job");
                    continue;
                }
            };
            if job.status.is_terminal() {
                continue;
            }
            if job.status == JobStatus::Pending {
                if let Err(e) = job.mark_running() {
                    error!(job_id = %id, error = %e, "Illegal job transition");
                    continue;
                }
            }
            if let Err(e) = job.mark_error(SHUTDOWN_MESSAGE) {
                error!(job_id = %id, error = %e, "Illegal job transition");
                continue;
            }

            let recorder = JobRecorder {
                store: Arc::clone(&self.store),
                job,
            };
            recorder.persist().await;
            metrics::record_job_aborted();
            warn!(job_id = %id, "Aborted run recorded as error");
        }
    }
}

fn lock_in_flight(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the in-flight gauge up for as long as the run future lives
struct FlightGauge;

impl FlightGauge {
    fn start() -> Self {
        metrics::record_job_started();
        FlightGauge
    }
}

impl Drop for FlightGauge {
    fn drop(&mut self) {
        metrics::record_job_left_flight();
    }
}

/// Observer that owns the job record and persists each phase
struct JobRecorder {
    store: Arc<dyn JobStore>,
    job: GradingJob,
}

impl JobRecorder {
    /// Write the record, retrying transient store failures
    async fn persist(&self) {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.store.put(&self.job).await {
                Ok(()) => return,
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(job_id = %self.job.id, attempt, error = %e, "Persist failed; retrying");
                    tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
                }
                Err(e) => {
                    error!(job_id = %self.job.id, status = %self.job.status, error = %e, "Persist failed; update lost");
                }
            }
        }
    }
}

#[async_trait]
impl GradeObserver for JobRecorder {
    async fn phase(&mut self, line: &str) {
        debug!(job_id = %self.job.id, line = line.lines().next().unwrap_or_default(), "Phase");
        self.job.append_log(line);
        self.persist().await;
    }
}

#[instrument(skip_all, fields(job_id = %job.id))]
async fn run_job<R: ContainerRuntime>(
    store: Arc<dyn JobStore>,
    grader: Arc<Grader<R>>,
    job: GradingJob,
    request: GradeRequest,
    in_flight: InFlight,
) {
    let started = Instant::now();
    let mut recorder = JobRecorder { store, job };
    if let Err(e) = recorder.job.mark_running() {
        error!(error = %e, "Job is not pending; refusing to run");
        lock_in_flight(&in_flight).remove(&recorder.job.id);
        return;
    }
    let _gauge = FlightGauge::start();
    recorder.persist().await;

    let result = AssertUnwindSafe(grader.grade(request, &mut recorder))
        .catch_unwind()
        .await;

    let transition = match result {
        Ok(Ok(report)) => {
            if report.timed_out {
                warn!(exit_code = report.exit_code, "Sandbox timed out; scoring partial results");
            }
            recorder.job.complete(report.into_outcome())
        }
        Ok(Err(e)) => {
            error!(error = %e, validation = e.is_validation(), "Grading failed");
            recorder.job.mark_error(&e.to_string())
        }
        Err(_) => {
            error!("Grading task panicked");
            recorder.job.mark_error("internal error: grading task panicked")
        }
    };
    if let Err(e) = transition {
        error!(error = %e, "Illegal job transition");
    }
    recorder.persist().await;
    lock_in_flight(&in_flight).remove(&recorder.job.id);

    let status = recorder.job.status;
    let elapsed_ms = started.elapsed().as_millis() as f64;
    metrics::record_job_completed(&status.to_string(), elapsed_ms);
    info!(
        status = %status,
        score = ?recorder.job.score,
        elapsed_ms,
        "Job finished"
    );
}
