/// Job scheduler
///
/// Runs every registered [`Job`] in its own Tokio task on the job's interval until
/// the shutdown token is cancelled.
///
/// # Behavior
///
/// - The first pass of each job starts immediately
/// - A job never overlaps with itself: a pass that outlasts the interval pushes the
///   next one back instead of triggering a burst of catch-up passes
/// - Each pass runs in a spawned task, so a panic is logged like an error and the
///   job keeps its schedule
/// - Shutdown lets in-flight passes finish
///
/// Claiming uses `FOR UPDATE SKIP LOCKED`, so several worker processes may run the
/// same jobs.
///
/// # Example
///
/// ```no_run
/// use pitchside_worker::config::JobSchedule;
/// use pitchside_worker::jobs::{default_jobs, JobContext};
/// use pitchside_worker::scheduler::Scheduler;
///
/// # async fn example(ctx: JobContext) -> anyhow::Result<()> {
/// let mut scheduler = Scheduler::new(ctx);
/// for job in default_jobs(&JobSchedule::default()) {
///     scheduler.register(job);
/// }
///
/// let shutdown = scheduler.shutdown_token();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     shutdown.cancel();
/// });
///
/// scheduler.run().await?;
/// # Ok(())
/// # }
/// ```

use crate::jobs::{Job, JobContext, JobReport, JobResult, SchedulerError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Shortest interval a job loop will tick at
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct Scheduler {
    context: JobContext,
    jobs: Vec<Arc<dyn Job>>,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(context: JobContext) -> Self {
        Self {
            context,
            jobs: Vec::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Registers a job; a job with the same name replaces the earlier one
    pub fn register(&mut self, job: Arc<dyn Job>) {
        tracing::info!(job = job.name(), interval_secs = job.interval().as_secs(), "Registering job");
        self.jobs.retain(|existing| existing.name() != job.name());
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    /// Gets shutdown token
    ///
    /// Used to signal graceful shutdown from external handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs one pass of the named job now, outside its schedule
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownJob`] for an unregistered name, otherwise whatever
    /// the pass returns.
    pub async fn run_once(&self, name: &str) -> JobResult<JobReport> {
        let job = self
            .jobs
            .iter()
            .find(|j| j.name() == name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;

        execute(job, self.context.clone()).await
    }

    /// Runs every job on its interval until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.jobs.is_empty() {
            tracing::warn!("No jobs registered");
        }

        tracing::info!(jobs = ?self.job_names(), "Scheduler starting");

        let handles: Vec<(&'static str, JoinHandle<()>)> = self
            .jobs
            .iter()
            .map(|job| {
                let handle = tokio::spawn(job_loop(
                    job.clone(),
                    self.context.clone(),
                    self.shutdown_token.clone(),
                ));
                (job.name(), handle)
            })
            .collect();

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(job = name, error = %e, "Job loop ended abnormally");
            }
        }

        tracing::info!("Scheduler shut down");
        Ok(())
    }
}

async fn job_loop(job: Arc<dyn Job>, context: JobContext, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(job.interval().max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let started = Instant::now();
                match execute(job.clone(), context.clone()).await {
                    Ok(JobReport::Skipped) => {
                        tracing::debug!(job = job.name(), "Job skipped; vendor not configured");
                    }
                    Ok(report) if report.touched() > 0 => {
                        tracing::info!(
                            job = job.name(),
                            report = ?report,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Job pass finished"
                        );
                    }
                    Ok(_) => {
                        tracing::trace!(job = job.name(), "Job pass found nothing to do");
                    }
                    Err(e) => {
                        tracing::error!(job = job.name(), error = %e, "Job pass failed");
                    }
                }
            }
        }
    }

    tracing::debug!(job = job.name(), "Job loop stopped");
}

/// Runs one pass in its own task so a panic stays contained
async fn execute(job: Arc<dyn Job>, context: JobContext) -> JobResult<JobReport> {
    let name = job.name();
    let handle = tokio::spawn(async move { job.run(&context).await });

    match handle.await {
        Ok(result) => result,
        Err(e) => Err(SchedulerError::Aborted {
            job: name,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::{offline_context, without_optional_vendors};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct CountingJob {
        name: &'static str,
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
    }

    impl CountingJob {
        fn new(name: &'static str, behavior: Behavior) -> (Arc<Self>, Arc<AtomicUsize>) {
            let runs = Arc::new(AtomicUsize::new(0));
            let job = Arc::new(Self {
                name,
                behavior,
                runs: runs.clone(),
            });
            (job, runs)
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn run(&self, _ctx: &JobContext) -> JobResult<JobReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(JobReport::Skipped),
                Behavior::Fail => Err(SchedulerError::UnknownJob("downstream".to_string())),
                Behavior::Panic => panic!("job exploded"),
            }
        }
    }

    #[tokio::test]
    async fn test_run_once_unknown_job() {
        let scheduler = Scheduler::new(offline_context(without_optional_vendors()));

        let err = scheduler.run_once("nope").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownJob(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_run_once_runs_named_job() {
        let mut scheduler = Scheduler::new(offline_context(without_optional_vendors()));
        let (job, runs) = CountingJob::new("counting", Behavior::Succeed);
        scheduler.register(job);

        let report = scheduler.run_once("counting").await.unwrap();
        assert_eq!(report, JobReport::Skipped);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_same_name() {
        let mut scheduler = Scheduler::new(offline_context(without_optional_vendors()));
        let (first, first_runs) = CountingJob::new("counting", Behavior::Succeed);
        let (second, second_runs) = CountingJob::new("counting", Behavior::Succeed);
        scheduler.register(first);
        scheduler.register(second);

        assert_eq!(scheduler.job_names(), ["counting"]);
        scheduler.run_once("counting").await.unwrap();
        assert_eq!(first_runs.load(Ordering::SeqCst), 0);
        assert_eq!(second_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let mut scheduler = Scheduler::new(offline_context(without_optional_vendors()));
        let (job, _) = CountingJob::new("exploding", Behavior::Panic);
        scheduler.register(job);

        let err = scheduler.run_once("exploding").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Aborted { job: "exploding", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_keep_running_until_shutdown() {
        let mut scheduler = Scheduler::new(offline_context(without_optional_vendors()));
        let (ok_job, ok_runs) = CountingJob::new("ok", Behavior::Succeed);
        let (failing_job, failing_runs) = CountingJob::new("failing", Behavior::Fail);
        let (panicking_job, panicking_runs) = CountingJob::new("panicking", Behavior::Panic);
        scheduler.register(ok_job);
        scheduler.register(failing_job);
        scheduler.register(panicking_job);

        let shutdown = scheduler.shutdown_token();
        let scheduler = Arc::new(scheduler);
        let running = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run().await }
        });

        // Ticks at 0s, 1s and 2s
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown.cancel();
        running.await.unwrap().unwrap();

        for runs in [ok_runs, failing_runs, panicking_runs] {
            assert_eq!(runs.load(Ordering::SeqCst), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_start_runs_nothing() {
        let mut scheduler = Scheduler::new(offline_context(without_optional_vendors()));
        let (job, runs) = CountingJob::new("counting", Behavior::Succeed);
        scheduler.register(job);

        scheduler.shutdown_token().cancel();
        scheduler.run().await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
