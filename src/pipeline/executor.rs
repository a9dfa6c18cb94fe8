//! Phase executors
//!
//! A phase is handed to an executor as a whole. Local execution runs the
//! tasks on a rayon pool, queued execution pushes them to a [`TaskQueue`]
//! for workers, and a dry run only records them. Every executor skips tasks
//! whose completion marker already exists and returns only once the phase
//! barrier has passed.

use crate::io::error::{AlignError, Result, computation_error, invalid_parameter, storage_error};
use crate::pipeline::barrier::{BarrierConfig, wait_for_drain, wait_for_markers};
use crate::pipeline::context::TaskContext;
use crate::pipeline::queue::{Failure, TaskQueue};
use crate::pipeline::scheduler::Phase;
use crate::pipeline::tasks::ChunkTask;
use crate::store::markers::MarkerStore;
use indicatif::ProgressBar;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Outcome of one phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    /// Phase name
    pub name: String,
    /// Tasks run by this executor
    pub executed: usize,
    /// Tasks skipped because their marker existed
    pub skipped: usize,
    /// Wall time including the barrier
    pub elapsed: Duration,
}

/// Runs every task of a phase and waits for its barrier
pub trait PhaseExecutor: Send + Sync {
    /// Execute `phase`, advancing `progress` once per task
    ///
    /// # Errors
    ///
    /// Returns the first task failure or a barrier timeout
    fn run_phase(&self, phase: &Phase, progress: &ProgressBar) -> Result<PhaseReport>;
}

/// Tasks whose marker does not exist yet
fn pending_tasks<'a>(markers: &dyn MarkerStore, phase: &'a Phase) -> Result<Vec<&'a ChunkTask>> {
    let mut pending = Vec::with_capacity(phase.tasks.len());
    for task in &phase.tasks {
        if !markers.has_marker(&task.marker_key())? {
            pending.push(task);
        }
    }
    Ok(pending)
}

/// Threaded in-process execution
pub struct LocalExecutor {
    ctx: TaskContext,
    pool: rayon::ThreadPool,
    barrier: BarrierConfig,
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("threads", &self.pool.current_num_threads())
            .field("barrier", &self.barrier)
            .finish_non_exhaustive()
    }
}

impl LocalExecutor {
    /// Executor with a pool of `threads` workers, rayon's default when 0
    ///
    /// # Errors
    ///
    /// Returns an error if the thread pool cannot be built
    pub fn new(ctx: TaskContext, threads: usize, barrier: BarrierConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| invalid_parameter("threads", &threads, &e))?;
        Ok(Self { ctx, pool, barrier })
    }

    /// Context the tasks run against
    pub const fn context(&self) -> &TaskContext {
        &self.ctx
    }
}

impl PhaseExecutor for LocalExecutor {
    fn run_phase(&self, phase: &Phase, progress: &ProgressBar) -> Result<PhaseReport> {
        let started = Instant::now();
        let pending = pending_tasks(self.ctx.markers.as_ref(), phase)?;
        let skipped = phase.tasks.len() - pending.len();
        progress.inc(skipped as u64);
        if skipped > 0 {
            info!(phase = %phase.name, skipped, "resuming phase");
        }

        self.pool
            .install(|| {
                pending.par_iter().try_for_each(|task| {
                    let key = task.marker_key();
                    debug!(task = %key, kind = task.task.kind(), "executing");
                    task.execute(&self.ctx)?;
                    self.ctx.markers.put_marker(&key)?;
                    progress.inc(1);
                    Ok(())
                })
            })
            .inspect_err(|e: &AlignError| error!(phase = %phase.name, error = %e, "phase aborted"))?;

        wait_for_markers(
            self.ctx.markers.as_ref(),
            &phase.prefix,
            phase.tasks.len(),
            &self.barrier,
            |_| Ok(()),
        )?;
        Ok(PhaseReport {
            name: phase.name.clone(),
            executed: pending.len(),
            skipped,
            elapsed: started.elapsed(),
        })
    }
}

/// Pulls tasks from a queue and executes them
#[derive(Clone)]
pub struct Worker {
    ctx: TaskContext,
    queue: Arc<dyn TaskQueue>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl Worker {
    /// Worker executing against `ctx`
    pub fn new(ctx: TaskContext, queue: Arc<dyn TaskQueue>) -> Self {
        Self { ctx, queue }
    }

    /// Lease and run one task
    ///
    /// A failing task is moved to the queue's failed set and reported as
    /// `Ok(true)`; only queue or marker failures are errors. Returns `false`
    /// when nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or marker store fails
    pub fn run_one(&self) -> Result<bool> {
        let Some(lease) = self.queue.lease()? else {
            return Ok(false);
        };
        let outcome = ChunkTask::from_json(&lease.payload).and_then(|task| {
            task.execute(&self.ctx)?;
            self.ctx.markers.put_marker(&task.marker_key())
        });
        match outcome {
            Ok(()) => self.queue.complete(&lease)?,
            Err(e) => {
                error!(lease = %lease.id, error = %e, "task failed");
                self.queue.fail(&lease, &e.to_string())?;
            }
        }
        Ok(true)
    }

    /// Run tasks until the queue has nothing left to lease
    ///
    /// Returns the number of tasks handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or marker store fails
    pub fn run_until_drained(&self) -> Result<usize> {
        let mut handled = 0;
        while self.run_one()? {
            handled += 1;
        }
        info!(handled, "queue drained");
        Ok(handled)
    }
}

/// Distributed execution through a shared queue
///
/// The orchestrator only enqueues, then waits until every marker of the
/// phase exists and the queue is empty. The optional in-process worker lets
/// a single machine drain its own queue.
pub struct QueuedExecutor {
    queue: Arc<dyn TaskQueue>,
    markers: Arc<dyn MarkerStore>,
    barrier: BarrierConfig,
    inline_worker: Option<Worker>,
}

impl std::fmt::Debug for QueuedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedExecutor")
            .field("barrier", &self.barrier)
            .field("inline_worker", &self.inline_worker.is_some())
            .finish_non_exhaustive()
    }
}

impl QueuedExecutor {
    /// Executor relying on external workers
    pub fn new(queue: Arc<dyn TaskQueue>, markers: Arc<dyn MarkerStore>, barrier: BarrierConfig) -> Self {
        Self {
            queue,
            markers,
            barrier,
            inline_worker: None,
        }
    }

    /// Also drain the queue in-process while waiting
    #[must_use]
    pub fn with_inline_worker(mut self, worker: Worker) -> Self {
        self.inline_worker = Some(worker);
        self
    }

    /// Run the inline worker, if any, until the queue is empty
    fn drain_inline(&self) -> Result<()> {
        if let Some(worker) = &self.inline_worker {
            worker.run_until_drained()?;
        }
        Ok(())
    }

    /// Fail the phase if a task it enqueued has failed
    ///
    /// Failures recorded before the phase was enqueued belong to earlier runs
    /// or phases; a rerun of the same task gets a fresh chance.
    fn check_failures(
        &self,
        phase: &Phase,
        earlier: &HashSet<String>,
        enqueued: &HashSet<String>,
    ) -> Result<()> {
        let failures: Vec<Failure> = self
            .queue
            .failures()?
            .into_iter()
            .filter(|f| !earlier.contains(&f.id) && enqueued.contains(&f.payload))
            .collect();
        match failures.first() {
            None => Ok(()),
            Some(first) => Err(AlignError::TaskFailed {
                task: format!("{} ({} failed)", phase.name, failures.len()),
                source: Box::new(storage_error("queued task", &phase.prefix, first)),
            }),
        }
    }
}

impl PhaseExecutor for QueuedExecutor {
    fn run_phase(&self, phase: &Phase, progress: &ProgressBar) -> Result<PhaseReport> {
        let started = Instant::now();
        let pending = pending_tasks(self.markers.as_ref(), phase)?;
        let skipped = phase.tasks.len() - pending.len();
        let earlier: HashSet<String> = self.queue.failures()?.into_iter().map(|f| f.id).collect();
        let mut enqueued = HashSet::with_capacity(pending.len());
        for task in &pending {
            let payload = task.to_json()?;
            self.queue.enqueue(&payload)?;
            enqueued.insert(payload);
        }
        debug!(phase = %phase.name, enqueued = enqueued.len(), "phase enqueued");

        let expected = phase.tasks.len();
        wait_for_markers(
            self.markers.as_ref(),
            &phase.prefix,
            expected,
            &self.barrier,
            |found| {
                progress.set_position(found as u64);
                self.drain_inline()?;
                // A complete phase stands even if a duplicate of one of its tasks failed
                if found >= expected {
                    return Ok(());
                }
                self.check_failures(phase, &earlier, &enqueued)
            },
        )
        .and_then(|_| {
            let remaining = self.barrier.timeout.saturating_sub(started.elapsed());
            let budget = BarrierConfig::new(remaining, self.barrier.poll_interval);
            wait_for_drain(self.queue.as_ref(), &phase.prefix, &budget, || self.drain_inline())
        })
        .inspect_err(|e: &AlignError| error!(phase = %phase.name, error = %e, "phase aborted"))?;

        Ok(PhaseReport {
            name: phase.name.clone(),
            executed: pending.len(),
            skipped,
            elapsed: started.elapsed(),
        })
    }
}

/// What a dry run saw of one phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    /// Phase name
    pub name: String,
    /// Marker prefix
    pub prefix: String,
    /// Task count per task kind
    pub kinds: BTreeMap<&'static str, usize>,
    /// Every section any task touches
    pub sections: Vec<i64>,
}

/// Records phases without touching storage or models
///
/// Each task is still serialized and decoded again, so a dry run catches
/// tasks a queue could not carry.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    records: Mutex<Vec<PhaseRecord>>,
}

impl DryRunExecutor {
    /// Phases recorded so far
    ///
    /// # Errors
    ///
    /// Returns a storage error if the record lock is poisoned
    pub fn records(&self) -> Result<Vec<PhaseRecord>> {
        self.records
            .lock()
            .map(|records| records.clone())
            .map_err(|e| storage_error("dry run records", "<memory>", &e))
    }
}

impl PhaseExecutor for DryRunExecutor {
    fn run_phase(&self, phase: &Phase, progress: &ProgressBar) -> Result<PhaseReport> {
        let started = Instant::now();
        let mut kinds = BTreeMap::new();
        let mut sections = Vec::new();
        for task in &phase.tasks {
            let decoded = ChunkTask::from_json(&task.to_json()?)?;
            if &decoded != task {
                return Err(computation_error(
                    "dry run",
                    &format!("task {} does not survive serialization", task.marker_key()),
                ));
            }
            *kinds.entry(task.task.kind()).or_insert(0) += 1;
            sections.extend(task.task.sections());
            progress.inc(1);
        }
        sections.sort_unstable();
        sections.dedup();
        info!(phase = %phase.name, tasks = phase.tasks.len(), ?kinds, "dry run");
        self.records
            .lock()
            .map_err(|e| storage_error("dry run records", "<memory>", &e))?
            .push(PhaseRecord {
                name: phase.name.clone(),
                prefix: phase.prefix.clone(),
                kinds,
                sections,
            });
        Ok(PhaseReport {
            name: phase.name.clone(),
            executed: 0,
            skipped: 0,
            elapsed: started.elapsed(),
        })
    }
}
