//! Workers and the scheduler that spreads split evaluations over them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::context::{SearchContext, SplitResult};
use crate::error::{PrepError, Result};
use crate::optimizer::HyperparamPoint;

/// Something able to run split evaluations, in this process or elsewhere.
pub trait Worker: Send {
    fn worker_id(&self) -> &str;

    /// Acquire whatever the worker needs before its first task.
    fn start(&mut self, context: &SearchContext) -> Result<()>;

    fn execute_work(
        &mut self,
        context: &SearchContext,
        split_id: usize,
        parameters: &HyperparamPoint,
    ) -> Result<SplitResult>;

    /// Release resources. Must not fail.
    fn stop(&mut self);
}

/// Runs the work on the calling thread.
#[derive(Debug, Clone)]
pub struct LocalWorker {
    id: String,
}

impl LocalWorker {
    pub fn new(index: usize) -> Self {
        Self {
            id: format!("local-{}", index),
        }
    }
}

impl Worker for LocalWorker {
    fn worker_id(&self) -> &str {
        &self.id
    }

    fn start(&mut self, _context: &SearchContext) -> Result<()> {
        Ok(())
    }

    fn execute_work(
        &mut self,
        context: &SearchContext,
        split_id: usize,
        parameters: &HyperparamPoint,
    ) -> Result<SplitResult> {
        context.execute_work(split_id, parameters)
    }

    fn stop(&mut self) {}
}

/// Builds the worker for one slot of a remote container: `(container, slot)`.
pub type RemoteWorkerFactory = Arc<dyn Fn(usize, usize) -> Box<dyn Worker> + Send + Sync>;

/// One split evaluation to schedule.
#[derive(Debug, Clone)]
pub struct Task {
    pub split_id: usize,
    pub parameters: HyperparamPoint,
    /// Rejected once the scheduler is soft-interrupted.
    pub soft_interruptible: bool,
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Done(SplitResult),
    Failed(String),
    Interrupted,
}

/// Pulls tasks from a shared queue onto a fixed set of workers.
///
/// A soft interrupt lets running work finish and rejects queued
/// interruptible tasks; a hard interrupt rejects everything queued.
pub struct WorkScheduler {
    workers: Mutex<Vec<Box<dyn Worker>>>,
    started: AtomicBool,
    soft_interrupted: Arc<AtomicBool>,
    hard_interrupted: AtomicBool,
    completed: AtomicUsize,
}

impl std::fmt::Debug for WorkScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkScheduler")
            .field("workers", &self.workers_count())
            .field("soft_interrupted", &self.soft_interrupted())
            .finish()
    }
}

impl WorkScheduler {
    pub fn new(workers: Vec<Box<dyn Worker>>) -> Result<Self> {
        if workers.is_empty() {
            return Err(PrepError::ConfigError("A work scheduler needs at least one worker".to_string()));
        }
        Ok(Self {
            workers: Mutex::new(workers),
            started: AtomicBool::new(false),
            soft_interrupted: Arc::new(AtomicBool::new(false)),
            hard_interrupted: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
        })
    }

    /// `n_threads` local workers, plus `n_threads` remote slots for each
    /// container beyond the first when a remote factory is given.
    pub fn with_layout(n_threads: usize, n_containers: usize, remote: Option<&RemoteWorkerFactory>) -> Result<Self> {
        let n_threads = if n_threads > 0 { n_threads } else { rayon::current_num_threads() };
        let mut workers: Vec<Box<dyn Worker>> = (0..n_threads).map(|i| Box::new(LocalWorker::new(i)) as Box<dyn Worker>).collect();
        match remote {
            Some(factory) => {
                let remote_containers = n_containers.saturating_sub(1);
                for container in 0..remote_containers {
                    for slot in 0..n_threads {
                        workers.push(factory(container, slot));
                    }
                }
                info!(
                    containers = n_containers,
                    threads = n_threads,
                    "Distributing hyperparameter search"
                );
            }
            None => info!(threads = n_threads, "Running hyperparameter search locally"),
        }
        Self::new(workers)
    }

    pub fn workers_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn interrupt_soft(&self) {
        if !self.soft_interrupted.swap(true, Ordering::SeqCst) {
            info!("Search interrupted, waiting for running evaluations");
        }
    }

    pub fn interrupt_hard(&self) {
        self.hard_interrupted.store(true, Ordering::SeqCst);
        self.soft_interrupted.store(true, Ordering::SeqCst);
    }

    pub fn soft_interrupted(&self) -> bool {
        self.soft_interrupted.load(Ordering::SeqCst)
    }

    pub fn completed_tasks(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    fn ensure_started(&self, context: &SearchContext) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut workers = self.workers.lock();
        let before = workers.len();
        let mut alive: Vec<Box<dyn Worker>> = Vec::with_capacity(before);
        for mut worker in workers.drain(..) {
            match worker.start(context) {
                Ok(()) => alive.push(worker),
                Err(e) => {
                    warn!(worker = worker.worker_id(), error = %e, "Failed to start worker");
                    worker.stop();
                }
            }
        }
        if alive.is_empty() {
            return Err(PrepError::ComputationError(format!("All {} workers failed to start", before)));
        }
        *workers = alive;
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run `tasks` to completion, one thread per worker. Outcomes come back
    /// in task order.
    pub fn run(&self, context: &SearchContext, tasks: Vec<Task>) -> Result<Vec<TaskOutcome>> {
        self.ensure_started(context)?;
        let n_tasks = tasks.len();
        let queue: Mutex<VecDeque<(usize, Task)>> = Mutex::new(tasks.into_iter().enumerate().collect());
        let outcomes: Mutex<Vec<Option<TaskOutcome>>> = Mutex::new(vec![None; n_tasks]);
        let mut workers = self.workers.lock();

        thread::scope(|scope| {
            for worker in workers.iter_mut() {
                let queue = &queue;
                let outcomes = &outcomes;
                scope.spawn(move || loop {
                    let next = queue.lock().pop_front();
                    let Some((index, task)) = next else { break };
                    let outcome = if self.hard_interrupted.load(Ordering::SeqCst)
                        || (task.soft_interruptible && self.soft_interrupted())
                    {
                        TaskOutcome::Interrupted
                    } else {
                        match worker.execute_work(context, task.split_id, &task.parameters) {
                            Ok(result) => TaskOutcome::Done(result),
                            Err(e) => {
                                warn!(
                                    worker = worker.worker_id(),
                                    split = task.split_id,
                                    error = %e,
                                    "Evaluation failed"
                                );
                                TaskOutcome::Failed(e.to_string())
                            }
                        }
                    };
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    outcomes.lock()[index] = Some(outcome);
                });
            }
        });

        Ok(outcomes
            .into_inner()
            .into_iter()
            .map(|o| o.unwrap_or(TaskOutcome::Interrupted))
            .collect())
    }

    /// Stop every worker.
    pub fn shutdown(&self) {
        for worker in self.workers.lock().iter_mut() {
            worker.stop();
        }
    }
}

impl Drop for WorkScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::context::KFold;
    use crate::search::scoring::{Metric, MetricScorer};
    use crate::search::test_support::ShiftRegressor;
    use ndarray::{Array1, Array2};

    fn context() -> SearchContext {
        SearchContext::new(
            Arc::new(Array2::from_shape_fn((8, 1), |(i, _)| i as f64)),
            Arc::new(Array1::from_iter((0..8).map(|i| i as f64))),
            KFold::new(2).split(8).unwrap(),
            None,
            Box::new(ShiftRegressor::default()),
            Arc::new(MetricScorer::new(Metric::Mse).unwrap()),
            -1.0,
        )
        .unwrap()
    }

    fn task(split_id: usize, shift: f64, soft_interruptible: bool) -> Task {
        let mut parameters = HyperparamPoint::new();
        parameters.insert("shift".to_string(), shift.into());
        Task {
            split_id,
            parameters,
            soft_interruptible,
        }
    }

    #[test]
    fn test_outcomes_keep_task_order() {
        let scheduler = WorkScheduler::with_layout(3, 1, None).unwrap();
        let tasks: Vec<Task> = (0..6).map(|i| task(i % 2, i as f64, true)).collect();
        let outcomes = scheduler.run(&context(), tasks).unwrap();
        for (i, outcome) in outcomes.iter().enumerate() {
            match outcome {
                TaskOutcome::Done(r) => assert_eq!(r.test_score, (i * i) as f64),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(scheduler.completed_tasks(), 6);
    }

    #[test]
    fn test_soft_interrupt_spares_protected_tasks() {
        let scheduler = WorkScheduler::with_layout(2, 1, None).unwrap();
        scheduler.interrupt_soft();
        let outcomes = scheduler.run(&context(), vec![task(0, 0.0, false), task(1, 0.0, true)]).unwrap();
        assert!(matches!(outcomes[0], TaskOutcome::Done(_)));
        assert!(matches!(outcomes[1], TaskOutcome::Interrupted));
    }

    #[test]
    fn test_failure_is_isolated() {
        let scheduler = WorkScheduler::with_layout(2, 1, None).unwrap();
        let mut failing = task(0, 0.0, true);
        failing.parameters.insert("fail".to_string(), true.into());
        let outcomes = scheduler.run(&context(), vec![failing, task(1, 0.0, true)]).unwrap();
        assert!(matches!(outcomes[0], TaskOutcome::Failed(_)));
        assert!(matches!(outcomes[1], TaskOutcome::Done(_)));
    }

    #[test]
    fn test_remote_slots_per_extra_container() {
        let factory: RemoteWorkerFactory = Arc::new(|c: usize, s: usize| Box::new(LocalWorker::new(100 + c * 10 + s)) as Box<dyn Worker>);
        let scheduler = WorkScheduler::with_layout(2, 3, Some(&factory)).unwrap();
        assert_eq!(scheduler.workers_count(), 2 + 2 * 2);
    }
}
