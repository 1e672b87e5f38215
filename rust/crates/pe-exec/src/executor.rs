//! The bounded concurrent executor: `run` and `run_with_deps`.

use crate::progress::{ErrorSummary, ProgressSnapshot};
use crate::task::{Task, TaskResult};
use pe_core::EngineError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Invoked after each transition: wave submitted, task completed, task
/// skipped. Receives an immutable snapshot taken under the bookkeeping
/// mutex.
pub type ProgressCallback<'a> = dyn Fn(ProgressSnapshot) + Sync + 'a;

struct Bookkeeping {
    total: usize,
    completed: usize,
    failed: usize,
    skipped: usize,
    running: usize,
    pending: usize,
    start: Instant,
    errors: ErrorSummary,
}

impl Bookkeeping {
    fn new(total: usize, start: Instant) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
            skipped: 0,
            running: 0,
            pending: total,
            start,
            errors: ErrorSummary::default(),
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            running: self.running,
            pending: self.pending,
            start_time: self.start,
            now: Instant::now(),
        }
    }

    fn mark_started(&mut self) {
        self.pending -= 1;
        self.running += 1;
    }

    fn mark_settled<T>(&mut self, result: &TaskResult<T>, required: bool) {
        self.running -= 1;
        if result.skipped {
            self.skipped += 1;
            self.errors.record_skipped(&result.task_id);
        } else if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
            self.errors.record_failure(
                &result.task_id,
                result.error_kind.as_deref().unwrap_or("Unknown"),
                required,
            );
        }
    }

    fn mark_skipped_without_running<T>(&mut self, result: &TaskResult<T>) {
        self.pending -= 1;
        self.skipped += 1;
        self.errors.record_skipped(&result.task_id);
    }
}

fn build_pool(workers: usize) -> Result<rayon::ThreadPool, EngineError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| EngineError::Executor(format!("failed to build worker pool: {e}")))
}

fn notify(cb: Option<&ProgressCallback>, book: &Mutex<Bookkeeping>) {
    if let Some(cb) = cb {
        let snap = book.lock().unwrap().snapshot();
        cb(snap);
    }
}

/// Run a set of independent tasks on a pool of at most `workers` threads.
/// Results come back in input order, not completion order.
#[instrument(skip(tasks, progress))]
pub fn run<T: Send>(
    tasks: Vec<Task<T>>,
    workers: usize,
    progress: Option<&ProgressCallback>,
) -> Result<Vec<TaskResult<T>>, EngineError> {
    if workers == 0 {
        return Err(EngineError::Config("worker count must be >= 1".to_string()));
    }
    let mut seen = HashSet::new();
    for t in &tasks {
        if !seen.insert(t.id.clone()) {
            return Err(EngineError::Config(format!("duplicate task id '{}'", t.id)));
        }
    }

    let n = tasks.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    let pool = build_pool(workers)?;
    let book = Mutex::new(Bookkeeping::new(n, Instant::now()));
    let slots: Mutex<Vec<Option<TaskResult<T>>>> = Mutex::new((0..n).map(|_| None).collect());

    notify(progress, &book);

    pool.scope(|scope| {
        for (idx, task) in tasks.into_iter().enumerate() {
            let slots = &slots;
            let book = &book;
            scope.spawn(move |_| {
                {
                    let mut b = book.lock().unwrap();
                    b.mark_started();
                }
                let required = task.required;
                let id = task.id.clone();
                let start = Instant::now();
                let outcome = (task.body)();
                let elapsed = start.elapsed().as_millis() as u64;
                let result = match outcome {
                    Ok(v) => TaskResult::success(id, v, elapsed),
                    Err(f) => TaskResult::failure(id, f, elapsed),
                };
                {
                    let mut b = book.lock().unwrap();
                    b.mark_settled(&result, required);
                }
                slots.lock().unwrap()[idx] = Some(result);
                notify(progress, book);
            });
        }
    });

    debug!(total = n, "run() completed");
    let slots = slots.into_inner().unwrap();
    Ok(slots.into_iter().map(|s| s.expect("every slot filled")).collect())
}

/// Run tasks that declare dependencies on each other's ids. Execution
/// proceeds wave by wave (Kahn stratification over task ids); within a
/// wave all ready tasks are submitted together and the executor waits for
/// the whole wave before computing the next.
#[instrument(skip(tasks, progress))]
pub fn run_with_deps<T: Send>(
    tasks: Vec<Task<T>>,
    workers: usize,
    progress: Option<&ProgressCallback>,
) -> Result<Vec<TaskResult<T>>, EngineError> {
    if workers == 0 {
        return Err(EngineError::Config("worker count must be >= 1".to_string()));
    }

    let order: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let id_set: HashSet<&str> = order.iter().map(|s| s.as_str()).collect();

    let mut seen = HashSet::new();
    let mut required_of: HashMap<String, bool> = HashMap::new();
    let mut deps_of: HashMap<String, Vec<String>> = HashMap::new();
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
    for id in &order {
        children_of.insert(id.clone(), Vec::new());
    }

    for t in &tasks {
        if !seen.insert(t.id.clone()) {
            return Err(EngineError::Config(format!("duplicate task id '{}'", t.id)));
        }
        for dep in &t.dependencies {
            if !id_set.contains(dep.as_str()) {
                return Err(EngineError::Config(format!(
                    "task '{}' depends on unknown task '{}'",
                    t.id, dep
                )));
            }
        }
        required_of.insert(t.id.clone(), t.required);
        deps_of.insert(t.id.clone(), t.dependencies.clone());
    }
    for t in &tasks {
        for dep in &t.dependencies {
            children_of.get_mut(dep).unwrap().push(t.id.clone());
        }
    }

    let n = tasks.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut in_degree: HashMap<String, usize> =
        order.iter().map(|id| (id.clone(), deps_of[id].len())).collect();
    let mut remaining: HashSet<String> = order.iter().cloned().collect();
    let mut bodies: HashMap<String, Task<T>> =
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
    let mut results: HashMap<String, TaskResult<T>> = HashMap::new();

    let pool = build_pool(workers)?;
    let book = Mutex::new(Bookkeeping::new(n, Instant::now()));
    notify(progress, &book);

    while !remaining.is_empty() {
        let frontier: Vec<String> = order
            .iter()
            .filter(|id| remaining.contains(id.as_str()) && in_degree[id.as_str()] == 0)
            .cloned()
            .collect();

        if frontier.is_empty() {
            return Err(EngineError::Executor("unreachable task set".to_string()));
        }

        let mut run_batch: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = frontier.into_iter().collect();

        while let Some(id) = queue.pop_front() {
            if !remaining.contains(&id) {
                continue;
            }
            let should_skip = deps_of[&id].iter().any(|d| {
                results
                    .get(d)
                    .map(|r| !r.success && required_of[d])
                    .unwrap_or(false)
            });

            if should_skip {
                let result = TaskResult::skipped_dependency_failure(id.clone());
                {
                    let mut b = book.lock().unwrap();
                    b.mark_skipped_without_running(&result);
                }
                notify(progress, &book);
                results.insert(id.clone(), result);
                remaining.remove(&id);
                for child in &children_of[&id] {
                    let deg = in_degree.get_mut(child).unwrap();
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 && remaining.contains(child) {
                        queue.push_back(child.clone());
                    }
                }
            } else {
                run_batch.push(id.clone());
                remaining.remove(&id);
            }
        }

        if run_batch.is_empty() {
            continue;
        }

        debug!(wave_size = run_batch.len(), "submitting wave");
        let batch_tasks: Vec<Task<T>> = run_batch
            .iter()
            .map(|id| bodies.remove(id).expect("task body present"))
            .collect();

        let wave_results: Vec<TaskResult<T>> = {
            let slots_mutex: Mutex<Vec<Option<TaskResult<T>>>> =
                Mutex::new((0..batch_tasks.len()).map(|_| None).collect());
            pool.scope(|scope| {
                for (idx, task) in batch_tasks.into_iter().enumerate() {
                    let slots_mutex = &slots_mutex;
                    let book = &book;
                    scope.spawn(move |_| {
                        {
                            let mut b = book.lock().unwrap();
                            b.mark_started();
                        }
                        let required = task.required;
                        let id = task.id.clone();
                        let start = Instant::now();
                        let outcome = (task.body)();
                        let elapsed = start.elapsed().as_millis() as u64;
                        let result = match outcome {
                            Ok(v) => TaskResult::success(id, v, elapsed),
                            Err(f) => TaskResult::failure(id, f, elapsed),
                        };
                        {
                            let mut b = book.lock().unwrap();
                            b.mark_settled(&result, required);
                        }
                        slots_mutex.lock().unwrap()[idx] = Some(result);
                    });
                }
            });
            notify(progress, &book);
            slots_mutex
                .into_inner()
                .unwrap()
                .into_iter()
                .map(|s| s.expect("every wave slot filled"))
                .collect()
        };

        for result in wave_results {
            for child in &children_of[&result.task_id] {
                let deg = in_degree.get_mut(child).unwrap();
                *deg = deg.saturating_sub(1);
            }
            results.insert(result.task_id.clone(), result);
        }
    }

    if results.len() != n {
        warn!(
            resolved = results.len(),
            total = n,
            "run_with_deps finished without resolving every task"
        );
    }

    Ok(order
        .into_iter()
        .map(|id| results.remove(&id).expect("every task resolved"))
        .collect())
}
