//! Task/result types shared by `run` and `run_with_deps`.

/// What a task body reports on failure: its short "kind" (mirroring the
/// original's `type(exception).__name__` capture) and a human message.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub error_kind: String,
    pub error_message: String,
}

impl TaskFailure {
    pub fn new(error_kind: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_kind: error_kind.into(),
            error_message: error_message.into(),
        }
    }
}

/// One unit of work submitted to the executor. `dependencies` is only
/// consulted by `run_with_deps`; `run` ignores it.
pub struct Task<T> {
    pub id: String,
    pub dependencies: Vec<String>,
    pub required: bool,
    pub body: Box<dyn FnOnce() -> Result<T, TaskFailure> + Send>,
}

impl<T> Task<T> {
    pub fn new(
        id: impl Into<String>,
        body: impl FnOnce() -> Result<T, TaskFailure> + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            required: true,
            body: Box::new(body),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// The outcome of one task, always present at its input-list position
/// regardless of completion order.
#[derive(Debug, Clone)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub success: bool,
    pub output: Option<T>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub skipped: bool,
    pub execution_time_ms: u64,
}

impl<T> TaskResult<T> {
    pub fn success(task_id: impl Into<String>, output: T, execution_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            output: Some(output),
            error_kind: None,
            error_message: None,
            skipped: false,
            execution_time_ms,
        }
    }

    pub fn failure(task_id: impl Into<String>, failure: TaskFailure, execution_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            output: None,
            error_kind: Some(failure.error_kind),
            error_message: Some(failure.error_message),
            skipped: false,
            execution_time_ms,
        }
    }

    pub fn skipped_dependency_failure(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            output: None,
            error_kind: Some("DependencyFailure".to_string()),
            error_message: Some("required dependency failed".to_string()),
            skipped: true,
            execution_time_ms: 0,
        }
    }
}
