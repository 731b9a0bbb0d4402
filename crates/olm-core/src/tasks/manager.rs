//! Bounded worker pool keyed by task name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use super::events::{TaskEvent, TaskOutcome};
use crate::config::DownloadSettings;
use crate::download::{
    self, ContentHash, ControlSignal, DownloadOutcome, DownloadRequest, HttpDownloader,
    ProgressSnapshot, PullOutcome, PullUpdate, RetryPolicy, TaskControl,
};
use crate::error::{CoreError, Result};
use crate::ollama::OllamaClient;
use crate::registry::{DownloadTask, TaskRegistry, TaskSource, TaskStatus};

/// A plain file for [`TaskManager::download_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequest {
    /// Source URL.
    pub url: String,
    /// Final path.
    pub dest: std::path::PathBuf,
    /// Declared size.
    pub expected_size: Option<u64>,
    /// Expected digest, `algo:hex` or bare hex.
    pub expected_hash: Option<String>,
}

impl From<FileRequest> for TaskSource {
    fn from(request: FileRequest) -> Self {
        Self::File {
            url: request.url,
            dest: request.dest,
            expected_size: request.expected_size,
            expected_hash: request.expected_hash,
        }
    }
}

/// What a pull or resume request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDisposition {
    /// A new task was created.
    Started,
    /// An existing paused, failed or queued task was picked up again.
    Resumed,
}

enum Execution {
    Completed,
    Paused,
    Cancelled,
}

/// Minimum gap between progress writes of one task to the registry file.
const PROGRESS_SAVE_INTERVAL: Duration = Duration::from_secs(5);

struct State {
    registry: TaskRegistry,
    workers: HashMap<String, TaskControl>,
    saved_at: HashMap<String, Instant>,
}

impl State {
    /// Forget the worker owning `name`.
    fn retire(&mut self, name: &str) {
        self.workers.remove(name);
        self.saved_at.remove(name);
    }
}

struct Inner {
    state: Mutex<State>,
    permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<TaskEvent>,
    downloader: HttpDownloader,
    ollama: OllamaClient,
    retry: RetryPolicy,
    progress_interval: Duration,
}

/// Runs downloads on a bounded pool and tracks them by name.
///
/// Cloning gives another handle to the same pool. Methods that start work
/// spawn onto the current tokio runtime.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Open the registry at `tasks_path` and build the pool.
    ///
    /// Returns the manager and the receiving end of its event channel.
    /// Interrupted tasks are loaded as paused and are not restarted.
    pub fn open(
        tasks_path: &Path,
        settings: &DownloadSettings,
        ollama: OllamaClient,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TaskEvent>)> {
        let registry = TaskRegistry::open(tasks_path)?;
        let (events, rx) = mpsc::unbounded_channel();
        let concurrency = settings.concurrency();
        info!(
            "Task manager ready: {} task(s) on record, {} worker slot(s)",
            registry.list().len(),
            concurrency
        );

        let inner = Inner {
            state: Mutex::new(State {
                registry,
                workers: HashMap::new(),
                saved_at: HashMap::new(),
            }),
            permits: Arc::new(Semaphore::new(concurrency)),
            events,
            downloader: HttpDownloader::new(settings)?,
            ollama,
            retry: RetryPolicy::from_settings(settings),
            progress_interval: settings.progress_interval(),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    /// Pull a model through the model server.
    ///
    /// A paused or failed task of the same name is resumed instead.
    pub fn pull_model(&self, name: &str) -> Result<PullDisposition> {
        self.start(name, TaskSource::Model)
    }

    /// Download a plain file under `name`.
    pub fn download_file(&self, name: &str, request: FileRequest) -> Result<PullDisposition> {
        self.start(name, request.into())
    }

    fn start(&self, name: &str, source: TaskSource) -> Result<PullDisposition> {
        let mut state = self.inner.lock()?;

        if let Some(disposition) = absorb_live(&state, name)? {
            return Ok(disposition);
        }

        let stored = state
            .registry
            .get(name)
            .filter(|task| task.status.is_resumable())
            .map(|task| task.source.clone());
        let disposition = match stored {
            Some(stored) if stored == source => PullDisposition::Resumed,
            stored => {
                if let Some(stale) = stored {
                    info!("Task {} was requested from a different source, starting over", name);
                    discard_partial(&stale);
                }
                let task = DownloadTask::new(name, source.clone());
                state.registry.upsert(task.clone())?;
                self.inner.emit(TaskEvent::TaskUpdated(task));
                PullDisposition::Started
            }
        };

        self.spawn_worker(&mut state, name, source);
        info!("Task {} {:?}", name, disposition);
        Ok(disposition)
    }

    /// Resume a paused, failed or queued task.
    pub fn resume(&self, name: &str) -> Result<PullDisposition> {
        let mut state = self.inner.lock()?;

        if let Some(control) = state.workers.get(name) {
            return match control.signal() {
                ControlSignal::Pause => {
                    control.resume();
                    Ok(PullDisposition::Resumed)
                }
                ControlSignal::Run => Err(CoreError::InvalidTaskState {
                    name: name.to_string(),
                    action: "resume",
                    status: TaskStatus::Downloading.to_string(),
                }),
                ControlSignal::Cancel => Err(CoreError::TaskAlreadyActive(name.to_string())),
            };
        }

        let task = state
            .registry
            .get(name)
            .ok_or_else(|| CoreError::TaskNotFound(name.to_string()))?;
        if !task.status.is_resumable() {
            return Err(CoreError::InvalidTaskState {
                name: name.to_string(),
                action: "resume",
                status: task.status.to_string(),
            });
        }

        let source = task.source.clone();
        self.spawn_worker(&mut state, name, source);
        Ok(PullDisposition::Resumed)
    }

    /// Pause a task. A running worker stops after its current chunk.
    pub fn pause(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock()?;

        if let Some(control) = state.workers.get(name) {
            if control.signal() == ControlSignal::Cancel {
                return Err(CoreError::InvalidTaskState {
                    name: name.to_string(),
                    action: "pause",
                    status: TaskStatus::Cancelled.to_string(),
                });
            }
            control.pause();
            debug!("Pause requested for {}", name);
            return Ok(());
        }

        let mut task = state
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(name.to_string()))?;
        match task.status {
            TaskStatus::Paused => Ok(()),
            TaskStatus::Queued => {
                task.status = TaskStatus::Paused;
                state.registry.upsert(task.clone())?;
                self.inner.emit(TaskEvent::TaskUpdated(task));
                Ok(())
            }
            status => Err(CoreError::InvalidTaskState {
                name: name.to_string(),
                action: "pause",
                status: status.to_string(),
            }),
        }
    }

    /// Cancel a task, discarding its partial file and registry entry.
    pub fn cancel(&self, name: &str) -> Result<()> {
        let mut state = self.inner.lock()?;

        if let Some(control) = state.workers.get(name) {
            control.cancel();
            debug!("Cancel requested for {}", name);
            return Ok(());
        }

        let task = state
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(name.to_string()))?;
        self.inner.finish_cancelled(&mut state, task)
    }

    /// Pause every running worker.
    pub fn pause_all(&self) -> Result<usize> {
        let state = self.inner.lock()?;
        let mut paused = 0;
        for control in state.workers.values() {
            if control.signal() == ControlSignal::Run {
                control.pause();
                paused += 1;
            }
        }
        Ok(paused)
    }

    /// Task by name.
    pub fn get(&self, name: &str) -> Result<Option<DownloadTask>> {
        Ok(self.inner.lock()?.registry.get(name).cloned())
    }

    /// All tasks on record.
    pub fn list(&self) -> Result<Vec<DownloadTask>> {
        Ok(self.inner.lock()?.registry.list())
    }

    /// True while a worker owns `name`.
    pub fn is_active(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock()?.workers.contains_key(name))
    }

    /// Number of live workers.
    pub fn active_count(&self) -> Result<usize> {
        Ok(self.inner.lock()?.workers.len())
    }

    fn spawn_worker(&self, state: &mut State, name: &str, source: TaskSource) {
        let control = TaskControl::new();
        state.workers.insert(name.to_string(), control.clone());

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            inner.run_worker(name, source, control).await;
        });
    }
}

/// Remove the partial file a source left behind.
fn discard_partial(source: &TaskSource) {
    if let TaskSource::File { dest, .. } = source {
        let temp = download::temp_path(dest);
        match std::fs::remove_file(&temp) {
            Ok(()) => debug!("Removed {}", temp.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", temp.display(), e),
        }
    }
}

/// Resolve a request against a live worker, if one exists.
fn absorb_live(state: &State, name: &str) -> Result<Option<PullDisposition>> {
    let Some(control) = state.workers.get(name) else {
        return Ok(None);
    };
    match control.signal() {
        ControlSignal::Pause => {
            control.resume();
            info!("Task {} resumed in place", name);
            Ok(Some(PullDisposition::Resumed))
        }
        ControlSignal::Run | ControlSignal::Cancel => {
            Err(CoreError::TaskAlreadyActive(name.to_string()))
        }
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Config("task state lock poisoned".to_string()))
    }

    fn emit(&self, event: TaskEvent) {
        if self.events.send(event).is_err() {
            debug!("Task event dropped, no receiver");
        }
    }

    async fn run_worker(self: Arc<Self>, name: String, source: TaskSource, control: TaskControl) {
        let mut permit: Option<OwnedSemaphorePermit> = None;

        loop {
            if permit.is_none() {
                let acquired = tokio::select! {
                    biased;
                    signal = control.stopped() => Err(signal),
                    permit = Arc::clone(&self.permits).acquire_owned() => Ok(permit),
                };
                match acquired {
                    Ok(Ok(p)) => permit = Some(p),
                    Ok(Err(_)) => {
                        error!("Worker pool closed, dropping task {}", name);
                        self.release(&name);
                        return;
                    }
                    Err(ControlSignal::Cancel) => {
                        self.settle_cancelled(&name, &source);
                        return;
                    }
                    Err(_) => {
                        if self.settle_paused(&name, &control) {
                            return;
                        }
                        continue;
                    }
                }
            }

            self.update(&name, |task| {
                task.status = TaskStatus::Downloading;
                task.error = None;
            });

            match self.execute(&name, &source, &control).await {
                Ok(Execution::Completed) => {
                    self.settle_completed(&name);
                    return;
                }
                Ok(Execution::Paused) => {
                    if self.settle_paused(&name, &control) {
                        return;
                    }
                    info!("Task {} resumed before the worker exited", name);
                }
                Ok(Execution::Cancelled) => {
                    self.settle_cancelled(&name, &source);
                    return;
                }
                Err(err) => {
                    self.settle_failed(&name, &err);
                    return;
                }
            }
        }
    }

    async fn execute(
        &self,
        name: &str,
        source: &TaskSource,
        control: &TaskControl,
    ) -> Result<Execution> {
        match source {
            TaskSource::Model => {
                let outcome = download::pull_model(
                    &self.ollama,
                    name,
                    control,
                    &self.retry,
                    self.progress_interval,
                    |update| match update {
                        PullUpdate::Status(message) => self.emit(TaskEvent::Status {
                            name: name.to_string(),
                            message,
                        }),
                        PullUpdate::Progress(snapshot) => self.record_progress(name, &snapshot),
                    },
                )
                .await?;
                Ok(match outcome {
                    PullOutcome::Completed { .. } => Execution::Completed,
                    PullOutcome::Paused => Execution::Paused,
                    PullOutcome::Cancelled => Execution::Cancelled,
                })
            }
            TaskSource::File {
                url,
                dest,
                expected_size,
                expected_hash,
            } => {
                let request = DownloadRequest {
                    url: url.clone(),
                    dest: dest.clone(),
                    expected_size: *expected_size,
                    expected_hash: ContentHash::parse_optional(expected_hash.as_deref())?,
                };
                let outcome = self
                    .downloader
                    .download(&request, control, |snapshot| {
                        self.record_progress(name, snapshot);
                    })
                    .await?;
                Ok(match outcome {
                    DownloadOutcome::Completed { .. } => Execution::Completed,
                    DownloadOutcome::Paused { .. } => Execution::Paused,
                    DownloadOutcome::Cancelled => Execution::Cancelled,
                })
            }
        }
    }

    /// Publish progress. The registry file is rewritten at most once per
    /// [`PROGRESS_SAVE_INTERVAL`]; status changes always persist.
    fn record_progress(&self, name: &str, snapshot: &ProgressSnapshot) {
        let updated = self.with_state(|state| {
            let Some(mut task) = state.registry.get(name).cloned() else {
                return Ok(None);
            };
            task.apply_progress(snapshot);

            let now = Instant::now();
            let due = state
                .saved_at
                .get(name)
                .is_none_or(|at| now.duration_since(*at) >= PROGRESS_SAVE_INTERVAL);
            if due {
                state.registry.upsert(task.clone())?;
                state.saved_at.insert(name.to_string(), now);
            } else {
                state.registry.stage(task.clone());
            }
            Ok(Some(task))
        });

        if let Some(task) = updated {
            self.emit(TaskEvent::Progress {
                name: task.name,
                percent: task.progress,
                speed: task.speed,
                eta: task.eta,
            });
        }
    }

    /// Apply `change` to the stored task, persist and publish it.
    fn update(&self, name: &str, change: impl FnOnce(&mut DownloadTask)) {
        let updated = self.with_state(|state| {
            let Some(mut task) = state.registry.get(name).cloned() else {
                return Ok(None);
            };
            change(&mut task);
            state.registry.upsert(task.clone())?;
            Ok(Some(task))
        });
        if let Some(task) = updated {
            self.emit(TaskEvent::TaskUpdated(task));
        }
    }

    /// Run `f` under the state lock, logging failures.
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<Option<T>>) -> Option<T> {
        let result = self.lock().and_then(|mut state| f(&mut state));
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to persist task state: {}", e);
                None
            }
        }
    }

    fn release(&self, name: &str) {
        if let Ok(mut state) = self.lock() {
            state.retire(name);
        }
    }

    /// Persist a pause unless the task was resumed meanwhile.
    ///
    /// Returns true when the worker should exit.
    fn settle_paused(&self, name: &str, control: &TaskControl) -> bool {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(e) => {
                error!("Cannot settle pause of {}: {}", name, e);
                return true;
            }
        };

        match control.signal() {
            ControlSignal::Run => return false,
            ControlSignal::Cancel => {
                let source = state
                    .registry
                    .get(name)
                    .map(|t| t.source.clone())
                    .unwrap_or_default();
                drop(state);
                self.settle_cancelled(name, &source);
                return true;
            }
            ControlSignal::Pause => {}
        }

        state.retire(name);
        if let Some(mut task) = state.registry.get(name).cloned() {
            task.status = TaskStatus::Paused;
            task.can_resume = true;
            task.clear_rates();
            if let Err(e) = state.registry.upsert(task.clone()) {
                warn!("Failed to persist pause of {}: {}", name, e);
            }
            info!("Task {} paused at {:.1}%", name, task.progress);
            self.emit(TaskEvent::TaskUpdated(task));
        }
        true
    }

    fn settle_completed(&self, name: &str) {
        let removed = self.lock().and_then(|mut state| {
            state.retire(name);
            state.registry.remove(name)
        });

        let removed = match removed {
            Ok(removed) => removed,
            Err(e) => {
                let reason = format!("download finished but the task list could not be updated: {e}");
                error!("Task {}: {}", name, reason);
                self.emit(TaskEvent::Finished {
                    name: name.to_string(),
                    outcome: TaskOutcome::Failed { reason },
                });
                return;
            }
        };

        let mut task = removed.unwrap_or_else(|| DownloadTask::new(name, TaskSource::Model));
        task.status = TaskStatus::Completed;
        task.progress = 100.0;
        task.clear_rates();
        info!("Task {} completed", name);
        self.emit(TaskEvent::TaskUpdated(task));
        self.emit(TaskEvent::Finished {
            name: name.to_string(),
            outcome: TaskOutcome::Completed,
        });
    }

    fn settle_cancelled(&self, name: &str, source: &TaskSource) {
        let result = self.lock().and_then(|mut state| {
            let task = state
                .registry
                .get(name)
                .cloned()
                .unwrap_or_else(|| DownloadTask::new(name, source.clone()));
            state.retire(name);
            self.finish_cancelled(&mut state, task)
        });
        if let Err(e) = result {
            warn!("Failed to record cancellation of {}: {}", name, e);
        }
    }

    /// Remove a task and its partial file, then publish the cancellation.
    fn finish_cancelled(&self, state: &mut State, mut task: DownloadTask) -> Result<()> {
        discard_partial(&task.source);

        state.registry.remove(&task.name)?;
        task.status = TaskStatus::Cancelled;
        task.clear_rates();
        info!("Task {} cancelled", task.name);

        let name = task.name.clone();
        self.emit(TaskEvent::TaskUpdated(task));
        self.emit(TaskEvent::Finished {
            name,
            outcome: TaskOutcome::Cancelled,
        });
        Ok(())
    }

    fn settle_failed(&self, name: &str, err: &CoreError) {
        error!("Task {} failed: {}", name, err);
        let reason = err.to_string();

        let updated = self.with_state(|state| {
            state.retire(name);
            let Some(mut task) = state.registry.get(name).cloned() else {
                return Ok(None);
            };
            task.status = TaskStatus::Failed;
            task.can_resume = true;
            task.error = Some(reason.clone());
            task.clear_rates();
            state.registry.upsert(task.clone())?;
            Ok(Some(task))
        });

        if let Some(task) = updated {
            self.emit(TaskEvent::TaskUpdated(task));
        }
        self.emit(TaskEvent::Finished {
            name: name.to_string(),
            outcome: TaskOutcome::Failed { reason },
        });
    }
}
