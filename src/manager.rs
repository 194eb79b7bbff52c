use futures::future::{join_all, BoxFuture};
use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::progress::ProgressEvent;
use crate::task::{OnDone, Task, TaskContext};
use crate::tasks::{SerializedTask, StatusCode, TaskOption};

mod maintenance;


/// Owns every task of the node and decides which of them run.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    ctx: Arc<TaskContext>,
    // Insertion order is the admission order.
    tasks: Mutex<IndexMap<String, Arc<Task>>>,
    running: Mutex<IndexSet<String>>,
    scheduling: Mutex<()>,
    snapshot: Mutex<()>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(ctx: Arc<TaskContext>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                tasks: Mutex::new(IndexMap::new()),
                running: Mutex::new(IndexSet::new()),
                scheduling: Mutex::new(()),
                snapshot: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.inner.ctx
    }

    /// Restores the registry, clears out leftovers from earlier runs, starts
    /// scheduling and installs the periodic maintenance loops.
    pub async fn initialize(&self) -> Result<()> {
        self.restore_task_list().await?;
        self.remove_old_tasks().await;
        self.remove_orphaned_directories().await;
        self.remove_stale_uploads().await;
        self.process_next_task().await;
        self.schedule_maintenance();
        tracing::info!("Task manager initialized");
        Ok(())
    }

    /// Loads the snapshot written by an earlier run. A missing file means a
    /// fresh node; an unreadable one is logged and ignored.
    pub async fn restore_task_list(&self) -> Result<()> {
        let path = self.inner.ctx.config.snapshot_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let entries: Vec<SerializedTask> = match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Could not parse task list, starting with an empty one"
                );
                return Ok(());
            }
        };

        let ctx = &self.inner.ctx;
        let restored = join_all(
            entries
                .into_iter()
                .map(|entry| Task::restore(entry, ctx.clone())),
        )
        .await;

        let mut tasks = self.inner.tasks.lock().await;
        for result in restored {
            match result {
                Ok(task) => {
                    tasks.insert(task.id().to_string(), task);
                }
                Err(err) => tracing::warn!(error = %err, "Could not restore task"),
            }
        }
        tracing::info!(count = tasks.len(), "Restored tasks");
        Ok(())
    }

    /// Fills free slots with ready tasks in admission order. Each finished
    /// task calls back in here, so the future is boxed.
    pub fn process_next_task(&self) -> BoxFuture<'static, ()> {
        let manager = self.clone();
        Box::pin(async move { manager.schedule().await })
    }

    async fn schedule(&self) {
        let _scheduling = self.inner.scheduling.lock().await;
        let limit = self.inner.ctx.config.parallel_queue_processing;

        loop {
            let candidates: Vec<Arc<Task>> =
                self.inner.tasks.lock().await.values().cloned().collect();

            let next = {
                let mut running = self.inner.running.lock().await;
                if running.len() >= limit {
                    break;
                }
                let mut next = None;
                for task in candidates {
                    if !running.contains(task.id()) && task.is_ready().await {
                        next = Some(task);
                        break;
                    }
                }
                let Some(task) = next else {
                    break;
                };
                running.insert(task.id().to_string());
                task
            };

            let manager = self.clone();
            let id = next.id().to_string();
            let on_done: OnDone = Box::new(move || {
                tokio::spawn(async move { manager.task_finished(&id).await });
            });

            if !next.start(on_done).await {
                // Lost readiness between the scan and the start.
                self.inner.running.lock().await.shift_remove(next.id());
            }
        }
    }

    async fn task_finished(&self, id: &str) {
        {
            // Slot release and admission never interleave.
            let _scheduling = self.inner.scheduling.lock().await;
            let task = self.inner.tasks.lock().await.get(id).cloned();
            match task {
                // Restarted and admitted again before the old run wound down.
                Some(task) if task.running_time().await.is_some() => {}
                Some(task) => {
                    self.inner.running.lock().await.shift_remove(id);
                    task.call_webhooks();
                }
                None => {
                    self.inner.running.lock().await.shift_remove(id);
                }
            }
        }

        self.dump_task_list().await;
        self.process_next_task().await;
    }

    /// Registers a task, initializes it in the background and schedules.
    pub async fn add_new(&self, task: Arc<Task>) {
        tracing::info!(task_id = %task.id(), "New task");
        self.inner
            .tasks
            .lock()
            .await
            .insert(task.id().to_string(), task.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = task.initialize().await {
                tracing::warn!(task_id = %task.id(), error = %err, "Task initialization failed");
            }
            manager.dump_task_list().await;
            manager.process_next_task().await;
        });

        self.process_next_task().await;
    }

    pub async fn find(&self, id: &str) -> Result<Arc<Task>> {
        self.inner
            .tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<Task>> {
        self.inner.tasks.lock().await.values().cloned().collect()
    }

    /// Succeeds without side effects when the task is already canceled.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let task = self.find(id).await?;
        match task.cancel().await {
            Ok(()) => {}
            Err(Error::AlreadyCanceled) => return Ok(()),
            Err(err) => return Err(err),
        }

        self.inner.running.lock().await.shift_remove(id);
        self.dump_task_list().await;
        self.process_next_task().await;
        Ok(())
    }

    /// Cancels the task, deletes its folder and forgets it. The task stays
    /// registered if any step fails.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.cancel(id).await?;
        let task = self.find(id).await?;
        task.cleanup().await?;

        self.inner.tasks.lock().await.shift_remove(id);
        self.inner.running.lock().await.shift_remove(id);
        tracing::info!(task_id = %id, "Task removed");

        self.dump_task_list().await;
        self.process_next_task().await;
        Ok(())
    }

    pub async fn restart(&self, id: &str, options: Option<Vec<TaskOption>>) -> Result<()> {
        let task = self.find(id).await?;
        task.restart(options).await?;
        self.dump_task_list().await;
        self.process_next_task().await;
        Ok(())
    }

    /// Tasks waiting or being processed.
    pub async fn get_queue_count(&self) -> usize {
        let tasks = self.list().await;
        let mut count = 0;
        for task in tasks {
            if matches!(task.status().await.code, StatusCode::Queued | StatusCode::Running) {
                count += 1;
            }
        }
        count
    }

    pub async fn running_count(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    /// Writes the snapshot. Failures are logged, never returned.
    pub async fn dump_task_list(&self) {
        // Serialized under the lock so an older state never overwrites a newer one.
        let _snapshot = self.inner.snapshot.lock().await;
        let tasks = self.list().await;
        let entries = join_all(tasks.iter().map(|task| task.serialize())).await;

        match self.write_snapshot(&entries).await {
            Ok(()) => tracing::debug!(count = entries.len(), "Task list saved"),
            Err(err) => tracing::error!(error = %err, "Could not save task list"),
        }
    }

    async fn write_snapshot(&self, entries: &[SerializedTask]) -> Result<()> {
        let path = self.inner.ctx.config.snapshot_path();
        let partial = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&partial, json).await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }

    /// Forwards engine progress reports to their tasks until the channel
    /// closes or the manager shuts down.
    pub fn listen_progress(&self, mut events: broadcast::Receiver<ProgressEvent>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = manager.inner.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if let Ok(task) = manager.find(&event.job_id).await {
                            task.update_progress(event.percent).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Progress listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Stops the maintenance loops and saves the task list one last time.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.dump_task_list().await;
        tracing::info!("Task manager stopped");
    }
}
