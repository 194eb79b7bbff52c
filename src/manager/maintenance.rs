use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use crate::manager::TaskManager;
use crate::task::now_millis;


const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const TIMEOUT_INTERVAL: Duration = Duration::from_secs(60);

static TASK_DIRECTORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w\d]+-[\w\d]+-[\w\d]+-[\w\d]+-[\w\d]+$").expect("valid regex")
});


fn minutes(n: u64) -> i64 {
    (n as i64).saturating_mul(60 * 1000)
}


impl TaskManager {
    /// Removes finished tasks whose completion is older than the
    /// configured retention.
    pub async fn remove_old_tasks(&self) {
        let retention = self.inner.ctx.config.cleanup_tasks_after;
        if retention == 0 {
            return;
        }

        let now = now_millis();
        let mut expired = vec![];
        for task in self.list().await {
            let summary = task.summary().await;
            let completed_at = summary.date_created + summary.processing_time;
            if summary.status.code.is_terminal() && now - completed_at > minutes(retention) {
                expired.push(summary.uuid);
            }
        }

        for id in expired {
            tracing::info!(task_id = %id, "Cleaning up old task");
            if let Err(err) = self.remove(&id).await {
                tracing::warn!(task_id = %id, error = %err, "Could not remove old task");
            }
        }
    }

    /// Deletes project folders that no registered task owns.
    pub async fn remove_orphaned_directories(&self) {
        let data_dir = &self.inner.ctx.config.data_dir;
        let mut entries = match tokio::fs::read_dir(data_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %data_dir.display(), error = %err, "Cannot list data folder");
                return;
            }
        };

        let known: Vec<String> = self.inner.tasks.lock().await.keys().cloned().collect();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "Cannot list data folder");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || !TASK_DIRECTORY.is_match(&name) || known.contains(&name) {
                continue;
            }

            tracing::info!(task_id = %name, "Found orphaned directory, removing");
            if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
                tracing::warn!(task_id = %name, error = %err, "Could not remove orphaned directory");
            }
        }
    }

    /// Deletes staged uploads that were never committed.
    pub async fn remove_stale_uploads(&self) {
        let config = &self.inner.ctx.config;
        if config.cleanup_uploads_after == 0 {
            return;
        }
        let max_age = Duration::from_secs(config.cleanup_uploads_after.saturating_mul(60));

        let mut entries = match tokio::fs::read_dir(&config.tmp_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(path = %config.tmp_dir.display(), error = %err, "Cannot list upload folder");
                return;
            }
        };

        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if !age.is_some_and(|age| age > max_age) {
                continue;
            }

            let path = entry.path();
            tracing::info!(path = %path.display(), "Removing stale upload");
            let removed = if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(err) = removed {
                tracing::warn!(path = %path.display(), error = %err, "Could not remove stale upload");
            }
        }
    }

    /// Cancels every task that has been running longer than the configured
    /// maximum.
    pub async fn check_timeouts(&self) {
        let Some(max_runtime) = self.inner.ctx.config.max_runtime else {
            return;
        };

        for task in self.list().await {
            let Some(elapsed) = task.running_time().await else {
                continue;
            };
            if elapsed < minutes(max_runtime) {
                continue;
            }

            tracing::warn!(task_id = %task.id(), max_runtime, "Task timed out");
            task.append_output(format!("Task timed out after {} minutes.", max_runtime))
                .await;
            if let Err(err) = self.cancel(task.id()).await {
                tracing::warn!(task_id = %task.id(), error = %err, "Could not cancel timed out task");
            }
        }
    }

    pub(super) fn schedule_maintenance(&self) {
        let shutdown = self.inner.shutdown.clone();

        let manager = self.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tracing::debug!("Running hourly maintenance");
                        manager.remove_old_tasks().await;
                        manager.dump_task_list().await;
                        manager.remove_stale_uploads().await;
                    }
                }
            }
        });

        if self.inner.ctx.config.max_runtime.is_some() {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TIMEOUT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => manager.check_timeouts().await,
                    }
                }
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_directories_need_five_groups() {
        assert!(TASK_DIRECTORY.is_match("1b1a3f2e-0c4d-4b6a-9f1e-2d3c4b5a6f70"));
        assert!(TASK_DIRECTORY.is_match("a-b-c-d-e"));
        assert!(!TASK_DIRECTORY.is_match("tasks.json"));
        assert!(!TASK_DIRECTORY.is_match("a-b-c-d"));
        assert!(!TASK_DIRECTORY.is_match("a-b-c-d-e-f"));
        assert!(!TASK_DIRECTORY.is_match("a-b-c-d-e/"));
    }
}
