use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::{
    exit_code_message, with_post_processing_defaults, Invocation, KnownOptions, OptionSchema,
};
use crate::error::{Error, Result};
use crate::process::{Process, ProcessCommand};
use crate::tasks::{
    CreateTask, SerializedTask, StatusCode, TaskOption, TaskStatus, TaskSummary,
};
use crate::upload::ResultUploader;
use crate::webhook::WebhookNotifier;

mod pipeline;


pub const ARCHIVE_NAME: &str = "all.zip";
const IMAGE_MANIFEST: &str = "images.json";


/// Invoked exactly once when a started task stops running.
pub type OnDone = Box<dyn FnOnce() + Send + 'static>;


pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}


/// Collaborators shared by every task of a node.
pub struct TaskContext {
    pub config: Arc<Config>,
    pub schema: Arc<dyn OptionSchema>,
    pub uploader: Arc<ResultUploader>,
    pub notifier: WebhookNotifier,
}

impl TaskContext {
    pub fn new(config: Config, uploader: ResultUploader) -> Self {
        let schema: Arc<dyn OptionSchema> = match &config.engine_options {
            Some(names) => Arc::new(KnownOptions::new(names.iter().cloned())),
            None => Arc::new(KnownOptions::post_processing()),
        };
        let notifier = WebhookNotifier::new(config.webhook_retry_delay());
        Self {
            config: Arc::new(config),
            schema,
            uploader: Arc::new(uploader),
            notifier,
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = notifier;
        self
    }
}


/// Auxiliary inputs found in a project's `gcp` folder.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuxiliaryFiles {
    pub gcp: Option<String>,
    pub geo: Option<String>,
    pub image_groups: Option<String>,
}

/// Sorts file names into roles: `geo.txt`, `image_groups.txt`, and any
/// other `.txt` as ground control points. The first name per role wins.
pub fn classify_auxiliary(names: &[String]) -> AuxiliaryFiles {
    let mut names = names.to_vec();
    names.sort();

    let mut files = AuxiliaryFiles::default();
    for name in names {
        let lower = name.to_lowercase();
        if lower == "geo.txt" {
            files.geo.get_or_insert(name);
        } else if lower == "image_groups.txt" {
            files.image_groups.get_or_insert(name);
        } else if lower.ends_with(".txt") {
            files.gcp.get_or_insert(name);
        }
    }
    files
}


#[derive(Debug)]
struct TaskState {
    name: String,
    date_created: i64,
    date_started: Option<i64>,
    processing_time: i64,
    status: TaskStatus,
    options: Vec<TaskOption>,
    progress: f64,
    images_count: usize,
    output: Vec<String>,
    webhook: Option<String>,
    outputs: Option<Vec<String>>,
    skip_post_processing: bool,
    auxiliary: AuxiliaryFiles,
    initializing: bool,
    pending_cleanup: bool,
    process: Option<Arc<Process>>,
    // Bumped on every start and restart so a superseded run cannot touch
    // the state of the current one.
    run: u64,
}

impl TaskState {
    fn is_processing(&self) -> bool {
        self.status.code == StatusCode::Running && !self.initializing
    }

    fn processing_time(&self) -> i64 {
        match (self.is_processing(), self.date_started) {
            (true, Some(started)) => now_millis() - started,
            _ => self.processing_time,
        }
    }
}


/// One processing job.
pub struct Task {
    id: String,
    ctx: Arc<TaskContext>,
    init_claimed: AtomicBool,
    state: Mutex<TaskState>,
}

impl Task {
    /// Creates a task that still has to be initialized. Until then its
    /// status is RUNNING so the scheduler leaves it alone.
    pub fn new(id: impl Into<String>, params: CreateTask, ctx: Arc<TaskContext>) -> Arc<Self> {
        let name = params.name.filter(|name| !name.is_empty()).unwrap_or_else(|| {
            format!(
                "Task of {}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
            )
        });

        Arc::new(Self {
            id: id.into(),
            ctx,
            init_claimed: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                name,
                date_created: params.date_created.unwrap_or_else(now_millis),
                date_started: None,
                processing_time: 0,
                status: TaskStatus::new(StatusCode::Running),
                options: params.options,
                progress: 0.0,
                images_count: params.images_count_estimate,
                output: vec![],
                webhook: params.webhook.filter(|hook| !hook.is_empty()),
                outputs: params.outputs,
                skip_post_processing: params.skip_post_processing,
                auxiliary: AuxiliaryFiles::default(),
                initializing: true,
                pending_cleanup: false,
                process: None,
                run: 0,
            }),
        })
    }

    /// Rebuilds a task from a snapshot entry. A task recorded as RUNNING
    /// comes back QUEUED since its process did not survive the restart.
    pub async fn restore(entry: SerializedTask, ctx: Arc<TaskContext>) -> Result<Arc<Self>> {
        let params = CreateTask {
            name: Some(entry.name),
            options: entry.options,
            webhook: entry.webhook,
            skip_post_processing: entry.skip_post_processing,
            outputs: entry.outputs,
            date_created: Some(entry.date_created),
            images_count_estimate: 0,
        };
        let task = Task::new(entry.uuid, params, ctx);
        task.initialize().await?;

        {
            let mut state = task.state.lock().await;
            state.status = match entry.status.code {
                StatusCode::Running => TaskStatus::new(StatusCode::Queued),
                _ => entry.status,
            };
            state.date_started = entry.date_started;
            state.processing_time = entry.processing_time;
        }
        Ok(task)
    }

    /// Scans the project folder and completes the option list. Runs once;
    /// later calls return immediately.
    pub async fn initialize(&self) -> Result<()> {
        if self.init_claimed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let scanned = self.scan_project().await;
        let pending_cleanup = {
            let mut state = self.state.lock().await;
            state.initializing = false;
            match &scanned {
                Ok((images, auxiliary)) => {
                    state.images_count = *images;
                    state.auxiliary = auxiliary.clone();
                    if !state.skip_post_processing {
                        let options = std::mem::take(&mut state.options);
                        state.options =
                            with_post_processing_defaults(options, self.ctx.schema.as_ref());
                    }
                    if state.status.code == StatusCode::Running {
                        state.status = TaskStatus::new(StatusCode::Queued);
                    }
                }
                Err(err) => {
                    if state.status.code == StatusCode::Running {
                        state.status = TaskStatus::failed(err.to_string());
                    }
                }
            }
            std::mem::take(&mut state.pending_cleanup)
        };

        if pending_cleanup {
            if let Err(err) = self.remove_storage().await {
                tracing::warn!(task_id = %self.id, error = %err, "Deferred cleanup failed");
            }
        }

        scanned.map(|_| ())
    }

    async fn scan_project(&self) -> Result<(usize, AuxiliaryFiles)> {
        let project = self.project_path();

        let mut images = 0;
        let mut entries = tokio::fs::read_dir(project.join("images")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                images += 1;
            }
        }

        let max_images = self.ctx.config.max_images;
        if max_images > 0 && images > max_images {
            return Err(Error::Process(format!(
                "Too many images ({}), the limit is {}",
                images, max_images
            )));
        }

        let mut names = vec![];
        match tokio::fs::read_dir(project.join("gcp")).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok((images, classify_auxiliary(&names)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_path(&self) -> PathBuf {
        self.ctx.config.project_path(&self.id)
    }

    pub async fn status(&self) -> TaskStatus {
        self.state.lock().await.status.clone()
    }

    pub async fn progress(&self) -> f64 {
        self.state.lock().await.progress
    }

    pub async fn is_initializing(&self) -> bool {
        self.state.lock().await.initializing
    }

    /// QUEUED and done initializing.
    pub async fn is_ready(&self) -> bool {
        let state = self.state.lock().await;
        state.status.code == StatusCode::Queued && !state.initializing
    }

    /// Milliseconds since the engine was started, while it is running.
    pub async fn running_time(&self) -> Option<i64> {
        let state = self.state.lock().await;
        match (state.is_processing(), state.date_started) {
            (true, Some(started)) => Some(now_millis() - started),
            _ => None,
        }
    }

    /// Spawns the engine. Only valid from QUEUED; returns false otherwise.
    pub async fn start(self: &Arc<Self>, on_done: OnDone) -> bool {
        let (run, process, options, auxiliary) = {
            let mut state = self.state.lock().await;
            if state.status.code != StatusCode::Queued || state.initializing {
                return false;
            }
            state.date_started = Some(now_millis());
            state.processing_time = 0;
            state.status = TaskStatus::new(StatusCode::Running);
            state.run += 1;
            let process = Process::new();
            state.process = Some(process.clone());
            (state.run, process, state.options.clone(), state.auxiliary.clone())
        };

        tracing::info!(task_id = %self.id, "Task started");
        let task = self.clone();
        tokio::spawn(async move {
            task.execute(run, process, options, auxiliary, on_done).await;
        });
        true
    }

    async fn execute(
        self: Arc<Self>,
        run: u64,
        process: Arc<Process>,
        options: Vec<TaskOption>,
        auxiliary: AuxiliaryFiles,
        on_done: OnDone,
    ) {
        let outcome = match self.run_engine(run, process, options, auxiliary).await {
            Ok(0) => self.complete(run).await,
            Ok(code) => TaskStatus::failed(exit_code_message(code)),
            Err(err) => TaskStatus::failed(err.to_string()),
        };

        self.finish(run, outcome).await;
        on_done();
    }

    async fn complete(self: &Arc<Self>, run: u64) -> TaskStatus {
        // Canceled or restarted while the engine was exiting.
        if !self.is_current_run(run).await {
            return TaskStatus::new(StatusCode::Completed);
        }
        match self.post_process(run).await {
            Ok(()) => TaskStatus::new(StatusCode::Completed),
            Err(err) => TaskStatus::failed(err.to_string()),
        }
    }

    async fn run_engine(
        self: &Arc<Self>,
        run: u64,
        process: Arc<Process>,
        options: Vec<TaskOption>,
        auxiliary: AuxiliaryFiles,
    ) -> Result<i32> {
        let config = &self.ctx.config;
        let data_dir = tokio::fs::canonicalize(&config.data_dir).await?;
        let gcp_dir = data_dir.join(&self.id).join("gcp");

        let invocation = Invocation {
            options,
            project_path: data_dir.clone(),
            gcp: auxiliary.gcp.map(|name| gcp_dir.join(name)),
            geo: auxiliary.geo.map(|name| gcp_dir.join(name)),
            image_groups: auxiliary.image_groups.map(|name| gcp_dir.join(name)),
            task_id: self.id.clone(),
        };
        let command = ProcessCommand::new(&config.engine_path)
            .args(invocation.args())
            .env("ODM_NONINTERACTIVE", "1");

        tracing::info!(task_id = %self.id, command = %command.command_line(), "Running engine");
        self.run_logged(run, process, &command).await
    }

    /// Runs `command`, appending its output to this run's log.
    async fn run_logged(
        self: &Arc<Self>,
        run: u64,
        process: Arc<Process>,
        command: &ProcessCommand,
    ) -> Result<i32> {
        let (lines, sink) = self.output_sink(run);
        let result = process.run(command, lines).await;
        let _ = sink.await;
        result
    }

    fn output_sink(self: &Arc<Self>, run: u64) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let task = self.clone();
        let sink = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let mut state = task.state.lock().await;
                if state.run == run {
                    state.output.push(line);
                }
            }
        });
        (tx, sink)
    }

    async fn is_current_run(&self, run: u64) -> bool {
        let state = self.state.lock().await;
        state.run == run && state.is_processing()
    }

    /// Registers a fresh process handle for `run` so cancel can reach it.
    async fn attach_process(&self, run: u64) -> Option<Arc<Process>> {
        let mut state = self.state.lock().await;
        if state.run != run || !state.is_processing() {
            return None;
        }
        let process = Process::new();
        state.process = Some(process.clone());
        Some(process)
    }

    async fn finish(&self, run: u64, outcome: TaskStatus) {
        let mut state = self.state.lock().await;
        if state.run != run {
            return;
        }
        state.process = None;
        if state.status.code != StatusCode::Running {
            return;
        }
        if let Some(started) = state.date_started {
            state.processing_time = now_millis() - started;
        }
        match &outcome.error_message {
            Some(message) => {
                tracing::warn!(task_id = %self.id, error = %message, "Task failed");
            }
            None => tracing::info!(task_id = %self.id, "Task completed"),
        }
        state.status = outcome;
    }

    /// Flips the task to CANCELED and signals its process, if any. The
    /// process is not guaranteed to have exited when this returns.
    pub async fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status.code == StatusCode::Canceled {
            return Err(Error::AlreadyCanceled);
        }

        let was_running = state.is_processing();
        state.status = TaskStatus::new(StatusCode::Canceled);
        if was_running {
            if let Some(started) = state.date_started {
                state.processing_time = now_millis() - started;
            }
            if let Some(process) = &state.process {
                process.kill();
            }
        }

        tracing::info!(task_id = %self.id, "Task canceled");
        Ok(())
    }

    /// Puts a finished, failed or canceled task back in the queue, clearing
    /// its log and progress. New options replace the old ones.
    pub async fn restart(&self, options: Option<Vec<TaskOption>>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.status.code.is_terminal() {
            return Err(Error::CannotRestart);
        }

        state.status = match state.initializing {
            true => TaskStatus::new(StatusCode::Running),
            false => TaskStatus::new(StatusCode::Queued),
        };
        state.date_created = now_millis().max(state.date_created + 1);
        state.date_started = None;
        state.processing_time = 0;
        state.output.clear();
        state.progress = 0.0;
        state.process = None;
        state.run += 1;

        if let Some(options) = options {
            state.options = match state.skip_post_processing {
                true => options,
                false => with_post_processing_defaults(options, self.ctx.schema.as_ref()),
            };
        }

        tracing::info!(task_id = %self.id, "Task restarted");
        Ok(())
    }

    /// Progress reports arrive out of order; only forward movement counts.
    pub async fn update_progress(&self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0);
        let mut state = self.state.lock().await;
        if percent >= state.progress {
            state.progress = percent;
        }
    }

    pub async fn append_output(&self, line: impl Into<String>) {
        self.state.lock().await.output.push(line.into());
    }

    pub async fn summary(&self) -> TaskSummary {
        let state = self.state.lock().await;
        TaskSummary {
            uuid: self.id.clone(),
            name: state.name.clone(),
            date_created: state.date_created,
            processing_time: state.processing_time(),
            status: state.status.clone(),
            options: state.options.clone(),
            images_count: state.images_count,
            progress: state.progress,
        }
    }

    /// Log lines from `line` on; a negative value returns the last `-line`.
    pub async fn output(&self, line: i64) -> Vec<String> {
        let state = self.state.lock().await;
        let skip = if line < 0 {
            state.output.len().saturating_sub(line.unsigned_abs() as usize)
        } else {
            line as usize
        };
        state.output.iter().skip(skip).cloned().collect()
    }

    pub fn asset_path(&self, asset: &str) -> Result<PathBuf> {
        match asset {
            ARCHIVE_NAME => Ok(self.project_path().join(ARCHIVE_NAME)),
            _ => Err(Error::InvalidAsset(asset.to_string())),
        }
    }

    pub async fn serialize(&self) -> SerializedTask {
        let state = self.state.lock().await;
        SerializedTask {
            uuid: self.id.clone(),
            name: state.name.clone(),
            date_created: state.date_created,
            date_started: state.date_started,
            processing_time: state.processing_time(),
            status: state.status.clone(),
            options: state.options.clone(),
            webhook: state.webhook.clone(),
            skip_post_processing: state.skip_post_processing,
            outputs: state.outputs.clone(),
        }
    }

    /// Deletes the project folder. While initializing, the deletion is
    /// deferred until initialization is over.
    pub async fn cleanup(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.initializing {
                state.pending_cleanup = true;
                return Ok(());
            }
        }
        self.remove_storage().await
    }

    async fn remove_storage(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(self.project_path()).await {
            Ok(()) => {
                tracing::info!(task_id = %self.id, "Removed project folder");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delivers the summary (and the engine's image manifest, if present) to
    /// the task's webhook and the node-wide one, in the background.
    pub fn call_webhooks(self: &Arc<Self>) {
        let task = self.clone();
        tokio::spawn(async move { task.notify_webhooks().await });
    }

    pub async fn notify_webhooks(&self) {
        let summary = self.summary().await;
        let mut hooks = vec![];
        if let Some(hook) = self.state.lock().await.webhook.clone() {
            hooks.push(hook);
        }
        if let Some(hook) = self.ctx.config.webhook.as_ref().filter(|hook| !hook.is_empty()) {
            hooks.push(hook.clone());
        }
        if hooks.is_empty() {
            return;
        }

        let mut payload = match serde_json::to_value(&summary) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(task_id = %self.id, error = %err, "Cannot encode webhook payload");
                return;
            }
        };

        let manifest = self.project_path().join(IMAGE_MANIFEST);
        match tokio::fs::read(&manifest).await {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(images) => {
                    if let Some(fields) = payload.as_object_mut() {
                        fields.insert("images".to_string(), images);
                    }
                }
                Err(err) => {
                    tracing::warn!(task_id = %self.id, error = %err, "Unreadable image manifest");
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(task_id = %self.id, error = %err, "Cannot read image manifest");
            }
        }

        let deliveries = hooks
            .iter()
            .map(|hook| self.ctx.notifier.notify(hook, &payload));
        futures::future::join_all(deliveries).await;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auxiliary_files_are_classified_by_name() {
        let names = vec![
            "notes.md".to_string(),
            "GEO.txt".to_string(),
            "image_groups.txt".to_string(),
            "zz_gcp.txt".to_string(),
            "gcp_list.txt".to_string(),
        ];
        assert_eq!(
            classify_auxiliary(&names),
            AuxiliaryFiles {
                gcp: Some("gcp_list.txt".to_string()),
                geo: Some("GEO.txt".to_string()),
                image_groups: Some("image_groups.txt".to_string()),
            }
        );
    }

    #[test]
    fn no_text_files_means_no_auxiliary_inputs() {
        let names = vec!["readme.md".to_string()];
        assert_eq!(classify_auxiliary(&names), AuxiliaryFiles::default());
    }
}
