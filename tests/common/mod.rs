#![allow(dead_code)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nodeodm::task::OnDone;
use nodeodm::upload::ResultUploader;
use nodeodm::{Config, CreateTask, Task, TaskContext, TaskOption};
use tokio::sync::oneshot;


/// Stand-in for the photogrammetry engine. Options drive its behaviour:
/// `--sleep <s>` and `--exit-code <n>`. Called with a single folder argument
/// it acts as the post-processing script and fails if `fail_post` exists.
const ENGINE: &str = r#"#!/bin/sh
if [ $# -eq 1 ] && [ -d "$1" ]; then
  echo "post-processing $1"
  if [ -f "$1/fail_post" ]; then exit 2; fi
  exit 0
fi

sleep_for=0
exit_code=0
project=""
task=""
echo "args: $*"
while [ $# -gt 0 ]; do
  case "$1" in
    --sleep) sleep_for="$2"; shift ;;
    --exit-code) exit_code="$2"; shift ;;
    --project-path) project="$2"; shift ;;
    --*) ;;
    *) task="$1" ;;
  esac
  shift
done

echo "engine started"
printf '\033[32mcolored line\033[0m\n'
echo "warning on stderr" 1>&2
mkdir -p "$project/$task/odm_dem"
echo "dsm" > "$project/$task/odm_dem/dsm.tif"
echo '[{"filename": "img0.jpg"}]' > "$project/$task/images.json"
sleep "$sleep_for"
exit "$exit_code"
"#;


pub fn engine_script() -> &'static Path {
    static SCRIPT: OnceLock<PathBuf> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        let path = std::env::temp_dir().join(format!("nodeodm-engine-{}.sh", std::process::id()));
        std::fs::write(&path, ENGINE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    })
}


pub fn test_config(root: &Path) -> Config {
    Config {
        data_dir: root.join("data"),
        tmp_dir: root.join("tmp"),
        engine_path: engine_script().to_path_buf(),
        webhook_retry_delay: 0,
        ..Config::default()
    }
}


pub struct Harness {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<TaskContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::create_dir_all(&config.tmp_dir).unwrap();
        let ctx = Arc::new(TaskContext::new(config, ResultUploader::disabled()));
        Self { dir, ctx }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.ctx.config.data_dir.clone()
    }

    pub fn project(&self, id: &str) -> PathBuf {
        self.ctx.config.project_path(id)
    }

    /// Creates `<data>/<id>/images` holding `images` empty pictures.
    pub fn create_project(&self, id: &str, images: usize) -> PathBuf {
        let project = self.project(id);
        std::fs::create_dir_all(project.join("images")).unwrap();
        for n in 0..images {
            std::fs::write(project.join("images").join(format!("img{}.jpg", n)), b"jpg").unwrap();
        }
        project
    }

    pub fn task(&self, id: &str, options: Vec<TaskOption>) -> Arc<Task> {
        let params = CreateTask {
            options,
            ..CreateTask::default()
        };
        Task::new(id, params, self.ctx.clone())
    }

    /// A project plus an initialized task for it.
    pub async fn ready_task(&self, options: Vec<TaskOption>) -> Arc<Task> {
        let id = new_id();
        self.create_project(&id, 2);
        let task = self.task(&id, options);
        task.initialize().await.unwrap();
        task
    }
}


pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}


pub fn sleep_option(seconds: u64) -> TaskOption {
    TaskOption::new("sleep", seconds)
}


pub fn done_signal() -> (OnDone, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let on_done: OnDone = Box::new(move || {
        let _ = tx.send(());
    });
    (on_done, rx)
}


/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}


pub const WAIT: Duration = Duration::from_secs(20);
