use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};


/// Node configuration. Every field has a default so a partial YAML file
/// (or none at all) is enough to start.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub engine_path: PathBuf,
    pub engine_options: Option<Vec<String>>,
    pub parallel_queue_processing: usize,
    /// Minutes after completion before a finished task is evicted; 0 disables.
    pub cleanup_tasks_after: u64,
    /// Minutes before an uncommitted upload folder is removed; 0 disables.
    pub cleanup_uploads_after: u64,
    /// Minutes a task may run before it is cancelled.
    pub max_runtime: Option<u64>,
    pub max_images: usize,
    pub webhook: Option<String>,
    pub webhook_retry_delay: u64,
    pub post_processing_script: Option<PathBuf>,
    pub progress_port: u16,
    pub s3: S3Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            data_dir: PathBuf::from("data"),
            tmp_dir: PathBuf::from("tmp"),
            engine_path: PathBuf::from("/code/run.sh"),
            engine_options: None,
            parallel_queue_processing: 2,
            cleanup_tasks_after: 2880,
            cleanup_uploads_after: 2880,
            max_runtime: None,
            max_images: 0,
            webhook: None,
            webhook_retry_delay: 5,
            post_processing_script: None,
            progress_port: 6367,
            s3: S3Config::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel_queue_processing == 0 {
            return Err(Error::Config(
                "parallelQueueProcessing must be at least 1".to_string(),
            ));
        }
        if self.s3.is_partial() {
            return Err(Error::Config(
                "s3 requires endpoint, bucket, accessKey and secretKey".to_string(),
            ));
        }
        Ok(())
    }

    pub fn project_path(&self, task_id: &str) -> PathBuf {
        self.data_dir.join(task_id)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn webhook_retry_delay(&self) -> Duration {
        Duration::from_secs(self.webhook_retry_delay)
    }
}


#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    pub signature_version: String,
    pub force_path_style: bool,
    /// Canned ACL applied to uploaded objects; "none" sends no ACL.
    pub acl: String,
    /// Upload every selected result path, not just the archive.
    pub upload_everything: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: None,
            access_key: None,
            secret_key: None,
            region: "us-east-1".to_string(),
            signature_version: "4".to_string(),
            force_path_style: false,
            acl: "public-read".to_string(),
            upload_everything: false,
        }
    }
}

impl S3Config {
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
            && self.bucket.is_some()
            && self.access_key.is_some()
            && self.secret_key.is_some()
    }

    fn is_partial(&self) -> bool {
        let set = [
            self.endpoint.is_some(),
            self.bucket.is_some(),
            self.access_key.is_some(),
            self.secret_key.is_some(),
        ];
        set.iter().any(|s| *s) && !set.iter().all(|s| *s)
    }
}
