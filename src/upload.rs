use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::archive::relative_name;
use crate::config::S3Config;
use crate::error::{Error, Result};

mod s3;

pub use s3::S3Storage;


#[derive(Clone, Debug, PartialEq)]
pub struct UploadedPart {
    pub number: i32,
    pub etag: String,
}


/// Minimal object-store surface the uploader needs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        number: i32,
        body: Bytes,
    ) -> Result<String>;

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}


#[derive(Clone, Debug)]
pub struct UploadSettings {
    /// Files transferred at the same time.
    pub parallel_uploads: usize,
    pub max_retries: u32,
    pub min_part_size: u64,
    pub part_size: u64,
    /// Parts of a single file transferred at the same time.
    pub part_concurrency: usize,
    /// Base of the exponential retry backoff.
    pub retry_delay: Duration,
    /// Overrides the system's available memory when planning transfers.
    pub memory_limit: Option<u64>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            parallel_uploads: 4,
            max_retries: 6,
            min_part_size: 5 * 1024 * 1024,
            part_size: 100 * 1024 * 1024,
            part_concurrency: 10,
            retry_delay: Duration::from_secs(1),
            memory_limit: None,
        }
    }
}


/// Picks a part size and per-file part concurrency so that every in-flight
/// part of every parallel file fits in `available` bytes. Concurrency is
/// reduced first, then part size down to the floor.
pub fn plan_transfer(available: u64, settings: &UploadSettings) -> (u64, usize) {
    let files = settings.parallel_uploads.max(1) as u64;
    let mut part_size = settings.part_size.max(settings.min_part_size);
    let mut concurrency = settings.part_concurrency.max(1);
    let required = |part_size: u64, concurrency: usize| {
        part_size.saturating_mul(concurrency as u64).saturating_mul(files)
    };

    while required(part_size, concurrency) > available && concurrency > 1 {
        concurrency -= 1;
    }
    while required(part_size, concurrency) > available && part_size > settings.min_part_size {
        part_size = (part_size * 4 / 5).max(settings.min_part_size);
    }

    (part_size, concurrency)
}


fn available_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.available_memory()
}


#[derive(Clone, Debug, PartialEq)]
pub struct UploadJob {
    pub source: PathBuf,
    pub destination: String,
    pub retries: u32,
}


/// Expands `paths` (relative to `root`) into one job per file. Directories
/// contribute every file below them; missing entries are skipped.
pub fn collect_jobs(root: &Path, prefix: &str, paths: &[String]) -> Vec<UploadJob> {
    let prefix = prefix.trim_end_matches('/');
    let key = |relative: &Path| {
        let name = relative_name(relative);
        if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        }
    };

    let mut jobs = Vec::new();
    for path in paths {
        let full = root.join(path);
        if full.is_dir() {
            for entry in WalkDir::new(&full).sort_by_file_name().into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(root) {
                    jobs.push(UploadJob {
                        source: entry.path().to_path_buf(),
                        destination: key(relative),
                        retries: 0,
                    });
                }
            }
        } else if full.is_file() {
            jobs.push(UploadJob {
                destination: key(Path::new(path)),
                source: full,
                retries: 0,
            });
        }
    }
    jobs
}


/// Publishes task results to an object-storage bucket.
pub struct ResultUploader {
    storage: Option<Arc<dyn ObjectStorage>>,
    bucket: String,
    settings: UploadSettings,
}

impl ResultUploader {
    pub fn disabled() -> Self {
        Self {
            storage: None,
            bucket: String::new(),
            settings: UploadSettings::default(),
        }
    }

    /// Builds an uploader for the configured S3 endpoint, or a disabled one
    /// when S3 is not configured.
    pub async fn from_config(config: &S3Config) -> Result<Self> {
        let bucket = match (&config.bucket, config.is_configured()) {
            (Some(bucket), true) => bucket.clone(),
            _ => return Ok(Self::disabled()),
        };
        let storage = S3Storage::new(config)?;
        Self::connect(Arc::new(storage), bucket, UploadSettings::default()).await
    }

    /// Probes the bucket with an empty object; the uploader is only enabled
    /// once that write succeeds.
    pub async fn connect(
        storage: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
        settings: UploadSettings,
    ) -> Result<Self> {
        let bucket = bucket.into();
        storage
            .put_object(&bucket, "test.txt", Bytes::new())
            .await
            .map_err(|err| {
                Error::Storage(format!(
                    "Cannot connect to S3. Check your S3 configuration: {}",
                    err
                ))
            })?;
        tracing::info!(bucket = %bucket, "Connected to S3");

        Ok(Self {
            storage: Some(storage),
            bucket,
            settings,
        })
    }

    pub fn enabled(&self) -> bool {
        self.storage.is_some()
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Uploads every file under `paths` to `bucket` below `prefix`. Returns
    /// once all files are stored, or with the first file that ran out of
    /// retries; the remaining transfers are abandoned in that case.
    pub async fn upload_paths(
        &self,
        source_root: &Path,
        bucket: &str,
        prefix: &str,
        paths: &[String],
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> Result<()> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| Error::Storage("S3 is not initialized".to_string()))?;

        let jobs = {
            let root = source_root.to_path_buf();
            let prefix = prefix.to_string();
            let paths = paths.to_vec();
            tokio::task::spawn_blocking(move || collect_jobs(&root, &prefix, &paths)).await?
        };
        on_output(format!("Uploading {} files to S3...", jobs.len()));

        let available = match self.settings.memory_limit {
            Some(limit) => limit,
            None => available_memory(),
        };
        let (part_size, concurrency) = plan_transfer(available, &self.settings);
        tracing::debug!(part_size, concurrency, available, "Planned S3 transfer");

        let transfer = Transfer {
            storage,
            bucket,
            part_size,
            concurrency: AtomicUsize::new(concurrency),
            reported: Mutex::new(HashMap::new()),
            settings: &self.settings,
            on_output,
        };

        stream::iter(jobs.into_iter().map(Ok))
            .try_for_each_concurrent(self.settings.parallel_uploads.max(1), |job| {
                transfer.upload_with_retries(job)
            })
            .await
    }
}


struct Transfer<'a> {
    storage: &'a Arc<dyn ObjectStorage>,
    bucket: &'a str,
    part_size: u64,
    concurrency: AtomicUsize,
    reported: Mutex<HashMap<String, u64>>,
    settings: &'a UploadSettings,
    on_output: &'a (dyn Fn(String) + Send + Sync),
}

impl Transfer<'_> {
    async fn upload_with_retries(&self, mut job: UploadJob) -> Result<()> {
        loop {
            tracing::debug!(source = %job.source.display(), key = %job.destination, "Uploading");
            let err = match self.upload_file(&job).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let message = format!("Cannot upload file to S3: {}, retrying... {}", err, job.retries);
            tracing::debug!(key = %job.destination, error = %err, "Upload attempt failed");
            (self.on_output)(message.clone());

            if job.retries >= self.settings.max_retries {
                return Err(Error::Upload(message));
            }
            job.retries += 1;
            self.reduce_concurrency();
            tokio::time::sleep(self.settings.retry_delay * 2u32.pow(job.retries)).await;
        }
    }

    fn reduce_concurrency(&self) {
        let _ = self.concurrency.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some((current * 2 / 3).max(1))
        });
    }

    async fn upload_file(&self, job: &UploadJob) -> Result<()> {
        let size = tokio::fs::metadata(&job.source).await?.len();

        if size <= self.part_size {
            let body = tokio::fs::read(&job.source).await?;
            self.storage
                .put_object(self.bucket, &job.destination, Bytes::from(body))
                .await?;
            self.report(&job.destination, size, size).await;
            return Ok(());
        }

        let upload_id = self
            .storage
            .create_multipart(self.bucket, &job.destination)
            .await?;

        let mut pending = PendingUpload {
            storage: self.storage.clone(),
            bucket: self.bucket.to_string(),
            key: job.destination.clone(),
            upload_id: upload_id.clone(),
            settled: false,
        };

        let result = match self.upload_parts(job, &upload_id, size).await {
            Ok(parts) => {
                self.storage
                    .complete_multipart(self.bucket, &job.destination, &upload_id, parts)
                    .await
            }
            Err(err) => {
                if let Err(abort) = self
                    .storage
                    .abort_multipart(self.bucket, &job.destination, &upload_id)
                    .await
                {
                    tracing::debug!(key = %job.destination, error = %abort, "Abort failed");
                }
                Err(err)
            }
        };
        pending.settled = true;
        result
    }

    async fn upload_parts(
        &self,
        job: &UploadJob,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<UploadedPart>> {
        let part_size = self.part_size;
        let count = size.div_ceil(part_size);
        let concurrency = self.concurrency.load(Ordering::SeqCst).max(1);
        let loaded = AtomicU64::new(0);
        let loaded = &loaded;

        let mut parts: Vec<UploadedPart> = stream::iter(0..count)
            .map(|index| async move {
                let offset = index * part_size;
                let len = part_size.min(size - offset);
                let body = read_chunk(&job.source, offset, len).await?;
                let number = (index + 1) as i32;
                let etag = self
                    .storage
                    .upload_part(self.bucket, &job.destination, upload_id, number, body)
                    .await?;
                let done = loaded.fetch_add(len, Ordering::SeqCst) + len;
                self.report(&job.destination, done, size).await;
                Ok::<_, Error>(UploadedPart { number, etag })
            })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        parts.sort_by_key(|part| part.number);
        Ok(parts)
    }

    /// Emits progress in 5% steps, never repeating or going back on a
    /// percentage already reported for the same key.
    async fn report(&self, key: &str, done: u64, total: u64) {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        let step = percent / 5 * 5;

        let mut reported = self.reported.lock().await;
        let fresh = reported.get(key).map_or(true, |last| step > *last);
        if fresh {
            reported.insert(key.to_string(), step);
            (self.on_output)(format!("Uploading {}... {}%", key, step));
        }
    }
}


/// Multipart upload that has neither completed nor been aborted. Dropping
/// it unsettled, as happens when a sibling transfer fails the batch, aborts
/// the upload in the background.
struct PendingUpload {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    key: String,
    upload_id: String,
    settled: bool,
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let storage = self.storage.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        runtime.spawn(async move {
            if let Err(err) = storage.abort_multipart(&bucket, &key, &upload_id).await {
                tracing::debug!(key = %key, error = %err, "Abort of abandoned upload failed");
            }
        });
    }
}


async fn read_chunk(path: &Path, offset: u64, len: u64) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
