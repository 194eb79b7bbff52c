use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodeodm::upload::UploadedPart;
use nodeodm::{Error, ObjectStorage, ResultUploader, UploadSettings};


/// Bucket kept in memory. `fail_next` makes that many writes fail.
/// `reject_puts` fails single-shot writes once a multipart upload is open,
/// `stall_parts` makes part uploads hang.
#[derive(Default)]
struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, HashMap<i32, Vec<u8>>>>,
    fail_next: AtomicU32,
    reject_puts: AtomicBool,
    stall_parts: AtomicBool,
    next_upload: AtomicU32,
    aborted: AtomicU32,
}

impl MemoryStorage {
    fn should_fail(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> nodeodm::Result<()> {
        if self.reject_puts.load(Ordering::SeqCst) {
            // Fail only once a multipart upload is in flight alongside.
            while self.uploads.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Err(Error::Storage("access denied".to_string()));
        }
        if self.should_fail() {
            return Err(Error::Storage("connection reset".to_string()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{}/{}", bucket, key), body.to_vec());
        Ok(())
    }

    async fn create_multipart(&self, _bucket: &str, _key: &str) -> nodeodm::Result<String> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(id.clone(), HashMap::new());
        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        number: i32,
        body: Bytes,
    ) -> nodeodm::Result<String> {
        if self.stall_parts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.should_fail() {
            return Err(Error::Storage("part rejected".to_string()));
        }
        let mut uploads = self.uploads.lock().unwrap();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::Storage("unknown upload".to_string()))?;
        parts.insert(number, body.to_vec());
        Ok(format!("etag-{}", number))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> nodeodm::Result<()> {
        let stored = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| Error::Storage("unknown upload".to_string()))?;

        let mut body = vec![];
        for (index, part) in parts.iter().enumerate() {
            assert_eq!(part.number, index as i32 + 1);
            assert_eq!(part.etag, format!("etag-{}", part.number));
            body.extend_from_slice(&stored[&part.number]);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{}/{}", bucket, key), body);
        Ok(())
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> nodeodm::Result<()> {
        self.uploads.lock().unwrap().remove(upload_id);
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}


fn settings() -> UploadSettings {
    UploadSettings {
        min_part_size: 4,
        part_size: 10,
        retry_delay: Duration::from_millis(1),
        memory_limit: Some(u64::MAX),
        ..UploadSettings::default()
    }
}

fn results() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("tiles/1")).unwrap();
    std::fs::write(root.join("all.zip"), b"zip").unwrap();
    std::fs::write(root.join("tiles/1/a.png"), b"a").unwrap();
    std::fs::write(root.join("tiles/b.png"), b"b").unwrap();
    std::fs::write(root.join("big.laz"), (0u8..35).collect::<Vec<u8>>()).unwrap();
    dir
}

async fn uploader(storage: Arc<MemoryStorage>, settings: UploadSettings) -> ResultUploader {
    ResultUploader::connect(storage, "results", settings).await.unwrap()
}


#[tokio::test]
async fn files_and_directories_land_under_the_prefix() {
    let dir = results();
    let storage = Arc::new(MemoryStorage::default());
    let uploader = uploader(storage.clone(), settings()).await;
    assert!(uploader.enabled());
    assert!(storage.object("results/test.txt").is_some());

    let lines = Mutex::new(vec![]);
    let on_output = |line: String| lines.lock().unwrap().push(line);
    let paths = vec!["all.zip".to_string(), "tiles".to_string(), "missing".to_string()];
    uploader
        .upload_paths(dir.path(), "results", "task-1", &paths, &on_output)
        .await
        .unwrap();

    assert_eq!(storage.object("results/task-1/all.zip").unwrap(), b"zip");
    assert_eq!(storage.object("results/task-1/tiles/1/a.png").unwrap(), b"a");
    assert_eq!(storage.object("results/task-1/tiles/b.png").unwrap(), b"b");

    let lines = lines.into_inner().unwrap();
    assert_eq!(lines[0], "Uploading 3 files to S3...");
    assert!(lines.contains(&"Uploading task-1/all.zip... 100%".to_string()));
}

#[tokio::test]
async fn large_files_are_sent_in_parts() {
    let dir = results();
    let storage = Arc::new(MemoryStorage::default());
    let uploader = uploader(storage.clone(), settings()).await;

    let lines = Mutex::new(vec![]);
    let on_output = |line: String| lines.lock().unwrap().push(line);
    uploader
        .upload_paths(dir.path(), "results", "task-2", &["big.laz".to_string()], &on_output)
        .await
        .unwrap();

    let expected: Vec<u8> = (0u8..35).collect();
    assert_eq!(storage.object("results/task-2/big.laz").unwrap(), expected);
    assert_eq!(storage.next_upload.load(Ordering::SeqCst), 1);

    let progress: Vec<String> = lines
        .into_inner()
        .unwrap()
        .into_iter()
        .filter(|line| line.starts_with("Uploading task-2/big.laz..."))
        .collect();
    let mut unique = progress.clone();
    unique.dedup();
    assert_eq!(progress, unique);
    assert_eq!(progress.last().unwrap(), "Uploading task-2/big.laz... 100%");
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let dir = results();
    let storage = Arc::new(MemoryStorage::default());
    let uploader = uploader(storage.clone(), settings()).await;
    storage.fail_next.store(2, Ordering::SeqCst);

    let lines = Mutex::new(vec![]);
    let on_output = |line: String| lines.lock().unwrap().push(line);
    uploader
        .upload_paths(dir.path(), "results", "task-3", &["all.zip".to_string()], &on_output)
        .await
        .unwrap();

    assert_eq!(storage.object("results/task-3/all.zip").unwrap(), b"zip");
    let retries: Vec<String> = lines
        .into_inner()
        .unwrap()
        .into_iter()
        .filter(|line| line.contains("retrying"))
        .collect();
    assert_eq!(
        retries,
        vec![
            "Cannot upload file to S3: connection reset, retrying... 0",
            "Cannot upload file to S3: connection reset, retrying... 1",
        ]
    );
}

#[tokio::test]
async fn exhausted_retries_fail_the_batch() {
    let dir = results();
    let storage = Arc::new(MemoryStorage::default());
    let settings = UploadSettings {
        max_retries: 2,
        ..settings()
    };
    let uploader = uploader(storage.clone(), settings).await;
    storage.fail_next.store(1000, Ordering::SeqCst);

    let on_output = |_line: String| {};
    let result = uploader
        .upload_paths(dir.path(), "results", "task-4", &["big.laz".to_string()], &on_output)
        .await;

    assert!(matches!(result, Err(Error::Upload(_))));
    assert!(storage.object("results/task-4/big.laz").is_none());
    assert_eq!(storage.aborted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn abandoned_multipart_uploads_are_aborted() {
    let dir = results();
    let storage = Arc::new(MemoryStorage::default());
    let settings = UploadSettings {
        max_retries: 0,
        ..settings()
    };
    let uploader = uploader(storage.clone(), settings).await;
    storage.reject_puts.store(true, Ordering::SeqCst);
    storage.stall_parts.store(true, Ordering::SeqCst);

    let on_output = |_line: String| {};
    let paths = vec!["big.laz".to_string(), "all.zip".to_string()];
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        uploader.upload_paths(dir.path(), "results", "task-6", &paths, &on_output),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::Upload(_))));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while storage.aborted.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(storage.aborted.load(Ordering::SeqCst), 1);
    assert!(storage.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_bucket_is_reported() {
    let storage = Arc::new(MemoryStorage::default());
    storage.fail_next.store(1, Ordering::SeqCst);

    let result = ResultUploader::connect(storage, "results", settings()).await;
    match result {
        Err(Error::Storage(message)) => assert!(message.starts_with("Cannot connect to S3")),
        other => panic!("unexpected result {:?}", other.map(|u| u.enabled())),
    }
}

#[tokio::test]
async fn disabled_uploader_refuses_work() {
    let dir = results();
    let uploader = ResultUploader::disabled();
    assert!(!uploader.enabled());

    let on_output = |_line: String| {};
    let result = uploader
        .upload_paths(dir.path(), "results", "task-5", &["all.zip".to_string()], &on_output)
        .await;
    assert!(result.is_err());
}
