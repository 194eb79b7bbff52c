use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use bytes::Bytes;

use crate::config::S3Config;
use crate::error::{Error, Result};
use crate::upload::{ObjectStorage, UploadedPart};


fn storage_error<E: std::error::Error>(err: E) -> Error {
    Error::Storage(DisplayErrorContext(err).to_string())
}


/// S3-compatible object storage.
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    acl: Option<ObjectCannedAcl>,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Result<Self> {
        let (Some(endpoint), Some(access_key), Some(secret_key)) =
            (&config.endpoint, &config.access_key, &config.secret_key)
        else {
            return Err(Error::Config("incomplete S3 configuration".to_string()));
        };

        if config.signature_version != "4" {
            tracing::warn!(
                signature_version = %config.signature_version,
                "Only S3 signature version 4 is supported, ignoring"
            );
        }

        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.clone()
        } else {
            format!("https://{}", endpoint)
        };

        let credentials = Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "nodeodm",
        );
        let conf = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .build();

        let acl = match config.acl.as_str() {
            "" | "none" => None,
            acl => Some(ObjectCannedAcl::from(acl)),
        };

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(conf),
            acl,
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_acl(self.acl.clone())
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String> {
        let output = self.client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_acl(self.acl.clone())
            .send()
            .await
            .map_err(storage_error)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Storage(format!("No upload id returned for {}", key)))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        number: i32,
        body: Bytes,
    ) -> Result<String> {
        let output = self.client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(storage_error)?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| Error::Storage(format!("No ETag returned for part {} of {}", number, key)))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<()> {
        let parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(part.etag)
                    .part_number(part.number)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}
