use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Client for the S3-compatible logo bucket. Store bytes under a key,
/// get back a durable public URL.
pub struct LogoStorage {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl LogoStorage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let public_base_url = if public_base_url.is_empty() {
            format!("{}/{}", endpoint.trim_end_matches('/'), bucket_name)
        } else {
            public_base_url.trim_end_matches('/').to_string()
        };

        Ok(Self {
            bucket,
            public_base_url,
        })
    }

    /// Upload logo bytes and return the durable URL they are served under.
    pub async fn upload_logo(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(StorageError::S3)?;
        Ok(format!("{}/{}", self.public_base_url, key))
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.delete_object(key).await.map_err(StorageError::S3)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
