use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    config::S3DatasourceConfig,
    datasources::Datasource,
    error::{DatasourceError, Result, StoreError},
    model::store::{DeleteOptions, ObjectStoreClient},
    util::stream::DataStream,
};

const CREDENTIALS_PROVIDER: &str = "objectds";

/// Datasource backed by one bucket of an S3-compatible object store.
///
/// The datasource owns a single client for its whole lifetime and keeps no
/// other state; dropping it releases the client.
pub struct S3Datasource {
    client: Box<dyn ObjectStoreClient>,
    config: S3DatasourceConfig,
}

impl S3Datasource {
    pub fn new(client: Box<dyn ObjectStoreClient>, config: S3DatasourceConfig) -> Self {
        Self { client, config }
    }

    /// Builds an `aws_sdk_s3::Client` from `config`. No request is made
    /// until the first operation.
    pub async fn connect(config: S3DatasourceConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(DatasourceError::Config("bucket must not be empty".to_string()));
        }
        if config.endpoint.is_empty() {
            return Err(DatasourceError::Config("endpoint must not be empty".to_string()));
        }

        let client = build_client(&config).await;

        info!(
            endpoint = %config.endpoint_url(),
            bucket = %config.bucket,
            region = %config.region,
            path_style = config.force_s3_path,
            "connected"
        );

        Ok(Self::new(Box::new(client), config))
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn list_keys(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.client
            .list_objects(&self.config.bucket, "", true)
            .map_ok(|entry| entry.name)
            .try_collect()
            .await
    }

    /// Repeats enumerate-then-delete until a listing comes back empty.
    ///
    /// Fails when the bucket still holds objects after `max_rounds`.
    pub async fn clear_until_empty(&self, max_rounds: usize) -> Result<()> {
        for round in 1..=max_rounds {
            let keys = self
                .list_keys()
                .await
                .map_err(|err| DatasourceError::Clear(err.to_string()))?;

            if keys.is_empty() {
                debug!(round = round, "bucket empty");
                return Ok(());
            }

            info!(round = round, count = keys.len(), "clearing");
            self.client
                .remove_objects(&self.config.bucket, keys)
                .await
                .map_err(|err| DatasourceError::Clear(err.to_string()))?;
        }

        let left = self
            .list_keys()
            .await
            .map_err(|err| DatasourceError::Clear(err.to_string()))?
            .len();

        if left == 0 {
            return Ok(());
        }

        warn!(rounds = max_rounds, left = left, "bucket not empty");
        Err(DatasourceError::Clear(format!(
            "{} objects left after {} rounds",
            left, max_rounds
        )))
    }
}

pub(crate) async fn build_client(config: &S3DatasourceConfig) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        None,
        None,
        CREDENTIALS_PROVIDER,
    );

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .credentials_provider(credentials)
        .endpoint_url(config.endpoint_url())
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(config.force_s3_path)
        .build();

    aws_sdk_s3::Client::from_conf(s3_config)
}

fn log_read_failure(err: &StoreError, group: &str, key: &str) {
    if err.is_not_found() {
        debug!(key = key, error_group = group, "not found");
    } else {
        error!(key = key, error_message = %err, error_group = group);
    }
}

#[async_trait]
impl Datasource for S3Datasource {
    fn name(&self) -> &'static str {
        "S3"
    }

    async fn save(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()> {
        debug!(key = key, size = data.len(), "called");

        self.client
            .put_object(&self.config.bucket, key, data, content_type)
            .await
            .map_err(|err| {
                error!(key = key, error_message = %err, error_group = "put_object");
                DatasourceError::Write {
                    key: key.to_string(),
                    message: err.to_string(),
                }
            })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(key = key, "called");

        self.client
            .remove_object(&self.config.bucket, key, DeleteOptions { force: true })
            .await
            .map_err(|err| {
                error!(key = key, error_message = %err, error_group = "delete_object");
                DatasourceError::Delete {
                    key: key.to_string(),
                    message: err.to_string(),
                }
            })
    }

    async fn clear(&self) -> Result<()> {
        let keys = self.list_keys().await.map_err(|err| {
            error!(error_message = %err, error_group = "list_objects");
            DatasourceError::Clear(err.to_string())
        })?;

        if keys.is_empty() {
            return Ok(());
        }

        info!(bucket = %self.config.bucket, count = keys.len(), "clearing");
        self.client
            .remove_objects(&self.config.bucket, keys)
            .await
            .map_err(|err| {
                error!(error_message = %err, error_group = "delete_objects");
                DatasourceError::Clear(err.to_string())
            })
    }

    async fn get(&self, key: &str) -> Option<DataStream> {
        match self.client.get_object(&self.config.bucket, key).await {
            Err(err) => {
                log_read_failure(&err, "get_object", key);
                None
            }
            Ok(stream) => Some(stream),
        }
    }

    async fn size(&self, key: &str) -> Option<u64> {
        match self.client.stat_object(&self.config.bucket, key).await {
            Err(err) => {
                log_read_failure(&err, "head_object", key);
                None
            }
            Ok(stat) => Some(stat.size),
        }
    }

    async fn full_size(&self) -> u64 {
        let res = self
            .client
            .list_objects(&self.config.bucket, "", true)
            .try_fold(0u64, |size, entry| async move {
                Ok::<_, StoreError>(size.saturating_add(entry.size))
            })
            .await;

        match res {
            Err(err) => {
                error!(error_message = %err, error_group = "list_objects");
                0
            }
            Ok(size) => size,
        }
    }

    async fn range(&self, key: &str, start: u64, end: u64) -> Option<DataStream> {
        if start > end {
            debug!(key = key, start = start, end = end, "invalid range");
            return None;
        }

        match self
            .client
            .get_object_range(&self.config.bucket, key, start, end)
            .await
        {
            Err(err) => {
                log_read_failure(&err, "get_object_range", key);
                None
            }
            Ok(stream) => Some(stream),
        }
    }
}
