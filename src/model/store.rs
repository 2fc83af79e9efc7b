use aws_sdk_s3::{
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
};
use bytes::Bytes;
use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};

use crate::{error::StoreError, util, util::stream::DataStream};

/// S3 caps a single `DeleteObjects` request at this many keys.
pub const MAX_DELETE_KEYS: usize = 1000;

const FORCE_DELETE_HEADER: &str = "x-minio-force-delete";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOptions {
    pub force: bool,
}

pub type StoreFuture<T> = BoxFuture<'static, Result<T, StoreError>>;

/// Bucket-scoped operations an object store must provide.
///
/// Every future is `'static` so a datasource can hold the client behind a
/// trait object and issue requests concurrently.
pub trait ObjectStoreClient: Send + Sync {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StoreFuture<()>;

    fn get_object(&self, bucket: &str, key: &str) -> StoreFuture<DataStream>;

    /// Reads bytes `start..=end` of an object.
    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> StoreFuture<DataStream>;

    fn stat_object(&self, bucket: &str, key: &str) -> StoreFuture<ObjectStat>;

    /// Lazily pages through every key under `prefix`. Without `recursive`
    /// the listing stops at the first `/` after the prefix.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> BoxStream<'static, Result<ObjectEntry, StoreError>>;

    fn remove_object(&self, bucket: &str, key: &str, options: DeleteOptions) -> StoreFuture<()>;

    fn remove_objects(&self, bucket: &str, keys: Vec<String>) -> StoreFuture<()>;
}

fn transport<E, R>(context: &str, key: &str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    StoreError::Transport(format!(
        "failed to {}: {}, {}",
        context,
        key,
        DisplayErrorContext(&err)
    ))
}

impl ObjectStoreClient for aws_sdk_s3::Client {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StoreFuture<()> {
        let key = key.to_string();
        let req = self
            .put_object()
            .bucket(bucket)
            .key(&key)
            .content_length(body.len() as i64)
            .set_content_type(content_type.map(str::to_string))
            .body(ByteStream::from(body));

        Box::pin(async move {
            req.send()
                .await
                .map_err(|err| transport("put_object", &key, err))?;

            Ok(())
        })
    }

    fn get_object(&self, bucket: &str, key: &str) -> StoreFuture<DataStream> {
        let key = key.to_string();
        let req = self.get_object().bucket(bucket).key(&key);

        Box::pin(async move {
            match req.send().await {
                Ok(o) => Ok(util::stream::from_byte_stream(o.body)),
                Err(err) => {
                    if let Some(svc_err) = err.as_service_error() {
                        if svc_err.is_no_such_key() {
                            return Err(StoreError::NotFound(key));
                        }
                    }

                    Err(transport("get_object", &key, err))
                }
            }
        })
    }

    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> StoreFuture<DataStream> {
        let key = key.to_string();
        let req = self
            .get_object()
            .bucket(bucket)
            .key(&key)
            .range(format!("bytes={}-{}", start, end));

        Box::pin(async move {
            match req.send().await {
                Ok(o) => Ok(util::stream::from_byte_stream(o.body)),
                Err(err) => {
                    if let Some(svc_err) = err.as_service_error() {
                        if svc_err.is_no_such_key() {
                            return Err(StoreError::NotFound(key));
                        }
                    }

                    if err.raw_response().map(|res| res.status().as_u16()) == Some(416) {
                        return Err(StoreError::InvalidRange { start, end });
                    }

                    Err(transport("get_object", &key, err))
                }
            }
        })
    }

    fn stat_object(&self, bucket: &str, key: &str) -> StoreFuture<ObjectStat> {
        let key = key.to_string();
        let req = self.head_object().bucket(bucket).key(&key);

        Box::pin(async move {
            let ho = match req.send().await {
                Err(err) => {
                    if let Some(svc_err) = err.as_service_error() {
                        if svc_err.is_not_found() {
                            return Err(StoreError::NotFound(key));
                        }
                    }

                    return Err(transport("head_object", &key, err));
                }
                Ok(ho) => ho,
            };

            Ok(ObjectStat {
                size: ho.content_length().unwrap_or(0).max(0) as u64,
                content_type: ho.content_type().map(str::to_string),
            })
        })
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> BoxStream<'static, Result<ObjectEntry, StoreError>> {
        let client = self.clone();
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();

        // `None` is the first page, `Some(None)` means the listing is done.
        let pages = stream::try_unfold(None::<Option<String>>, move |state| {
            let client = client.clone();
            let bucket = bucket.clone();
            let prefix = prefix.clone();

            async move {
                let continuation_token = match state {
                    Some(None) => return Ok(None),
                    Some(Some(tok)) => Some(tok),
                    None => None,
                };

                let mut req = client.list_objects_v2().bucket(&bucket).prefix(&prefix);
                if !recursive {
                    req = req.delimiter("/");
                }
                if let Some(tok) = continuation_token {
                    req = req.continuation_token(tok);
                }

                let lo = req
                    .send()
                    .await
                    .map_err(|err| transport("list_objects", &prefix, err))?;

                let entries: Vec<Result<ObjectEntry, StoreError>> = lo
                    .contents()
                    .iter()
                    .map(|o| {
                        Ok(ObjectEntry {
                            name: o.key().unwrap_or("").to_string(),
                            size: o.size().unwrap_or(0).max(0) as u64,
                        })
                    })
                    .collect();

                let next = lo.next_continuation_token().map(|tok| tok.to_string());

                Ok::<_, StoreError>(Some((stream::iter(entries), Some(next))))
            }
        });

        pages.try_flatten().boxed()
    }

    fn remove_object(&self, bucket: &str, key: &str, options: DeleteOptions) -> StoreFuture<()> {
        let key = key.to_string();
        let req = self.delete_object().bucket(bucket).key(&key);

        Box::pin(async move {
            let res = if options.force {
                req.customize()
                    .mutate_request(|req| {
                        req.headers_mut().insert(FORCE_DELETE_HEADER, "true");
                    })
                    .send()
                    .await
            } else {
                req.send().await
            };

            res.map_err(|err| transport("delete_object", &key, err))?;

            Ok(())
        })
    }

    fn remove_objects(&self, bucket: &str, keys: Vec<String>) -> StoreFuture<()> {
        let client = self.clone();
        let bucket = bucket.to_string();

        Box::pin(async move {
            let mut failed = Vec::new();

            for chunk in keys.chunks(MAX_DELETE_KEYS) {
                let objects = chunk
                    .iter()
                    .map(|key| ObjectIdentifier::builder().key(key).build())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| StoreError::Transport(err.to_string()))?;

                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(true)
                    .build()
                    .map_err(|err| StoreError::Transport(err.to_string()))?;

                let out = client
                    .delete_objects()
                    .bucket(&bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|err| transport("delete_objects", &bucket, err))?;

                for err in out.errors() {
                    failed.push(format!(
                        "{}: {}",
                        err.key().unwrap_or(""),
                        err.message().or(err.code()).unwrap_or("unknown error")
                    ));
                }
            }

            if !failed.is_empty() {
                return Err(StoreError::Transport(format!(
                    "failed to delete {} objects: {}",
                    failed.len(),
                    failed.join(", ")
                )));
            }

            Ok(())
        })
    }
}
