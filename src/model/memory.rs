use std::{
    collections::BTreeMap,
    future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::{
    error::StoreError,
    model::store::{DeleteOptions, ObjectEntry, ObjectStat, ObjectStoreClient, StoreFuture},
    util,
    util::stream::DataStream,
};

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
}

type Buckets = BTreeMap<String, BTreeMap<String, StoredObject>>;

/// Object store held in process memory.
///
/// Buckets spring into existence on first write. `fail_requests(true)` makes
/// every call fail with a transport error until switched back off.
#[derive(Clone, Default)]
pub struct InMemoryClient {
    buckets: Arc<Mutex<Buckets>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_requests(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self, bucket: &str) -> usize {
        self.buckets
            .lock()
            .map(|buckets| buckets.get(bucket).map(|b| b.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }

    fn check(&self, op: &str) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Transport(format!("{} refused: connection reset", op)));
        }

        Ok(())
    }

    fn with_buckets<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Buckets) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.check(op)?;

        let mut buckets = self
            .buckets
            .lock()
            .map_err(|err| StoreError::Transport(format!("failed to acquire guard: {}", err)))?;

        f(&mut buckets)
    }

    fn read(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        self.with_buckets("get_object", |buckets| {
            buckets
                .get(bucket)
                .and_then(|b| b.get(key))
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))
        })
    }
}

impl ObjectStoreClient for InMemoryClient {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> StoreFuture<()> {
        let res = self.with_buckets("put_object", |buckets| {
            buckets.entry(bucket.to_string()).or_default().insert(
                key.to_string(),
                StoredObject {
                    data: body,
                    content_type: content_type.map(str::to_string),
                },
            );
            Ok(())
        });

        Box::pin(future::ready(res))
    }

    fn get_object(&self, bucket: &str, key: &str) -> StoreFuture<DataStream> {
        let res = self
            .read(bucket, key)
            .map(|o| util::stream::from_bytes(o.data));

        Box::pin(future::ready(res))
    }

    fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> StoreFuture<DataStream> {
        let res = self.read(bucket, key).and_then(|o| {
            let len = o.data.len() as u64;
            if start > end || start >= len {
                return Err(StoreError::InvalidRange { start, end });
            }

            let end = end.min(len - 1);
            Ok(util::stream::from_bytes(
                o.data.slice(start as usize..=end as usize),
            ))
        });

        Box::pin(future::ready(res))
    }

    fn stat_object(&self, bucket: &str, key: &str) -> StoreFuture<ObjectStat> {
        let res = self.read(bucket, key).map(|o| ObjectStat {
            size: o.data.len() as u64,
            content_type: o.content_type,
        });

        Box::pin(future::ready(res))
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> BoxStream<'static, Result<ObjectEntry, StoreError>> {
        let res = self.with_buckets("list_objects", |buckets| {
            let Some(objects) = buckets.get(bucket) else {
                return Ok(Vec::new());
            };

            Ok(objects
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .filter(|(name, _)| recursive || !name[prefix.len()..].contains('/'))
                .map(|(name, o)| ObjectEntry {
                    name: name.clone(),
                    size: o.data.len() as u64,
                })
                .collect::<Vec<_>>())
        });

        match res {
            Ok(entries) => stream::iter(entries.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(future::ready(Err(err))).boxed(),
        }
    }

    fn remove_object(&self, bucket: &str, key: &str, _options: DeleteOptions) -> StoreFuture<()> {
        let res = self.with_buckets("delete_object", |buckets| {
            if let Some(objects) = buckets.get_mut(bucket) {
                objects.remove(key);
            }
            Ok(())
        });

        Box::pin(future::ready(res))
    }

    fn remove_objects(&self, bucket: &str, keys: Vec<String>) -> StoreFuture<()> {
        let res = self.with_buckets("delete_objects", |buckets| {
            if let Some(objects) = buckets.get_mut(bucket) {
                for key in &keys {
                    objects.remove(key);
                }
            }
            Ok(())
        });

        Box::pin(future::ready(res))
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn test_list_objects() {
        let client = InMemoryClient::new();
        for key in ["a.txt", "dir/b.txt", "dir/sub/c.txt", "other/d.txt"] {
            client
                .put_object("bucket", key, Bytes::from_static(b"abc"), None)
                .await
                .unwrap();
        }

        let cases = vec![
            ("", true, vec!["a.txt", "dir/b.txt", "dir/sub/c.txt", "other/d.txt"]),
            ("", false, vec!["a.txt"]),
            ("dir/", true, vec!["dir/b.txt", "dir/sub/c.txt"]),
            ("dir/", false, vec!["dir/b.txt"]),
            ("missing/", true, vec![]),
        ];

        for (prefix, recursive, expected) in cases {
            let names: Vec<String> = client
                .list_objects("bucket", prefix, recursive)
                .map_ok(|entry| entry.name)
                .try_collect()
                .await
                .unwrap();

            assert_eq!(
                names, expected,
                "failed for case: {} recursive={}",
                prefix, recursive
            );
        }
    }

    #[tokio::test]
    async fn test_get_object_range() {
        let client = InMemoryClient::new();
        client
            .put_object("bucket", "k", Bytes::from_static(b"0123456789"), None)
            .await
            .unwrap();

        let cases = vec![
            (0, 0, Some(&b"0"[..])),
            (2, 5, Some(&b"2345"[..])),
            (7, 100, Some(&b"789"[..])),
            (5, 4, None),
            (10, 12, None),
        ];

        for (start, end, expected) in cases {
            let res = client.get_object_range("bucket", "k", start, end).await;
            match expected {
                Some(bytes) => {
                    let got = util::stream::collect(res.unwrap()).await.unwrap();
                    assert_eq!(&got[..], bytes, "failed for case: {}-{}", start, end);
                }
                None => assert!(
                    matches!(res, Err(StoreError::InvalidRange { .. })),
                    "failed for case: {}-{}",
                    start,
                    end
                ),
            }
        }
    }

    #[tokio::test]
    async fn test_fail_requests() {
        let client = InMemoryClient::new();
        client.fail_requests(true);

        let res = client
            .put_object("bucket", "k", Bytes::from_static(b"x"), None)
            .await;
        assert!(matches!(res, Err(StoreError::Transport(_))));

        let listed: Vec<_> = client.list_objects("bucket", "", true).collect().await;
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_err());

        client.fail_requests(false);
        assert!(client
            .put_object("bucket", "k", Bytes::from_static(b"x"), None)
            .await
            .is_ok());
        assert_eq!(client.len("bucket"), 1);
    }
}
