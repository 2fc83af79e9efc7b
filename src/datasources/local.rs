use std::{
    io::{self, SeekFrom},
    path::{Component, Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, error, info};

use crate::{
    config::LocalDatasourceConfig,
    datasources::Datasource,
    error::{DatasourceError, Result},
    util,
    util::stream::DataStream,
};

const TEMP_SUFFIX: &str = ".objectds-tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Datasource storing each object as a file below a root directory.
pub struct LocalDatasource {
    root: PathBuf,
}

impl LocalDatasource {
    pub async fn new(config: LocalDatasourceConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory).await?;
        info!(directory = %config.directory.display(), "opened");

        Ok(Self {
            root: config.directory,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key onto a path below the root, refusing anything that could
    /// escape it.
    fn key_to_path(&self, key: &str) -> Option<PathBuf> {
        if key.is_empty() || key.ends_with('/') || key.ends_with(TEMP_SUFFIX) {
            return None;
        }

        // `Path::components` folds `a//b` and `a/./b` into `a/b`, so the raw
        // segments are checked first to keep keys one-to-one with files.
        if key
            .split('/')
            .any(|s| s.is_empty() || s == "." || s == "..")
        {
            return None;
        }

        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }

        Some(self.root.join(relative))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);

        path.with_file_name(format!(".{}.{}.{}{}", name, process::id(), n, TEMP_SUFFIX))
    }

    async fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = Self::temp_path(path);
        if let Err(err) = fs::write(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }

        Ok(())
    }

    async fn walk_size(&self) -> io::Result<u64> {
        let mut size = 0;
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX)
                {
                    size += entry.metadata().await?.len();
                }
            }
        }

        Ok(size)
    }

    async fn open(&self, key: &str) -> Option<(fs::File, u64)> {
        let path = self.key_to_path(key)?;

        let file = match fs::File::open(&path).await {
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    error!(key = key, error_message = %err, error_group = "open_file");
                }
                return None;
            }
            Ok(file) => file,
        };

        match file.metadata().await {
            Ok(meta) if meta.is_file() => Some((file, meta.len())),
            Ok(_) => None,
            Err(err) => {
                error!(key = key, error_message = %err, error_group = "file_metadata");
                None
            }
        }
    }
}

#[async_trait]
impl Datasource for LocalDatasource {
    fn name(&self) -> &'static str {
        "Local"
    }

    async fn save(&self, key: &str, data: Bytes, _content_type: Option<&str>) -> Result<()> {
        let path = self.key_to_path(key).ok_or_else(|| DatasourceError::Write {
            key: key.to_string(),
            message: "invalid key".to_string(),
        })?;

        Self::write_file(&path, &data).await.map_err(|err| {
            error!(key = key, error_message = %err, error_group = "write_file");
            DatasourceError::Write {
                key: key.to_string(),
                message: err.to_string(),
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let Some(path) = self.key_to_path(key) else {
            return Ok(());
        };

        // a directory never reads as an object, so it deletes as absent
        match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            _ => {}
        }

        match fs::remove_file(&path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                error!(key = key, error_message = %err, error_group = "remove_file");
                Err(DatasourceError::Delete {
                    key: key.to_string(),
                    message: err.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn clear(&self) -> Result<()> {
        let clear_err = |err: io::Error| {
            error!(error_message = %err, error_group = "clear");
            DatasourceError::Clear(err.to_string())
        };

        let mut entries = fs::read_dir(&self.root).await.map_err(clear_err)?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await.map_err(clear_err)? {
            let res = if entry.file_type().await.map_err(clear_err)?.is_dir() {
                fs::remove_dir_all(entry.path()).await
            } else {
                fs::remove_file(entry.path()).await
            };

            match res {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(clear_err(err)),
                _ => removed += 1,
            }
        }

        info!(directory = %self.root.display(), removed = removed, "cleared");
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<DataStream> {
        let (file, _) = self.open(key).await?;
        Some(util::stream::from_reader(file))
    }

    async fn size(&self, key: &str) -> Option<u64> {
        let path = self.key_to_path(key)?;

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    error!(key = key, error_message = %err, error_group = "file_metadata");
                }
                None
            }
        }
    }

    async fn full_size(&self) -> u64 {
        match self.walk_size().await {
            Err(err) => {
                error!(error_message = %err, error_group = "walk_dir");
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

        let (mut file, len) = self.open(key).await?;
        if start >= len {
            debug!(key = key, start = start, len = len, "range past end");
            return None;
        }

        if let Err(err) = file.seek(SeekFrom::Start(start)).await {
            error!(key = key, error_message = %err, error_group = "seek_file");
            return None;
        }

        let end = end.min(len - 1);
        Some(util::stream::from_reader(file.take(end - start + 1)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    async fn datasource() -> (LocalDatasource, TempDir) {
        let dir = TempDir::new().unwrap();
        let ds = LocalDatasource::new(LocalDatasourceConfig {
            directory: dir.path().join("uploads"),
        })
        .await
        .unwrap();

        (ds, dir)
    }

    async fn read(stream: Option<DataStream>) -> Vec<u8> {
        util::stream::collect(stream.expect("expected a stream"))
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_key_to_path() {
        let ds = LocalDatasource {
            root: PathBuf::from("/srv/uploads"),
        };

        let cases = vec![
            ("file.png", Some(PathBuf::from("/srv/uploads/file.png"))),
            ("a/b/c.txt", Some(PathBuf::from("/srv/uploads/a/b/c.txt"))),
            ("", None),
            ("dir/", None),
            ("../escape", None),
            ("a/../../escape", None),
            ("/etc/passwd", None),
            ("./file", None),
            ("x.objectds-tmp", None),
            ("a//b", None),
            ("a/./b", None),
            ("a/b/.", None),
        ];

        for (key, expected) in cases {
            assert_eq!(ds.key_to_path(key), expected, "failed for case: {}", key);
        }
    }

    #[tokio::test]
    async fn test_save_get() {
        let (ds, _dir) = datasource().await;

        let cases = vec![
            ("image.png", b"\x89PNG\r\n".to_vec()),
            ("nested/dir/file.txt", b"hello".to_vec()),
            ("empty", Vec::new()),
        ];

        for (key, payload) in cases {
            ds.save(key, Bytes::from(payload.clone()), None).await.unwrap();

            assert_eq!(read(ds.get(key).await).await, payload, "failed for case: {}", key);
            assert_eq!(ds.size(key).await, Some(payload.len() as u64));
        }
    }

    #[tokio::test]
    async fn test_save_invalid_key() {
        let (ds, _dir) = datasource().await;

        assert!(matches!(
            ds.save("../outside", Bytes::from_static(b"x"), None).await,
            Err(DatasourceError::Write { .. })
        ));
        assert!(ds.get("../outside").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let (ds, _dir) = datasource().await;

        ds.save("k", Bytes::from_static(b"data"), None).await.unwrap();
        ds.delete("k").await.unwrap();
        ds.delete("k").await.unwrap();

        assert!(ds.get("k").await.is_none());
        assert!(ds.size("k").await.is_none());
    }

    #[tokio::test]
    async fn test_directory_is_absent() {
        let (ds, _dir) = datasource().await;
        ds.save("dir/file", Bytes::from_static(b"data"), None)
            .await
            .unwrap();

        assert!(ds.get("dir").await.is_none());
        assert!(ds.size("dir").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_directory_key() {
        let (ds, _dir) = datasource().await;
        ds.save("dir/file", Bytes::from_static(b"data"), None)
            .await
            .unwrap();

        assert!(ds.get("dir").await.is_none());
        ds.delete("dir").await.unwrap();
        assert_eq!(ds.size("dir/file").await, Some(4));
    }

    #[tokio::test]
    async fn test_aliased_keys() {
        let (ds, _dir) = datasource().await;
        ds.save("a/b", Bytes::from_static(b"one"), None).await.unwrap();

        let cases = vec!["a//b", "a/./b"];

        for key in cases {
            assert!(ds.size(key).await.is_none(), "failed for case: {}", key);
            assert!(ds.get(key).await.is_none(), "failed for case: {}", key);
            ds.delete(key).await.unwrap();
            assert_eq!(ds.size("a/b").await, Some(3), "failed for case: {}", key);
        }

        assert!(matches!(
            ds.save("a//b", Bytes::from_static(b"two"), None).await,
            Err(DatasourceError::Write { .. })
        ));
    }

    #[tokio::test]
    async fn test_range() {
        let (ds, _dir) = datasource().await;
        ds.save("k", Bytes::from_static(b"0123456789"), None)
            .await
            .unwrap();

        let cases = vec![
            (0, 9, Some(b"0123456789".to_vec())),
            (0, 0, Some(b"0".to_vec())),
            (3, 6, Some(b"3456".to_vec())),
            (8, 20, Some(b"89".to_vec())),
            (6, 3, None),
            (10, 11, None),
        ];

        for (start, end, expected) in cases {
            let res = ds.range("k", start, end).await;
            match expected {
                Some(bytes) => assert_eq!(
                    read(res).await,
                    bytes,
                    "failed for case: {}-{}",
                    start,
                    end
                ),
                None => assert!(res.is_none(), "failed for case: {}-{}", start, end),
            }
        }

        assert!(ds.range("missing", 0, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_full_size_and_clear() {
        let (ds, _dir) = datasource().await;
        assert_eq!(ds.full_size().await, 0);

        ds.save("k1", Bytes::from(vec![1u8; 10]), None).await.unwrap();
        ds.save("dir/k2", Bytes::from(vec![2u8; 20]), None)
            .await
            .unwrap();
        assert_eq!(ds.full_size().await, 30);

        ds.clear().await.unwrap();

        assert_eq!(ds.full_size().await, 0);
        assert!(ds.get("k1").await.is_none());
        assert!(ds.get("dir/k2").await.is_none());
        assert!(ds.root().exists());
    }

    #[tokio::test]
    async fn test_concurrent_saves() {
        let (ds, _dir) = datasource().await;
        let ds = Arc::new(ds);

        let p1 = Bytes::from(vec![b'a'; 64 * 1024]);
        let p2 = Bytes::from(vec![b'b'; 128 * 1024]);

        let mut handles = Vec::new();
        for payload in [p1.clone(), p2.clone(), p1.clone(), p2.clone()] {
            let ds = ds.clone();
            handles.push(tokio::spawn(async move {
                ds.save("race", payload, None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let got = read(ds.get("race").await).await;
        assert!(got == p1 || got == p2, "torn write of {} bytes", got.len());
        assert_eq!(ds.full_size().await, got.len() as u64);
    }
}
