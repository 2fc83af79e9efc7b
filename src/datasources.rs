use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::Result, util::stream::DataStream};

pub mod local;
pub mod s3;

pub use local::LocalDatasource;
pub use s3::S3Datasource;

/// Storage backend for named binary objects.
///
/// `get`, `size` and `range` never fail: a missing key, a bad range and a
/// store that cannot be reached all come back as `None`. `full_size` reports
/// `0` when the namespace cannot be enumerated.
#[async_trait]
pub trait Datasource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stores `data` under `key`, replacing any previous object in full.
    async fn save(&self, key: &str, data: Bytes, content_type: Option<&str>) -> Result<()>;

    /// Removes `key`. Deleting a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Removes every object in the namespace.
    ///
    /// Best effort: objects written while the clear runs may survive, and a
    /// failure part way through leaves already-deleted objects deleted.
    async fn clear(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Option<DataStream>;

    async fn size(&self, key: &str) -> Option<u64>;

    async fn full_size(&self) -> u64;

    /// Streams bytes `start..=end` of `key`. An `end` beyond the object is
    /// clamped to its last byte.
    async fn range(&self, key: &str, start: u64, end: u64) -> Option<DataStream>;
}
