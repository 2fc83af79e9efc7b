pub mod config;
pub mod datasources;
pub mod error;
pub mod model;
pub mod util;

pub use config::{DatasourceConfig, LocalDatasourceConfig, S3DatasourceConfig};
pub use datasources::{Datasource, LocalDatasource, S3Datasource};
pub use error::{DatasourceError, Result, StoreError};
pub use util::stream::DataStream;
