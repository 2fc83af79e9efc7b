use std::path::PathBuf;

use serde::Deserialize;

use crate::{
    datasources::{Datasource, LocalDatasource, S3Datasource},
    error::Result,
};

/// Connection parameters for an S3-compatible bucket.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct S3DatasourceConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    #[serde(default)]
    pub force_s3_path: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
    pub region: String,
}

fn default_use_ssl() -> bool {
    true
}

impl S3DatasourceConfig {
    pub fn endpoint_url(&self) -> String {
        let base = if self.endpoint.contains("://") {
            self.endpoint.trim_end_matches('/').to_string()
        } else {
            let scheme = if self.use_ssl { "https" } else { "http" };
            format!("{}://{}", scheme, self.endpoint.trim_end_matches('/'))
        };

        match self.port {
            Some(port) if !has_port(&base) => format!("{}:{}", base, port),
            _ => base,
        }
    }
}

fn has_port(url: &str) -> bool {
    let authority = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = authority.split('/').next().unwrap_or("");
    // skip past a bracketed IPv6 host
    let host_end = authority.rfind(']').map(|i| i + 1).unwrap_or(0);

    authority[host_end..].contains(':')
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LocalDatasourceConfig {
    pub directory: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DatasourceConfig {
    #[serde(rename = "s3")]
    S3(S3DatasourceConfig),
    #[serde(rename = "local")]
    Local(LocalDatasourceConfig),
}

impl DatasourceConfig {
    pub async fn build(self) -> Result<Box<dyn Datasource>> {
        Ok(match self {
            DatasourceConfig::S3(config) => Box::new(S3Datasource::connect(config).await?),
            DatasourceConfig::Local(config) => Box::new(LocalDatasource::new(config).await?),
        })
    }
}
