use std::{path::PathBuf, process::ExitCode};

use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use objectds::{
    Datasource, DatasourceError, DataStream, LocalDatasource, LocalDatasourceConfig,
    S3Datasource, S3DatasourceConfig,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "objectds")]
#[command(about = "Store and read objects through a datasource backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Use a local directory instead of an S3 bucket
    #[arg(long, global = true, env = "OBJECTDS_LOCAL_DIR")]
    local: Option<PathBuf>,

    #[arg(long, global = true, env = "S3_ENDPOINT", default_value = "s3.amazonaws.com")]
    endpoint: String,

    #[arg(long, global = true, env = "S3_ACCESS_KEY_ID", default_value = "")]
    access_key_id: String,

    #[arg(
        long,
        global = true,
        env = "S3_SECRET_ACCESS_KEY",
        default_value = "",
        hide_env_values = true
    )]
    secret_access_key: String,

    #[arg(long, global = true, env = "S3_BUCKET", default_value = "")]
    bucket: String,

    #[arg(long, global = true, env = "S3_REGION", default_value = "us-east-1")]
    region: String,

    #[arg(long, global = true, env = "S3_PORT")]
    port: Option<u16>,

    /// Address buckets as `endpoint/bucket` instead of `bucket.endpoint`
    #[arg(long, global = true, env = "S3_FORCE_PATH_STYLE")]
    force_s3_path: bool,

    /// Talk plain http to the endpoint
    #[arg(long, global = true)]
    no_ssl: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file under a key
    Save {
        key: String,
        file: PathBuf,

        #[arg(long)]
        content_type: Option<String>,
    },

    /// Write an object to stdout or a file
    Get {
        key: String,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the byte length of an object
    Size { key: String },

    /// Write bytes start..=end of an object
    Range {
        key: String,
        start: u64,
        end: u64,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete an object
    Delete { key: String },

    /// Delete every object
    Clear {
        /// Keep clearing until a listing is empty, for at most this many rounds
        #[arg(long)]
        until_empty: Option<usize>,
    },

    /// Print the total byte length of every object
    FullSize,
}

enum Backend {
    S3(S3Datasource),
    Local(LocalDatasource),
}

impl Backend {
    async fn open(cli: &Cli) -> Result<Self, DatasourceError> {
        if let Some(directory) = &cli.local {
            let config = LocalDatasourceConfig {
                directory: directory.clone(),
            };
            return Ok(Backend::Local(LocalDatasource::new(config).await?));
        }

        let config = S3DatasourceConfig {
            endpoint: cli.endpoint.clone(),
            access_key_id: cli.access_key_id.clone(),
            secret_access_key: cli.secret_access_key.clone(),
            bucket: cli.bucket.clone(),
            force_s3_path: cli.force_s3_path,
            port: cli.port,
            use_ssl: !cli.no_ssl,
            region: cli.region.clone(),
        };

        Ok(Backend::S3(S3Datasource::connect(config).await?))
    }

    fn datasource(&self) -> &dyn Datasource {
        match self {
            Backend::S3(ds) => ds,
            Backend::Local(ds) => ds,
        }
    }
}

async fn write_stream(stream: DataStream, out: Option<&PathBuf>) -> Result<(), DatasourceError> {
    let mut writer: Box<dyn AsyncWrite + Unpin + Send> = match out {
        Some(path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };

    let mut stream = stream;
    while let Some(chunk) = stream.try_next().await? {
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;

    Ok(())
}

fn validate(cli: &Cli) -> Result<(), DatasourceError> {
    if let Commands::Clear {
        until_empty: Some(_),
    } = cli.command
    {
        if cli.local.is_some() {
            return Err(DatasourceError::Config(
                "--until-empty is only supported by the S3 datasource".to_string(),
            ));
        }
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<bool, DatasourceError> {
    validate(&cli)?;

    let backend = Backend::open(&cli).await?;
    let ds = backend.datasource();
    info!(datasource = ds.name(), "opened");

    match &cli.command {
        Commands::Save {
            key,
            file,
            content_type,
        } => {
            let data = tokio::fs::read(file).await?;
            ds.save(key, Bytes::from(data), content_type.as_deref())
                .await?;
        }
        Commands::Get { key, out } => match ds.get(key).await {
            Some(stream) => write_stream(stream, out.as_ref()).await?,
            None => {
                eprintln!("not found: {}", key);
                return Ok(false);
            }
        },
        Commands::Size { key } => match ds.size(key).await {
            Some(size) => println!("{}", size),
            None => {
                eprintln!("not found: {}", key);
                return Ok(false);
            }
        },
        Commands::Range {
            key,
            start,
            end,
            out,
        } => match ds.range(key, *start, *end).await {
            Some(stream) => write_stream(stream, out.as_ref()).await?,
            None => {
                eprintln!("not found or unsatisfiable range: {} bytes={}-{}", key, start, end);
                return Ok(false);
            }
        },
        Commands::Delete { key } => ds.delete(key).await?,
        Commands::Clear { until_empty } => match (&backend, until_empty) {
            (Backend::S3(s3), Some(rounds)) => s3.clear_until_empty(*rounds).await?,
            _ => ds.clear().await?,
        },
        Commands::FullSize => println!("{}", ds.full_size().await),
    }

    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(error_message = %err, error_group = "main");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let cases = vec![
            (vec!["objectds", "clear"], true),
            (vec!["objectds", "clear", "--until-empty", "3"], true),
            (vec!["objectds", "--local", "/tmp/objectds", "clear"], true),
            (
                vec!["objectds", "--local", "/tmp/objectds", "clear", "--until-empty", "3"],
                false,
            ),
            (vec!["objectds", "--local", "/tmp/objectds", "full-size"], true),
        ];

        for (args, expected) in cases {
            let cli = Cli::try_parse_from(args.clone()).unwrap();
            assert_eq!(validate(&cli).is_ok(), expected, "failed for case: {:?}", args);
        }
    }
}
