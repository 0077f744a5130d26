use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{CollectionId, TimeRange};
use crate::error::IngestError;

/// On-disk config file. Every field has a default matching the original
/// deployment, so an empty `{}` is a valid config apart from the time range.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_collection_id")]
    pub collection_id: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default = "default_measurements_filename")]
    pub measurements_filename: String,
    #[serde(default = "default_store_base_path")]
    pub store_base_path: String,
    #[serde(default = "default_index_dimension")]
    pub index_dimension: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default)]
    pub credentials_path: Option<String>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

fn default_collection_id() -> String {
    "EO:EUM:DAT:0415".to_string()
}

fn default_download_dir() -> String {
    "/tmp/products".to_string()
}

fn default_measurements_filename() -> String {
    "reduced_measurement.nc".to_string()
}

fn default_store_base_path() -> String {
    "/tmp/sen3_sral".to_string()
}

fn default_index_dimension() -> String {
    "time_01".to_string()
}

fn default_max_parallel() -> usize {
    4
}

fn default_download_timeout_secs() -> u64 {
    300
}

/// Validated configuration handed to every component constructor. No
/// component reads process state on its own.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub collection_id: CollectionId,
    pub download_dir: Utf8PathBuf,
    pub measurements_filename: String,
    pub store_base_path: Utf8PathBuf,
    pub index_dimension: String,
    pub max_parallel: usize,
    pub download_timeout_secs: u64,
    pub credentials_path: Utf8PathBuf,
    pub time_range: TimeRange,
}

/// API credentials, `~/.eumdac/credentials.json` by default.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
}

impl Credentials {
    pub fn load(path: &Utf8PathBuf) -> Result<Self, IngestError> {
        if !path.as_std_path().exists() {
            return Err(IngestError::MissingCredentials(
                path.as_std_path().to_path_buf(),
            ));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| IngestError::CredentialsParse(err.to_string()))?;
        let credentials: Credentials = serde_json::from_str(&content)
            .map_err(|err| IngestError::CredentialsParse(err.to_string()))?;
        if credentials.consumer_key.trim().is_empty()
            || credentials.consumer_secret.trim().is_empty()
        {
            return Err(IngestError::CredentialsParse(
                "consumer_key and consumer_secret must be non-empty".to_string(),
            ));
        }
        Ok(credentials)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        range_override: Option<TimeRange>,
    ) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("sral-ingest.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content =
            fs::read_to_string(&config_path).map_err(|_| IngestError::ConfigRead(config_path))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config, range_override)
    }

    pub fn resolve_config(
        config: Config,
        range_override: Option<TimeRange>,
    ) -> Result<ResolvedConfig, IngestError> {
        let collection_id: CollectionId = config.collection_id.parse()?;

        let time_range = match range_override {
            Some(range) => range,
            None => {
                let (Some(start), Some(end)) = (config.time_start, config.time_end) else {
                    return Err(IngestError::ConfigParse(
                        "time_start and time_end are required (config or --start/--end)"
                            .to_string(),
                    ));
                };
                TimeRange::new(start, end)?
            }
        };

        if config.max_parallel == 0 {
            return Err(IngestError::ConfigParse(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        let credentials_path = match config.credentials_path {
            Some(path) => Utf8PathBuf::from(path),
            None => default_credentials_path()?,
        };

        Ok(ResolvedConfig {
            collection_id,
            download_dir: Utf8PathBuf::from(config.download_dir),
            measurements_filename: config.measurements_filename,
            store_base_path: Utf8PathBuf::from(config.store_base_path),
            index_dimension: config.index_dimension,
            max_parallel: config.max_parallel,
            download_timeout_secs: config.download_timeout_secs,
            credentials_path,
            time_range,
        })
    }
}

fn default_credentials_path() -> Result<Utf8PathBuf, IngestError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(
                dirs.home_dir().join(".eumdac").join("credentials.json"),
            )
            .ok()
        })
        .ok_or_else(|| IngestError::Filesystem("unable to resolve home directory".to_string()))
}
