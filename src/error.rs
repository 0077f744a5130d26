use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid collection id: {0}")]
    InvalidCollectionId(String),

    #[error("invalid product id: {0}")]
    InvalidProductId(String),

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("missing config file sral-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing credentials file at {0}")]
    MissingCredentials(PathBuf),

    #[error("failed to parse credentials: {0}")]
    CredentialsParse(String),

    #[error("token request failed: {0}")]
    AuthHttp(String),

    #[error("token endpoint returned status {status}: {message}")]
    AuthStatus { status: u16, message: String },

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("unexpected catalog payload: {0}")]
    CatalogPayload(String),

    #[error("download failed for product {product}: {message}")]
    DownloadHttp { product: String, message: String },

    #[error("download for product {product} returned status {status}: {message}")]
    DownloadStatus {
        product: String,
        status: u16,
        message: String,
    },

    #[error("corrupt archive for product {product}: {message}")]
    CorruptArchive { product: String, message: String },

    #[error("archive for product {product} has no file named {target}")]
    MissingTarget { product: String, target: String },

    #[error("failed to load measurement frame from {path}: {message}")]
    FrameLoad { path: String, message: String },

    #[error("no measurement frames survived assembly; nothing to insert")]
    EmptyDataset,

    #[error("failed to write partition {partition}: {message}")]
    StoreWrite { partition: String, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
