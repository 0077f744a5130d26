use std::fs;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::archive;
use crate::catalog::TokenProvider;
use crate::domain::{CollectionId, ProductDescriptor};
use crate::error::IngestError;

pub trait ProductDownloader: Send + Sync {
    /// Download the product archive to `destination` as a zip file.
    fn download(
        &self,
        descriptor: &ProductDescriptor,
        destination: &Path,
    ) -> Result<(), IngestError>;
}

pub struct HttpProductDownloader {
    client: Client,
    base_url: String,
    collection: CollectionId,
    tokens: Arc<TokenProvider>,
}

impl HttpProductDownloader {
    pub fn new(
        base_url: &str,
        collection: CollectionId,
        tokens: Arc<TokenProvider>,
        timeout_secs: u64,
    ) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sral-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| IngestError::DownloadHttp {
                product: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            collection,
            tokens,
        })
    }

    fn send_with_retries<F>(
        &self,
        product: &str,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, IngestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::DownloadHttp {
                        product: product.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl ProductDownloader for HttpProductDownloader {
    fn download(
        &self,
        descriptor: &ProductDescriptor,
        destination: &Path,
    ) -> Result<(), IngestError> {
        let product = descriptor.id.as_str();
        let url = format!(
            "{}/data/download/1.0.0/collections/{}/products/{}",
            self.base_url,
            self.collection.as_str(),
            product
        );
        let token = self.tokens.bearer_token()?;
        let mut response = self.send_with_retries(product, || {
            self.client.get(&url).bearer_auth(token.clone())
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "download request failed".to_string());
            return Err(IngestError::DownloadStatus {
                product: product.to_string(),
                status,
                message,
            });
        }
        let mut file =
            File::create(destination).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// One entry per submitted descriptor, in submission order.
#[derive(Debug)]
pub struct FetchOutcome {
    pub descriptor: ProductDescriptor,
    pub result: Result<Utf8PathBuf, IngestError>,
}

/// Download, unpack, and locate the target measurement file for every
/// descriptor, with at most `max_parallel` downloads in flight. Per-item
/// failures are isolated into the outcome; the output order matches the
/// input order regardless of completion order.
pub fn fetch_all(
    downloader: &dyn ProductDownloader,
    descriptors: &[ProductDescriptor],
    download_dir: &Utf8Path,
    target_filename: &str,
    max_parallel: usize,
) -> Result<Vec<FetchOutcome>, IngestError> {
    fs::create_dir_all(download_dir.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_parallel.max(1))
        .build()
        .map_err(|err| IngestError::Filesystem(format!("worker pool: {err}")))?;

    let outcomes = pool.install(|| {
        descriptors
            .par_iter()
            .map(|descriptor| {
                let result = fetch_one(downloader, descriptor, download_dir, target_filename);
                if let Err(err) = &result {
                    warn!(product = %descriptor.id, error = %err, "fetch failed");
                }
                FetchOutcome {
                    descriptor: descriptor.clone(),
                    result,
                }
            })
            .collect()
    });

    Ok(outcomes)
}

/// Download → verified unpack → locate target → remove zip, all inside a
/// per-product scratch directory so concurrent unpacks never collide.
fn fetch_one(
    downloader: &dyn ProductDownloader,
    descriptor: &ProductDescriptor,
    download_dir: &Utf8Path,
    target_filename: &str,
) -> Result<Utf8PathBuf, IngestError> {
    let product = descriptor.id.as_str();
    let product_dir = download_dir.join(product);
    fs::create_dir_all(product_dir.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;

    let zip_path = product_dir.join(format!("{product}.zip"));
    debug!(product, "downloading archive");
    downloader.download(descriptor, zip_path.as_std_path())?;

    archive::unpack_archive(zip_path.as_std_path(), product_dir.as_std_path()).map_err(|err| {
        IngestError::CorruptArchive {
            product: product.to_string(),
            message: err.to_string(),
        }
    })?;

    // The zip is scratch; its extracted tree is what downstream reads.
    if let Err(err) = fs::remove_file(zip_path.as_std_path()) {
        warn!(product, error = %err, "failed to remove downloaded zip");
    }

    let found = archive::find_file(product_dir.as_std_path(), target_filename)?;
    let path = found.ok_or_else(|| IngestError::MissingTarget {
        product: product.to_string(),
        target: target_filename.to_string(),
    })?;
    Utf8PathBuf::from_path_buf(path)
        .map_err(|_| IngestError::Filesystem("non-utf8 path in extracted archive".to_string()))
}
