use std::fs;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::assembler;
use crate::catalog::CatalogClient;
use crate::config::ResolvedConfig;
use crate::error::IngestError;
use crate::fetcher::{self, ProductDownloader};
use crate::frame::FrameReader;
use crate::store::{PartitionOutcome, PartitionedStore};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Leave the download scratch directory in place after a successful
    /// run. The scratch is a cache, not transactional storage.
    pub keep_downloads: bool,
}

/// Final summary of one ingestion pass, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub products_located: usize,
    pub products_fetched: usize,
    pub fetch_failures: usize,
    pub frames_assembled: usize,
    pub frames_skipped: usize,
    pub records_inserted: usize,
    pub partitions_written: usize,
    pub partitions_failed: usize,
    pub partitions: Vec<PartitionOutcome>,
}

/// One full Locator → Fetcher → Assembler → Writer pass.
pub struct IngestJob<C, D, F> {
    config: ResolvedConfig,
    catalog: C,
    downloader: D,
    reader: F,
}

impl<C: CatalogClient, D: ProductDownloader, F: FrameReader> IngestJob<C, D, F> {
    pub fn new(config: ResolvedConfig, catalog: C, downloader: D, reader: F) -> Self {
        Self {
            config,
            catalog,
            downloader,
            reader,
        }
    }

    pub fn run(&self, options: RunOptions) -> Result<RunSummary, IngestError> {
        let config = &self.config;
        info!(
            collection = %config.collection_id,
            start = %config.time_range.start(),
            end = %config.time_range.end(),
            "querying catalog"
        );
        let descriptors = self
            .catalog
            .search(&config.collection_id, &config.time_range)?;
        let products_located = descriptors.len();

        info!(
            products = products_located,
            max_parallel = config.max_parallel,
            "fetching products"
        );
        let outcomes = fetcher::fetch_all(
            &self.downloader,
            &descriptors,
            &config.download_dir,
            &config.measurements_filename,
            config.max_parallel,
        )?;
        let fetch_failures = outcomes.iter().filter(|o| o.result.is_err()).count();
        let paths: Vec<Utf8PathBuf> = outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok().cloned())
            .collect();

        let (dataset, stats) = assembler::assemble(&self.reader, &paths, &config.index_dimension)?;
        let records_inserted = dataset.len();

        let store = PartitionedStore::new(
            config.store_base_path.clone(),
            config.index_dimension.clone(),
        );
        let report = store.insert(&dataset);

        if !options.keep_downloads {
            self.clear_scratch(&outcomes);
        }

        Ok(RunSummary {
            products_located,
            products_fetched: products_located - fetch_failures,
            fetch_failures,
            frames_assembled: stats.frames_assembled,
            frames_skipped: stats.frames_skipped,
            records_inserted,
            partitions_written: report.written(),
            partitions_failed: report.failed(),
            partitions: report.partitions,
        })
    }

    fn clear_scratch(&self, outcomes: &[fetcher::FetchOutcome]) {
        for outcome in outcomes {
            let product_dir = self
                .config
                .download_dir
                .join(outcome.descriptor.id.as_str());
            if !product_dir.as_std_path().exists() {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(product_dir.as_std_path()) {
                warn!(dir = %product_dir, error = %err, "failed to clear scratch");
            }
        }
    }
}
