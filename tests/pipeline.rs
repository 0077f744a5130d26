use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use sral_ingest::catalog::CatalogClient;
use sral_ingest::config::ResolvedConfig;
use sral_ingest::domain::{CollectionId, ProductDescriptor, TimeRange};
use sral_ingest::error::IngestError;
use sral_ingest::fetcher::ProductDownloader;
use sral_ingest::frame::{FrameReader, MeasurementFrame};
use sral_ingest::pipeline::{IngestJob, RunOptions};

const TARGET: &str = "reduced_measurement.nc";

fn utf8(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

fn sensing_start(position: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 23, 0, position, 0).unwrap()
}

fn config(download_dir: &TempDir, store_dir: &TempDir) -> ResolvedConfig {
    let range = TimeRange::new(
        Utc.with_ymd_and_hms(2024, 9, 23, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 9, 24, 0, 0, 0).unwrap(),
    )
    .unwrap();
    ResolvedConfig {
        collection_id: "EO:EUM:DAT:0415".parse().unwrap(),
        download_dir: utf8(download_dir),
        measurements_filename: TARGET.to_string(),
        store_base_path: utf8(store_dir),
        index_dimension: "time_01".to_string(),
        max_parallel: 3,
        download_timeout_secs: 30,
        credentials_path: Utf8PathBuf::from("/nonexistent/credentials.json"),
        time_range: range,
    }
}

struct FixedCatalog {
    descriptors: Vec<ProductDescriptor>,
}

impl FixedCatalog {
    fn with_products(count: u32) -> Self {
        Self {
            descriptors: (0..count)
                .map(|position| ProductDescriptor {
                    id: format!("P{position}").parse().unwrap(),
                    sensing_start: sensing_start(position),
                    title: format!("P{position}"),
                })
                .collect(),
        }
    }
}

impl CatalogClient for FixedCatalog {
    fn search(
        &self,
        _collection: &CollectionId,
        _range: &TimeRange,
    ) -> Result<Vec<ProductDescriptor>, IngestError> {
        Ok(self.descriptors.clone())
    }
}

/// Writes a product zip containing the target file, or fails outright for
/// the named products.
struct ZipDownloader {
    fail_for: Vec<String>,
}

impl ProductDownloader for ZipDownloader {
    fn download(
        &self,
        descriptor: &ProductDescriptor,
        destination: &Path,
    ) -> Result<(), IngestError> {
        let product = descriptor.id.as_str();
        if self.fail_for.iter().any(|id| id == product) {
            return Err(IngestError::DownloadStatus {
                product: product.to_string(),
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        let file = fs::File::create(destination)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer
            .start_file(format!("{product}/{TARGET}"), options)
            .unwrap();
        writer.write_all(b"placeholder").unwrap();
        writer.finish().unwrap();
        Ok(())
    }
}

/// Builds a one-record frame per product, timestamped from the product
/// name embedded in the extracted path.
struct PathReader;

impl FrameReader for PathReader {
    fn load(&self, path: &Path, _index_dimension: &str) -> Result<MeasurementFrame, IngestError> {
        let product = path
            .components()
            .filter_map(|component| component.as_os_str().to_str())
            .rev()
            .find(|segment| segment.starts_with('P') && segment[1..].parse::<u32>().is_ok())
            .ok_or_else(|| IngestError::FrameLoad {
                path: path.display().to_string(),
                message: "no product segment in path".to_string(),
            })?;
        let position: u32 = product[1..].parse().unwrap();
        Ok(MeasurementFrame {
            index: vec![sensing_start(position)],
            variables: BTreeMap::from([("range".to_string(), vec![f64::from(position)])]),
        })
    }
}

#[test]
fn partial_download_failures_do_not_abort_the_run() {
    let download_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let job = IngestJob::new(
        config(&download_dir, &store_dir),
        FixedCatalog::with_products(10),
        ZipDownloader {
            fail_for: vec!["P3".to_string(), "P7".to_string()],
        },
        PathReader,
    );

    let summary = job.run(RunOptions::default()).unwrap();

    assert_eq!(summary.products_located, 10);
    assert_eq!(summary.products_fetched, 8);
    assert_eq!(summary.fetch_failures, 2);
    assert_eq!(summary.frames_assembled, 8);
    assert_eq!(summary.frames_skipped, 0);
    assert_eq!(summary.records_inserted, 8);
    assert_eq!(summary.partitions_written, 1);
    assert_eq!(summary.partitions_failed, 0);
    assert_eq!(summary.partitions[0].partition, "2024-09");
}

#[test]
fn scratch_directories_are_cleared_after_the_run() {
    let download_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let job = IngestJob::new(
        config(&download_dir, &store_dir),
        FixedCatalog::with_products(3),
        ZipDownloader { fail_for: vec![] },
        PathReader,
    );

    job.run(RunOptions::default()).unwrap();

    let remaining = fs::read_dir(download_dir.path()).unwrap().count();
    assert_eq!(remaining, 0);
}

#[test]
fn keep_downloads_leaves_extracted_products_in_place() {
    let download_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let job = IngestJob::new(
        config(&download_dir, &store_dir),
        FixedCatalog::with_products(2),
        ZipDownloader { fail_for: vec![] },
        PathReader,
    );

    job.run(RunOptions {
        keep_downloads: true,
    })
    .unwrap();

    assert!(download_dir.path().join("P0").join("P0").join(TARGET).exists());
    assert!(download_dir.path().join("P1").join("P1").join(TARGET).exists());
}

#[test]
fn all_products_failing_is_an_empty_dataset_error() {
    let download_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let job = IngestJob::new(
        config(&download_dir, &store_dir),
        FixedCatalog::with_products(2),
        ZipDownloader {
            fail_for: vec!["P0".to_string(), "P1".to_string()],
        },
        PathReader,
    );

    assert_matches!(
        job.run(RunOptions::default()),
        Err(IngestError::EmptyDataset)
    );
}

#[test]
fn a_second_run_over_the_same_window_is_idempotent() {
    let download_dir = TempDir::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let catalog = FixedCatalog::with_products(4);
    let make_job = |catalog: FixedCatalog| {
        IngestJob::new(
            config(&download_dir, &store_dir),
            catalog,
            ZipDownloader { fail_for: vec![] },
            PathReader,
        )
    };

    let first = make_job(FixedCatalog {
        descriptors: catalog.descriptors.clone(),
    })
    .run(RunOptions::default())
    .unwrap();
    let second = make_job(catalog).run(RunOptions::default()).unwrap();

    assert_eq!(first.records_inserted, 4);
    assert_eq!(second.records_inserted, 4);
    assert_eq!(second.partitions[0].action, "merged");
    assert_eq!(second.partitions[0].records, 4);
}
