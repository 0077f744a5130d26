use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info};
use zarrs::array::codec::GzipCodec;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue, ZARR_NAN_F64};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorage;

use crate::assembler::AssembledDataset;
use crate::domain::{partition_key, PartitionKey};
use crate::error::IngestError;

const CHUNK_SIZE: u64 = 4096;
const GZIP_LEVEL: u32 = 5;

/// Month-partitioned zarr collection under a base directory. Each
/// `year=YYYY/month=MM` subtree holds one 1-D array per variable plus the
/// index coordinate (Int64 microseconds since the Unix epoch).
pub struct PartitionedStore {
    base_path: Utf8PathBuf,
    index_dimension: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionOutcome {
    pub partition: String,
    pub action: String,
    pub records: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InsertReport {
    pub partitions: Vec<PartitionOutcome>,
}

impl InsertReport {
    pub fn written(&self) -> usize {
        self.partitions.iter().filter(|p| p.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.partitions.len() - self.written()
    }

    pub fn all_ok(&self) -> bool {
        self.failed() == 0
    }
}

/// One partition's records, keyed by index value in microseconds. Row
/// values follow `variable_names` order.
struct PartitionRows {
    variable_names: Vec<String>,
    rows: BTreeMap<i64, Vec<f64>>,
}

impl PartitionedStore {
    pub fn new(base_path: impl Into<Utf8PathBuf>, index_dimension: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            index_dimension: index_dimension.into(),
        }
    }

    pub fn base_path(&self) -> &Utf8Path {
        &self.base_path
    }

    /// Insert the dataset, creating partitions that do not exist and
    /// merging (dedup by index, last-write-wins) into ones that do. A
    /// failing partition is reported and does not abort the others.
    pub fn insert(&self, dataset: &AssembledDataset) -> InsertReport {
        let mut report = InsertReport::default();
        for (key, positions) in group_by_partition(dataset) {
            let outcome = match self.write_partition(key, dataset, &positions) {
                Ok(outcome) => outcome,
                Err(err) => PartitionOutcome {
                    partition: key.to_string(),
                    action: "failed".to_string(),
                    records: 0,
                    error: Some(err.to_string()),
                },
            };
            report.partitions.push(outcome);
        }
        info!(
            written = report.written(),
            failed = report.failed(),
            "insert complete"
        );
        report
    }

    fn write_partition(
        &self,
        key: PartitionKey,
        dataset: &AssembledDataset,
        positions: &[usize],
    ) -> Result<PartitionOutcome, IngestError> {
        let partition_dir = self.base_path.join(key.relative_path());
        let exists = partition_dir
            .join(&self.index_dimension)
            .join("zarr.json")
            .as_std_path()
            .exists();

        let mut merged = if exists {
            debug!(partition = %key, "merging into existing partition");
            self.read_partition(key, &partition_dir)?
        } else {
            debug!(partition = %key, "creating partition");
            PartitionRows {
                variable_names: dataset.variables.keys().cloned().collect(),
                rows: BTreeMap::new(),
            }
        };

        merge_new_rows(&mut merged, dataset, positions);

        // Read-merge-rewrite; the zarr layer's own write semantics are the
        // consistency boundary, no atomic replace at this level.
        if exists {
            fs::remove_dir_all(partition_dir.as_std_path())
                .map_err(|err| self.store_error(key, err.to_string()))?;
        }
        fs::create_dir_all(partition_dir.as_std_path())
            .map_err(|err| self.store_error(key, err.to_string()))?;
        self.write_arrays(key, &partition_dir, &merged)?;

        Ok(PartitionOutcome {
            partition: key.to_string(),
            action: if exists { "merged" } else { "created" }.to_string(),
            records: merged.rows.len() as u64,
            error: None,
        })
    }

    fn read_partition(
        &self,
        key: PartitionKey,
        partition_dir: &Utf8Path,
    ) -> Result<PartitionRows, IngestError> {
        let store: ReadableWritableListableStorage = Arc::new(
            FilesystemStore::new(partition_dir.as_std_path())
                .map_err(|err| self.store_error(key, err.to_string()))?,
        );

        let index_array = Array::open(store.clone(), &format!("/{}", self.index_dimension))
            .map_err(|err| self.store_error(key, err.to_string()))?;
        let times = index_array
            .retrieve_array_subset_elements::<i64>(&index_array.subset_all())
            .map_err(|err| self.store_error(key, err.to_string()))?;

        let variable_names = self.list_variable_names(key, partition_dir)?;
        let mut rows: BTreeMap<i64, Vec<f64>> = times
            .iter()
            .map(|&micros| (micros, vec![f64::NAN; variable_names.len()]))
            .collect();

        for (column, name) in variable_names.iter().enumerate() {
            let array = Array::open(store.clone(), &format!("/{name}"))
                .map_err(|err| self.store_error(key, err.to_string()))?;
            let values = array
                .retrieve_array_subset_elements::<f64>(&array.subset_all())
                .map_err(|err| self.store_error(key, err.to_string()))?;
            if values.len() != times.len() {
                return Err(self.store_error(
                    key,
                    format!(
                        "variable {name} has {} values for {} index entries",
                        values.len(),
                        times.len()
                    ),
                ));
            }
            for (&micros, value) in times.iter().zip(values) {
                if let Some(row) = rows.get_mut(&micros) {
                    row[column] = value;
                }
            }
        }

        Ok(PartitionRows {
            variable_names,
            rows,
        })
    }

    /// Every array in the partition except the index coordinate. Array
    /// directories are the ones carrying zarr metadata.
    fn list_variable_names(
        &self,
        key: PartitionKey,
        partition_dir: &Utf8Path,
    ) -> Result<Vec<String>, IngestError> {
        let mut names = Vec::new();
        let entries = fs::read_dir(partition_dir.as_std_path())
            .map_err(|err| self.store_error(key, err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| self.store_error(key, err.to_string()))?;
            let path = entry.path();
            if !path.is_dir() || !path.join("zarr.json").exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name != self.index_dimension {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn write_arrays(
        &self,
        key: PartitionKey,
        partition_dir: &Utf8Path,
        content: &PartitionRows,
    ) -> Result<(), IngestError> {
        let length = content.rows.len() as u64;
        let store: ReadableWritableListableStorage = Arc::new(
            FilesystemStore::new(partition_dir.as_std_path())
                .map_err(|err| self.store_error(key, err.to_string()))?,
        );
        let subset = ArraySubset::new_with_ranges(&[0..length]);

        let times: Vec<i64> = content.rows.keys().copied().collect();
        let index_array = self
            .build_array(
                key,
                store.clone(),
                &self.index_dimension,
                length,
                DataType::Int64,
                FillValue::from(0i64),
                serde_json::json!({
                    "units": "microseconds since 1970-01-01T00:00:00Z",
                }),
            )?;
        index_array
            .store_array_subset_elements::<i64>(&subset, &times)
            .map_err(|err| self.store_error(key, err.to_string()))?;

        for (column, name) in content.variable_names.iter().enumerate() {
            let values: Vec<f64> = content.rows.values().map(|row| row[column]).collect();
            let array = self.build_array(
                key,
                store.clone(),
                name,
                length,
                DataType::Float64,
                FillValue::from(ZARR_NAN_F64),
                serde_json::json!({}),
            )?;
            array
                .store_array_subset_elements::<f64>(&subset, &values)
                .map_err(|err| self.store_error(key, err.to_string()))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_array(
        &self,
        key: PartitionKey,
        store: ReadableWritableListableStorage,
        name: &str,
        length: u64,
        data_type: DataType,
        fill_value: FillValue,
        attributes: serde_json::Value,
    ) -> Result<Array<dyn zarrs::storage::ReadableWritableListableStorageTraits>, IngestError>
    {
        let chunk_grid: zarrs::array::chunk_grid::ChunkGrid = vec![CHUNK_SIZE]
            .try_into()
            .map_err(|err| self.store_error(key, format!("chunk grid: {err}")))?;
        let gzip =
            GzipCodec::new(GZIP_LEVEL).map_err(|err| self.store_error(key, err.to_string()))?;
        let array = ArrayBuilder::new(vec![length], data_type, chunk_grid, fill_value)
            .bytes_to_bytes_codecs(vec![Arc::new(gzip)])
            .dimension_names([self.index_dimension.as_str()].into())
            .attributes(
                attributes
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            )
            .build(store, &format!("/{name}"))
            .map_err(|err| self.store_error(key, err.to_string()))?;
        array
            .store_metadata()
            .map_err(|err| self.store_error(key, err.to_string()))?;
        Ok(array)
    }

    fn store_error(&self, key: PartitionKey, message: String) -> IngestError {
        IngestError::StoreWrite {
            partition: key.to_string(),
            message,
        }
    }
}

/// Row positions per partition key, in dataset order within each key.
fn group_by_partition(dataset: &AssembledDataset) -> BTreeMap<PartitionKey, Vec<usize>> {
    let mut groups: BTreeMap<PartitionKey, Vec<usize>> = BTreeMap::new();
    for (position, instant) in dataset.index.iter().enumerate() {
        groups.entry(partition_key(*instant)).or_default().push(position);
    }
    groups
}

/// Apply the new records on top of whatever the partition already holds.
/// Last write wins: a new record replaces a stored record with the same
/// index value, and within the new batch later records replace earlier
/// ones.
fn merge_new_rows(merged: &mut PartitionRows, dataset: &AssembledDataset, positions: &[usize]) {
    // Union the variable schema first, remapping stored rows onto the new
    // column order so they keep their values.
    let names: Vec<String> = merged
        .variable_names
        .iter()
        .chain(dataset.variables.keys())
        .cloned()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    if names != merged.variable_names {
        let old_positions: Vec<Option<usize>> = names
            .iter()
            .map(|name| merged.variable_names.iter().position(|old| old == name))
            .collect();
        for row in merged.rows.values_mut() {
            *row = old_positions
                .iter()
                .map(|old| old.map_or(f64::NAN, |column| row[column]))
                .collect();
        }
        merged.variable_names = names;
    }

    let columns: Vec<Option<&Vec<f64>>> = merged
        .variable_names
        .iter()
        .map(|name| dataset.variables.get(name))
        .collect();

    for &position in positions {
        let micros = dataset.index[position].timestamp_micros();
        let row: Vec<f64> = columns
            .iter()
            .map(|column| column.map_or(f64::NAN, |values| values[position]))
            .collect();
        merged.rows.insert(micros, row);
    }
}
