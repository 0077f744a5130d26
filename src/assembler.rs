use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::IngestError;
use crate::frame::{FrameReader, MeasurementFrame};

/// Concatenation of all surviving measurement frames along the index
/// dimension, globally non-decreasing in time.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledDataset {
    pub index: Vec<DateTime<Utc>>,
    pub variables: BTreeMap<String, Vec<f64>>,
}

impl AssembledDataset {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AssemblyStats {
    pub frames_assembled: usize,
    pub frames_skipped: usize,
}

/// Load every path into a frame and concatenate, in input order. Frames
/// that fail to load are logged and skipped rather than aborting the run;
/// the resulting index is sorted (stably) if concatenation order did not
/// already yield a non-decreasing sequence.
pub fn assemble(
    reader: &dyn FrameReader,
    paths: &[Utf8PathBuf],
    index_dimension: &str,
) -> Result<(AssembledDataset, AssemblyStats), IngestError> {
    let mut frames = Vec::new();
    let mut stats = AssemblyStats::default();

    for path in paths {
        match reader.load(path.as_std_path(), index_dimension) {
            Ok(frame) => {
                frames.push(frame);
                stats.frames_assembled += 1;
            }
            Err(err) => {
                warn!(path = %path, error = %err, "skipping unloadable frame");
                stats.frames_skipped += 1;
            }
        }
    }

    let dataset = concatenate(&frames);
    if dataset.is_empty() {
        return Err(IngestError::EmptyDataset);
    }
    info!(
        records = dataset.len(),
        frames = stats.frames_assembled,
        skipped = stats.frames_skipped,
        "assembly complete"
    );
    Ok((dataset, stats))
}

fn concatenate(frames: &[MeasurementFrame]) -> AssembledDataset {
    let names: BTreeSet<&str> = frames
        .iter()
        .flat_map(|frame| frame.variables.keys().map(String::as_str))
        .collect();

    let total: usize = frames.iter().map(MeasurementFrame::len).sum();
    let mut index = Vec::with_capacity(total);
    for frame in frames {
        index.extend_from_slice(&frame.index);
    }

    let variables: BTreeMap<String, Vec<f64>> = names
        .iter()
        .map(|name| {
            let mut column = Vec::with_capacity(total);
            for frame in frames {
                match frame.variables.get(*name) {
                    Some(values) => column.extend_from_slice(values),
                    // A frame missing a variable contributes fill values,
                    // so every column stays aligned with the index.
                    None => column.extend(std::iter::repeat(f64::NAN).take(frame.len())),
                }
            }
            (name.to_string(), column)
        })
        .collect();

    let mut dataset = AssembledDataset { index, variables };
    if dataset.index.windows(2).any(|pair| pair[0] > pair[1]) {
        sort_by_index(&mut dataset);
    }
    dataset
}

/// Stable sort by index value; ties keep their original relative order,
/// which matters at product boundaries where timestamps can repeat.
fn sort_by_index(dataset: &mut AssembledDataset) {
    let mut order: Vec<usize> = (0..dataset.index.len()).collect();
    order.sort_by_key(|&position| dataset.index[position]);

    dataset.index = order.iter().map(|&position| dataset.index[position]).collect();
    for values in dataset.variables.values_mut() {
        *values = order.iter().map(|&position| values[position]).collect();
    }
}
