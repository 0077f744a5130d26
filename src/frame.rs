use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tracing::debug;

use crate::error::IngestError;

/// In-memory labeled arrays from one extracted measurement file: a time
/// index plus named variables sharing that dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementFrame {
    pub index: Vec<DateTime<Utc>>,
    pub variables: BTreeMap<String, Vec<f64>>,
}

impl MeasurementFrame {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Structural invariants: equal lengths everywhere, and a
    /// non-decreasing index (source files are pre-sorted; a violation
    /// means the file is not what we think it is).
    pub fn check(&self) -> Result<(), String> {
        for (name, values) in &self.variables {
            if values.len() != self.index.len() {
                return Err(format!(
                    "variable {name} has {} values for {} index entries",
                    values.len(),
                    self.index.len()
                ));
            }
        }
        if self.index.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err("index coordinate is not non-decreasing".to_string());
        }
        Ok(())
    }
}

pub trait FrameReader: Send + Sync {
    fn load(&self, path: &Path, index_dimension: &str) -> Result<MeasurementFrame, IngestError>;
}

/// Reads NetCDF measurement files: the index variable named by
/// `index_dimension` decoded through its CF `units` attribute, plus every
/// other numeric variable over that dimension.
pub struct NetcdfFrameReader;

impl FrameReader for NetcdfFrameReader {
    fn load(&self, path: &Path, index_dimension: &str) -> Result<MeasurementFrame, IngestError> {
        let frame_error = |message: String| IngestError::FrameLoad {
            path: path.display().to_string(),
            message,
        };

        let file = netcdf::open(path).map_err(|err| frame_error(err.to_string()))?;
        let index_var = file
            .variable(index_dimension)
            .ok_or_else(|| frame_error(format!("missing index coordinate {index_dimension}")))?;
        let raw_index: Vec<f64> = index_var
            .get_values(..)
            .map_err(|err| frame_error(err.to_string()))?;
        let units = index_var
            .attribute("units")
            .and_then(|attr| attr.value().ok())
            .and_then(|value| match value {
                netcdf::AttributeValue::Str(text) => Some(text),
                _ => None,
            })
            .ok_or_else(|| frame_error(format!("{index_dimension} has no units attribute")))?;
        let index = decode_cf_time(&raw_index, &units).map_err(frame_error)?;

        let mut variables = BTreeMap::new();
        for var in file.variables() {
            let name = var.name();
            if name == index_dimension {
                continue;
            }
            let dims = var.dimensions();
            if dims.len() != 1 || dims[0].name() != index_dimension {
                continue;
            }
            match var.get_values::<f64, _>(..) {
                Ok(values) => {
                    variables.insert(name, values);
                }
                Err(err) => {
                    // Non-numeric variables (flags, strings) are not part
                    // of the measurement set.
                    debug!(variable = %name, error = %err, "skipping variable");
                }
            }
        }

        let frame = MeasurementFrame { index, variables };
        frame.check().map_err(frame_error)?;
        Ok(frame)
    }
}

/// Decode CF-convention time values: `"<unit> since <epoch>"` applied to
/// each raw value.
pub fn decode_cf_time(values: &[f64], units: &str) -> Result<Vec<DateTime<Utc>>, String> {
    let pattern = Regex::new(
        r"^\s*(seconds|milliseconds|microseconds|minutes|hours|days)\s+since\s+(.+?)\s*$",
    )
    .map_err(|err| err.to_string())?;
    let captures = pattern
        .captures(units)
        .ok_or_else(|| format!("unsupported time units: {units}"))?;
    let unit = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    let epoch_text = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
    let epoch = parse_epoch(epoch_text)?;

    let micros_per_unit: f64 = match unit {
        "microseconds" => 1.0,
        "milliseconds" => 1e3,
        "seconds" => 1e6,
        "minutes" => 60.0 * 1e6,
        "hours" => 3_600.0 * 1e6,
        "days" => 86_400.0 * 1e6,
        other => return Err(format!("unsupported time unit: {other}")),
    };

    values
        .iter()
        .map(|value| {
            if !value.is_finite() {
                return Err(format!("non-finite time value: {value}"));
            }
            let micros = (value * micros_per_unit).round() as i64;
            Ok(epoch + Duration::microseconds(micros))
        })
        .collect()
}

fn parse_epoch(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    // ISO separator without an offset, common in NetCDF units.
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let midnight = parsed
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("unrepresentable epoch date: {text}"))?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(format!("unparseable epoch: {text}"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn decode_seconds_since_epoch() {
        let decoded = decode_cf_time(&[0.0, 1.5], "seconds since 2000-01-01 00:00:00").unwrap();
        assert_eq!(decoded[0], Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            decoded[1],
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 1).unwrap() + Duration::milliseconds(500)
        );
    }

    #[test]
    fn decode_iso_separator_epoch_without_offset() {
        let decoded = decode_cf_time(&[60.0], "seconds since 2000-01-01T00:00:00").unwrap();
        assert_eq!(decoded[0], Utc.with_ymd_and_hms(2000, 1, 1, 0, 1, 0).unwrap());
    }

    #[test]
    fn decode_days_since_date() {
        let decoded = decode_cf_time(&[31.0], "days since 2024-09-01").unwrap();
        assert_eq!(decoded[0], Utc.with_ymd_and_hms(2024, 10, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn decode_rejects_unknown_units() {
        assert!(decode_cf_time(&[0.0], "fortnights since 2000-01-01").is_err());
        assert!(decode_cf_time(&[f64::NAN], "seconds since 2000-01-01").is_err());
    }

    #[test]
    fn frame_check_catches_length_mismatch() {
        let frame = MeasurementFrame {
            index: vec![Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap()],
            variables: BTreeMap::from([("range".to_string(), vec![1.0, 2.0])]),
        };
        assert!(frame.check().is_err());
    }

    #[test]
    fn frame_check_catches_unsorted_index() {
        let t0 = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 1).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
        let frame = MeasurementFrame {
            index: vec![t0, t1],
            variables: BTreeMap::new(),
        };
        assert!(frame.check().is_err());
    }
}
