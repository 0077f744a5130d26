use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// EUMETSAT Data Store collection identifier, e.g. `EO:EUM:DAT:0415`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
            return Err(IngestError::InvalidCollectionId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Opaque remote product identifier, usable as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductId(String);

impl ProductId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && !normalized.contains('/')
            && !normalized.contains("..")
            && normalized.chars().all(|ch| !ch.is_whitespace());
        if !is_valid {
            return Err(IngestError::InvalidProductId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// One catalog entry: where to download from and when it was sensed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductDescriptor {
    pub id: ProductId,
    pub sensing_start: DateTime<Utc>,
    pub title: String,
}

/// Inclusive sensing-time window, matching the catalog's `dtstart`/`dtend`
/// filter semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, IngestError> {
        if start > end {
            return Err(IngestError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// Calendar-month partition key over the index coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    /// Relative directory path of this partition, `year=YYYY/month=MM`.
    pub fn relative_path(&self) -> String {
        format!("year={}/month={:02}", self.year, self.month)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Derive the partition key for one index value. Pure.
pub fn partition_key(instant: DateTime<Utc>) -> PartitionKey {
    PartitionKey {
        year: instant.year(),
        month: instant.month(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parse_collection_id_valid() {
        let id: CollectionId = " EO:EUM:DAT:0415 ".parse().unwrap();
        assert_eq!(id.as_str(), "EO:EUM:DAT:0415");
    }

    #[test]
    fn parse_collection_id_invalid() {
        let err = "  ".parse::<CollectionId>().unwrap_err();
        assert_matches!(err, IngestError::InvalidCollectionId(_));
    }

    #[test]
    fn parse_product_id_rejects_path_separators() {
        let err = "a/b".parse::<ProductId>().unwrap_err();
        assert_matches!(err, IngestError::InvalidProductId(_));
        let err = "..".parse::<ProductId>().unwrap_err();
        assert_matches!(err, IngestError::InvalidProductId(_));
    }

    #[test]
    fn time_range_rejects_inverted_bounds() {
        let start = Utc.with_ymd_and_hms(2024, 9, 25, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 9, 23, 0, 0, 0).unwrap();
        let err = TimeRange::new(start, end).unwrap_err();
        assert_matches!(err, IngestError::InvalidRange { .. });
    }

    #[test]
    fn partition_key_month_boundary() {
        let mid = Utc.with_ymd_and_hms(2024, 9, 15, 12, 0, 0).unwrap();
        assert_eq!(
            partition_key(mid),
            PartitionKey {
                year: 2024,
                month: 9
            }
        );

        let boundary = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(
            partition_key(boundary),
            PartitionKey {
                year: 2024,
                month: 10
            }
        );
    }

    #[test]
    fn partition_key_path_is_zero_padded() {
        let key = PartitionKey {
            year: 2024,
            month: 9,
        };
        assert_eq!(key.relative_path(), "year=2024/month=09");
    }
}
