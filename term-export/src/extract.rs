//! Shard extraction into staged files.
//!
//! [`BatchExtractor`] hands the shard's select statement to the bulk
//! transfer collaborator, which materializes it as exactly one file in the
//! staging area, replacing any earlier file at that path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{ExportError, Result};
use crate::shard::{ShardDescriptor, ShardPlan};
use crate::transfer::{join_remote, BulkTransfer};

/// Output encoding of extracted files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum OutputFormat {
    /// Delimited text.
    Csv { delimiter: u8, header: bool },
    Parquet,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Csv {
            delimiter: b',',
            header: true,
        }
    }
}

impl OutputFormat {
    /// Resolves a format name with its optional delimited-text settings.
    ///
    /// ```rust
    /// use term_export::extract::OutputFormat;
    ///
    /// let tsv = OutputFormat::parse("csv", Some("\t"), Some(false)).unwrap();
    /// assert_eq!(tsv, OutputFormat::Csv { delimiter: b'\t', header: false });
    /// assert!(OutputFormat::parse("xml", None, None).is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// [`ExportError::UnsupportedFormat`] for anything but `csv` or
    /// `parquet`; [`ExportError::Configuration`] for a delimiter that is not
    /// one ASCII character.
    pub fn parse(name: &str, delimiter: Option<&str>, header: Option<bool>) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "csv" => {
                let delimiter = match delimiter {
                    None => b',',
                    Some(d) if d.len() == 1 && d.is_ascii() => d.as_bytes()[0],
                    Some(d) => {
                        return Err(ExportError::Configuration(format!(
                            "delimiter must be a single ASCII character, got '{d}'"
                        )))
                    }
                };
                if matches!(delimiter, b'"' | b'\n' | b'\r') {
                    return Err(ExportError::Configuration(format!(
                        "delimiter {:?} conflicts with CSV quoting",
                        delimiter as char
                    )));
                }
                Ok(Self::Csv {
                    delimiter,
                    header: header.unwrap_or(true),
                })
            }
            "parquet" => Ok(Self::Parquet),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv { .. } => "csv",
            Self::Parquet => "parquet",
        }
    }

    /// Whether data rows can be counted from the file text.
    pub fn supports_row_count(&self) -> bool {
        matches!(self, Self::Csv { .. })
    }

    pub fn has_header(&self) -> bool {
        matches!(self, Self::Csv { header: true, .. })
    }
}

/// `<prefix>_<YYYYMMDD>_<HHMMSS>_<NNN>.<ext>`
pub fn output_file_name(
    prefix: &str,
    timestamp: DateTime<Utc>,
    shard_id: u32,
    format: &OutputFormat,
) -> String {
    format!(
        "{prefix}_{}_{shard_id:03}.{}",
        timestamp.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Materializes shards as staged files.
pub struct BatchExtractor {
    transfer: Arc<dyn BulkTransfer>,
    stage_prefix: String,
}

impl BatchExtractor {
    pub fn new(transfer: Arc<dyn BulkTransfer>, stage_prefix: impl Into<String>) -> Self {
        Self {
            transfer,
            stage_prefix: stage_prefix.into(),
        }
    }

    /// Extracts `shard` into `<stage>/<file_name>` and returns the staged
    /// path.
    ///
    /// # Errors
    ///
    /// [`ExportError::Extraction`] carrying the shard id when the bulk
    /// operation fails or produces no file.
    #[instrument(skip(self, plan, format), fields(shard_id = shard.shard_id))]
    pub async fn extract(
        &self,
        plan: &ShardPlan,
        shard: &ShardDescriptor,
        format: &OutputFormat,
        file_name: &str,
    ) -> Result<String> {
        let query = plan.extract_query(shard)?;
        let remote = join_remote(&self.stage_prefix, file_name);
        debug!(predicate = %shard.predicate(), remote = %remote, "Extracting shard");

        let files = self
            .transfer
            .bulk_extract(&query, format, &remote)
            .await
            .map_err(|e| {
                ExportError::extraction_with_source(shard.shard_id, "bulk extract failed", e)
            })?;

        files.into_iter().next().ok_or_else(|| {
            ExportError::extraction(shard.shard_id, "bulk extract produced no files")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_formats() {
        assert_eq!(OutputFormat::parse("CSV", None, None).unwrap(), OutputFormat::default());
        assert_eq!(OutputFormat::parse("parquet", Some(";"), None).unwrap(), OutputFormat::Parquet);

        let err = OutputFormat::parse("xlsx", None, None).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFormatError");
        assert!(OutputFormat::parse("csv", Some("||"), None).is_err());
        assert!(OutputFormat::parse("csv", Some("\""), None).is_err());
    }

    #[test]
    fn test_format_capabilities() {
        let csv = OutputFormat::parse("csv", Some("|"), Some(false)).unwrap();
        assert!(csv.supports_row_count());
        assert!(!csv.has_header());
        assert_eq!(csv.extension(), "csv");
        assert!(!OutputFormat::Parquet.supports_row_count());
    }

    #[test]
    fn test_output_file_name() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            output_file_name("orders", ts, 7, &OutputFormat::default()),
            "orders_20240309_070501_007.csv"
        );
        assert_eq!(
            output_file_name("orders", ts, 123, &OutputFormat::Parquet),
            "orders_20240309_070501_123.parquet"
        );
    }
}
