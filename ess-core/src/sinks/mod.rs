//! Concrete [`Sink`] implementations, grounded on `LogHandlerFile` in
//! `original_source/logger.py`: an appended text file, one line per
//! flushed record, flushed to disk after every write.

use async_trait::async_trait;
use chrono::SecondsFormat;
use ess_contracts::sink::Sink;
use ess_model::error::{EssError, Result};
use ess_model::record::{FieldValue, PartialRecord};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

fn field_text(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{v}"),
        FieldValue::Int(v) => format!("{v}"),
        FieldValue::Str(v) => v.clone(),
        FieldValue::Bool(v) => format!("{v}"),
        FieldValue::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

/// Appends one comma-separated line per flushed record to a file, columns
/// fixed at construction time (missing fields render as `~`, matching
/// `MyFormatter`'s `missing` placeholder).
pub struct FileSink {
    label: String,
    columns: Vec<String>,
    file: File,
}

impl FileSink {
    pub async fn create(path: impl AsRef<std::path::Path>, columns: Vec<String>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path).await.map_err(EssError::Io)?;
        let label = format!("FileSink:{}", path.file_name().and_then(|n| n.to_str()).unwrap_or("unknown"));
        Ok(Self { label, columns, file })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn label(&self) -> &str {
        &self.label
    }

    async fn write_rec(&mut self, record: &PartialRecord) -> Result<()> {
        let missing = "~";
        let line: Vec<String> = self
            .columns
            .iter()
            .map(|col| record.fields.get(col).map(field_text).unwrap_or_else(|| missing.to_string()))
            .collect();
        let row = format!("{}\n", line.join(","));
        self.file.write_all(row.as_bytes()).await.map_err(EssError::Io)?;
        self.file.flush().await.map_err(EssError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn missing_fields_render_as_placeholder() {
        let dir = std::env::temp_dir().join(format!("ess-filesink-test-{}", uuid::Uuid::new_v4()));
        let mut sink = FileSink::create(&dir, vec!["timestamp".to_string(), "bme_temp1".to_string()]).await.unwrap();
        let record = PartialRecord::with_timestamp(Utc::now());
        sink.write_rec(&record).await.unwrap();
        let contents = tokio::fs::read_to_string(&dir).await.unwrap();
        assert!(contents.trim_end().ends_with(",~"));
        tokio::fs::remove_file(&dir).await.ok();
    }
}
