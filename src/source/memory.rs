use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tokio_stream::Stream;

use crate::error::{PoolError, Result};
use crate::scheduler::{Column, Row};
use crate::source::{DataSource, RowColumns};

/// Data source holding every value in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: BTreeMap<Row, BTreeMap<Column, Vec<u8>>>,
    required: BTreeSet<Column>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required(mut self, columns: impl IntoIterator<Item = impl Into<Column>>) -> Self {
        self.required = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn insert(
        &mut self,
        row: impl Into<Row>,
        column: impl Into<Column>,
        value: impl Into<Vec<u8>>,
    ) {
        self.rows
            .entry(row.into())
            .or_default()
            .insert(column.into(), value.into());
    }

    pub fn with_value(
        mut self,
        row: impl Into<Row>,
        column: impl Into<Column>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.insert(row, column, value);
        self
    }

    /// Loads a JSON object of the form `{"row": {"column": "value"}}`.
    ///
    /// Values are served as their UTF-8 bytes.
    pub async fn from_json_file(
        path: impl AsRef<Path>,
        required: impl IntoIterator<Item = impl Into<Column>>,
    ) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let parsed: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(&raw)?;

        let mut source = Self::new().with_required(required);
        for (row, columns) in parsed {
            for (column, value) in columns {
                source.insert(row.as_str(), column, value.into_bytes());
            }
        }
        tracing::info!(
            path = %path.as_ref().display(),
            rows = source.len(),
            "Loaded data source"
        );
        Ok(source)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl DataSource for MemorySource {
    fn rows(&self) -> impl Stream<Item = Result<RowColumns>> + Send + '_ {
        tokio_stream::iter(
            self.rows
                .iter()
                .map(|(row, columns)| Ok((row.clone(), columns.keys().cloned().collect()))),
        )
    }

    async fn columns(&self, row: &Row) -> Result<BTreeSet<Column>> {
        self.rows
            .get(row)
            .map(|columns| columns.keys().cloned().collect())
            .ok_or_else(|| PoolError::NotFound(format!("row {row}")))
    }

    async fn value(&self, row: &Row, column: &Column) -> Result<Vec<u8>> {
        self.rows
            .get(row)
            .and_then(|columns| columns.get(column))
            .cloned()
            .ok_or_else(|| PoolError::NotFound(format!("value {row}/{column}")))
    }

    fn required_columns(&self) -> BTreeSet<Column> {
        self.required.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn enumerates_rows_with_columns() {
        let source = MemorySource::new()
            .with_required(["image"])
            .with_value("r1", "image", "a")
            .with_value("r1", "label", "b")
            .with_value("r2", "label", "c");

        let rows: Vec<RowColumns> = source.rows().map(|r| r.unwrap()).collect().await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, Row::from("r1"));
        assert_eq!(rows[0].1.len(), 2);
        assert_eq!(
            source.required_columns(),
            BTreeSet::from([Column::from("image")])
        );
    }

    #[tokio::test]
    async fn missing_values_are_not_found() {
        let source = MemorySource::new().with_value("r1", "image", "a");

        assert_eq!(
            source
                .value(&Row::from("r1"), &Column::from("image"))
                .await
                .unwrap(),
            b"a".to_vec()
        );
        assert!(matches!(
            source.value(&Row::from("r1"), &Column::from("x")).await,
            Err(PoolError::NotFound(_))
        ));
        assert!(matches!(
            source.columns(&Row::from("r9")).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn loads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"r1": {{"image": "http://x/1.jpg"}}, "r2": {{"image": "http://x/2.jpg", "hint": "cat"}}}}"#
        )
        .unwrap();

        let source = MemorySource::from_json_file(file.path(), ["image"])
            .await
            .unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(
            source
                .value(&Row::from("r2"), &Column::from("hint"))
                .await
                .unwrap(),
            b"cat".to_vec()
        );
    }
}
