#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use askdb_domain::{CellValue, DomainError, QueryResult, SchemaField};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("unable to open database {path}: {source}")]
    Connection {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("no such table: {0}")]
    UnknownTable(String),
    #[error("catalog query failed: {0}")]
    Catalog(#[source] rusqlite::Error),
    #[error("{0}")]
    Execution(#[source] rusqlite::Error),
    #[error("{0}")]
    Shape(#[from] DomainError),
}

/// Catalog access: which entities exist and what their fields look like.
pub trait SchemaInspector {
    /// # Errors
    /// Returns an error when the dataset cannot be reached or the catalog cannot be read.
    fn list_tables(&self) -> Result<Vec<String>, DatasetError>;

    /// # Errors
    /// Returns [`DatasetError::UnknownTable`] when `table` does not exist.
    fn describe_table(&self, table: &str) -> Result<Vec<SchemaField>, DatasetError>;
}

pub trait QueryExecutor {
    /// Execute `sql` and collect every row in projection order.
    ///
    /// # Errors
    /// Returns [`DatasetError::Execution`] for malformed statements or unknown
    /// tables/columns.
    fn run_query(&self, sql: &str) -> Result<QueryResult, DatasetError>;
}

/// A SQLite file opened afresh for every call.
#[derive(Debug, Clone)]
pub struct SqliteDataset {
    db_path: PathBuf,
}

impl SqliteDataset {
    #[must_use]
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    // No CREATE flag: a missing file is a connection failure, not an empty dataset.
    fn connect(&self) -> Result<Connection, DatasetError> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| DatasetError::Connection {
            path: self.db_path.display().to_string(),
            source,
        })
    }
}

impl SchemaInspector for SqliteDataset {
    fn list_tables(&self) -> Result<Vec<String>, DatasetError> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            )
            .map_err(DatasetError::Catalog)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(DatasetError::Catalog)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatasetError::Catalog)?;
        tracing::debug!(tables = names.len(), "listed dataset tables");
        Ok(names)
    }

    fn describe_table(&self, table: &str) -> Result<Vec<SchemaField>, DatasetError> {
        let conn = self.connect()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE LIMIT 1",
                params![table],
                |_| Ok(()),
            )
            .optional()
            .map_err(DatasetError::Catalog)?;
        if exists.is_none() {
            return Err(DatasetError::UnknownTable(table.to_string()));
        }

        let mut stmt = conn
            .prepare(
                "SELECT name, type, \"notnull\", dflt_value, pk \
                 FROM pragma_table_info(?1) ORDER BY cid",
            )
            .map_err(DatasetError::Catalog)?;
        let fields = stmt
            .query_map(params![table], |row| {
                Ok(SchemaField {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                    notnull: row.get::<_, i64>(2)? != 0,
                    default: row.get(3)?,
                    primary_key: row.get::<_, i64>(4)? != 0,
                })
            })
            .map_err(DatasetError::Catalog)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatasetError::Catalog)?;
        Ok(fields)
    }
}

impl QueryExecutor for SqliteDataset {
    fn run_query(&self, sql: &str) -> Result<QueryResult, DatasetError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql).map_err(DatasetError::Execution)?;
        let columns: Vec<String> = stmt
            .column_names()
            .iter()
            .map(ToString::to_string)
            .collect();
        let column_count = columns.len();

        let mut result = QueryResult::new(columns);
        let mut rows = stmt.query([]).map_err(DatasetError::Execution)?;
        while let Some(row) = rows.next().map_err(DatasetError::Execution)? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                let value = row.get_ref(index).map_err(DatasetError::Execution)?;
                values.push(cell_from_sql(value));
            }
            result.push_row(values)?;
        }
        tracing::debug!(rows = result.len(), "query executed");
        Ok(result)
    }
}

fn cell_from_sql(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(value) => CellValue::Integer(value),
        // JSON has no infinity or NaN; keep them readable instead of collapsing to null.
        ValueRef::Real(value) if !value.is_finite() => CellValue::Text(value.to_string()),
        ValueRef::Real(value) => CellValue::Real(value),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Text(hex::encode(bytes)),
    }
}
