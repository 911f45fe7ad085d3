//! Chain catalog backed by a cached SQLite file.

use super::fetch::{fetch_cached_file, Transport};
use super::metadata::ChainMetadata;
use crate::error::{ChainError, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Public catalog of recorded chains.
pub const DEFAULT_CATALOG_URL: &str = "http://chains.mggg.org.s3-website-us-east-1.amazonaws.com/";

/// Catalog file name under the base URL and in the cache directory.
const CATALOG_FILE: &str = "chains.db";

const TABLE: &str = "chains";

/// Catalog-local primary key; never part of a chain's metadata.
const ROW_ID: &str = "id";

/// Rows fetched per cursor page.
const PAGE_SIZE: usize = 64;

/// Catalog configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Base URL serving `chains.db` and the chain archives.
    pub url: String,

    /// Where the catalog is cached.
    pub cache_dir: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
            cache_dir: std::env::temp_dir(),
        }
    }
}

/// Equality filter over catalog columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChainFilter {
    conditions: BTreeMap<String, Value>,
}

impl ChainFilter {
    /// Matches every chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `column == value`.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(column.into(), value.into());
        self
    }

    pub fn identifier(identifier: impl Into<String>) -> Self {
        let identifier: String = identifier.into();
        Self::new().eq("identifier", identifier)
    }
}

/// Read access to the chain catalog.
pub struct History {
    url: String,
    path: PathBuf,
    conn: Connection,
}

impl History {
    /// Refresh the cached catalog from `config.url` and open it.
    pub fn open(config: &HistoryConfig, transport: &dyn Transport) -> Result<Self> {
        let url = normalize_url(&config.url);
        std::fs::create_dir_all(&config.cache_dir)?;
        let path = config.cache_dir.join(CATALOG_FILE);

        let outcome = fetch_cached_file(transport, &format!("{url}{CATALOG_FILE}"), &path)?;
        debug!(?outcome, path = %path.display(), "catalog ready");

        Self::from_catalog(path, url)
    }

    /// Open a local catalog file; results are annotated with `url`.
    pub fn from_catalog(path: impl AsRef<Path>, url: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        Ok(Self {
            url: normalize_url(url.as_ref()),
            path,
            conn,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All chains matching `filter`, read lazily in rowid order.
    ///
    /// A filter on a column the catalog does not have matches nothing.
    pub fn search(&self, filter: &ChainFilter) -> Result<ChainCursor<'_>> {
        let columns = self.columns()?;

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut unknown = false;
        for (column, value) in &filter.conditions {
            if !columns.contains(column) {
                unknown = true;
                continue;
            }
            match to_sql(value) {
                Some(param) => {
                    clauses.push(format!("{} = ?", quote(column)));
                    params.push(param);
                }
                None => clauses.push(format!("{} IS NULL", quote(column))),
            }
        }
        clauses.push("rowid > ?".to_string());

        let sql = format!(
            "SELECT rowid AS _cursor_rowid, * FROM {} WHERE {} ORDER BY rowid LIMIT {}",
            TABLE,
            clauses.join(" AND "),
            PAGE_SIZE
        );

        Ok(ChainCursor {
            history: self,
            sql,
            params,
            last_rowid: i64::MIN,
            page: VecDeque::new(),
            exhausted: unknown || columns.is_empty(),
        })
    }

    /// First chain matching `filter`.
    pub fn search_one(&self, filter: &ChainFilter) -> Result<Option<ChainMetadata>> {
        self.search(filter)?.next().transpose()
    }

    /// Add a chain to the catalog, creating the table and any extension
    /// columns it needs.
    pub fn insert(&self, metadata: &ChainMetadata) -> Result<()> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT,
                filename TEXT,
                start_timestamp INTEGER,
                end_timestamp INTEGER,
                graph_hash TEXT,
                user TEXT
            )"
        ))?;

        let Value::Object(mut fields) = serde_json::to_value(metadata)? else {
            return Err(ChainError::Serialization(
                "chain metadata did not serialize to an object".into(),
            ));
        };
        fields.remove(ROW_ID);

        let columns = self.columns()?;
        for (name, value) in &fields {
            if !columns.contains(name) {
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {TABLE} ADD COLUMN {} {}",
                    quote(name),
                    column_type(value)
                ))?;
            }
        }

        let names: Vec<_> = fields.keys().map(|name| quote(name)).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        let values: Vec<SqlValue> = fields
            .values()
            .map(|value| to_sql(value).unwrap_or(SqlValue::Null))
            .collect();
        self.conn.execute(
            &format!(
                "INSERT INTO {TABLE} ({}) VALUES ({placeholders})",
                names.join(", ")
            ),
            params_from_iter(values),
        )?;
        Ok(())
    }

    fn columns(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT name FROM pragma_table_info('{TABLE}')"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }
}

/// Lazy iterator over catalog search results.
pub struct ChainCursor<'a> {
    history: &'a History,
    sql: String,
    params: Vec<SqlValue>,
    last_rowid: i64,
    page: VecDeque<Map<String, Value>>,
    exhausted: bool,
}

impl ChainCursor<'_> {
    fn fetch_page(&mut self) -> Result<()> {
        let history = self.history;
        let mut stmt = history.conn.prepare_cached(&self.sql)?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();

        let params = self
            .params
            .iter()
            .cloned()
            .chain(std::iter::once(SqlValue::Integer(self.last_rowid)));
        let mut rows = stmt.query(params_from_iter(params))?;

        let mut fetched = 0;
        while let Some(row) = rows.next()? {
            self.last_rowid = row.get(0)?;
            let mut fields = Map::new();
            for (i, name) in names.iter().enumerate().skip(1) {
                if name == ROW_ID {
                    continue;
                }
                let value = from_sql(row.get_ref(i)?);
                if !value.is_null() {
                    fields.insert(name.clone(), value);
                }
            }
            self.page.push_back(fields);
            fetched += 1;
        }

        if fetched < PAGE_SIZE {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Iterator for ChainCursor<'_> {
    type Item = Result<ChainMetadata>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let fields = self.page.pop_front()?;
        Some(
            serde_json::from_value::<ChainMetadata>(Value::Object(fields))
                .map(|mut metadata| {
                    metadata.url = Some(self.history.url.clone());
                    metadata
                })
                .map_err(Into::into),
        )
    }
}

fn normalize_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "BOOLEAN",
        Value::Number(n) if n.is_f64() => "REAL",
        Value::Number(_) => "INTEGER",
        _ => "TEXT",
    }
}

/// `None` for JSON null, which is matched with `IS NULL`.
fn to_sql(value: &Value) -> Option<SqlValue> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    })
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}
