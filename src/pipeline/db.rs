//! Row store collaborators
//!
//! The pipeline reads accounts from one tab and upserts metric rows into
//! another. Both sides sit behind async traits; `SqliteSheetStore` is the
//! bundled adapter, keeping each tab as JSON rows in SQLite.
//!
//! Schema: `/sql/01_sheet_rows.sql`

use super::types::{Account, AggregatedRow, MetricField};
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const SHEET_ROWS_SCHEMA: &str = include_str!("../../sql/01_sheet_rows.sql");

const TOKEN_HEADERS: [&str; 3] = ["token", "access_token", "bearer_token"];
const ACCOUNT_HEADERS: [&str; 5] = ["account", "account_id", "name", "nickname", "id"];

/// One tab row: normalized column name -> cell
pub type SheetRow = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RowStoreError {
    #[error("row store database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("row payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("row store lock poisoned")]
    Poisoned,

    #[error("row store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only source of the accounts to track
#[async_trait]
pub trait AccountSource: Send + Sync {
    async fn load_accounts(&self) -> Result<Vec<Account>, RowStoreError>;
}

/// Destination for aggregated rows, upserted by post id
#[async_trait]
pub trait RowStoreWriter: Send + Sync {
    /// Returns the number of rows written
    async fn upsert_rows(&self, rows: Vec<AggregatedRow>) -> Result<usize, RowStoreError>;
}

/// SQLite-backed tabs
///
/// Operations lock a single connection; WAL mode is enabled on open.
pub struct SqliteSheetStore {
    conn: Arc<Mutex<Connection>>,
    accounts_tab: String,
    metrics_tab: String,
}

impl SqliteSheetStore {
    pub fn open(
        path: impl AsRef<Path>,
        accounts_tab: &str,
        metrics_tab: &str,
    ) -> Result<Self, RowStoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::info!("📊 Opened sheet store at {}", path.as_ref().display());
        Self::with_connection(conn, accounts_tab, metrics_tab)
    }

    pub fn open_in_memory(accounts_tab: &str, metrics_tab: &str) -> Result<Self, RowStoreError> {
        Self::with_connection(Connection::open_in_memory()?, accounts_tab, metrics_tab)
    }

    fn with_connection(
        conn: Connection,
        accounts_tab: &str,
        metrics_tab: &str,
    ) -> Result<Self, RowStoreError> {
        conn.execute_batch(SHEET_ROWS_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            accounts_tab: accounts_tab.to_string(),
            metrics_tab: metrics_tab.to_string(),
        })
    }

    pub fn accounts_tab(&self) -> &str {
        &self.accounts_tab
    }

    pub fn metrics_tab(&self) -> &str {
        &self.metrics_tab
    }

    /// Upsert keyed rows into `tab` in one transaction
    pub fn put_rows(&self, tab: &str, rows: &[(String, SheetRow)]) -> Result<usize, RowStoreError> {
        let mut conn = self.conn.lock().map_err(|_| RowStoreError::Poisoned)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO sheet_rows (tab, row_key, payload) VALUES (?1, ?2, ?3)
                ON CONFLICT(tab, row_key) DO UPDATE SET payload = excluded.payload
                "#,
            )?;
            for (key, row) in rows {
                let payload = serde_json::to_string(row)?;
                stmt.execute(rusqlite::params![tab, key, payload])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Rows of `tab` in insertion order, keys normalized
    pub fn read_rows(&self, tab: &str) -> Result<Vec<SheetRow>, RowStoreError> {
        let conn = self.conn.lock().map_err(|_| RowStoreError::Poisoned)?;
        let mut stmt = conn.prepare("SELECT payload FROM sheet_rows WHERE tab = ?1 ORDER BY rowid")?;
        let payloads = stmt
            .query_map([tab], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|payload| -> Result<SheetRow, RowStoreError> {
                let raw: SheetRow = serde_json::from_str(payload)?;
                Ok(raw
                    .into_iter()
                    .map(|(key, value)| (normalize_header(&key), value))
                    .collect())
            })
            .collect()
    }
}

#[async_trait]
impl AccountSource for SqliteSheetStore {
    async fn load_accounts(&self) -> Result<Vec<Account>, RowStoreError> {
        let rows = self.read_rows(&self.accounts_tab)?;
        let total = rows.len();
        let accounts: Vec<Account> = rows.iter().filter_map(account_from_row).collect();

        if accounts.len() < total {
            log::warn!(
                "⚠️  Skipped {} rows in {} without an account id and token",
                total - accounts.len(),
                self.accounts_tab
            );
        }
        Ok(accounts)
    }
}

#[async_trait]
impl RowStoreWriter for SqliteSheetStore {
    async fn upsert_rows(&self, rows: Vec<AggregatedRow>) -> Result<usize, RowStoreError> {
        let keyed: Vec<(String, SheetRow)> = rows
            .iter()
            .map(|row| (row.post_id.clone(), metrics_row(row)))
            .collect();
        let written = self.put_rows(&self.metrics_tab, &keyed)?;
        log::debug!("Upserted {} rows into {}", written, self.metrics_tab);
        Ok(written)
    }
}

/// Lower-case a column header and turn inner whitespace into `_`
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Build an account from a normalized tab row; `None` if either the id or
/// the token is missing
pub fn account_from_row(row: &SheetRow) -> Option<Account> {
    let token = first_cell(row, &TOKEN_HEADERS)?;
    let account_id = first_cell(row, &ACCOUNT_HEADERS)?;
    Some(Account { account_id, token })
}

fn first_cell(row: &SheetRow, headers: &[&str]) -> Option<String> {
    headers.iter().find_map(|header| {
        let text = match row.get(*header)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

/// Destination columns for one aggregated row; unset metrics stay null
fn metrics_row(row: &AggregatedRow) -> SheetRow {
    let mut cells = SheetRow::new();
    cells.insert("post_id".to_string(), Value::from(row.post_id.clone()));
    cells.insert("account".to_string(), Value::from(row.account_id.clone()));
    cells.insert(
        "permalink".to_string(),
        row.permalink.clone().map_or(Value::Null, Value::from),
    );
    for field in MetricField::ALL {
        cells.insert(
            field.as_str().to_string(),
            row.metrics.get(field).map_or(Value::Null, Value::from),
        );
    }
    cells.insert("updated_at".to_string(), Value::from(row.updated_at.to_rfc3339()));
    cells
}
