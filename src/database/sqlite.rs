use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection, QueryBuilder, Sqlite};
use std::str::FromStr;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::dialect::{SqlDialect, SqliteDialect};
use super::{
    blocking_runtime, check_compatible, check_engine, AdapterState, DatabaseAdapter,
    DatabaseConfig, DatabaseError, DatabaseResult, DatabaseType, DatabaseValue, ExistingColumn,
    InsertOutcome, Session, DEFAULT_CHUNK_SIZE,
};
use crate::normalizer::RecordSet;
use crate::schema::{ColumnType, Schema};

const IN_MEMORY: &str = ":memory:";

struct SqliteSession {
    runtime: Runtime,
    conn: SqliteConnection,
}

/// Embedded SQLite implementation of the load contract.
///
/// The descriptor's database is a file path, created when missing, or
/// `:memory:` for a private in-memory database that lives as long as the
/// session.
pub struct SqliteAdapter {
    session: Session<SqliteSession>,
    chunk_size: usize,
}

impl SqliteAdapter {
    pub fn new() -> Self {
        Self {
            session: Session::Unconnected,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Read back every row of `table`, decoded with `schema`'s types.
    #[cfg(test)]
    pub(crate) fn fetch_rows(
        &mut self,
        table: &str,
        schema: &Schema,
    ) -> DatabaseResult<Vec<Vec<DatabaseValue>>> {
        use sqlx::Row;

        let SqliteSession { runtime, conn } = self.session.active("fetch_rows")?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY rowid",
            SqliteDialect.quote_identifier(table)
        );
        let rows = runtime
            .block_on(sqlx::query(&sql).fetch_all(&mut *conn))
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let decode = |e: sqlx::Error| DatabaseError::Query(e.to_string());
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(schema.len());
            for (idx, column) in schema.columns().iter().enumerate() {
                let value = match column.column_type {
                    ColumnType::Boolean => row
                        .try_get::<Option<bool>, _>(idx)
                        .map_err(decode)?
                        .map(DatabaseValue::Boolean),
                    ColumnType::Integer => row
                        .try_get::<Option<i64>, _>(idx)
                        .map_err(decode)?
                        .map(DatabaseValue::Integer),
                    ColumnType::Float => row
                        .try_get::<Option<f64>, _>(idx)
                        .map_err(decode)?
                        .map(DatabaseValue::Float),
                    ColumnType::String => row
                        .try_get::<Option<String>, _>(idx)
                        .map_err(decode)?
                        .map(DatabaseValue::Text),
                };
                values.push(value.unwrap_or(DatabaseValue::Null));
            }
            out.push(values);
        }
        Ok(out)
    }
}

impl Default for SqliteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn connect_options(config: &DatabaseConfig) -> DatabaseResult<SqliteConnectOptions> {
    let mut options = if config.database() == IN_MEMORY {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::Configuration(e.to_string()))?
    } else {
        SqliteConnectOptions::new()
            .filename(config.database())
            .create_if_missing(true)
    };

    for (key, value) in config.options() {
        options = match key.as_str() {
            "journal_mode" => {
                let mode = value.parse::<SqliteJournalMode>().map_err(|e| {
                    DatabaseError::Configuration(format!("invalid journal_mode '{}': {}", value, e))
                })?;
                options.journal_mode(mode)
            }
            other => {
                return Err(DatabaseError::Configuration(format!(
                    "unsupported sqlite option '{}'",
                    other
                )))
            }
        };
    }

    Ok(options.disable_statement_logging())
}

fn push_value(
    row: &mut Separated<'_, '_, Sqlite, &'static str>,
    value: &DatabaseValue,
    column_type: ColumnType,
) {
    match value {
        DatabaseValue::Null => match column_type {
            ColumnType::Boolean => row.push_bind(None::<bool>),
            ColumnType::Integer => row.push_bind(None::<i64>),
            ColumnType::Float => row.push_bind(None::<f64>),
            ColumnType::String => row.push_bind(None::<String>),
        },
        DatabaseValue::Boolean(b) => row.push_bind(*b),
        DatabaseValue::Integer(i) => row.push_bind(*i),
        DatabaseValue::Float(f) => row.push_bind(*f),
        DatabaseValue::Text(s) => row.push_bind(s.clone()),
    };
}

async fn existing_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<Vec<ExistingColumn>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(SqliteDialect.columns_query())
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, native)| ExistingColumn { name, native })
        .collect())
}

async fn insert_rows(
    conn: &mut SqliteConnection,
    table: &str,
    records: &RecordSet,
    rows_per_statement: usize,
) -> Result<(), sqlx::Error> {
    let schema = records.schema();
    let prefix = SqliteDialect.generate_insert_prefix(table, schema);
    let mut tx = conn.begin().await?;

    for chunk in records.rows().chunks(rows_per_statement) {
        let mut builder = QueryBuilder::<Sqlite>::new(&prefix);
        builder.push_values(chunk, |mut row, values| {
            for (value, column) in values.iter().zip(schema.columns()) {
                push_value(&mut row, value, column.column_type);
            }
        });

        let executed = builder.build().execute(&mut *tx).await;
        if let Err(e) = executed {
            if let Err(rollback) = tx.rollback().await {
                warn!("rollback after failed insert also failed: {}", rollback);
            }
            return Err(e);
        }
    }

    tx.commit().await
}

impl DatabaseAdapter for SqliteAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn state(&self) -> AdapterState {
        self.session.state()
    }

    fn connect(&mut self, config: &DatabaseConfig) -> DatabaseResult<()> {
        self.session.check_connectable(DatabaseType::Sqlite)?;
        check_engine(DatabaseType::Sqlite, config)?;

        let options = connect_options(config)?;
        let runtime = blocking_runtime()?;
        let conn = runtime
            .block_on(options.connect())
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        info!(database = config.database(), "opened sqlite database");
        self.session.open(SqliteSession { runtime, conn });
        Ok(())
    }

    fn ensure_target(&mut self, name: &str, schema: &Schema) -> DatabaseResult<bool> {
        let SqliteSession { runtime, conn } = self.session.active("ensure_target")?;

        let existing = runtime
            .block_on(existing_columns(conn, name))
            .map_err(|e| DatabaseError::Query(format!("failed to inspect '{}': {}", name, e)))?;

        if !existing.is_empty() {
            check_compatible(name, &existing, schema, &SqliteDialect)?;
            debug!(table = name, "table already exists with a compatible shape");
            return Ok(false);
        }

        let sql = SqliteDialect.generate_create_table_sql(name, schema);
        debug!(dialect = SqliteDialect.name(), sql = %sql, "creating table");
        runtime
            .block_on(sqlx::query(&sql).execute(&mut *conn))
            .map_err(|e| DatabaseError::Query(format!("failed to create '{}': {}", name, e)))?;
        info!(table = name, columns = schema.len(), "created table");
        Ok(true)
    }

    fn insert_batch(&mut self, name: &str, records: &RecordSet) -> DatabaseResult<InsertOutcome> {
        let rows_per_statement =
            SqliteDialect.rows_per_statement(self.chunk_size, records.schema().len());
        let SqliteSession { runtime, conn } = self.session.active("insert_batch")?;

        if records.is_empty() {
            return Ok(InsertOutcome::complete(0));
        }

        debug!(table = name, rows = records.len(), rows_per_statement, "inserting batch");
        runtime
            .block_on(insert_rows(conn, name, records, rows_per_statement))
            .map_err(|e| DatabaseError::Insert {
                inserted: 0,
                partial: false,
                cause: e.to_string(),
            })?;

        Ok(InsertOutcome::complete(records.len()))
    }

    fn count_rows(&mut self, name: &str) -> DatabaseResult<u64> {
        let SqliteSession { runtime, conn } = self.session.active("count_rows")?;
        let sql = SqliteDialect.generate_count_sql(name);
        let count: i64 = runtime
            .block_on(sqlx::query_scalar(&sql).fetch_one(&mut *conn))
            .map_err(|e| DatabaseError::Query(format!("failed to count '{}': {}", name, e)))?;
        Ok(count.max(0) as u64)
    }

    fn ping(&mut self) -> DatabaseResult<()> {
        let SqliteSession { runtime, conn } = self.session.active("ping")?;
        runtime
            .block_on(conn.ping())
            .map_err(|e| DatabaseError::Connection(format!("Failed to ping database: {}", e)))
    }

    fn close(&mut self) -> DatabaseResult<()> {
        let Some(SqliteSession { runtime, conn }) = self.session.release() else {
            return Ok(());
        };
        let result = runtime.block_on(conn.close());
        info!("closed sqlite database");
        result.map_err(|e| DatabaseError::Connection(format!("failed to close connection: {}", e)))
    }
}

impl Drop for SqliteAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing sqlite adapter on drop: {}", e);
        }
    }
}
