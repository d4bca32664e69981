use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::query_builder::Separated;
use sqlx::{ConnectOptions, Connection, Postgres, QueryBuilder};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use super::dialect::{PostgresDialect, SqlDialect};
use super::{
    blocking_runtime, check_compatible, check_engine, AdapterState, DatabaseAdapter,
    DatabaseConfig, DatabaseError, DatabaseResult, DatabaseType, DatabaseValue, ExistingColumn,
    InsertOutcome, Session, DEFAULT_CHUNK_SIZE,
};
use crate::logging::{redact, register_config_for_redaction};
use crate::normalizer::RecordSet;
use crate::schema::{ColumnType, Schema};

struct PgSession {
    runtime: Runtime,
    conn: PgConnection,
}

/// PostgreSQL implementation of the load contract
///
/// Holds one connection (not a pool) for the whole run.
pub struct PostgresAdapter {
    session: Session<PgSession>,
    chunk_size: usize,
}

impl PostgresAdapter {
    pub fn new() -> Self {
        Self {
            session: Session::Unconnected,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Rows per `INSERT` statement; still capped by the bind-parameter limit
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build driver options from a descriptor.
///
/// `sslmode` and `application_name` map to their typed setters; any other
/// option is forwarded as a server runtime parameter.
fn connect_options(config: &DatabaseConfig) -> DatabaseResult<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(config.host())
        .port(config.port())
        .username(config.username())
        .password(config.password().expose_secret())
        .database(config.database());

    for (key, value) in config.options() {
        options = match key.as_str() {
            "sslmode" => {
                let mode = value.parse::<PgSslMode>().map_err(|e| {
                    DatabaseError::Configuration(format!("invalid sslmode '{}': {}", value, e))
                })?;
                options.ssl_mode(mode)
            }
            "application_name" => options.application_name(value),
            _ => options.options([(key.as_str(), value.as_str())]),
        };
    }

    Ok(options.disable_statement_logging())
}

fn push_value(
    row: &mut Separated<'_, '_, Postgres, &'static str>,
    value: &DatabaseValue,
    column_type: ColumnType,
) {
    match value {
        // Postgres parameters are typed, so NULL takes the column's type
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
    conn: &mut PgConnection,
    table: &str,
) -> Result<Vec<ExistingColumn>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(PostgresDialect.columns_query())
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, native)| ExistingColumn { name, native })
        .collect())
}

async fn insert_rows(
    conn: &mut PgConnection,
    table: &str,
    records: &RecordSet,
    rows_per_statement: usize,
) -> Result<(), sqlx::Error> {
    let schema = records.schema();
    let prefix = PostgresDialect.generate_insert_prefix(table, schema);
    let mut tx = conn.begin().await?;

    for chunk in records.rows().chunks(rows_per_statement) {
        let mut builder = QueryBuilder::<Postgres>::new(&prefix);
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

impl DatabaseAdapter for PostgresAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn state(&self) -> AdapterState {
        self.session.state()
    }

    fn connect(&mut self, config: &DatabaseConfig) -> DatabaseResult<()> {
        self.session.check_connectable(DatabaseType::Postgres)?;
        check_engine(DatabaseType::Postgres, config)?;
        register_config_for_redaction(config);

        let options = connect_options(config)?;
        let runtime = blocking_runtime()?;
        let conn = runtime.block_on(options.connect()).map_err(|e| {
            let msg = redact(&e.to_string());
            error!(
                host = config.host(),
                port = config.port(),
                "postgres connection failed: {}",
                msg
            );
            DatabaseError::Connection(msg)
        })?;

        info!(
            host = config.host(),
            port = config.port(),
            database = config.database(),
            "connected to postgres"
        );
        self.session.open(PgSession { runtime, conn });
        Ok(())
    }

    fn ensure_target(&mut self, name: &str, schema: &Schema) -> DatabaseResult<bool> {
        let PgSession { runtime, conn } = self.session.active("ensure_target")?;

        let existing = runtime
            .block_on(existing_columns(conn, name))
            .map_err(|e| DatabaseError::Query(format!("failed to inspect '{}': {}", name, e)))?;

        if !existing.is_empty() {
            check_compatible(name, &existing, schema, &PostgresDialect)?;
            debug!(table = name, "table already exists with a compatible shape");
            return Ok(false);
        }

        let sql = PostgresDialect.generate_create_table_sql(name, schema);
        debug!(dialect = PostgresDialect.name(), sql = %sql, "creating table");
        runtime
            .block_on(sqlx::query(&sql).execute(&mut *conn))
            .map_err(|e| DatabaseError::Query(format!("failed to create '{}': {}", name, e)))?;
        info!(table = name, columns = schema.len(), "created table");
        Ok(true)
    }

    fn insert_batch(&mut self, name: &str, records: &RecordSet) -> DatabaseResult<InsertOutcome> {
        let rows_per_statement =
            PostgresDialect.rows_per_statement(self.chunk_size, records.schema().len());
        let PgSession { runtime, conn } = self.session.active("insert_batch")?;

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
        let PgSession { runtime, conn } = self.session.active("count_rows")?;
        let sql = PostgresDialect.generate_count_sql(name);
        let count: i64 = runtime
            .block_on(sqlx::query_scalar(&sql).fetch_one(&mut *conn))
            .map_err(|e| DatabaseError::Query(format!("failed to count '{}': {}", name, e)))?;
        Ok(count.max(0) as u64)
    }

    fn ping(&mut self) -> DatabaseResult<()> {
        let PgSession { runtime, conn } = self.session.active("ping")?;
        runtime
            .block_on(conn.ping())
            .map_err(|e| DatabaseError::Connection(format!("Failed to ping database: {}", e)))
    }

    fn close(&mut self) -> DatabaseResult<()> {
        let Some(PgSession { runtime, conn }) = self.session.release() else {
            return Ok(());
        };
        let result = runtime.block_on(conn.close());
        info!("closed postgres connection");
        result.map_err(|e| DatabaseError::Connection(format!("failed to close connection: {}", e)))
    }
}

impl Drop for PostgresAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing postgres adapter on drop: {}", e);
        }
    }
}
