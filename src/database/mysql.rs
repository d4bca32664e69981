use secrecy::ExposeSecret;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::query_builder::Separated;
use sqlx::{ConnectOptions, Connection, MySql, QueryBuilder};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use super::dialect::{MySqlDialect, SqlDialect};
use super::{
    blocking_runtime, check_compatible, check_engine, AdapterState, DatabaseAdapter,
    DatabaseConfig, DatabaseError, DatabaseResult, DatabaseType, DatabaseValue, ExistingColumn,
    InsertOutcome, Session, DEFAULT_CHUNK_SIZE,
};
use crate::logging::{redact, register_config_for_redaction};
use crate::normalizer::RecordSet;
use crate::schema::{ColumnType, Schema};

struct MySqlSession {
    runtime: Runtime,
    conn: MySqlConnection,
}

/// MySQL implementation of the load contract
pub struct MySqlAdapter {
    session: Session<MySqlSession>,
    chunk_size: usize,
}

impl MySqlAdapter {
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
}

impl Default for MySqlAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build driver options from a descriptor. Recognized options are
/// `charset` and `ssl-mode`.
fn connect_options(config: &DatabaseConfig) -> DatabaseResult<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::new()
        .host(config.host())
        .port(config.port())
        .username(config.username())
        .password(config.password().expose_secret())
        .database(config.database());

    for (key, value) in config.options() {
        options = match key.as_str() {
            "charset" => options.charset(value),
            "ssl-mode" | "ssl_mode" | "sslmode" => {
                let mode = value.parse::<MySqlSslMode>().map_err(|e| {
                    DatabaseError::Configuration(format!("invalid ssl-mode '{}': {}", value, e))
                })?;
                options.ssl_mode(mode)
            }
            other => {
                return Err(DatabaseError::Configuration(format!(
                    "unsupported mysql option '{}'",
                    other
                )))
            }
        };
    }

    Ok(options.disable_statement_logging())
}

fn push_value(
    row: &mut Separated<'_, '_, MySql, &'static str>,
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
    conn: &mut MySqlConnection,
    table: &str,
) -> Result<Vec<ExistingColumn>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(MySqlDialect.columns_query())
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, native)| ExistingColumn { name, native })
        .collect())
}

async fn insert_rows(
    conn: &mut MySqlConnection,
    table: &str,
    records: &RecordSet,
    rows_per_statement: usize,
) -> Result<(), sqlx::Error> {
    let schema = records.schema();
    let prefix = MySqlDialect.generate_insert_prefix(table, schema);
    let mut tx = conn.begin().await?;

    for chunk in records.rows().chunks(rows_per_statement) {
        let mut builder = QueryBuilder::<MySql>::new(&prefix);
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

impl DatabaseAdapter for MySqlAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    fn state(&self) -> AdapterState {
        self.session.state()
    }

    fn connect(&mut self, config: &DatabaseConfig) -> DatabaseResult<()> {
        self.session.check_connectable(DatabaseType::MySql)?;
        check_engine(DatabaseType::MySql, config)?;
        register_config_for_redaction(config);

        let options = connect_options(config)?;
        let runtime = blocking_runtime()?;
        let conn = runtime.block_on(options.connect()).map_err(|e| {
            let msg = redact(&e.to_string());
            error!(
                host = config.host(),
                port = config.port(),
                "mysql connection failed: {}",
                msg
            );
            DatabaseError::Connection(msg)
        })?;

        info!(
            host = config.host(),
            port = config.port(),
            database = config.database(),
            "connected to mysql"
        );
        self.session.open(MySqlSession { runtime, conn });
        Ok(())
    }

    fn ensure_target(&mut self, name: &str, schema: &Schema) -> DatabaseResult<bool> {
        let MySqlSession { runtime, conn } = self.session.active("ensure_target")?;

        let existing = runtime
            .block_on(existing_columns(conn, name))
            .map_err(|e| DatabaseError::Query(format!("failed to inspect '{}': {}", name, e)))?;

        if !existing.is_empty() {
            check_compatible(name, &existing, schema, &MySqlDialect)?;
            debug!(table = name, "table already exists with a compatible shape");
            return Ok(false);
        }

        let sql = MySqlDialect.generate_create_table_sql(name, schema);
        debug!(dialect = MySqlDialect.name(), sql = %sql, "creating table");
        runtime
            .block_on(sqlx::query(&sql).execute(&mut *conn))
            .map_err(|e| DatabaseError::Query(format!("failed to create '{}': {}", name, e)))?;
        info!(table = name, columns = schema.len(), "created table");
        Ok(true)
    }

    fn insert_batch(&mut self, name: &str, records: &RecordSet) -> DatabaseResult<InsertOutcome> {
        let rows_per_statement =
            MySqlDialect.rows_per_statement(self.chunk_size, records.schema().len());
        let MySqlSession { runtime, conn } = self.session.active("insert_batch")?;

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
        let MySqlSession { runtime, conn } = self.session.active("count_rows")?;
        let sql = MySqlDialect.generate_count_sql(name);
        let count: i64 = runtime
            .block_on(sqlx::query_scalar(&sql).fetch_one(&mut *conn))
            .map_err(|e| DatabaseError::Query(format!("failed to count '{}': {}", name, e)))?;
        Ok(count.max(0) as u64)
    }

    fn ping(&mut self) -> DatabaseResult<()> {
        let MySqlSession { runtime, conn } = self.session.active("ping")?;
        runtime
            .block_on(conn.ping())
            .map_err(|e| DatabaseError::Connection(format!("Failed to ping database: {}", e)))
    }

    fn close(&mut self) -> DatabaseResult<()> {
        let Some(MySqlSession { runtime, conn }) = self.session.release() else {
            return Ok(());
        };
        let result = runtime.block_on(conn.close());
        info!("closed mysql connection");
        result.map_err(|e| DatabaseError::Connection(format!("failed to close connection: {}", e)))
    }
}

impl Drop for MySqlAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing mysql adapter on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn descriptor() -> DatabaseConfig {
        DatabaseConfig::new(
            DatabaseType::MySql,
            "mysql.internal",
            3307,
            "warehouse",
            "loader",
            SecretString::new("pw".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_connect_options_from_descriptor() {
        let config = descriptor().with_options([("charset", "utf8mb4")]);
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_host(), "mysql.internal");
        assert_eq!(options.get_port(), 3307);
        assert_eq!(options.get_database(), Some("warehouse"));
        assert_eq!(options.get_charset(), "utf8mb4");
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let config = descriptor().with_options([("application_name", "loader")]);
        assert!(matches!(
            connect_options(&config),
            Err(DatabaseError::Configuration(_))
        ));
    }

    #[test]
    fn test_insert_requires_connection() {
        let mut adapter = MySqlAdapter::new();
        let records = crate::normalizer::normalize_reader(
            "a\n1\n".as_bytes(),
            &crate::normalizer::NormalizeOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            adapter.insert_batch("a", &records),
            Err(DatabaseError::InvalidState(_))
        ));
    }
}
