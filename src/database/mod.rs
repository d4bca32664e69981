use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

use crate::normalizer::RecordSet;
use crate::schema::{ColumnType, Schema};

/// Error type for database operations
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Network or authentication failure while opening a session
    #[error("connection error: {0}")]
    Connection(String),

    /// Descriptor does not fit the requested engine
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation called in a lifecycle state that does not allow it
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Existing target has a shape the incoming schema cannot be loaded into
    #[error("schema conflict on '{target}': {reason}")]
    SchemaConflict { target: String, reason: String },

    /// Batch insert failed
    #[error("insert failed after {inserted} row(s) (partial: {partial}): {cause}")]
    Insert {
        inserted: usize,
        partial: bool,
        cause: String,
    },

    /// Any other statement failure
    #[error("query error: {0}")]
    Query(String),
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Rows per relational `INSERT` statement unless the caller asks otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL database
    Postgres,
    /// MySQL database
    MySql,
    /// MongoDB database
    Mongo,
    /// Embedded SQLite database
    Sqlite,
}

impl DatabaseType {
    /// Whether the engine is reached over the network with credentials.
    pub fn is_server(&self) -> bool {
        !matches!(self, DatabaseType::Sqlite)
    }

    /// Whether the engine loads batches all-or-nothing.
    pub fn is_relational(&self) -> bool {
        !matches!(self, DatabaseType::Mongo)
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            DatabaseType::Postgres => Some(5432),
            DatabaseType::MySql => Some(3306),
            DatabaseType::Mongo => Some(27017),
            DatabaseType::Sqlite => None,
        }
    }
}

impl Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::Postgres => write!(f, "postgres"),
            DatabaseType::MySql => write!(f, "mysql"),
            DatabaseType::Mongo => write!(f, "mongo"),
            DatabaseType::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for DatabaseType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseType::Postgres),
            "mysql" => Ok(DatabaseType::MySql),
            "mongo" | "mongodb" => Ok(DatabaseType::Mongo),
            "sqlite" => Ok(DatabaseType::Sqlite),
            other => Err(DatabaseError::Configuration(format!(
                "unsupported database type: '{}'",
                other
            ))),
        }
    }
}

/// Validated, immutable connection descriptor.
///
/// Built once from the configuration provider's record and handed to an
/// adapter's `connect`. Fields are private so a descriptor that passed
/// validation cannot be edited afterwards.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    db_type: DatabaseType,
    host: String,
    port: u16,
    database: String,
    username: String,
    password: SecretString,
    options: BTreeMap<String, String>,
}

impl DatabaseConfig {
    /// Descriptor for a server engine (Postgres, MySQL, Mongo).
    pub fn new(
        db_type: DatabaseType,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> DatabaseResult<Self> {
        let config = Self {
            db_type,
            host: host.into(),
            port,
            database: database.into(),
            username: username.into(),
            password,
            options: BTreeMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Descriptor for an SQLite database file, or `:memory:`.
    pub fn sqlite(path: impl Into<String>) -> DatabaseResult<Self> {
        let config = Self {
            db_type: DatabaseType::Sqlite,
            host: String::new(),
            port: 0,
            database: path.into(),
            username: String::new(),
            password: SecretString::new(String::new()),
            options: BTreeMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Attach engine-specific driver options (e.g. `application_name`,
    /// `charset`, `authSource`).
    pub fn with_options<I, K, V>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.options
            .extend(options.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    fn validate(&self) -> DatabaseResult<()> {
        let invalid = |msg: &str| {
            DatabaseError::Configuration(format!("{} descriptor: {}", self.db_type, msg))
        };

        if self.database.trim().is_empty() {
            return Err(invalid("database name must not be empty"));
        }
        if self.db_type.is_server() {
            if self.host.trim().is_empty() {
                return Err(invalid("host must not be empty"));
            }
            if self.port == 0 {
                return Err(invalid("port must be between 1 and 65535"));
            }
            if self.username.trim().is_empty() {
                return Err(invalid("user must not be empty"));
            }
            if self.password.expose_secret().is_empty() {
                return Err(invalid("password must not be empty"));
            }
        }
        Ok(())
    }

    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// A typed scalar cell of a normalized record
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    /// Null value
    Null,
    /// Boolean value
    Boolean(bool),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Text(String),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Type of the value, `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            DatabaseValue::Null => None,
            DatabaseValue::Boolean(_) => Some(ColumnType::Boolean),
            DatabaseValue::Integer(_) => Some(ColumnType::Integer),
            DatabaseValue::Float(_) => Some(ColumnType::Float),
            DatabaseValue::Text(_) => Some(ColumnType::String),
        }
    }
}

impl Display for DatabaseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(fl) => write!(f, "{}", fl),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Boolean(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Integer(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::Text(value.to_string())
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::Text(value)
    }
}

/// Lifecycle of an adapter's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unconnected,
    Connected,
    Closed,
}

impl Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unconnected => write!(f, "unconnected"),
            AdapterState::Connected => write!(f, "connected"),
            AdapterState::Closed => write!(f, "closed"),
        }
    }
}

/// Outcome of a successful `insert_batch`.
///
/// Shares its shape with `DatabaseError::Insert` so callers report both
/// engines the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub partial: bool,
}

impl InsertOutcome {
    pub fn complete(inserted: usize) -> Self {
        Self {
            inserted,
            partial: false,
        }
    }
}

/// Engine-agnostic load contract.
///
/// Every implementation owns at most one live session and follows the
/// `Unconnected -> Connected -> Closed` lifecycle. All calls block the
/// calling thread.
pub trait DatabaseAdapter: Send {
    /// Engine this adapter talks to
    fn database_type(&self) -> DatabaseType;

    /// Current lifecycle state
    fn state(&self) -> AdapterState;

    /// Open the session described by `config`
    fn connect(&mut self, config: &DatabaseConfig) -> DatabaseResult<()>;

    /// Create the target if absent; returns `true` when it was created
    fn ensure_target(&mut self, name: &str, schema: &Schema) -> DatabaseResult<bool>;

    /// Insert every row of `records` into `name` as one batch
    fn insert_batch(&mut self, name: &str, records: &RecordSet) -> DatabaseResult<InsertOutcome>;

    /// Number of rows or documents currently in the target
    fn count_rows(&mut self, name: &str) -> DatabaseResult<u64>;

    /// Check that the session is still alive
    fn ping(&mut self) -> DatabaseResult<()>;

    /// Release the session; a no-op when nothing is open
    fn close(&mut self) -> DatabaseResult<()>;
}

/// Session slot shared by the concrete adapters.
///
/// Holds the engine handle only while connected, so releasing it is a move
/// out of the slot and cannot happen twice.
#[allow(dead_code)]
pub(crate) enum Session<S> {
    Unconnected,
    Connected(S),
    Closed,
}

#[allow(dead_code)]
impl<S> Session<S> {
    pub(crate) fn state(&self) -> AdapterState {
        match self {
            Session::Unconnected => AdapterState::Unconnected,
            Session::Connected(_) => AdapterState::Connected,
            Session::Closed => AdapterState::Closed,
        }
    }

    /// Fails unless a new session may be opened.
    pub(crate) fn check_connectable(&self, engine: DatabaseType) -> DatabaseResult<()> {
        match self {
            Session::Unconnected => Ok(()),
            Session::Connected(_) => Err(DatabaseError::InvalidState(format!(
                "{} adapter is already connected",
                engine
            ))),
            Session::Closed => Err(DatabaseError::InvalidState(format!(
                "{} adapter is closed and cannot reconnect",
                engine
            ))),
        }
    }

    pub(crate) fn open(&mut self, handle: S) {
        *self = Session::Connected(handle);
    }

    /// Live handle for `operation`, or `InvalidState` outside `Connected`.
    pub(crate) fn active(&mut self, operation: &str) -> DatabaseResult<&mut S> {
        match self {
            Session::Connected(handle) => Ok(handle),
            other => Err(DatabaseError::InvalidState(format!(
                "{} requires a connected adapter (state: {})",
                operation,
                other.state()
            ))),
        }
    }

    /// Take the handle out and move to `Closed`. Returns `None` and leaves
    /// the state alone when nothing is connected.
    pub(crate) fn release(&mut self) -> Option<S> {
        match std::mem::replace(self, Session::Closed) {
            Session::Connected(handle) => Some(handle),
            previous => {
                *self = previous;
                None
            }
        }
    }
}

/// Column of an existing target as reported by the engine's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExistingColumn {
    pub name: String,
    /// Declared type as the engine spells it
    pub native: String,
}

/// How an engine matches an existing target's columns against incoming ones.
pub(crate) trait ColumnRules {
    /// Whether an existing column name refers to an incoming one
    fn names_match(&self, existing: &str, incoming: &str) -> bool;

    /// Whether a column declared as `native` takes `incoming` values as
    /// they are sent on insert
    fn stores(&self, native: &str, incoming: ColumnType) -> bool;
}

/// Compare an existing target against the incoming schema.
pub(crate) fn check_compatible(
    target: &str,
    existing: &[ExistingColumn],
    schema: &Schema,
    rules: &impl ColumnRules,
) -> DatabaseResult<()> {
    let conflict = |reason: String| DatabaseError::SchemaConflict {
        target: target.to_string(),
        reason,
    };

    if existing.len() != schema.len() {
        return Err(conflict(format!(
            "existing target has {} column(s), incoming schema has {}",
            existing.len(),
            schema.len()
        )));
    }

    for column in schema.columns() {
        let found = existing
            .iter()
            .find(|e| rules.names_match(&e.name, &column.name))
            .ok_or_else(|| conflict(format!("column '{}' does not exist", column.name)))?;

        if !rules.stores(&found.native, column.column_type) {
            return Err(conflict(format!(
                "column '{}' is declared {}, incoming data is {}",
                column.name, found.native, column.column_type
            )));
        }
    }

    Ok(())
}

/// Current-thread runtime an adapter drives its async driver with.
#[cfg(any(feature = "database", feature = "mongo"))]
pub(crate) fn blocking_runtime() -> DatabaseResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| DatabaseError::Connection(format!("failed to start driver runtime: {}", e)))
}

/// Reject descriptors meant for another engine.
#[allow(dead_code)]
pub(crate) fn check_engine(expected: DatabaseType, config: &DatabaseConfig) -> DatabaseResult<()> {
    if config.database_type() != expected {
        return Err(DatabaseError::Configuration(format!(
            "{} adapter cannot use a {} descriptor",
            expected,
            config.database_type()
        )));
    }
    Ok(())
}

#[cfg(not(any(
    feature = "postgres",
    feature = "mysql",
    feature = "sqlite",
    feature = "mongo"
)))]
compile_error!("enable at least one of the postgres, mysql, sqlite or mongo features");

/// Adapter for whichever engine a descriptor names.
///
/// One variant per compiled-in engine; dispatch is a plain `match`.
pub enum EngineAdapter {
    #[cfg(feature = "postgres")]
    Postgres(PostgresAdapter),
    #[cfg(feature = "mysql")]
    MySql(MySqlAdapter),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteAdapter),
    #[cfg(feature = "mongo")]
    Mongo(MongoAdapter),
}

impl EngineAdapter {
    /// Build an unconnected adapter for the descriptor's engine kind
    pub fn for_config(config: &DatabaseConfig) -> DatabaseResult<Self> {
        Self::for_type(config.database_type())
    }

    /// Rows per `INSERT` statement for relational engines. Mongo sends one
    /// `insertMany` per batch and ignores it.
    pub fn with_chunk_size(self, chunk_size: usize) -> Self {
        match self {
            #[cfg(feature = "postgres")]
            EngineAdapter::Postgres(a) => EngineAdapter::Postgres(a.with_chunk_size(chunk_size)),
            #[cfg(feature = "mysql")]
            EngineAdapter::MySql(a) => EngineAdapter::MySql(a.with_chunk_size(chunk_size)),
            #[cfg(feature = "sqlite")]
            EngineAdapter::Sqlite(a) => EngineAdapter::Sqlite(a.with_chunk_size(chunk_size)),
            #[allow(unreachable_patterns)]
            other => other,
        }
    }

    pub fn for_type(db_type: DatabaseType) -> DatabaseResult<Self> {
        match db_type {
            DatabaseType::Postgres => {
                #[cfg(feature = "postgres")]
                {
                    Ok(EngineAdapter::Postgres(PostgresAdapter::new()))
                }
                #[cfg(not(feature = "postgres"))]
                {
                    Err(DatabaseError::Configuration(
                        "PostgreSQL support is not enabled. Enable the 'postgres' feature."
                            .to_string(),
                    ))
                }
            }
            DatabaseType::MySql => {
                #[cfg(feature = "mysql")]
                {
                    Ok(EngineAdapter::MySql(MySqlAdapter::new()))
                }
                #[cfg(not(feature = "mysql"))]
                {
                    Err(DatabaseError::Configuration(
                        "MySQL support is not enabled. Enable the 'mysql' feature.".to_string(),
                    ))
                }
            }
            DatabaseType::Sqlite => {
                #[cfg(feature = "sqlite")]
                {
                    Ok(EngineAdapter::Sqlite(SqliteAdapter::new()))
                }
                #[cfg(not(feature = "sqlite"))]
                {
                    Err(DatabaseError::Configuration(
                        "SQLite support is not enabled. Enable the 'sqlite' feature.".to_string(),
                    ))
                }
            }
            DatabaseType::Mongo => {
                #[cfg(feature = "mongo")]
                {
                    Ok(EngineAdapter::Mongo(MongoAdapter::new()))
                }
                #[cfg(not(feature = "mongo"))]
                {
                    Err(DatabaseError::Configuration(
                        "MongoDB support is not enabled. Enable the 'mongo' feature.".to_string(),
                    ))
                }
            }
        }
    }
}

macro_rules! delegate {
    ($self:ident, $adapter:ident => $call:expr) => {
        match $self {
            #[cfg(feature = "postgres")]
            EngineAdapter::Postgres($adapter) => $call,
            #[cfg(feature = "mysql")]
            EngineAdapter::MySql($adapter) => $call,
            #[cfg(feature = "sqlite")]
            EngineAdapter::Sqlite($adapter) => $call,
            #[cfg(feature = "mongo")]
            EngineAdapter::Mongo($adapter) => $call,
        }
    };
}

impl DatabaseAdapter for EngineAdapter {
    fn database_type(&self) -> DatabaseType {
        delegate!(self, a => a.database_type())
    }

    fn state(&self) -> AdapterState {
        delegate!(self, a => a.state())
    }

    fn connect(&mut self, config: &DatabaseConfig) -> DatabaseResult<()> {
        delegate!(self, a => a.connect(config))
    }

    fn ensure_target(&mut self, name: &str, schema: &Schema) -> DatabaseResult<bool> {
        delegate!(self, a => a.ensure_target(name, schema))
    }

    fn insert_batch(&mut self, name: &str, records: &RecordSet) -> DatabaseResult<InsertOutcome> {
        delegate!(self, a => a.insert_batch(name, records))
    }

    fn count_rows(&mut self, name: &str) -> DatabaseResult<u64> {
        delegate!(self, a => a.count_rows(name))
    }

    fn ping(&mut self) -> DatabaseResult<()> {
        delegate!(self, a => a.ping())
    }

    fn close(&mut self) -> DatabaseResult<()> {
        delegate!(self, a => a.close())
    }
}

// Shared SQL generation for the relational engines
#[cfg(feature = "database")]
pub mod dialect;

// Implementation modules for specific database types
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;

#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "mysql")]
pub use mysql::MySqlAdapter;

#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

#[cfg(feature = "mongo")]
mod mongo;
#[cfg(feature = "mongo")]
pub use mongo::MongoAdapter;
