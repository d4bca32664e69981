//! Load raw delimited files into a relational or document database.
//!
//! A run reads each file, infers a typed [`Schema`] for it, creates the
//! matching table or collection when it does not exist yet, and inserts the
//! rows as one batch through an engine adapter. PostgreSQL, MySQL and
//! SQLite are reached through `sqlx`; MongoDB through the official driver.
//!
//! ```no_run
//! use raw2database::{load, ConnectionSettings, DatabaseConfig, LoadOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ConnectionSettings::from_file("connection.toml")?;
//! let config = DatabaseConfig::try_from(settings)?;
//! let report = load(&config, &["raw/people.csv"], LoadOptions::default())?;
//! for (path, error) in report.errors() {
//!     eprintln!("{}: {}", path.display(), error);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod loader;
pub mod logging;
pub mod normalizer;
pub mod schema;


pub use config::{ConfigError, ConnectionSettings};
pub use database::{
    AdapterState, DatabaseAdapter, DatabaseConfig, DatabaseError, DatabaseResult, DatabaseType,
    DatabaseValue, EngineAdapter, InsertOutcome,
};
pub use error::{Error, Result};
pub use loader::{discover_files, load, FileResult, LoadOptions, LoadReport, Loader};
pub use logging::init_logging;
pub use normalizer::{
    normalize_file, normalize_reader, FormatHint, NormalizeError, NormalizeOptions, RecordSet,
    TypeWarning,
};
pub use schema::{ColumnDescriptor, ColumnType, Schema};
