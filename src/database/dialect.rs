//! SQL generation for the relational engines.
//!
//! Each dialect maps inferred column types to native types and renders the
//! handful of statements a load needs: create-if-absent, multi-row insert
//! prefix, row count and the catalog lookup used for compatibility checks.

use super::ColumnRules;
use crate::schema::{ColumnType, Schema};

/// Trait defining the dialect-specific parts of relational loading
pub trait SqlDialect: Send + Sync {
    /// Name of the engine this dialect targets
    fn name(&self) -> &'static str;

    /// Native column type for an inferred type
    fn map_column_type(&self, column_type: ColumnType) -> &'static str;

    /// Character used to quote identifiers
    fn identifier_quote_char(&self) -> char;

    /// Largest number of bind parameters one statement may carry
    fn max_bind_params(&self) -> usize;

    /// Catalog query returning `(column name, native type)` for a table,
    /// with the table name as its single bind parameter
    fn columns_query(&self) -> &'static str;

    /// Type family of a native type reported by the catalog
    fn type_family(&self, native: &str) -> Option<ColumnType>;

    /// Trailing table options for `CREATE TABLE`
    fn table_options(&self) -> &'static str {
        ""
    }

    /// Whether column names compare case-sensitively
    fn names_case_sensitive(&self) -> bool {
        false
    }

    /// Whether a column of `existing` family stores bound `incoming` values.
    /// Integer columns take booleans and float columns take integers.
    fn accepts_family(&self, existing: ColumnType, incoming: ColumnType) -> bool {
        existing == incoming
            || matches!(
                (existing, incoming),
                (ColumnType::Integer, ColumnType::Boolean) | (ColumnType::Float, ColumnType::Integer)
            )
    }

    /// Quote an identifier (table, column name), doubling embedded quotes
    fn quote_identifier(&self, identifier: &str) -> String {
        let q = self.identifier_quote_char();
        let escaped = identifier.replace(q, &format!("{}{}", q, q));
        format!("{}{}{}", q, escaped, q)
    }

    /// Generate SQL for a column definition
    fn generate_column_definition_sql(&self, name: &str, column_type: ColumnType) -> String {
        format!(
            "{} {}",
            self.quote_identifier(name),
            self.map_column_type(column_type)
        )
    }

    /// Generate `CREATE TABLE IF NOT EXISTS` for a schema
    fn generate_create_table_sql(&self, table: &str, schema: &Schema) -> String {
        let parts: Vec<String> = schema
            .columns()
            .iter()
            .map(|c| self.generate_column_definition_sql(&c.name, c.column_type))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n){}",
            self.quote_identifier(table),
            parts.join(",\n  "),
            self.table_options()
        )
    }

    /// `INSERT INTO t (a, b) ` prefix; the `VALUES` list is appended by the
    /// query builder
    fn generate_insert_prefix(&self, table: &str, schema: &Schema) -> String {
        let cols: Vec<String> = schema.names().map(|c| self.quote_identifier(c)).collect();
        format!(
            "INSERT INTO {} ({}) ",
            self.quote_identifier(table),
            cols.join(", ")
        )
    }

    /// Generate a row count query
    fn generate_count_sql(&self, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.quote_identifier(table))
    }

    /// Rows per statement for a table of `columns` width
    fn rows_per_statement(&self, chunk_size: usize, columns: usize) -> usize {
        let by_params = self.max_bind_params() / columns.max(1);
        chunk_size.min(by_params).max(1)
    }
}

impl<D: SqlDialect> ColumnRules for D {
    fn names_match(&self, existing: &str, incoming: &str) -> bool {
        if self.names_case_sensitive() {
            existing == incoming
        } else {
            existing.eq_ignore_ascii_case(incoming)
        }
    }

    fn stores(&self, native: &str, incoming: ColumnType) -> bool {
        // Unrecognized native types are left for the engine to judge
        self.type_family(native)
            .map_or(true, |family| self.accepts_family(family, incoming))
    }
}

/// PostgreSQL dialect
///
/// Quoted identifiers are case-sensitive and there is no assignment cast
/// from `boolean` to an integer type.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn map_column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::String => "TEXT",
        }
    }

    fn identifier_quote_char(&self) -> char {
        '"'
    }

    fn max_bind_params(&self) -> usize {
        u16::MAX as usize
    }

    fn columns_query(&self) -> &'static str {
        "SELECT column_name::text, data_type::text FROM information_schema.columns \
         WHERE table_schema = current_schema() AND table_name = $1 \
         ORDER BY ordinal_position"
    }

    fn type_family(&self, native: &str) -> Option<ColumnType> {
        match native.to_ascii_lowercase().as_str() {
            "boolean" => Some(ColumnType::Boolean),
            "smallint" | "integer" | "bigint" => Some(ColumnType::Integer),
            "real" | "double precision" | "numeric" => Some(ColumnType::Float),
            "text" | "character varying" | "character" => Some(ColumnType::String),
            _ => None,
        }
    }

    fn names_case_sensitive(&self) -> bool {
        true
    }

    fn accepts_family(&self, existing: ColumnType, incoming: ColumnType) -> bool {
        existing == incoming || (existing, incoming) == (ColumnType::Float, ColumnType::Integer)
    }
}

/// MySQL dialect
///
/// `BOOLEAN` is an alias of `TINYINT(1)`, so the catalog reports boolean
/// columns as integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn map_column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE",
            ColumnType::String => "TEXT",
        }
    }

    fn identifier_quote_char(&self) -> char {
        '`'
    }

    fn max_bind_params(&self) -> usize {
        u16::MAX as usize
    }

    // information_schema columns come back as binary strings on MySQL 8
    fn columns_query(&self) -> &'static str {
        "SELECT CAST(COLUMN_NAME AS CHAR), CAST(DATA_TYPE AS CHAR) \
         FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? \
         ORDER BY ORDINAL_POSITION"
    }

    fn type_family(&self, native: &str) -> Option<ColumnType> {
        match native.to_ascii_lowercase().as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => {
                Some(ColumnType::Integer)
            }
            "float" | "double" | "decimal" => Some(ColumnType::Float),
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" => {
                Some(ColumnType::String)
            }
            _ => None,
        }
    }
}

/// SQLite dialect
///
/// Tables are created `STRICT` so a value of the wrong type is rejected
/// instead of stored under SQLite's type affinity rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn map_column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Boolean | ColumnType::Integer => "INTEGER",
            ColumnType::Float => "REAL",
            ColumnType::String => "TEXT",
        }
    }

    fn identifier_quote_char(&self) -> char {
        '"'
    }

    fn max_bind_params(&self) -> usize {
        32_766
    }

    fn columns_query(&self) -> &'static str {
        "SELECT name, type FROM pragma_table_info(?1)"
    }

    fn type_family(&self, native: &str) -> Option<ColumnType> {
        match native.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" => Some(ColumnType::Integer),
            "REAL" => Some(ColumnType::Float),
            "TEXT" => Some(ColumnType::String),
            _ => None,
        }
    }

    fn table_options(&self) -> &'static str {
        " STRICT"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{check_compatible, DatabaseError, ExistingColumn};
    use crate::schema::ColumnDescriptor;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnDescriptor::new("name", ColumnType::String),
            ColumnDescriptor::new("age", ColumnType::Integer),
            ColumnDescriptor::new("score", ColumnType::Float),
            ColumnDescriptor::new("active", ColumnType::Boolean),
        ])
    }

    #[test]
    fn test_postgres_create_table() {
        let sql = PostgresDialect.generate_create_table_sql("people", &schema());
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"people\" (\n  \"name\" TEXT,\n  \"age\" BIGINT,\n  \
             \"score\" DOUBLE PRECISION,\n  \"active\" BOOLEAN\n)"
        );
    }

    #[test]
    fn test_mysql_create_table_uses_backticks() {
        let sql = MySqlDialect.generate_create_table_sql("people", &schema());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `people`"));
        assert!(sql.contains("`score` DOUBLE"));
        assert!(sql.contains("`active` BOOLEAN"));
    }

    #[test]
    fn test_sqlite_create_table_is_strict() {
        let sql = SqliteDialect.generate_create_table_sql("people", &schema());
        assert!(sql.ends_with(") STRICT"));
        assert!(sql.contains("\"active\" INTEGER"));
        assert!(sql.contains("\"score\" REAL"));
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(PostgresDialect.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(MySqlDialect.quote_identifier("a`b"), "`a``b`");
    }

    #[test]
    fn test_insert_prefix() {
        let sql = PostgresDialect.generate_insert_prefix("people", &schema());
        assert_eq!(
            sql,
            "INSERT INTO \"people\" (\"name\", \"age\", \"score\", \"active\") "
        );
    }

    #[test]
    fn test_rows_per_statement_respects_param_limit() {
        assert_eq!(SqliteDialect.rows_per_statement(500, 4), 500);
        assert_eq!(SqliteDialect.rows_per_statement(100_000, 2), 16_383);
        assert_eq!(PostgresDialect.rows_per_statement(0, 3), 1);
    }

    fn column(name: &str, native: &str) -> ExistingColumn {
        ExistingColumn {
            name: name.to_string(),
            native: native.to_string(),
        }
    }

    fn flagged() -> Schema {
        Schema::new(vec![
            ColumnDescriptor::new("Name", ColumnType::String),
            ColumnDescriptor::new("flag", ColumnType::Boolean),
        ])
    }

    #[test]
    fn test_postgres_names_are_case_sensitive() {
        let existing = vec![column("name", "text"), column("flag", "boolean")];
        assert!(matches!(
            check_compatible("t", &existing, &flagged(), &PostgresDialect),
            Err(DatabaseError::SchemaConflict { .. })
        ));
        assert!(check_compatible("t", &existing, &flagged(), &MySqlDialect).is_ok());

        let exact = vec![column("Name", "text"), column("flag", "boolean")];
        assert!(check_compatible("t", &exact, &flagged(), &PostgresDialect).is_ok());
    }

    #[test]
    fn test_postgres_integer_column_rejects_booleans() {
        let existing = vec![column("Name", "text"), column("flag", "bigint")];
        assert!(matches!(
            check_compatible("t", &existing, &flagged(), &PostgresDialect),
            Err(DatabaseError::SchemaConflict { .. })
        ));

        let tinyint = vec![column("Name", "text"), column("flag", "tinyint")];
        assert!(check_compatible("t", &tinyint, &flagged(), &MySqlDialect).is_ok());
        let sqlite = vec![column("Name", "TEXT"), column("flag", "INTEGER")];
        assert!(check_compatible("t", &sqlite, &flagged(), &SqliteDialect).is_ok());
    }

    #[test]
    fn test_float_columns_take_integers_everywhere() {
        let incoming = Schema::new(vec![ColumnDescriptor::new("score", ColumnType::Integer)]);
        let pg = vec![column("score", "double precision")];
        assert!(check_compatible("t", &pg, &incoming, &PostgresDialect).is_ok());
        let my = vec![column("score", "double")];
        assert!(check_compatible("t", &my, &incoming, &MySqlDialect).is_ok());

        let narrower = Schema::new(vec![ColumnDescriptor::new("score", ColumnType::Float)]);
        let int_col = vec![column("score", "bigint")];
        assert!(check_compatible("t", &int_col, &narrower, &PostgresDialect).is_err());
    }

    #[test]
    fn test_unrecognized_native_type_is_accepted() {
        let incoming = Schema::new(vec![ColumnDescriptor::new("doc", ColumnType::String)]);
        let existing = vec![column("doc", "jsonb")];
        assert!(check_compatible("t", &existing, &incoming, &PostgresDialect).is_ok());
    }

    #[test]
    fn test_type_families() {
        assert_eq!(
            PostgresDialect.type_family("double precision"),
            Some(ColumnType::Float)
        );
        assert_eq!(MySqlDialect.type_family("tinyint"), Some(ColumnType::Integer));
        assert_eq!(SqliteDialect.type_family("text"), Some(ColumnType::String));
        assert_eq!(PostgresDialect.type_family("jsonb"), None);
    }
}
