use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{
    ClientOptions, CreateCollectionOptions, Credential, InsertManyOptions, ServerAddress,
};
use mongodb::{Client, Database};
use secrecy::ExposeSecret;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use super::{
    blocking_runtime, check_compatible, check_engine, AdapterState, DatabaseAdapter,
    ColumnRules, DatabaseConfig, DatabaseError, DatabaseResult, DatabaseType, DatabaseValue,
    ExistingColumn, InsertOutcome, Session,
};
use crate::logging::{redact, register_config_for_redaction};
use crate::normalizer::RecordSet;
use crate::schema::{ColumnType, Schema};

struct MongoSession {
    runtime: Runtime,
    client: Client,
    db: Database,
}

/// MongoDB implementation of the load contract.
///
/// Targets are collections guarded by a `$jsonSchema` validator. Inserts are
/// one ordered `insertMany`, so a failure leaves the documents before it in
/// place and the error reports how many that was.
pub struct MongoAdapter {
    session: Session<MongoSession>,
}

impl MongoAdapter {
    pub fn new() -> Self {
        Self {
            session: Session::Unconnected,
        }
    }
}

impl Default for MongoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn bson_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Boolean => "bool",
        ColumnType::Integer => "long",
        ColumnType::Float => "double",
        ColumnType::String => "string",
    }
}

/// Compatibility as the validator enforces it: field names are exact and a
/// declared `bsonType` must list the type documents carry for the column.
struct BsonRules;

impl ColumnRules for BsonRules {
    fn names_match(&self, existing: &str, incoming: &str) -> bool {
        existing == incoming
    }

    fn stores(&self, native: &str, incoming: ColumnType) -> bool {
        if native.is_empty() {
            return true;
        }
        native.split(',').any(|declared| {
            declared == bson_type(incoming)
                || (declared == "number"
                    && matches!(incoming, ColumnType::Integer | ColumnType::Float))
        })
    }
}

fn client_options(config: &DatabaseConfig) -> DatabaseResult<ClientOptions> {
    let mut auth_source = None;
    let mut app_name = None;
    for (key, value) in config.options() {
        match key.as_str() {
            "authSource" => auth_source = Some(value.clone()),
            "appName" => app_name = Some(value.clone()),
            other => {
                return Err(DatabaseError::Configuration(format!(
                    "unsupported mongo option '{}'",
                    other
                )))
            }
        }
    }

    let credential = Credential::builder()
        .username(config.username().to_string())
        .password(config.password().expose_secret().to_string())
        .source(auth_source)
        .build();

    Ok(ClientOptions::builder()
        .hosts(vec![ServerAddress::Tcp {
            host: config.host().to_string(),
            port: Some(config.port()),
        }])
        .credential(credential)
        .app_name(app_name)
        .build())
}

/// `$jsonSchema` validator allowing each column's type or null.
pub(crate) fn validator_document(schema: &Schema) -> Document {
    let mut properties = Document::new();
    for column in schema.columns() {
        properties.insert(
            column.name.clone(),
            doc! { "bsonType": [bson_type(column.column_type), "null"] },
        );
    }
    doc! {
        "$jsonSchema": {
            "bsonType": "object",
            "properties": properties,
        }
    }
}

/// Columns declared by a collection validator; `None` when the collection
/// has no `$jsonSchema` and is therefore schemaless.
pub(crate) fn columns_from_validator(validator: &Document) -> Option<Vec<ExistingColumn>> {
    let properties = validator
        .get_document("$jsonSchema")
        .ok()?
        .get_document("properties")
        .ok()?;

    let columns = properties
        .iter()
        .filter(|(name, _)| name.as_str() != "_id")
        .map(|(name, spec)| {
            // Comma-joined declared types without "null"; empty when unconstrained
            let native = match spec.as_document().and_then(|d| d.get("bsonType")) {
                Some(Bson::String(t)) => t.clone(),
                Some(Bson::Array(types)) => types
                    .iter()
                    .filter_map(Bson::as_str)
                    .filter(|t| *t != "null")
                    .collect::<Vec<_>>()
                    .join(","),
                _ => String::new(),
            };
            ExistingColumn {
                name: name.clone(),
                native,
            }
        })
        .collect();

    Some(columns)
}

fn to_bson(value: &DatabaseValue) -> Bson {
    match value {
        DatabaseValue::Null => Bson::Null,
        DatabaseValue::Boolean(b) => Bson::Boolean(*b),
        DatabaseValue::Integer(i) => Bson::Int64(*i),
        DatabaseValue::Float(f) => Bson::Double(*f),
        DatabaseValue::Text(s) => Bson::String(s.clone()),
    }
}

pub(crate) fn to_documents(records: &RecordSet) -> Vec<Document> {
    let names: Vec<&str> = records.schema().names().collect();
    records
        .rows()
        .iter()
        .map(|row| {
            names
                .iter()
                .zip(row)
                .map(|(name, value)| (name.to_string(), to_bson(value)))
                .collect()
        })
        .collect()
}

/// Documents written before an ordered bulk write stopped.
fn inserted_before_failure(error: &MongoError) -> usize {
    match error.kind.as_ref() {
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .and_then(|errors| errors.iter().map(|e| e.index).min())
            .unwrap_or(0),
        _ => 0,
    }
}

/// Validator of an existing collection: `None` when the collection is
/// absent, `Some(None)` when it exists without one.
async fn collection_validator(
    db: &Database,
    name: &str,
) -> Result<Option<Option<Document>>, MongoError> {
    let mut cursor = db.list_collections(doc! { "name": name }, None).await?;
    if cursor.advance().await? {
        let spec = cursor.deserialize_current()?;
        return Ok(Some(spec.options.validator));
    }
    Ok(None)
}

impl DatabaseAdapter for MongoAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Mongo
    }

    fn state(&self) -> AdapterState {
        self.session.state()
    }

    fn connect(&mut self, config: &DatabaseConfig) -> DatabaseResult<()> {
        self.session.check_connectable(DatabaseType::Mongo)?;
        check_engine(DatabaseType::Mongo, config)?;
        register_config_for_redaction(config);

        let options = client_options(config)?;
        let runtime = blocking_runtime()?;
        let (client, db) = runtime
            .block_on(async {
                // Client::with_options spawns monitors, so it needs the runtime
                let client = Client::with_options(options)?;
                let db = client.database(config.database());
                db.run_command(doc! { "ping": 1 }, None).await?;
                Ok::<_, MongoError>((client, db))
            })
            .map_err(|e| {
                let msg = redact(&e.to_string());
                error!(
                    host = config.host(),
                    port = config.port(),
                    "mongo connection failed: {}",
                    msg
                );
                DatabaseError::Connection(msg)
            })?;

        info!(
            host = config.host(),
            port = config.port(),
            database = config.database(),
            "connected to mongo"
        );
        self.session.open(MongoSession {
            runtime,
            client,
            db,
        });
        Ok(())
    }

    fn ensure_target(&mut self, name: &str, schema: &Schema) -> DatabaseResult<bool> {
        let MongoSession { runtime, db, .. } = self.session.active("ensure_target")?;

        let existing = runtime
            .block_on(collection_validator(db, name))
            .map_err(|e| DatabaseError::Query(format!("failed to inspect '{}': {}", name, e)))?;

        match existing {
            Some(Some(validator)) => {
                if let Some(columns) = columns_from_validator(&validator) {
                    check_compatible(name, &columns, schema, &BsonRules)?;
                }
                debug!(collection = name, "collection already exists");
                Ok(false)
            }
            Some(None) => {
                debug!(collection = name, "collection exists without a validator");
                Ok(false)
            }
            None => {
                let validator = validator_document(schema);
                debug!(validator = %validator, "creating collection");
                let options = CreateCollectionOptions::builder()
                    .validator(validator)
                    .build();
                runtime
                    .block_on(db.create_collection(name, options))
                    .map_err(|e| {
                        DatabaseError::Query(format!("failed to create '{}': {}", name, e))
                    })?;
                info!(collection = name, columns = schema.len(), "created collection");
                Ok(true)
            }
        }
    }

    fn insert_batch(&mut self, name: &str, records: &RecordSet) -> DatabaseResult<InsertOutcome> {
        let MongoSession { runtime, db, .. } = self.session.active("insert_batch")?;

        if records.is_empty() {
            return Ok(InsertOutcome::complete(0));
        }

        let documents = to_documents(records);
        let options = InsertManyOptions::builder().ordered(true).build();
        let collection = db.collection::<Document>(name);

        debug!(collection = name, documents = documents.len(), "inserting batch");
        match runtime.block_on(collection.insert_many(documents, options)) {
            Ok(result) => Ok(InsertOutcome::complete(result.inserted_ids.len())),
            Err(e) => {
                let inserted = inserted_before_failure(&e);
                Err(DatabaseError::Insert {
                    inserted,
                    partial: inserted > 0,
                    cause: e.to_string(),
                })
            }
        }
    }

    fn count_rows(&mut self, name: &str) -> DatabaseResult<u64> {
        let MongoSession { runtime, db, .. } = self.session.active("count_rows")?;
        runtime
            .block_on(db.collection::<Document>(name).count_documents(None, None))
            .map_err(|e| DatabaseError::Query(format!("failed to count '{}': {}", name, e)))
    }

    fn ping(&mut self) -> DatabaseResult<()> {
        let MongoSession { runtime, db, .. } = self.session.active("ping")?;
        runtime
            .block_on(db.run_command(doc! { "ping": 1 }, None))
            .map(|_| ())
            .map_err(|e| DatabaseError::Connection(format!("Failed to ping database: {}", e)))
    }

    fn close(&mut self) -> DatabaseResult<()> {
        let Some(MongoSession { runtime, client, .. }) = self.session.release() else {
            return Ok(());
        };
        runtime.block_on(client.shutdown());
        info!("closed mongo client");
        Ok(())
    }
}

impl Drop for MongoAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing mongo adapter on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::{normalize_reader, NormalizeOptions};
    use crate::schema::ColumnDescriptor;
    use secrecy::SecretString;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnDescriptor::new("name", ColumnType::String),
            ColumnDescriptor::new("age", ColumnType::Integer),
            ColumnDescriptor::new("score", ColumnType::Float),
            ColumnDescriptor::new("active", ColumnType::Boolean),
        ])
    }

    #[test]
    fn test_validator_allows_null() {
        let validator = validator_document(&schema());
        let age = validator
            .get_document("$jsonSchema")
            .unwrap()
            .get_document("properties")
            .unwrap()
            .get_document("age")
            .unwrap();
        assert_eq!(
            age.get_array("bsonType").unwrap(),
            &vec![Bson::String("long".into()), Bson::String("null".into())]
        );
    }

    #[test]
    fn test_validator_columns_match_schema() {
        let columns = columns_from_validator(&validator_document(&schema())).unwrap();
        assert_eq!(columns.len(), 4);
        assert!(check_compatible("people", &columns, &schema(), &BsonRules).is_ok());
        assert_eq!(columns[3].native, "bool");
    }

    fn single_field(bson_types: Bson) -> Vec<ExistingColumn> {
        let validator = doc! {
            "$jsonSchema": {
                "bsonType": "object",
                "properties": { "value": { "bsonType": bson_types } },
            }
        };
        columns_from_validator(&validator).unwrap()
    }

    fn single_column(column_type: ColumnType) -> Schema {
        Schema::new(vec![ColumnDescriptor::new("value", column_type)])
    }

    #[test]
    fn test_validator_types_must_match_exactly() {
        let cases = [
            // declared, incoming, accepted
            ("double", ColumnType::Integer, false),
            ("long", ColumnType::Boolean, false),
            ("int", ColumnType::Integer, false),
            ("decimal", ColumnType::Float, false),
            ("long", ColumnType::Integer, true),
            ("double", ColumnType::Float, true),
            ("number", ColumnType::Integer, true),
            ("number", ColumnType::Float, true),
            ("number", ColumnType::Boolean, false),
        ];
        for (declared, incoming, accepted) in cases {
            let columns = single_field(Bson::Array(vec![
                Bson::String(declared.into()),
                Bson::String("null".into()),
            ]));
            let result = check_compatible("c", &columns, &single_column(incoming), &BsonRules);
            assert_eq!(result.is_ok(), accepted, "{} <- {:?}", declared, incoming);
        }
    }

    #[test]
    fn test_validator_with_several_types() {
        let columns = single_field(Bson::Array(vec![
            Bson::String("int".into()),
            Bson::String("long".into()),
        ]));
        assert_eq!(columns[0].native, "int,long");
        let schema = single_column(ColumnType::Integer);
        assert!(check_compatible("c", &columns, &schema, &BsonRules).is_ok());

        let scalar = single_field(Bson::String("string".into()));
        let schema = single_column(ColumnType::String);
        assert!(check_compatible("c", &scalar, &schema, &BsonRules).is_ok());
    }

    #[test]
    fn test_unconstrained_field_accepts_anything() {
        let validator = doc! {
            "$jsonSchema": { "properties": { "value": { "description": "free" } } }
        };
        let columns = columns_from_validator(&validator).unwrap();
        assert!(columns[0].native.is_empty());
        let schema = single_column(ColumnType::Boolean);
        assert!(check_compatible("c", &columns, &schema, &BsonRules).is_ok());
    }

    #[test]
    fn test_field_names_are_case_sensitive() {
        let columns = columns_from_validator(&validator_document(&schema())).unwrap();
        let renamed = Schema::new(vec![
            ColumnDescriptor::new("Name", ColumnType::String),
            ColumnDescriptor::new("age", ColumnType::Integer),
            ColumnDescriptor::new("score", ColumnType::Float),
            ColumnDescriptor::new("active", ColumnType::Boolean),
        ]);
        assert!(matches!(
            check_compatible("people", &columns, &renamed, &BsonRules),
            Err(DatabaseError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_validator_conflict_detected() {
        let other = Schema::new(vec![
            ColumnDescriptor::new("name", ColumnType::String),
            ColumnDescriptor::new("age", ColumnType::String),
            ColumnDescriptor::new("score", ColumnType::Float),
            ColumnDescriptor::new("active", ColumnType::Boolean),
        ]);
        let columns = columns_from_validator(&validator_document(&schema())).unwrap();
        assert!(matches!(
            check_compatible("people", &columns, &other, &BsonRules),
            Err(DatabaseError::SchemaConflict { .. })
        ));
    }

    #[test]
    fn test_validator_without_json_schema_is_schemaless() {
        let validator = doc! { "age": { "$gte": 0 } };
        assert!(columns_from_validator(&validator).is_none());
    }

    #[test]
    fn test_documents_keep_nulls_and_types() {
        let records = normalize_reader(
            "name,age,active\nAlice,30,true\nBob,,FALSE\n".as_bytes(),
            &NormalizeOptions::default(),
        )
        .unwrap();
        let docs = to_documents(&records);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get_i64("age").unwrap(), 30);
        assert!(docs[0].get_bool("active").unwrap());
        assert_eq!(docs[1].get("age"), Some(&Bson::Null));
        assert_eq!(docs[1].get_str("name").unwrap(), "Bob");
    }

    #[test]
    fn test_client_options_carry_credentials() {
        let config = DatabaseConfig::new(
            DatabaseType::Mongo,
            "mongo.internal",
            27018,
            "raw",
            "loader",
            SecretString::new("pw".to_string()),
        )
        .unwrap()
        .with_options([("authSource", "admin")]);

        let options = client_options(&config).unwrap();
        assert_eq!(
            options.hosts,
            vec![ServerAddress::Tcp {
                host: "mongo.internal".to_string(),
                port: Some(27018),
            }]
        );
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("loader"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let config = DatabaseConfig::new(
            DatabaseType::Mongo,
            "mongo.internal",
            27017,
            "raw",
            "loader",
            SecretString::new("pw".to_string()),
        )
        .unwrap()
        .with_options([("charset", "utf8")]);
        assert!(matches!(
            client_options(&config),
            Err(DatabaseError::Configuration(_))
        ));
    }

    #[test]
    fn test_close_without_connect_is_noop() {
        let mut adapter = MongoAdapter::new();
        adapter.close().unwrap();
        adapter.close().unwrap();
        assert_eq!(adapter.state(), AdapterState::Unconnected);
    }
}
