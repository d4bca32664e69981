//! Load orchestration: normalize each file and push it through an adapter.
//!
//! Files are processed one after another on the calling thread. A failure
//! confined to one file is recorded in that file's [`FileResult`] and the
//! run moves on; configuration, connection and lifecycle failures end the
//! run with an error.

use serde::{Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::database::{
    DatabaseAdapter, DatabaseConfig, DatabaseError, EngineAdapter, DEFAULT_CHUNK_SIZE,
};
use crate::config::ConfigError;
use crate::error::{Error, Result};
use crate::normalizer::{normalize_file, FormatHint, NormalizeOptions, TypeWarning};

/// Options applied to every file of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    pub normalize: NormalizeOptions,
    /// Rows per relational `INSERT` statement
    pub chunk_size: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            normalize: NormalizeOptions::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl LoadOptions {
    pub fn with_format(mut self, format: FormatHint) -> Self {
        self.normalize.format = format;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Outcome of loading one file
#[derive(Debug, Serialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub target: String,
    pub rows_attempted: usize,
    pub rows_inserted: usize,
    pub partial: bool,
    /// Whether this run created the target
    pub created: bool,
    pub warnings: Vec<TypeWarning>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
}

impl FileResult {
    fn new(path: &Path, target: String) -> Self {
        Self {
            path: path.to_path_buf(),
            target,
            rows_attempted: 0,
            rows_inserted: 0,
            partial: false,
            created: false,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Ordered per-file results of a run
#[derive(Debug, Default, Serialize)]
pub struct LoadReport {
    files: Vec<FileResult>,
}

impl LoadReport {
    pub fn files(&self) -> &[FileResult] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// `true` when every file loaded without error
    pub fn is_success(&self) -> bool {
        self.files.iter().all(FileResult::is_success)
    }

    /// Per-file errors in file order
    pub fn errors(&self) -> Vec<(&Path, &Error)> {
        self.files
            .iter()
            .filter_map(|f| f.error.as_ref().map(|e| (f.path.as_path(), e)))
            .collect()
    }

    pub fn rows_inserted(&self) -> usize {
        self.files.iter().map(|f| f.rows_inserted).sum()
    }
}

/// Target table or collection name for a file: its stem.
pub fn target_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Regular files in `dir` whose extension matches `extension`
/// (case-insensitive, leading dot optional), sorted by file name.
pub fn discover_files(dir: impl AsRef<Path>, extension: &str) -> Result<Vec<PathBuf>> {
    let wanted = extension.trim_start_matches('.');
    let mut files = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(wanted));
        if matches {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Drives one load run over an adapter it owns.
pub struct Loader<A: DatabaseAdapter> {
    adapter: A,
    options: LoadOptions,
}

impl<A: DatabaseAdapter> Loader<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            options: LoadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn into_adapter(self) -> A {
        self.adapter
    }

    /// Connect, load every path in order, and close.
    ///
    /// The adapter is closed on every return path.
    pub fn run<P: AsRef<Path>>(
        &mut self,
        config: &DatabaseConfig,
        paths: &[P],
    ) -> Result<LoadReport> {
        if config.database_type() != self.adapter.database_type() {
            return Err(DatabaseError::Configuration(format!(
                "{} descriptor given to a {} adapter",
                config.database_type(),
                self.adapter.database_type()
            ))
            .into());
        }
        if paths.is_empty() {
            return Err(ConfigError::Invalid("no raw files to load".to_string()).into());
        }

        info!(
            engine = %config.database_type(),
            database = config.database(),
            files = paths.len(),
            "starting load"
        );

        if let Err(e) = self.adapter.connect(config) {
            self.close_adapter();
            return Err(e.into());
        }

        let mut report = LoadReport::default();
        for path in paths {
            match self.load_file(path.as_ref()) {
                Ok(result) => report.files.push(result),
                Err(fatal) => {
                    self.close_adapter();
                    return Err(fatal);
                }
            }
        }

        self.close_adapter();
        info!(
            files = report.len(),
            failed = report.errors().len(),
            rows = report.rows_inserted(),
            "load finished"
        );
        Ok(report)
    }

    fn close_adapter(&mut self) {
        if let Err(e) = self.adapter.close() {
            warn!("failed to close adapter: {}", e);
        }
    }

    /// Load one file. `Err` only for errors that end the run.
    fn load_file(&mut self, path: &Path) -> Result<FileResult> {
        let target = target_name(path);
        let mut result = FileResult::new(path, target.clone());
        info!(path = %path.display(), table = %target, "loading file");

        let records = match normalize_file(path, &self.options.normalize) {
            Ok(records) => records,
            Err(e) => return record_failure(result, e.into()),
        };
        result.rows_attempted = records.len();
        result.warnings = records.warnings().to_vec();

        match self.adapter.ensure_target(&target, records.schema()) {
            Ok(created) => result.created = created,
            Err(e) => return record_failure(result, e.into()),
        }

        match self.adapter.insert_batch(&target, &records) {
            Ok(outcome) => {
                result.rows_inserted = outcome.inserted;
                result.partial = outcome.partial;
            }
            Err(e) => {
                if let DatabaseError::Insert {
                    inserted, partial, ..
                } = &e
                {
                    result.rows_inserted = *inserted;
                    result.partial = *partial;
                }
                return record_failure(result, e.into());
            }
        }

        match self.adapter.count_rows(&target) {
            Ok(total) => info!(
                table = %target,
                inserted = result.rows_inserted,
                total,
                "{} rows were saved",
                result.rows_inserted
            ),
            Err(e) => warn!(table = %target, "could not count rows: {}", e),
        }

        Ok(result)
    }
}

fn record_failure(mut result: FileResult, error: Error) -> Result<FileResult> {
    if error.is_fatal() {
        return Err(error);
    }
    crate::safe_log!(warn, "{} failed: {}", result.path.display(), error);
    result.error = Some(error);
    Ok(result)
}

/// Load `paths` into the database `config` describes.
///
/// Builds the engine adapter for the descriptor and runs a [`Loader`] with
/// it.
pub fn load<P: AsRef<Path>>(
    config: &DatabaseConfig,
    paths: &[P],
    options: LoadOptions,
) -> Result<LoadReport> {
    let adapter = EngineAdapter::for_config(config)?.with_chunk_size(options.chunk_size);
    Loader::new(adapter).with_options(options).run(config, paths)
}
