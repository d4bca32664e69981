//! CLI for loading raw delimited files into a database

use anyhow::{bail, Context};
use clap::Parser;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use raw2database::{
    discover_files, init_logging, load, ConnectionSettings, DatabaseConfig, FormatHint,
    LoadOptions, NormalizeOptions,
};

/// Entry point for the raw2database CLI
#[derive(Parser)]
#[command(name = "raw2database")]
#[command(about = "Load raw delimited files into PostgreSQL, MySQL, MongoDB or SQLite", long_about = None)]
struct Cli {
    /// Connection record (JSON, TOML or YAML). Read from DB_* environment variables when omitted
    #[arg(long, value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Target engine (postgres, mysql, mongo, sqlite); overrides the record's db_type
    #[arg(long, value_name = "TYPE")]
    db_type: Option<String>,

    /// A raw file, or a directory whose matching files are loaded in name order
    #[arg(long, value_name = "PATH")]
    raw_files_path: PathBuf,

    /// File extension to pick up when loading a directory
    #[arg(long, default_value = "csv")]
    extension: String,

    /// Field delimiter
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Treat the first row as data and name columns positionally
    #[arg(long)]
    no_header: bool,

    /// Drop repeated rows, keeping the first occurrence
    #[arg(long)]
    deduplicate: bool,

    /// Fail a file instead of loosening a mostly-typed column to string
    #[arg(long)]
    strict_types: bool,

    /// Rows per relational INSERT statement
    #[arg(long, value_name = "N")]
    chunk_size: Option<usize>,
}

fn connection_config(cli: &Cli) -> anyhow::Result<DatabaseConfig> {
    let mut settings = match &cli.config_file {
        Some(path) => ConnectionSettings::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ConnectionSettings::from_env(),
    };
    if let Some(db_type) = &cli.db_type {
        settings = settings.with_db_type(db_type.as_str());
    }
    Ok(DatabaseConfig::try_from(settings)?)
}

fn load_options(cli: &Cli) -> anyhow::Result<LoadOptions> {
    if !cli.delimiter.is_ascii() {
        bail!("delimiter must be a single ASCII character");
    }
    let mut options = LoadOptions {
        normalize: NormalizeOptions {
            format: FormatHint {
                delimiter: cli.delimiter as u8,
                has_header: !cli.no_header,
            },
            deduplicate: cli.deduplicate,
            strict_types: cli.strict_types,
        },
        ..Default::default()
    };
    if let Some(chunk_size) = cli.chunk_size {
        options = options.with_chunk_size(chunk_size);
    }
    Ok(options)
}

fn raw_files(path: &Path, extension: &str) -> anyhow::Result<Vec<PathBuf>> {
    if path.is_dir() {
        discover_files(path, extension)
            .with_context(|| format!("failed to list {}", path.display()))
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

/// Returns whether every file loaded.
fn run(cli: &Cli) -> anyhow::Result<bool> {
    let config = connection_config(cli)?;
    let options = load_options(cli)?;
    let files = raw_files(&cli.raw_files_path, &cli.extension)?;

    let report = load(&config, &files, options)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for file in report.files() {
        serde_json::to_writer(&mut out, file)?;
        writeln!(out)?;
    }
    Ok(report.is_success())
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
