/*!
 * Vigil CLI - offline tooling for the audit store
 *
 * Validates configuration, exports signed archives from a SQLite audit store,
 * verifies archives produced elsewhere and runs a single archiver pass.
 */

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use vigil::{
    archiver::{
        DirectoryTransport, FlagTrafficControl, MemoryPropertyStore, PropertyLease,
        TransportArchiveSink, ARCHIVER_LOCK_PROPERTY,
    },
    config::{LogLevel, VigilConfig},
    error::{Result, VigilError, EXIT_SUCCESS},
    logging, verify_archive, Archiver, Exporter, SqliteStore,
};
use vigil_core_audit::{AuditSigner, MessageCatalog, ServiceId, SECRET_ENV_VAR};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Audit record export, verification and archiving", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Shorthand for --log-level debug
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    CheckConfig {
        /// File to check
        file: PathBuf,
    },

    /// Export records to a signed archive
    Export {
        /// SQLite audit store
        #[arg(long = "db", value_name = "FILE")]
        db: PathBuf,

        /// Archive to write
        #[arg(short = 'o', long = "out", value_name = "FILE")]
        out: PathBuf,

        /// Earliest record time (epoch millis or RFC 3339)
        #[arg(long = "from", value_parser = parse_time)]
        from: Option<i64>,

        /// Latest record time, inclusive (epoch millis or RFC 3339)
        #[arg(long = "to", value_parser = parse_time)]
        to: Option<i64>,

        /// Restrict to message records of these services (hex id, repeatable)
        #[arg(long = "service", value_name = "ID")]
        services: Vec<ServiceId>,
    },

    /// Check an archive's digests and signature
    Verify {
        /// Archive to verify
        archive: PathBuf,

        /// Print the verified metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one archiver pass against a SQLite store
    Archive {
        /// SQLite audit store
        #[arg(long = "db", value_name = "FILE")]
        db: PathBuf,

        /// Directory receiving finished archives
        #[arg(long = "dest", value_name = "DIR")]
        dest: PathBuf,

        /// Store capacity in bytes (overrides archiver.max_store_bytes)
        #[arg(long = "max-bytes")]
        max_bytes: Option<u64>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn parse_time(value: &str) -> std::result::Result<i64, String> {
    if let Ok(millis) = value.parse::<i64>() {
        return Ok(millis);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc).timestamp_millis())
        .map_err(|e| format!("expected epoch millis or RFC 3339 time: {}", e))
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => VigilConfig::from_file(path)?,
        None => VigilConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level.into();
    }
    config.logging.verbose |= cli.verbose;
    logging::init_logging(&config.logging)?;

    match cli.command {
        Commands::CheckConfig { file } => check_config(&file),
        Commands::Export {
            db,
            out,
            from,
            to,
            services,
        } => export(&config, &db, &out, from, to, &services),
        Commands::Verify { archive, json } => verify(&archive, json),
        Commands::Archive {
            db,
            dest,
            max_bytes,
        } => archive(&config, &db, &dest, max_bytes),
    }
}

fn check_config(file: &Path) -> Result<()> {
    let config = VigilConfig::from_file(file)?;
    config.validate()?;
    let policy = config.audit.resolve();
    println!("{}: OK", file.display());
    println!(
        "  message threshold {}, admin threshold {}, detail threshold {}",
        policy.message_threshold.name(),
        policy.admin_threshold.name(),
        policy.detail_threshold.name()
    );
    println!(
        "  archiver stop/start/shutdown {}%/{}%/{}%",
        config.archiver.stop_percent, config.archiver.start_percent, config.archiver.shutdown_percent
    );
    Ok(())
}

fn signer_from_env() -> Option<AuditSigner> {
    match AuditSigner::from_env() {
        Ok(signer) => Some(signer),
        Err(e) => {
            warn!("Archive will not be signed: {}", e);
            None
        }
    }
}

fn open_store(db: &Path) -> Result<Arc<SqliteStore>> {
    if !db.exists() {
        return Err(VigilError::Store(format!(
            "audit store {} does not exist",
            db.display()
        )));
    }
    Ok(Arc::new(SqliteStore::open(db)?))
}

fn export(
    config: &VigilConfig,
    db: &Path,
    out: &Path,
    from: Option<i64>,
    to: Option<i64>,
    services: &[ServiceId],
) -> Result<()> {
    let store = open_store(db)?;
    let mut exporter = Exporter::new(store, Arc::new(MessageCatalog::builtin()));
    if let Some(signer) = signer_from_env() {
        exporter = exporter.with_signer(signer);
    } else if config.audit.sign_records {
        return Err(VigilError::Config(format!(
            "record signing is enabled but {} is not set",
            SECRET_ENV_VAR
        )));
    }

    let file = BufWriter::new(File::create(out)?);
    let info = exporter.export_time_range(from, to, services, file)?;
    info!(
        "Exported {} records to {}",
        info.records_exported,
        out.display()
    );
    println!(
        "Exported {} records ({} bytes) to {}",
        info.records_exported,
        info.transferred_bytes,
        out.display()
    );
    Ok(())
}

fn verify(archive: &Path, json: bool) -> Result<()> {
    let signer = AuditSigner::from_env()?;
    let metadata = verify_archive(File::open(archive)?, &signer)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }
    let data = &metadata.exported_audit_data;
    println!("{}: OK", archive.display());
    println!("  records: {}", data.records_exported);
    if let (Some(low), Some(high)) = (data.lowest_audit_record_id, data.highest_audit_record_id) {
        println!("  ids:     {} - {}", low, high);
    }
    println!("  sha1:    {}", data.sha1_digest);
    println!("  md5:     {}", data.md5_digest);
    Ok(())
}

fn archive(config: &VigilConfig, db: &Path, dest: &Path, max_bytes: Option<u64>) -> Result<()> {
    let store = open_store(db)?;
    let node_id = config.audit.node_id.clone();

    let mut exporter = Exporter::new(store.clone(), Arc::new(MessageCatalog::builtin()));
    if let Some(signer) = signer_from_env() {
        exporter = exporter.with_signer(signer);
    }
    let sink = TransportArchiveSink::new(
        exporter,
        Arc::new(DirectoryTransport::new(dest)),
        dest.join(".staging"),
        &node_id,
    )
    .with_max_archive_bytes(config.archiver.max_archive_bytes);

    let lock = PropertyLease::new(MemoryPropertyStore::new(), ARCHIVER_LOCK_PROPERTY, &node_id);
    let mut archiver = Archiver::from_config(
        store,
        Arc::new(sink),
        Arc::new(lock),
        Arc::new(FlagTrafficControl::new()),
        &config.archiver,
    )?;
    if let Some(max) = max_bytes {
        archiver = archiver.with_max_size(max);
    }

    let summary = archiver.run_once()?;
    match summary.usage {
        Some(usage) => println!("Store usage: {:.1}%", usage),
        None => println!("Store usage: unknown"),
    }
    if summary.halted {
        return Err(VigilError::Archive(
            "archiver halted; check the log for the reason".to_string(),
        ));
    }
    println!(
        "Archived {} records, deleted {} ({} passes)",
        summary.records_archived, summary.records_deleted, summary.passes
    );
    Ok(())
}
