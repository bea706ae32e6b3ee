use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use icebox::engine::tar::{TarConfig, TarEngine};
use icebox::{
    BackupEngine, Compression, EngineError, LocalStorage, RsyncConfig, RsyncEngine, StorageSink,
    Symlinks, DEFAULT_MAX_SEGMENT_SIZE,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "icebox", version = "1.0.0", about = "Incremental filesystem backup engine")]
struct Cli {
    /// Storage directory for segments and manifests
    #[arg(long, default_value = ".icebox-store", global = true)]
    store: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a directory tree into a backup generation
    Backup {
        /// Source directory to back up
        source: PathBuf,
        /// Backup id; generated when omitted
        #[arg(short, long)]
        backup_id: Option<String>,
        /// Previous generation to increment from (rsync engine)
        #[arg(short, long)]
        parent: Option<String>,
        /// Engine: rsync (default) or tar
        #[arg(short, long, default_value = "rsync")]
        engine: String,
        /// Compression: gzip (default), bzip2, xz, none
        #[arg(short, long, default_value = "gzip")]
        compression: String,
        /// Symmetric key file; enables encryption
        #[arg(short = 'k', long)]
        encrypt_key_file: Option<PathBuf>,
        /// Glob patterns to exclude, relative to the source root
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
        /// Follow symlinks instead of preserving them
        #[arg(long)]
        dereference: bool,
        /// Maximum segment size in bytes
        #[arg(long, default_value_t = DEFAULT_MAX_SEGMENT_SIZE)]
        max_segment_size: usize,
        /// Archiver binary for the tar engine
        #[arg(long, default_value = "tar")]
        archiver: PathBuf,
    },
    /// Rebuild a backup generation into a directory
    Restore {
        backup_id: String,
        /// Directory to restore into
        #[arg(short, long, default_value = ".")]
        target: PathBuf,
        /// Engine: rsync (default) or tar
        #[arg(short, long, default_value = "rsync")]
        engine: String,
        /// Compression used at backup time (tar engine only; the rsync
        /// engine reads it from the manifest)
        #[arg(short, long, default_value = "gzip")]
        compression: String,
        #[arg(short = 'k', long)]
        encrypt_key_file: Option<PathBuf>,
        /// Decode and validate without touching the filesystem
        #[arg(long)]
        dry_run: bool,
        /// Archiver binary for the tar engine
        #[arg(long, default_value = "tar")]
        archiver: PathBuf,
    },
    /// Show manifest details of a backup generation
    Info {
        backup_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("icebox: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Exit codes: 1 user/config, 2 I/O or storage, 3 archiver, 4 cancelled.
fn exit_code(e: &EngineError) -> u8 {
    match e {
        EngineError::Config(_) | EngineError::Crypto(_) => 1,
        EngineError::ExternalArchiver(_) => 3,
        EngineError::Cancelled => 4,
        _ => 2,
    }
}

fn parse_compression(name: &str) -> Result<Compression, EngineError> {
    Compression::from_name(name)
        .ok_or_else(|| EngineError::Config(format!("unknown compression {name:?}")))
}

fn run(cli: Cli) -> Result<(), EngineError> {
    let storage: Arc<dyn StorageSink> = Arc::new(LocalStorage::new(&cli.store)?);

    match cli.command {
        // ── Backup ───────────────────────────────────────────────────────────
        Commands::Backup {
            source,
            backup_id,
            parent,
            engine,
            compression,
            encrypt_key_file,
            exclude,
            dereference,
            max_segment_size,
            archiver,
        } => {
            let compression = parse_compression(&compression)?;
            let backup_id =
                backup_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let engine: Box<dyn BackupEngine> = match engine.as_str() {
                "rsync" => Box::new(RsyncEngine::new(
                    RsyncConfig {
                        compression,
                        encrypt_key_file,
                        symlinks: if dereference {
                            Symlinks::Dereference
                        } else {
                            Symlinks::Preserve
                        },
                        exclude,
                        max_segment_size,
                        dry_run: false,
                    },
                    Arc::clone(&storage),
                )?),
                "tar" => Box::new(TarEngine::new(
                    TarConfig {
                        archiver_path: archiver,
                        compression,
                        dereference,
                        exclude,
                        encrypt_key_file,
                        max_segment_size,
                        dry_run: false,
                    },
                    Arc::clone(&storage),
                )?),
                other => {
                    return Err(EngineError::Config(format!("unknown engine {other:?}")))
                }
            };

            let prev_manifest = match &parent {
                Some(parent_id) => Some(storage.read_meta(parent_id)?),
                None => None,
            };
            let manifest = engine.backup(&backup_id, &source, prev_manifest.as_deref())?;
            engine.post_backup(&backup_id, &manifest)?;
            println!("Backup complete: {backup_id}");
        }

        // ── Restore ──────────────────────────────────────────────────────────
        Commands::Restore {
            backup_id,
            target,
            engine,
            compression,
            encrypt_key_file,
            dry_run,
            archiver,
        } => {
            let compression = parse_compression(&compression)?;
            let engine: Box<dyn BackupEngine> = match engine.as_str() {
                "rsync" => Box::new(RsyncEngine::new(
                    RsyncConfig {
                        compression,
                        encrypt_key_file,
                        dry_run,
                        ..RsyncConfig::default()
                    },
                    Arc::clone(&storage),
                )?),
                "tar" => Box::new(TarEngine::new(
                    TarConfig {
                        archiver_path: archiver,
                        compression,
                        encrypt_key_file,
                        dry_run,
                        ..TarConfig::default()
                    },
                    Arc::clone(&storage),
                )?),
                other => {
                    return Err(EngineError::Config(format!("unknown engine {other:?}")))
                }
            };

            engine.restore(&backup_id, &target)?;
            println!(
                "Restore {}: {backup_id} -> {}",
                if dry_run { "validated" } else { "complete" },
                target.display()
            );
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { backup_id } => {
            let meta = icebox::FsMeta::from_bytes(&storage.read_meta(&backup_id)?)?;
            println!("── Backup {backup_id} ─────────────────────────────────");
            println!("  Engine          {}", meta.meta.engine);
            println!("  Level           {:04}", meta.meta.level_id);
            println!("  Created         {}", meta.meta.created_at);
            println!("  Platform        {}", meta.meta.platform);
            println!("  Compression     {}", meta.meta.compression);
            println!("  Encrypted       {}", meta.meta.encryption);
            println!("  Entries         {} ({} live)", meta.files.len(), meta.live_count());
            println!("  Directories     {}", meta.directories.len());
            println!("  Bytes on disk   {}", meta.meta.backup_size_on_disk);
            println!("  Bytes uploaded  {}", meta.meta.backup_size_compressed);
            println!("  Block size      {}", meta.meta.rsync_block_size);
        }
    }

    Ok(())
}
