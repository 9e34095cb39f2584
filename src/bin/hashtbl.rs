//! hashtbl operator tool
//!
//! Create, inspect and rewrite hash table files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use hashstore::config::parse_table_kind;
use hashstore::{
    create_table_with, open_table, read_header, Config, Context, Key, Record, Result, TableKind,
    TblHeader,
};
use tracing_subscriber::{fmt, EnvFilter};

/// hashtbl
#[derive(Parser, Debug)]
#[command(name = "hashtbl")]
#[command(about = "Inspect and maintain hashstore table files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty table
    Create {
        /// Path of the table file
        path: PathBuf,

        /// log2 of the number of slots
        #[arg(short, long, default_value = "14")]
        log_slots: u64,

        /// Table kind (hashtbl|hash|memtbl|mem); defaults to the configured kind
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Print the header
    Info {
        /// Path of the table file
        path: PathBuf,
    },

    /// Scan the table and print statistics
    Stats {
        /// Path of the table file
        path: PathBuf,
    },

    /// Look up one key
    Get {
        /// Path of the table file
        path: PathBuf,

        /// Key as 64 hex characters
        key: String,
    },

    /// Print records in slot order
    Dump {
        /// Path of the table file
        path: PathBuf,

        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Copy live records into a fresh table using an ordered load
    Rewrite {
        /// Source table
        src: PathBuf,

        /// Destination table (overwritten)
        dst: PathBuf,

        /// log2 of the destination slot count; defaults to the source's
        #[arg(short, long)]
        log_slots: Option<u64>,

        /// Destination kind; defaults to the configured kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Drop trashed records that expired on or before this day
        /// (days since the unix epoch)
        #[arg(short, long)]
        today: Option<u32>,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hashstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();

    // Resolve the default table kind once, before touching any file
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(args.command, &config) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands, config: &Config) -> Result<()> {
    let ctx = Context::background();

    match command {
        Commands::Create {
            path,
            log_slots,
            kind,
        } => {
            let header = TblHeader {
                created: now_secs(),
                hash_key: config.hash_key,
                kind: resolve_kind(kind.as_deref(), config)?,
                log_slots,
            };
            let tbl = create_table_with(&ctx, create_file(&path)?, header)?;
            tbl.sync()?;
            tbl.close();
            println!("created {} ({}, {} slots)", path.display(), header.kind, header.num_slots());
        }

        Commands::Info { path } => {
            let header = read_header(&File::open(&path)?)?;
            println!("kind:       {}", header.kind);
            println!("created:    {}", header.created);
            println!("hash_key:   {}", header.hash_key);
            println!("log_slots:  {}", header.log_slots);
            println!("num_slots:  {}", header.num_slots());
            println!("table_size: {}", header.table_size());
        }

        Commands::Stats { path } => {
            let tbl = open_table(&ctx, open_file(&path)?)?;
            let stats = tbl.stats();
            println!("kind:        {}", stats.kind);
            println!("created:     {}", stats.created);
            println!("num_set:     {}", stats.num_set);
            println!("len_set:     {}", stats.len_set);
            println!("avg_set:     {:.1}", stats.avg_set);
            println!("num_trash:   {}", stats.num_trash);
            println!("len_trash:   {}", stats.len_trash);
            println!("avg_trash:   {:.1}", stats.avg_trash);
            println!("num_corrupt: {}", stats.num_corrupt);
            println!("num_slots:   {}", stats.num_slots);
            println!("table_size:  {}", stats.table_size);
            println!(
                "load:        {:.4} (compact at {}, max {})",
                stats.load,
                tbl.compact_load(),
                tbl.max_load()
            );
            tbl.close();
        }

        Commands::Get { path, key } => {
            let key: Key = key.parse()?;
            let tbl = open_table(&ctx, open_file(&path)?)?;
            match tbl.lookup(&ctx, &key)? {
                Some(record) => print_record(&record),
                None => println!("not found: {}", key),
            }
            tbl.close();
        }

        Commands::Dump { path, limit } => {
            let tbl = open_table(&ctx, open_file(&path)?)?;
            let limit = limit.unwrap_or(usize::MAX);
            let mut printed = 0usize;
            tbl.range(&ctx, &mut |record| {
                if printed >= limit {
                    return Ok(false);
                }
                print_record(record);
                printed += 1;
                Ok(true)
            })?;
            tbl.close();
        }

        Commands::Rewrite {
            src,
            dst,
            log_slots,
            kind,
            today,
        } => {
            let source = open_table(&ctx, open_file(&src)?)?;

            let mut records: Vec<Record> = Vec::new();
            source.range(&ctx, &mut |record| {
                let dead = matches!(today, Some(day) if record.trashed() && record.expires.is_expired(day));
                if !dead {
                    records.push(*record);
                }
                Ok(true)
            })?;
            let dropped = source.stats().num_set - records.len() as u64;

            let header = TblHeader {
                created: now_secs(),
                hash_key: config.hash_key,
                kind: resolve_kind(kind.as_deref(), config)?,
                log_slots: log_slots.unwrap_or(source.log_slots()),
            };
            source.close();

            let dest = create_table_with(&ctx, create_file(&dst)?, header)?;
            records.sort_by_key(|record| header.home_slot(&record.key));

            let mut session = dest.expect_ordered(&ctx)?;
            for record in &records {
                session.commit(*record)?;
            }
            session.finish()?;
            dest.sync()?;

            tracing::info!(
                kept = records.len(),
                dropped,
                load = dest.load(),
                "rewrote {} into {}",
                src.display(),
                dst.display()
            );
            dest.close();
        }
    }

    Ok(())
}

fn resolve_kind(kind: Option<&str>, config: &Config) -> Result<TableKind> {
    match kind {
        Some(kind) => parse_table_kind(kind),
        None => Ok(config.default_kind),
    }
}

fn open_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

fn create_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn print_record(record: &Record) {
    println!(
        "{} log={} offset={} length={} created={} expires={} trash={}",
        record.key,
        record.log,
        record.offset,
        record.length,
        record.created,
        record.expires.days(),
        record.trashed()
    );
}
