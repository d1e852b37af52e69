//! TierKV Inspect Binary
//!
//! Offline view of one region's disk files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tierkv::block::BlockDiskCache;
use tierkv::record::RecordDiskCache;
use tierkv::serializer::BincodeSerializer;
use tierkv::{CacheKey, DiskConfig, DiskStore, Result, TierError};
use tracing_subscriber::{fmt, EnvFilter};

/// TierKV disk inspector
#[derive(Parser, Debug)]
#[command(name = "tierkv-inspect")]
#[command(about = "Inspect the disk tier of a TierKV region")]
#[command(version)]
struct Args {
    /// Data directory (the context root)
    #[arg(short, long, default_value = "./tierkv_data")]
    data_dir: String,

    /// Region name
    #[arg(short, long)]
    region: String,

    #[command(subcommand)]
    store: StoreKind,
}

#[derive(Subcommand, Debug)]
enum StoreKind {
    /// Region uses a block store
    Block {
        /// Block size the region was created with
        #[arg(short, long, default_value_t = DiskConfig::DEFAULT_BLOCK_SIZE)]
        block_size: usize,

        #[command(subcommand)]
        action: Action,
    },

    /// Region uses a record store
    Record {
        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print store statistics
    Stats,

    /// List keys, oldest first
    Keys,

    /// Print one element
    Get {
        /// Name key to read
        key: String,
    },

    /// Compact the record file (record stores only)
    Optimize,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tierkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("TierKV Inspect v{}", tierkv::VERSION);

    let dir = PathBuf::from(&args.data_dir).join(&args.region);
    if let Err(e) = run(&dir, &args.region, args.store) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(dir: &Path, region: &str, store: StoreKind) -> Result<()> {
    // Opening without a key file resets the data file, so refuse instead
    let key_path = dir.join(format!("{}.key", region));
    if !key_path.exists() {
        return Err(TierError::Config(format!(
            "No key file at {}; nothing to inspect",
            key_path.display()
        )));
    }

    let serializer = Arc::new(BincodeSerializer);
    match store {
        StoreKind::Block { block_size, action } => {
            let cache = BlockDiskCache::open(dir, region, &DiskConfig::block(block_size), serializer)?;
            match action {
                Action::Stats => {
                    let stats = cache.stats();
                    println!("keys:          {}", cache.len());
                    println!("block size:    {}", stats.block_size);
                    println!("blocks:        {}", stats.block_count);
                    println!("empty blocks:  {}", stats.empty_blocks);
                    println!("file bytes:    {}", stats.file_len);
                }
                Action::Keys => print_keys(&cache),
                Action::Get { key } => print_element(&cache, &key)?,
                Action::Optimize => {
                    return Err(TierError::Config(
                        "Block stores reuse freed blocks directly and have no optimize".to_string(),
                    ))
                }
            }
        }
        StoreKind::Record { action } => {
            let config = DiskConfig::record().optimize_on_shutdown(false);
            let cache = RecordDiskCache::open(dir, region, &config, serializer)?;
            match action {
                Action::Stats => {
                    let stats = cache.stats();
                    println!("keys:              {}", cache.len());
                    println!("file bytes:        {}", stats.file_len);
                    println!("recycle bin:       {} ranges, {} bytes", stats.recycle_bin_len, stats.recycle_bin_bytes);
                    println!("leaked bytes:      {}", stats.leaked_bytes);
                }
                Action::Keys => print_keys(&cache),
                Action::Get { key } => print_element(&cache, &key)?,
                Action::Optimize => {
                    let before = cache.stats().file_len;
                    cache.optimize()?;
                    cache.shutdown()?;
                    println!("{} -> {} bytes", before, cache.stats().file_len);
                }
            }
        }
    }
    Ok(())
}

fn print_keys(store: &impl DiskStore) {
    for key in store.keys() {
        println!("{}", key);
    }
}

fn print_element(store: &impl DiskStore, key: &str) -> Result<()> {
    match store.read(&CacheKey::name(key))? {
        Some(element) => {
            println!("key:       {}", element.key);
            println!("bytes:     {}", element.value.len());
            println!("eternal:   {}", element.attributes.is_eternal);
            println!("created:   {}", element.attributes.create_time_ms);
            println!("value:     {}", String::from_utf8_lossy(&element.value));
        }
        None => println!("(not found)"),
    }
    Ok(())
}
