//! largebuf simulator
//!
//! Drives large buffers over an in-memory block cache persisted to an image
//! file, so blobs can be created, resized and inspected across runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use crossbeam::channel;
use largebuf::buffer_cache::{CompletionMode, MemoryCache, MemoryTransaction};
use largebuf::large_buf::{has_segment_magic, IndexRecord};
use largebuf::{Access, BlockId, Config, Geometry, LargeBuf, LargeBufError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// largebuf simulator
#[derive(Parser, Debug)]
#[command(name = "largebuf-sim")]
#[command(about = "Create and reshape large buffers in a block cache image")]
#[command(version)]
struct Args {
    /// Cache image file
    #[arg(short, long, default_value = "./largebuf.img")]
    image: PathBuf,

    /// Cache block size in bytes
    #[arg(short, long, default_value = "4096")]
    block_size: usize,

    #[command(subcommand)]
    command: Commands,
}

/// The blob a command operates on. The size is kept by the caller, not in
/// the index block.
#[derive(clap::Args, Debug)]
struct BlobRef {
    /// Index block id
    #[arg(long)]
    index: BlockId,

    /// Current size in bytes
    #[arg(long)]
    size: u32,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate a new blob, optionally filled with a repeated pattern
    Alloc {
        #[arg(long)]
        size: u32,

        #[arg(long)]
        fill: Option<String>,
    },

    /// Print a blob's geometry
    Inspect {
        #[command(flatten)]
        blob: BlobRef,
    },

    /// Grow the tail
    Append {
        #[command(flatten)]
        blob: BlobRef,

        #[arg(long)]
        by: u32,
    },

    /// Grow the head
    Prepend {
        #[command(flatten)]
        blob: BlobRef,

        #[arg(long)]
        by: u32,
    },

    /// Shrink the tail
    Unappend {
        #[command(flatten)]
        blob: BlobRef,

        #[arg(long)]
        by: u32,
    },

    /// Shrink the head
    Unprepend {
        #[command(flatten)]
        blob: BlobRef,

        #[arg(long)]
        by: u32,
    },

    /// Write text at a position
    Write {
        #[command(flatten)]
        blob: BlobRef,

        #[arg(long)]
        pos: u32,

        text: String,
    },

    /// Read bytes at a position
    Read {
        #[command(flatten)]
        blob: BlobRef,

        #[arg(long)]
        pos: u32,

        #[arg(long)]
        len: u32,
    },

    /// Delete a blob and free its blocks
    Delete {
        #[command(flatten)]
        blob: BlobRef,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,largebuf=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!("largebuf-sim v{}", largebuf::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder().block_size(args.block_size).build();
    let cache = open_cache(&args.image, &config)?;
    let txn = cache.begin(CompletionMode::Immediate);

    match args.command {
        Commands::Alloc { size, fill } => {
            check_out_of_line(&config, size)?;
            let mut buf = LargeBuf::new(&txn, &config);
            buf.allocate(size)?;
            if let Some(pattern) = fill.filter(|p| !p.is_empty()) {
                let data: Vec<u8> = pattern.bytes().cycle().take(size as usize).collect();
                buf.fill_at(0, &data);
            }
            println!("index {} size {}", buf.index_block_id(), buf.size());
            buf.release();
        }
        Commands::Inspect { blob } => {
            let mut buf = load(&txn, &config, &blob, Access::Read)?;
            let geometry = buf.geometry();
            println!(
                "index {} size {} first_block_offset {} segments {}/{}",
                buf.index_block_id(),
                buf.size(),
                buf.first_block_offset(),
                buf.num_segments(),
                buf.max_segments()
            );
            for (ix, id) in buf.segment_block_ids().iter().enumerate() {
                println!("  [{}] block {} len {}", ix, id, geometry.segment_byte_length(ix));
            }
            buf.release();
        }
        Commands::Append { blob, by } => reshape(&txn, &config, &blob, |buf| buf.append(by))?,
        Commands::Prepend { blob, by } => reshape(&txn, &config, &blob, |buf| buf.prepend(by))?,
        Commands::Unappend { blob, by } => reshape(&txn, &config, &blob, |buf| {
            check_shrink(buf.size(), by)?;
            buf.unappend(by);
            Ok(())
        })?,
        Commands::Unprepend { blob, by } => reshape(&txn, &config, &blob, |buf| {
            check_shrink(buf.size(), by)?;
            buf.unprepend(by);
            Ok(())
        })?,
        Commands::Write { blob, pos, text } => reshape(&txn, &config, &blob, |buf| {
            check_range(&buf.geometry(), pos, text.len())?;
            buf.fill_at(pos, text.as_bytes());
            Ok(())
        })?,
        Commands::Read { blob, pos, len } => {
            let mut buf = load(&txn, &config, &blob, Access::Read)?;
            let read = check_range(&buf.geometry(), pos, len as usize).map(|()| {
                let mut out = vec![0u8; len as usize];
                buf.read_at(pos, &mut out);
                out
            });
            buf.release();
            println!("{}", String::from_utf8_lossy(&read?));
        }
        Commands::Delete { blob } => {
            let mut buf = load(&txn, &config, &blob, Access::Write)?;
            buf.mark_deleted();
            buf.release();
            println!("deleted index {}", blob.index);
        }
    }

    cache.save_image(&args.image)
}

fn open_cache(image: &Path, config: &Config) -> Result<Arc<MemoryCache>> {
    if image.exists() {
        MemoryCache::load_image(image, config)
    } else {
        tracing::info!("Starting new image at {}", image.display());
        MemoryCache::new(config)
    }
}

/// Refuse a value small enough to be stored in the node
fn check_out_of_line(config: &Config, size: u32) -> Result<()> {
    if size <= config.max_in_node_value_size {
        return Err(LargeBufError::InvalidRequest(format!(
            "a {} byte value is stored in the node, large bufs start above {} bytes",
            size, config.max_in_node_value_size
        )));
    }
    Ok(())
}

/// Refuse a shrink that would leave nothing
fn check_shrink(size: u32, by: u32) -> Result<()> {
    if by >= size {
        return Err(LargeBufError::InvalidRequest(format!(
            "cannot remove {} of {} bytes",
            by, size
        )));
    }
    Ok(())
}

/// Refuse a read or write past the end of the value
fn check_range(geometry: &Geometry, pos: u32, len: usize) -> Result<()> {
    match u32::try_from(len) {
        Ok(len) if geometry.contains_range(pos, len) => Ok(()),
        _ => Err(LargeBufError::InvalidRequest(format!(
            "{} bytes at {} run past the end of a {} byte value",
            len, pos, geometry.size
        ))),
    }
}

/// Check that `blob` names a stored large buf of the given size, so the
/// acquire below cannot trip over a bad index or segment.
fn check_stored(cache: &MemoryCache, config: &Config, blob: &BlobRef) -> Result<()> {
    check_out_of_line(config, blob.size)?;

    let index = cache.read_block(blob.index).ok_or_else(|| {
        LargeBufError::InvalidRequest(format!("no block {} in image", blob.index))
    })?;
    let record = IndexRecord::decode_for_size(&index, blob.size)?;

    for id in &record.blocks {
        if !cache.read_block(*id).is_some_and(|block| has_segment_magic(&block)) {
            return Err(LargeBufError::InvalidBlob(format!(
                "segment block {} of index {} is missing or not a segment",
                id, blob.index
            )));
        }
    }
    Ok(())
}

/// Acquire a blob. Every acquire on an `Immediate` transaction completes
/// in-line, so the buffer is ready when this returns.
fn load(
    txn: &Arc<MemoryTransaction>,
    config: &Config,
    blob: &BlobRef,
    access: Access,
) -> Result<LargeBuf<MemoryTransaction>> {
    check_stored(txn.cache(), config, blob)?;

    let (tx, rx) = channel::bounded(1);
    LargeBuf::new(txn, config).acquire(blob.index, blob.size, access, move |buf| {
        let _ = tx.send(buf);
    });
    rx.try_recv()
        .map_err(|_| LargeBufError::Config(format!("blob {} did not load in-line", blob.index)))
}

fn reshape<F>(txn: &Arc<MemoryTransaction>, config: &Config, blob: &BlobRef, op: F) -> Result<()>
where
    F: FnOnce(&mut LargeBuf<MemoryTransaction>) -> Result<()>,
{
    let mut buf = load(txn, config, blob, Access::Write)?;
    let outcome = op(&mut buf);
    println!(
        "index {} size {} first_block_offset {} segments {}",
        buf.index_block_id(),
        buf.size(),
        buf.first_block_offset(),
        buf.num_segments()
    );
    buf.release();
    outcome
}
