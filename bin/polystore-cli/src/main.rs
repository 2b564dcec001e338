//! PolyStore CLI - operator tool
//!
//! Opens a store over a fast and a slow mirror root and drives it with
//! host files or synthetic writers. Interval indexes live in memory, so
//! anything written by one invocation is verified within that invocation.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use polystore_common::{CacheMode, Config, parse_capacity};
use polystore_placement::SchedulerStats;
use polystore_storage::{CacheStatsSnapshot, FileStat, IoStatsSnapshot, OpenFlags, PolyStore};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "polystore-cli")]
#[command(about = "PolyStore operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "POLYSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Fast-device mirror root
    #[arg(long)]
    fast_root: Option<PathBuf>,

    /// Slow-device mirror root
    #[arg(long)]
    slow_root: Option<PathBuf>,

    /// Prefix of logical store paths
    #[arg(long)]
    logical_root: Option<PathBuf>,

    /// direct or cached
    #[arg(long)]
    mode: Option<CacheMode>,

    /// Tasks allowed on the fast device at once
    #[arg(long)]
    split_point: Option<usize>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy a host file into the store from a worker thread
    CopyIn {
        /// Host file to read
        source: PathBuf,
        /// Store path to create
        dest: PathBuf,
        /// Read/write chunk size
        #[arg(long, default_value = "4k", value_parser = parse_size)]
        buffer_size: u64,
        /// Read the copy back through the store and compare
        #[arg(long)]
        verify: bool,
    },
    /// Write a synthetic pattern from several threads
    WritePattern {
        /// Store path (suffixed with the thread number unless --shared)
        path: PathBuf,
        #[arg(short, long, default_value_t = 4)]
        threads: usize,
        /// Bytes per thread
        #[arg(long, default_value = "64m", value_parser = parse_size)]
        size: u64,
        /// Bytes per write call
        #[arg(long, default_value = "4k", value_parser = parse_size)]
        io_size: u64,
        /// All threads write disjoint regions of one file
        #[arg(long)]
        shared: bool,
        /// Write blocks in a shuffled order
        #[arg(long)]
        random: bool,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Read every block back and compare
        #[arg(long)]
        verify: bool,
    },
    /// Show size and placement of a store path
    Stat { path: PathBuf },
    /// Print the effective configuration as JSON
    Config,
}

fn parse_size(value: &str) -> std::result::Result<u64, String> {
    match parse_capacity(value) {
        Some(0) => Err("size must be non-zero".to_string()),
        Some(bytes) => Ok(bytes),
        None => Err(format!("not a size: {value}")),
    }
}

/// Defaults, then the TOML file, then the environment, then flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(root) = &args.fast_root {
        config.mounts.fast_root.clone_from(root);
    }
    if let Some(root) = &args.slow_root {
        config.mounts.slow_root.clone_from(root);
    }
    if let Some(root) = &args.logical_root {
        config.mounts.logical_root.clone_from(root);
    }
    if let Some(mode) = args.mode {
        config.cache.mode = mode;
    }
    if let Some(split_point) = args.split_point {
        config.placement.split_point = split_point;
    }
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct CopyReport {
    bytes: u64,
    seconds: f64,
    verified: bool,
    stat: FileStat,
    io: IoStatsSnapshot,
    cache: Option<CacheStatsSnapshot>,
}

fn copy_in(config: Config, source: &Path, dest: &Path, buffer_size: usize, verify: bool) -> Result<()> {
    let store = Arc::new(PolyStore::new(config)?);
    let started = Instant::now();

    let copier = {
        let store = Arc::clone(&store);
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        thread::Builder::new()
            .name("polystore-copy".to_string())
            .spawn(move || copy_file(&store, &source, &dest, buffer_size))?
    };
    let bytes = copier
        .join()
        .map_err(|_| anyhow!("copy thread panicked"))??;
    let seconds = started.elapsed().as_secs_f64();
    info!(bytes, seconds, "copy finished");

    if verify {
        verify_copy(&store, source, dest, buffer_size)?;
        info!("copy verified");
    }

    let report = CopyReport {
        bytes,
        seconds,
        verified: verify,
        stat: store.stat(dest)?,
        io: store.io_stats(),
        cache: store.cache_stats(),
    };
    store.shutdown()?;
    print_json(&report)
}

fn read_chunk(input: &mut File, buf: &mut [u8]) -> Result<usize> {
    loop {
        match input.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn copy_file(store: &PolyStore, source: &Path, dest: &Path, buffer_size: usize) -> Result<u64> {
    let mut input =
        File::open(source).with_context(|| format!("opening {}", source.display()))?;
    let fh = store.open(dest, OpenFlags::read_write().create().truncate(), 0o644)?;

    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let n = read_chunk(&mut input, &mut buf)?;
        if n == 0 {
            break;
        }
        let written = store.write(fh, &buf[..n])?;
        if written != n {
            bail!("short write to {}: {written} of {n} bytes", dest.display());
        }
        total += n as u64;
    }

    store.fsync(fh)?;
    store.close(fh)?;
    Ok(total)
}

fn verify_copy(store: &PolyStore, source: &Path, dest: &Path, buffer_size: usize) -> Result<()> {
    let mut input = File::open(source)?;
    let fh = store.open(dest, OpenFlags::read_only(), 0)?;
    let mut expected = vec![0u8; buffer_size];
    let mut actual = vec![0u8; buffer_size];
    let mut offset = 0u64;

    loop {
        let n = read_chunk(&mut input, &mut expected)?;
        if n == 0 {
            break;
        }
        let got = store.pread(fh, &mut actual[..n], offset)?;
        if got != n || actual[..n] != expected[..n] {
            store.close(fh)?;
            bail!("{} differs from {} at offset {offset}", dest.display(), source.display());
        }
        offset += n as u64;
    }

    let size = store.fstat(fh)?.size;
    store.close(fh)?;
    if size != offset {
        bail!("{} is {size} bytes, source is {offset}", dest.display());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Pattern {
    threads: usize,
    size: u64,
    io_size: u64,
    shared: bool,
    random: bool,
    seed: u64,
    verify: bool,
}

impl Pattern {
    fn blocks(&self) -> u64 {
        self.size.div_ceil(self.io_size)
    }

    /// Store path and base offset of one writer
    fn target(&self, path: &Path, thread: usize) -> (PathBuf, u64) {
        if self.shared {
            (path.to_path_buf(), thread as u64 * self.size)
        } else {
            let mut name = path.as_os_str().to_owned();
            name.push(format!("-{thread}"));
            (PathBuf::from(name), 0)
        }
    }

    /// Byte every block is filled with
    fn fill(thread: usize, block: u64) -> u8 {
        ((thread as u64 * 31 + block) % 251) as u8 + 1
    }

    fn block_len(&self, block: u64) -> usize {
        (self.size - block * self.io_size).min(self.io_size) as usize
    }
}

#[derive(Serialize)]
struct PatternReport {
    threads: usize,
    bytes: u64,
    seconds: f64,
    mib_per_sec: f64,
    verified: bool,
    files: Vec<FileStat>,
    io: IoStatsSnapshot,
    cache: Option<CacheStatsSnapshot>,
    scheduler: SchedulerStats,
}

fn write_pattern(config: Config, path: &Path, pattern: Pattern) -> Result<()> {
    let store = PolyStore::new(config)?;

    let mut handles = Vec::new();
    let mut paths = Vec::new();
    for writer in 0..pattern.threads {
        let (target, _) = pattern.target(path, writer);
        if pattern.shared && writer > 0 {
            handles.push(handles[0]);
            continue;
        }
        handles.push(store.open(&target, OpenFlags::read_write().create().truncate(), 0o644)?);
        paths.push(target);
    }

    let started = Instant::now();
    thread::scope(|s| -> Result<()> {
        let mut workers = Vec::new();
        for (writer, &fh) in handles.iter().enumerate() {
            let store = &store;
            let worker = thread::Builder::new()
                .name(format!("polystore-writer-{writer}"))
                .spawn_scoped(s, move || -> Result<()> {
                    let (_, base) = pattern.target(Path::new(""), writer);
                    let mut order: Vec<u64> = (0..pattern.blocks()).collect();
                    if pattern.random {
                        order.shuffle(&mut StdRng::seed_from_u64(pattern.seed + writer as u64));
                    }
                    let mut buf = vec![0u8; pattern.io_size as usize];
                    for block in order {
                        let len = pattern.block_len(block);
                        buf[..len].fill(Pattern::fill(writer, block));
                        let offset = base + block * pattern.io_size;
                        let written = store.pwrite(fh, &buf[..len], offset)?;
                        if written != len {
                            bail!("short write at {offset}: {written} of {len} bytes");
                        }
                    }
                    debug!(writer, "writer finished");
                    Ok(())
                })?;
            workers.push(worker);
        }
        for worker in workers {
            worker.join().map_err(|_| anyhow!("writer thread panicked"))??;
        }
        Ok(())
    })?;
    let seconds = started.elapsed().as_secs_f64();
    let bytes = pattern.size * pattern.threads as u64;
    info!(bytes, seconds, "pattern written");

    if pattern.verify {
        verify_pattern(&store, &handles, pattern)?;
        info!("pattern verified");
    }

    let files = paths
        .iter()
        .map(|target| store.stat(target))
        .collect::<polystore_common::Result<Vec<_>>>()?;
    for fh in handles.iter().take(paths.len()) {
        store.close(*fh)?;
    }

    let report = PatternReport {
        threads: pattern.threads,
        bytes,
        seconds,
        mib_per_sec: bytes as f64 / (1024.0 * 1024.0) / seconds.max(f64::EPSILON),
        verified: pattern.verify,
        files,
        io: store.io_stats(),
        cache: store.cache_stats(),
        scheduler: store.scheduler().stats(),
    };
    store.shutdown()?;
    print_json(&report)
}

fn verify_pattern(store: &PolyStore, handles: &[polystore_common::FileHandle], pattern: Pattern) -> Result<()> {
    let mut buf = vec![0u8; pattern.io_size as usize];
    for (thread, &fh) in handles.iter().enumerate() {
        let (_, base) = pattern.target(Path::new(""), thread);
        for block in 0..pattern.blocks() {
            let len = pattern.block_len(block);
            let offset = base + block * pattern.io_size;
            let got = store.pread(fh, &mut buf[..len], offset)?;
            let expected = Pattern::fill(thread, block);
            if got != len || buf[..len].iter().any(|&b| b != expected) {
                bail!("thread {thread} block {block} (offset {offset}) does not match");
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;

    match args.command {
        Commands::Config => print_json(&config),
        Commands::Stat { path } => {
            let store = PolyStore::new(config)?;
            print_json(&store.stat(&path)?)
        }
        Commands::CopyIn {
            source,
            dest,
            buffer_size,
            verify,
        } => copy_in(config, &source, &dest, usize::try_from(buffer_size)?, verify),
        Commands::WritePattern {
            path,
            threads,
            size,
            io_size,
            shared,
            random,
            seed,
            verify,
        } => {
            if threads == 0 {
                bail!("--threads must be at least 1");
            }
            let pattern = Pattern {
                threads,
                size,
                io_size,
                shared,
                random,
                seed,
                verify,
            };
            write_pattern(config, &path, pattern)
        }
    }
}
