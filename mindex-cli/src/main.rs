mod report;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{ArgAction, ArgGroup, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use mindex_core::{CacheConfig, Cached, ScanConfig, ScanMessage, Scanner, TempStore};

/// mindex - cached directory indexes for mirrored mounts
#[derive(Parser, Debug)]
#[command(name = "mindex")]
#[command(about = "Build, inspect and clean cached directory indexes")]
#[command(version)]
struct Args {
    /// Base directory for persisted indexes (defaults to the user cache directory)
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// Options that change what a scan records
#[derive(clap::Args, Debug, Clone)]
struct ScanArgs {
    /// Maximum entry depth to record
    #[arg(short, long)]
    max_depth: Option<usize>,

    /// Follow symbolic links
    #[arg(short, long)]
    follow_symlinks: bool,

    /// Cross filesystem boundaries
    #[arg(short = 'x', long)]
    cross_filesystems: bool,
}

impl ScanArgs {
    fn to_config(&self) -> ScanConfig {
        ScanConfig {
            follow_symlinks: self.follow_symlinks,
            max_depth: self.max_depth,
            same_filesystem: !self.cross_filesystems,
            num_threads: 0,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a directory through the cache and print its totals
    Index {
        /// Directory to index
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Reuse a cached index younger than this many seconds
        #[arg(long, default_value_t = 0)]
        rescan: u64,

        /// Only show totals down to this depth
        #[arg(short, long)]
        depth: Option<usize>,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Keep requesting the index of a directory and report changes
    Watch {
        /// Directory to index
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Rebuild the index once it is older than this many seconds
        #[arg(long, default_value_t = 30)]
        rescan: u64,

        /// Seconds between requests
        #[arg(long, default_value_t = 5)]
        every: u64,

        /// Stop after this many requests
        #[arg(long)]
        iterations: Option<u64>,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Scan a directory without the cache, reporting progress
    Walk {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// List persisted indexes
    List,

    /// Remove persisted indexes
    #[command(group(ArgGroup::new("target").required(true).args(["path", "all"])))]
    Clean {
        /// Directory whose index should be removed
        path: Option<PathBuf>,

        /// Remove every persisted index
        #[arg(long)]
        all: bool,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(args.verbose);

    let temp_dir = args.temp_dir.clone().unwrap_or_else(default_temp_dir);
    log::debug!("using temp dir {}", temp_dir.display());

    match args.command {
        Command::Index {
            path,
            rescan,
            depth,
            scan,
        } => run_index(&path, &temp_dir, rescan, depth, &scan),
        Command::Watch {
            path,
            rescan,
            every,
            iterations,
            scan,
        } => run_watch(&path, &temp_dir, rescan, every, iterations, &scan),
        Command::Walk { path, scan } => run_walk(path, &scan),
        Command::List => run_list(&temp_dir),
        Command::Clean { path, all } => run_clean(&temp_dir, path.as_deref(), all),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn default_temp_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mindex")
}

fn cache_for(temp_dir: &Path, rescan: u64, scan: &ScanArgs) -> Cached {
    let mut config = CacheConfig::default()
        .with_rescan(Duration::from_secs(rescan))
        .with_temp_dir(temp_dir);
    config.scan = scan.to_config();
    Cached::new(config)
}

fn run_index(
    path: &Path,
    temp_dir: &Path,
    rescan: u64,
    depth: Option<usize>,
    scan: &ScanArgs,
) -> Result<()> {
    let cache = cache_for(temp_dir, rescan, scan);

    let index = cache
        .get_cached_index(path)
        .wrap_err_with(|| format!("Failed to index {}", path.display()))?;
    let (count, disk_size) = cache.head_cached_index(path)?;

    report::print_summary(&index, count, disk_size, cache.index_location(path).as_deref());
    report::print_levels(&index, depth);

    let stats = cache.stats();
    if stats.adopted > 0 {
        println!("(reused persisted index)");
    }

    Ok(())
}

fn run_watch(
    path: &Path,
    temp_dir: &Path,
    rescan: u64,
    every: u64,
    iterations: Option<u64>,
    scan: &ScanArgs,
) -> Result<()> {
    let cache = cache_for(temp_dir, rescan, scan);
    let start = Instant::now();
    let mut last: Option<(usize, u64)> = None;
    let mut requests = 0u64;

    loop {
        match cache.get_cached_index(path) {
            Ok(_) => {
                let head = cache.head_cached_index(path)?;
                if last != Some(head) {
                    report::print_change(start.elapsed(), last, head);
                    last = Some(head);
                }
            }
            Err(e) => {
                eprintln!(
                    "[{:>8.1}s] rebuild failed: {}",
                    start.elapsed().as_secs_f64(),
                    e
                );
            }
        }

        requests += 1;
        if iterations.is_some_and(|max| requests >= max) {
            break;
        }
        std::thread::sleep(Duration::from_secs(every));
    }

    let stats = cache.stats();
    println!(
        "{} requests, {} scans, {} writes",
        requests, stats.scans, stats.writes
    );

    Ok(())
}

fn run_walk(path: PathBuf, scan: &ScanArgs) -> Result<()> {
    let scanner = Scanner::new(scan.to_config());
    let (rx, handle) = scanner.scan(path.clone());

    let start = Instant::now();
    let mut last_print = Instant::now();

    for msg in rx {
        match msg {
            ScanMessage::Progress(p) => {
                if last_print.elapsed() > Duration::from_secs(1) {
                    report::print_progress(start.elapsed(), &p);
                    last_print = Instant::now();
                }
            }
            ScanMessage::Error(e) => {
                log::debug!("scan of {} failed: {}", path.display(), e);
            }
            _ => {}
        }
    }

    let index = handle
        .join()
        .map_err(|_| color_eyre::eyre::eyre!("Scanner thread panicked"))?
        .wrap_err_with(|| format!("Failed to scan {}", path.display()))?;

    eprintln!("[{:>8.1}s] done", start.elapsed().as_secs_f64());
    report::print_summary(&index, index.count(None), index.disk_size(None), None);
    report::print_levels(&index, None);

    Ok(())
}

fn run_list(temp_dir: &Path) -> Result<()> {
    let store = TempStore::new(temp_dir);
    let dirs = store
        .discover()
        .wrap_err_with(|| format!("Failed to read {}", store.base().display()))?;

    if dirs.is_empty() {
        println!("No persisted indexes under {}", store.base().display());
        return Ok(());
    }

    for dir in dirs {
        match TempStore::read_header(&dir) {
            Ok(header) => report::print_header(&header),
            Err(e) => println!("{}  (unreadable: {})", dir.display(), e),
        }
    }

    Ok(())
}

fn run_clean(temp_dir: &Path, path: Option<&Path>, all: bool) -> Result<()> {
    let store = TempStore::new(temp_dir);

    if all {
        let removed = store.remove_all()?;
        println!("Removed {} index directories", removed);
        return Ok(());
    }

    if let Some(path) = path {
        let root = std::path::absolute(path)?;
        if store.remove(&root)? {
            println!("Removed index of {}", root.display());
        } else {
            println!("No index for {}", root.display());
        }
    }

    Ok(())
}
