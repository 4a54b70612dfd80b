//! NimbusFS mount command.
//!
//! A single command: mount a OneDrive drive at a mountpoint. OAuth
//! token acquisition is an external collaborator; this binary consumes
//! `auth_tokens.json` from the cache directory read-only.
//!
//! Exit codes: 0 success, 1 misuse, 2 mount failure, 128+signo when a
//! signal terminates the mount.

mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nimbus_core::config::Config;
use nimbus_core::ports::remote::CloudProvider;
use nimbus_graph::{FileTokenSource, GraphProvider};
use nimbus_store::DatabasePool;
use nimbus_vfs::{ConnectivityOracle, Vfs};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for CLI misuse.
const EXIT_MISUSE: u8 = 1;
/// Exit code for a failed mount.
const EXIT_MOUNT_FAILURE: u8 = 2;

/// Mount a Microsoft OneDrive drive as a filesystem.
#[derive(Debug, Parser)]
#[command(name = "nimbusfs", version, about)]
struct Args {
    /// Directory to mount the drive at.
    #[arg(value_name = "MOUNTPOINT", required_unless_present = "auth_only")]
    mountpoint: Option<PathBuf>,

    /// Verify authentication and exit without mounting.
    #[arg(long)]
    auth_only: bool,

    /// Headless operation: never try to open a browser for auth.
    #[arg(long)]
    no_browser: bool,

    /// Path to the YAML configuration file.
    #[arg(long, value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL")]
    log: Option<String>,

    /// Cache directory root.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Delete the cached metadata and bodies before mounting.
    #[arg(long)]
    wipe_cache: bool,

    /// Enable debug logging and kernel FUSE debug output.
    #[arg(long)]
    debug: bool,

    /// Eagerly traverse the whole remote tree after mounting.
    #[arg(long)]
    sync_tree: bool,

    /// Seconds between remote change polls.
    #[arg(long, value_name = "SECS")]
    delta_interval: Option<u64>,

    /// Idle seconds before a cached body may be evicted.
    #[arg(long, value_name = "SECS")]
    cache_expiration: Option<u64>,
}

fn main() -> ExitCode {
    // clap's own exit code for bad usage is 2; the contract here is 1.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(if err.use_stderr() { EXIT_MISUSE } else { 0 });
        }
    };

    init_tracing(&args);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            output::present_error(&err);
            ExitCode::from(EXIT_MOUNT_FAILURE)
        }
    }
}

fn init_tracing(args: &Args) {
    let level = if args.debug || std::env::var_os("NIMBUSFS_DEBUG").is_some() {
        "debug"
    } else {
        args.log.as_deref().unwrap_or("info")
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_file {
        Some(path) => Config::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache.dir = dir.clone();
    }
    if let Some(secs) = args.delta_interval {
        config.delta.interval_secs = secs;
    }
    if let Some(secs) = args.cache_expiration {
        config.cache.expiration_secs = secs;
    }
    if args.debug {
        config.fuse.kernel_debug = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn run(args: Args) -> Result<ExitCode> {
    let config = load_config(&args)?;
    let cache_dir = config.mount_cache_dir();
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("cannot create cache dir {}", cache_dir.display()))?;

    if args.wipe_cache {
        info!(dir = %cache_dir.display(), "wiping cache");
        wipe_cache(&cache_dir)?;
    }

    let tokens = Arc::new(FileTokenSource::new(cache_dir.join("auth_tokens.json")));
    let provider: Arc<GraphProvider> =
        Arc::new(GraphProvider::new(tokens, config.network.clone()));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    if args.auth_only {
        if args.no_browser {
            info!("headless auth requested; expecting the device-code helper to maintain auth_tokens.json");
        }
        let principal = rt
            .block_on(provider.principal_name())
            .context("authentication check failed")?;
        println!("authenticated as {principal}");
        return Ok(ExitCode::SUCCESS);
    }

    let mountpoint = args
        .mountpoint
        .clone()
        .context("a mountpoint is required")?;

    let oracle = ConnectivityOracle::init();
    let pool = rt
        .block_on(DatabasePool::open(&cache_dir.join("metadata.db")))
        .context("cannot open metadata store")?;

    let (vfs, tasks) = rt
        .block_on(Vfs::bootstrap(
            config.clone(),
            provider,
            &pool,
            &cache_dir,
            oracle,
        ))
        .context("engine bootstrap failed")?;

    if args.sync_tree {
        let crawled = rt
            .block_on(vfs.sync_tree())
            .context("eager tree sync failed")?;
        info!(directories = crawled, "tree sync complete");
    }

    install_signal_exit(&rt);

    // Serve on the main thread until unmounted.
    let serve = nimbus_fuse::mount_and_serve(rt.handle().clone(), vfs, &config.fuse, &mountpoint);

    rt.block_on(tasks.stop());
    ConnectivityOracle::teardown();

    match serve {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            output::present_error(&err);
            Ok(ExitCode::from(EXIT_MOUNT_FAILURE))
        }
    }
}

/// Removes the metadata database and body store.
fn wipe_cache(cache_dir: &std::path::Path) -> Result<()> {
    for name in ["metadata.db", "metadata.db-wal", "metadata.db-shm"] {
        let path = cache_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("cannot remove {}", path.display()))?;
        }
    }
    let content = cache_dir.join("content");
    if content.exists() {
        std::fs::remove_dir_all(&content)
            .with_context(|| format!("cannot remove {}", content.display()))?;
    }
    Ok(())
}

/// Exits with 128+signo on SIGINT/SIGTERM. The kernel tears the mount
/// down when the process dies.
fn install_signal_exit(rt: &tokio::runtime::Runtime) {
    rt.spawn(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(int) => int,
            Err(e) => {
                warn!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        let signo = tokio::select! {
            _ = term.recv() => libc::SIGTERM,
            _ = int.recv() => libc::SIGINT,
        };
        info!(signo, "signal received, exiting");
        std::process::exit(128 + signo);
    });
}
