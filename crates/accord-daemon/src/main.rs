//! accordd - the agreement negotiation daemon.
//!
//! Wires the worker collective together: opens the store, loads (or
//! creates) the party's key material, builds the directory and anchor
//! clients, spawns the enabled workers plus the local configuration API,
//! and drives the two-phase shutdown on SIGINT/SIGTERM.
//!
//! The collective itself is synchronous threads; tokio runtimes exist
//! only on the API thread and (briefly) here for signal handling, and are
//! constructed manually.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use accord_core::config::Config;
use accord_core::persistence::Store;
use accord_core::policy::manager::PolicyManager;
use accord_core::protocol::signing::PartyKey;
use accord_core::protocol::PROTOCOL_CURRENT_VERSION;

use accord_daemon::agbot::AgbotWorker;
use accord_daemon::anchor::{
    AnchorLog, AnchorWorker, AnchorWriter, HttpAnchorLog, MemAnchorLog,
};
use accord_daemon::api::{self, ApiState};
use accord_daemon::context::WorkerContext;
use accord_daemon::exchange::HttpDirectory;
use accord_daemon::governance::GovernanceWorker;
use accord_daemon::keycache::KeyCache;
use accord_daemon::node::NodeWorker;
use accord_daemon::runtime::{MessageBus, WorkerRuntime};

/// How long remote mailbox keys stay cached.
const KEY_CACHE_TTL: Duration = Duration::from_secs(600);

/// Deadline for the two-phase shutdown drain.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// accordd - edge agreement negotiation daemon
#[derive(Parser, Debug)]
#[command(name = "accordd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/accord/accord.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the configuration API listen address
    #[arg(long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        Config::default()
    };
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = data_dir;
    }
    if let Some(listen) = args.listen {
        config.api.listen = listen;
    }
    if !config.agbot.enabled && !config.node.enabled {
        bail!("both the agbot and the node worker are disabled; nothing to run");
    }

    let data_dir = config.store.data_dir.clone();
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;

    let store = Arc::new(
        Store::open(data_dir.join("accord.db")).context("cannot open the embedded store")?,
    );
    let identity = Arc::new(load_or_create_identity(&data_dir)?);
    info!(address = %identity.address(), "party identity loaded");

    let config = Arc::new(config);
    let policies = Arc::new(PolicyManager::new(PROTOCOL_CURRENT_VERSION));
    let bus = MessageBus::new();

    let directory: Arc<dyn accord_daemon::exchange::Directory> = Arc::new(
        HttpDirectory::new(&config.exchange).context("cannot build the directory client")?,
    );
    let keys = Arc::new(KeyCache::new(directory.clone(), KEY_CACHE_TTL));

    let anchor_log: Arc<dyn AnchorLog> = match HttpAnchorLog::new(&config.anchor) {
        Ok(log) => Arc::new(log),
        Err(err) => {
            warn!(%err, "anchor disabled; agreements are witnessed in-process only");
            Arc::new(MemAnchorLog::new())
        }
    };
    let anchor = Arc::new(AnchorWriter::new(
        anchor_log.clone(),
        config.anchor.write_retries,
    ));

    let ctx = WorkerContext {
        config: config.clone(),
        store: store.clone(),
        policies,
        directory,
        anchor,
        bus: bus.clone(),
        keys,
        identity,
    };

    let mut runtime = WorkerRuntime::new(bus.clone());
    if config.node.enabled {
        runtime.spawn(NodeWorker::new(ctx.clone()));
    }
    if config.agbot.enabled {
        runtime.spawn(AgbotWorker::new(ctx.clone()));
    }
    runtime.spawn(GovernanceWorker::new(ctx.clone()));
    runtime.spawn(AnchorWorker::new(
        anchor_log,
        bus.clone(),
        config.anchor.poll_interval,
    ));

    let _api = api::spawn(
        config.api.listen.clone(),
        ApiState {
            store,
            bus: bus.clone(),
        },
    );

    wait_for_shutdown_signal()?;
    info!("shutdown signal received");
    runtime.shutdown(SHUTDOWN_DEADLINE);
    info!("daemon stopped");
    Ok(())
}

/// Blocks until SIGINT or SIGTERM arrives.
fn wait_for_shutdown_signal() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build the signal runtime")?;
    runtime.block_on(async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).context("cannot install the SIGTERM handler")?;
        let mut int =
            signal(SignalKind::interrupt()).context("cannot install the SIGINT handler")?;
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        Ok(())
    })
}

/// Loads the party key material, generating it on first run.
///
/// The key file holds the two secrets as hex lines and is created with
/// 0600 permissions; existing files with looser permissions are rejected.
fn load_or_create_identity(data_dir: &Path) -> Result<PartyKey> {
    let path = data_dir.join("identity.key");
    if path.exists() {
        let metadata = fs::metadata(&path)?;
        if metadata.permissions().mode() & 0o077 != 0 {
            bail!("insecure permissions on {}", path.display());
        }
        let mut text = String::new();
        fs::File::open(&path)?.read_to_string(&mut text)?;
        let mut lines = text.lines();
        let signing = decode_key_line(lines.next(), &path)?;
        let mailbox = decode_key_line(lines.next(), &path)?;
        return Ok(PartyKey::from_bytes(&signing, mailbox));
    }

    let key = PartyKey::generate();
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    writeln!(file, "{}", hex::encode(key.signing_bytes()))?;
    writeln!(file, "{}", hex::encode(key.mailbox_bytes()))?;
    info!(path = %path.display(), "generated new party identity");
    Ok(key)
}

fn decode_key_line(line: Option<&str>, path: &Path) -> Result<[u8; 32]> {
    let line = line.with_context(|| format!("{} is truncated", path.display()))?;
    let bytes = hex::decode(line.trim())
        .with_context(|| format!("{} holds malformed key material", path.display()))?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("{} holds malformed key material", path.display()))
}
