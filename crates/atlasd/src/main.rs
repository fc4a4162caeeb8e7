//! `atlasd`: the Atlas daemon.
//!
//! Binary entrypoint that wires the ownership registry, layer store, commit
//! log and subscriber hub into one dispatcher, served over HTTP and over the
//! loopback command socket.
//!
//! # Usage
//!
//! ```text
//! atlasd start                               # start the daemon
//! atlasd start -c atlas.toml                 # start with a config file
//! atlasd start -d ./data -H 127.0.0.1:9080   # custom data dir and HTTP address
//! atlasd start --memory                      # nothing persisted but the commit log
//! atlasd customers                           # list registered access keys
//! atlasd import parcels.shp --apikey K       # import a file while the daemon is stopped
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atlas_engine::{Caller, Command, Dispatcher, Importer, Ogr2Ogr, Outcome, SubscriberHub};
use atlas_http::{HttpServer, HttpServerConfig};
use atlas_journal::{CommitLog, JournalError, JournalWriter};
use atlas_meta::OwnershipRegistry;
use atlas_socket::SocketServer;
use atlas_store::{LayerDb, LayerStore};
use atlas_types::AccessKey;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "atlasd",
    version,
    about = "Atlas versioned GeoJSON layer daemon"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Start {
        /// Override data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override HTTP listen address (e.g. "127.0.0.1:8080").
        #[arg(short = 'H', long)]
        http_listen_addr: Option<String>,

        /// Override command socket listen address (e.g. "127.0.0.1:3333").
        #[arg(short = 'S', long)]
        socket_listen_addr: Option<String>,

        /// Key for `/management` routes.
        ///
        /// Can also be set via ATLAS_SUPERUSER_KEY or `[auth] superuser_key`.
        /// If none is provided, a random key is generated and logged.
        #[arg(long, env = "ATLAS_SUPERUSER_KEY")]
        superuser_key: Option<String>,

        /// Keep registry and layers in memory.
        #[arg(short, long)]
        memory: bool,
    },

    /// List access keys and the datasources they own.
    Customers,

    /// Import a GeoJSON file or shapefile as a new layer.
    ///
    /// Opens the data directory directly, so the daemon must not be running.
    Import {
        /// File to import (`.geojson`, `.json` or `.shp`).
        file: PathBuf,

        /// Access key that becomes the owner of the new layer.
        #[arg(long)]
        apikey: Option<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            http_listen_addr,
            socket_listen_addr,
            superuser_key,
            memory,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(addr) = http_listen_addr {
                config.node.http_listen_addr = addr;
            }
            if let Some(addr) = socket_listen_addr {
                config.node.socket_listen_addr = addr;
            }
            if let Some(key) = superuser_key {
                config.auth.superuser_key = key;
            }
            if memory {
                config.storage.backend = "memory".to_string();
            }
            cmd_start(config).await
        }
        Commands::Customers => cmd_customers(&config),
        Commands::Import { file, apikey } => cmd_import(&config, file, apikey).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// Component assembly
// -----------------------------------------------------------------------

/// Everything behind the dispatcher, plus the commit log writer task.
struct Node {
    dispatcher: Arc<Dispatcher>,
    journal: CommitLog,
    writer: JoinHandle<Result<u64, JournalError>>,
}

fn open_node(config: &CliConfig) -> Result<Node> {
    let memory_mode = config.memory_mode();

    if !memory_mode {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
    }

    // --- Ownership registry ---
    let registry = if memory_mode {
        info!("using temporary ownership registry");
        OwnershipRegistry::open_temporary().context("failed to open temporary registry")?
    } else {
        let path = config.meta_path();
        OwnershipRegistry::open(&path).with_context(|| {
            format!(
                "cannot open registry at {}. Is another atlasd running?",
                path.display()
            )
        })?
    };

    // --- Layer store ---
    let store: Arc<dyn LayerStore> = if memory_mode {
        info!("using in-memory layer store");
        Arc::new(LayerDb::in_memory())
    } else {
        let path = config.layers_path();
        info!(path = %path.display(), "using fjall layer store");
        Arc::new(LayerDb::open(&path).context("failed to open layer store")?)
    };

    // --- Commit log ---
    let (journal, writer) = CommitLog::new(config.journal.capacity);
    let writer = spawn_writer(writer, config.journal_path());

    let importer = Importer::new(Arc::new(Ogr2Ogr::new(config.import.converter.clone())));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        store,
        journal.clone(),
        Arc::new(SubscriberHub::default()),
        importer,
    ));

    Ok(Node {
        dispatcher,
        journal,
        writer,
    })
}

fn spawn_writer(writer: JournalWriter, path: PathBuf) -> JoinHandle<Result<u64, JournalError>> {
    info!(path = %path.display(), "commit log");
    tokio::spawn(writer.run(path))
}

/// Wait for the writer after every producer handle is gone.
async fn finish_writer(writer: JoinHandle<Result<u64, JournalError>>) -> Result<()> {
    let written = writer
        .await
        .context("commit log writer panicked")?
        .context("commit log write failed")?;
    info!(written, "commit log closed");
    Ok(())
}

// -----------------------------------------------------------------------
// atlasd start
// -----------------------------------------------------------------------

async fn cmd_start(mut config: CliConfig) -> Result<()> {
    info!("starting atlasd");
    info!(
        data_dir = %config.node.data_dir.display(),
        http_addr = %config.node.http_listen_addr,
        socket_addr = %config.node.socket_listen_addr,
        backend = %config.storage.backend,
        journal = %config.journal_path().display(),
        "node configuration"
    );

    if config.auth.superuser_key.is_empty() {
        config.auth.superuser_key = atlas_types::random_hex(16);
        info!("superuser key (generated): {}", config.auth.superuser_key);
    }

    let Node {
        dispatcher,
        journal,
        mut writer,
    } = open_node(&config)?;

    let http_listener = TcpListener::bind(&config.node.http_listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP on {}", config.node.http_listen_addr))?;
    let socket_listener = TcpListener::bind(&config.node.socket_listen_addr)
        .await
        .with_context(|| format!("failed to bind socket on {}", config.node.socket_listen_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);

    // --- HTTP API ---
    let http = HttpServer::new(HttpServerConfig {
        dispatcher: dispatcher.clone(),
        superuser_key: config.auth.superuser_key.clone(),
    });
    let mut http_task = tokio::spawn(http.serve_with_shutdown(http_listener, stopped(stop_rx.clone())));

    // --- Command socket ---
    let socket = SocketServer::new(dispatcher.clone());
    let sessions = socket.sessions();
    let mut socket_task = tokio::spawn(socket.serve_with_shutdown(socket_listener, stopped(stop_rx)));

    info!("atlasd ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        result = &mut writer => {
            // The writer only returns early on a write failure.
            match result {
                Ok(Err(e)) => error!(error = %e, "commit log writer failed"),
                Ok(Ok(_)) => error!("commit log writer stopped unexpectedly"),
                Err(e) => error!(error = %e, "commit log writer panicked"),
            }
            let _ = stop_tx.send(true);
            anyhow::bail!("commit log is unavailable");
        }
        result = &mut http_task => {
            let _ = stop_tx.send(true);
            return Err(server_exit("HTTP server", result));
        }
        result = &mut socket_task => {
            let _ = stop_tx.send(true);
            return Err(server_exit("command socket", result));
        }
    }

    // --- Graceful shutdown ---
    let timeout = config.shutdown_timeout();
    let closed = dispatcher.hub().close_all();
    info!(closed, "closed live views");
    let _ = stop_tx.send(true);

    if tokio::time::timeout(timeout, async {
        let _ = (&mut http_task).await;
        let _ = (&mut socket_task).await;
    })
    .await
    .is_err()
    {
        warn!("servers did not stop within the shutdown timeout");
    }
    if !sessions.wait_idle(timeout).await {
        warn!(open = sessions.active(), "socket sessions still open at shutdown");
    }
    if !journal.wait_drained(timeout).await {
        warn!(pending = journal.depth(), "commit log not drained at shutdown");
    }

    drop(journal);
    drop(dispatcher);
    http_task.abort();
    socket_task.abort();

    match tokio::time::timeout(timeout, finish_writer(writer)).await {
        Ok(result) => result?,
        Err(_) => warn!("commit log writer still busy, exiting anyway"),
    }
    info!("atlasd stopped");
    Ok(())
}

/// Resolves once the stop flag is raised.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn server_exit<E: std::fmt::Display>(
    name: &str,
    result: std::result::Result<std::result::Result<(), E>, tokio::task::JoinError>,
) -> anyhow::Error {
    let err = match result {
        Ok(Ok(())) => anyhow::anyhow!("{name} exited"),
        Ok(Err(e)) => anyhow::anyhow!("{name} failed: {e}"),
        Err(e) => anyhow::anyhow!("{name} panicked: {e}"),
    };
    error!(error = %err, "server stopped");
    err
}

// -----------------------------------------------------------------------
// atlasd customers
// -----------------------------------------------------------------------

fn cmd_customers(config: &CliConfig) -> Result<()> {
    let path = config.meta_path();
    let registry = OwnershipRegistry::open(&path).map_err(|e| {
        anyhow::anyhow!(
            "cannot open registry at {}. Is atlasd running? ({e})",
            path.display(),
        )
    })?;

    let keys = registry.list_customers()?;
    println!("Customers: {}", keys.len());
    for key in &keys {
        let customer = registry.get_customer(key)?;
        println!("  {} datasources={}", key, customer.datasources.len());
        for ds in &customer.datasources {
            println!("    {ds}");
        }
    }
    Ok(())
}

// -----------------------------------------------------------------------
// atlasd import
// -----------------------------------------------------------------------

async fn cmd_import(config: &CliConfig, file: PathBuf, apikey: Option<String>) -> Result<()> {
    let Node {
        dispatcher,
        journal,
        writer,
    } = open_node(config)?;

    let caller = match apikey {
        Some(key) => Caller::Key(AccessKey::from(key)),
        None => Caller::Trusted,
    };
    let result = dispatcher
        .dispatch(&caller, Command::ImportFile { file: file.clone() })
        .await;

    drop(journal);
    drop(dispatcher);
    finish_writer(writer).await?;

    match result.with_context(|| format!("failed to import {}", file.display()))? {
        Outcome::Datasource(id) => println!("{id}"),
        other => println!("{}", other.to_json()),
    }
    Ok(())
}
