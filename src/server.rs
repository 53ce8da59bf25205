//! # Directory Server
//!
//! [`Server`] wires a [`Directory`] to the network and runs its background
//! work:
//!
//! | Task | Trigger | Action |
//! |------|---------|--------|
//! | listener | incoming QUIC connection | spawn [`rpc::handle_connection`] |
//! | snapshot ticker | every `dump_interval_minutes` | [`Directory::dump_snapshot`] |
//! | policy watcher | change to the policy file | [`Directory::reload_policy`] |
//!
//! All three stop when [`Server::shutdown`] flips the shared stop signal.
//! Handlers already running keep the directory mutex until they finish, so a
//! shutdown never interrupts a mutation halfway.
//!
//! ```ignore
//! let server = Server::start(ServerConfig::default(), Arc::new(SshBannerProbe::default())).await?;
//! println!("clients connect with --server {}", server.address()?);
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::Endpoint;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::authority::PolicyWatcher;
use crate::config::ServerConfig;
use crate::crypto::{create_server_config, generate_ed25519_cert};
use crate::directory::Directory;
use crate::identity::{Identity, Keypair};
use crate::reachability::ReachabilityProbe;
use crate::rpc;

/// Editors often emit several events per save; wait for them to settle.
const RELOAD_SETTLE: Duration = Duration::from_millis(100);

/// Upper bound on waiting for open connections to drain at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    keypair: Keypair,
    endpoint: Endpoint,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Open the directory, bind the endpoint and spawn the background tasks.
    /// Fails if the policy file is missing or invalid.
    pub async fn start(config: ServerConfig, probe: Arc<dyn ReachabilityProbe>) -> Result<Self> {
        let directory = Arc::new(Directory::open(&config, probe).context("failed to open directory")?);
        let keypair = Keypair::load_or_create(&config.key_path)?;

        let (certs, key) = generate_ed25519_cert(&keypair)?;
        let server_config = create_server_config(certs, key)?;
        let endpoint = Endpoint::server(server_config, config.bind)
            .with_context(|| format!("failed to bind {}", config.bind))?;
        let local_addr = endpoint.local_addr()?;

        let (watcher, policy_events) =
            PolicyWatcher::start(&config.policy_path).context("failed to watch policy file")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(listen(endpoint.clone(), directory.clone(), stop_rx.clone())),
            tokio::spawn(watch_policy(watcher, policy_events, directory.clone(), stop_rx.clone())),
        ];
        match config.dump_interval() {
            Some(period) => tasks.push(tokio::spawn(snapshot_ticker(period, directory.clone(), stop_rx))),
            None => info!("periodic snapshot disabled"),
        }

        info!("Directory {}/{}", local_addr, keypair.identity());

        Ok(Self {
            keypair,
            endpoint,
            stop_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("failed to get local address")
    }

    /// `ADDR/IDENTITY` string clients pass as `--server`.
    pub fn address(&self) -> Result<String> {
        Ok(format!("{}/{}", self.local_addr()?, self.identity()))
    }

    /// Stop the background tasks, close the endpoint and wait for both.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        self.endpoint.close(0u32.into(), b"shutdown");
        if tokio::time::timeout(SHUTDOWN_GRACE, self.endpoint.wait_idle()).await.is_err() {
            debug!("connections still draining at shutdown");
        }
        info!("directory stopped");
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn listen(endpoint: Endpoint, directory: Arc<Directory>, mut stop: watch::Receiver<bool>) {
    loop {
        let incoming = tokio::select! {
            _ = stopped(&mut stop) => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc::handle_connection(directory, incoming).await {
                warn!("connection error: {:?}", e);
            }
        });
    }
    debug!("listener stopped");
}

async fn snapshot_ticker(period: Duration, directory: Arc<Directory>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    // first tick fires immediately
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = interval.tick() => {
                match directory.dump_snapshot().await {
                    Ok(added) => debug!(added, "periodic snapshot"),
                    Err(e) => error!(error = %e, "periodic snapshot failed"),
                }
            }
        }
    }
    debug!("snapshot ticker stopped");
}

async fn watch_policy(
    watcher: PolicyWatcher,
    mut events: mpsc::Receiver<()>,
    directory: Arc<Directory>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(path = %watcher.path().display(), "policy watcher running");
    loop {
        let event = tokio::select! {
            _ = stopped(&mut stop) => break,
            event = events.recv() => event,
        };
        if event.is_none() {
            warn!("policy watcher channel closed");
            break;
        }

        tokio::time::sleep(RELOAD_SETTLE).await;
        while events.try_recv().is_ok() {}

        if let Err(e) = directory.reload_policy().await {
            warn!(error = %e, "policy reload failed, keeping previous policy");
        }
    }
    drop(watcher);
    debug!("policy watcher stopped");
}
