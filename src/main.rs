use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use fleetdir::{
    AlwaysReachable, AuthorityConfig, ClusterFile, DirectoryRpc, Identity, LocalCache, ReachabilityProbe, RpcClient,
    Server, ServerConfig, SshBannerProbe, caller_identity, parse_server_address,
};

#[derive(Clone, Debug)]
struct ServerAddress {
    addr: SocketAddr,
    identity: Identity,
}

impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, identity) = parse_server_address(s)?;
        Ok(ServerAddress { addr, identity })
    }
}

#[derive(Parser, Debug)]
#[command(name = "fleetdir")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the directory server.
    Serve(ServeArgs),
    /// Write an example policy file.
    TemplatePolicy {
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
        /// User granted in the template; defaults to the caller identity.
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Write an example cluster-load file.
    TemplateCluster {
        #[arg(short, long, default_value = "cluster.json")]
        output: PathBuf,
    },
    /// Check that the server knows the caller.
    Access(ClientArgs),
    /// List users and whether each is a superuser.
    Users(ClientArgs),
    /// List visible nodes, from the local cache when it is current.
    Query {
        #[command(flatten)]
        client: ClientArgs,
        groups: Vec<String>,
        /// Ignore the local cache.
        #[arg(long)]
        refresh: bool,
    },
    /// Register the nodes of a cluster-load file.
    Load {
        #[command(flatten)]
        client: ClientArgs,
        file: PathBuf,
    },
    /// Remove groups and their nodes (all groups when none given).
    Delete {
        #[command(flatten)]
        client: ClientArgs,
        groups: Vec<String>,
    },
    /// Merge the directory into the server-side snapshot.
    Dump(ClientArgs),
    /// Write the server-side snapshot out as plaintext.
    Decode(ClientArgs),
    /// Show whether the caller's cache is stale.
    Cache(ClientArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// JSON server configuration; flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(long)]
    policy: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long)]
    snapshot: Option<PathBuf>,

    #[arg(long)]
    key: Option<PathBuf>,

    /// Minutes between periodic snapshots; 0 disables them.
    #[arg(long)]
    dump_interval: Option<u64>,

    /// Accept nodes on Load without probing their shell port.
    #[arg(long)]
    skip_reachability: bool,
}

impl ServeArgs {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(policy) = &self.policy {
            config.policy_path = policy.clone();
        }
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(snapshot) = &self.snapshot {
            config.snapshot_path = snapshot.clone();
        }
        if let Some(key) = &self.key {
            config.key_path = key.clone();
        }
        if let Some(minutes) = self.dump_interval {
            config.dump_interval_minutes = minutes;
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Directory server as IP:PORT/IDENTITY.
    #[arg(short, long, value_name = "SERVER")]
    server: ServerAddress,

    /// Caller identity; defaults to login@outbound-address.
    #[arg(short, long)]
    user: Option<String>,

    /// Local cache file.
    #[arg(long)]
    cache: Option<PathBuf>,
}

impl ClientArgs {
    fn user(&self) -> String {
        self.user.clone().unwrap_or_else(caller_identity)
    }

    fn cache_path(&self) -> PathBuf {
        self.cache.clone().unwrap_or_else(LocalCache::default_path)
    }

    fn connect(&self) -> Result<RpcClient> {
        RpcClient::new(self.server.addr, self.server.identity)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::TemplatePolicy { output, user } => {
            let user = user.unwrap_or_else(caller_identity);
            AuthorityConfig::write_template(&output, &user)?;
            info!(path = %output.display(), user = %user, "policy template written");
            Ok(())
        }
        Command::TemplateCluster { output } => {
            ClusterFile::write_template(&output)?;
            info!(path = %output.display(), "cluster template written");
            Ok(())
        }
        Command::Access(client) => run_client(client, Request::Access).await,
        Command::Users(client) => run_client(client, Request::Users).await,
        Command::Query { client, groups, refresh } => run_client(client, Request::Query { groups, refresh }).await,
        Command::Load { client, file } => run_client(client, Request::Load { file }).await,
        Command::Delete { client, groups } => run_client(client, Request::Delete { groups }).await,
        Command::Dump(client) => run_client(client, Request::Dump).await,
        Command::Decode(client) => run_client(client, Request::Decode).await,
        Command::Cache(client) => run_client(client, Request::Cache).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.server_config()?;
    let probe: Arc<dyn ReachabilityProbe> = if args.skip_reachability {
        Arc::new(AlwaysReachable)
    } else {
        Arc::new(SshBannerProbe::default())
    };

    let server = Server::start(config, probe).await?;
    info!("clients connect with --server {}", server.address()?);

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal, exiting gracefully");
    server.shutdown().await;
    Ok(())
}

/// A client subcommand with its own arguments.
enum Request {
    Access,
    Users,
    Query { groups: Vec<String>, refresh: bool },
    Load { file: PathBuf },
    Delete { groups: Vec<String> },
    Dump,
    Decode,
    Cache,
}

async fn run_client(args: ClientArgs, request: Request) -> Result<()> {
    let rpc = args.connect()?;
    let result = execute(&rpc, &args.user(), &args.cache_path(), request).await;
    rpc.close().await;
    result
}

async fn execute(rpc: &RpcClient, user: &str, cache_path: &Path, request: Request) -> Result<()> {
    match request {
        Request::Access => {
            rpc.access(user).await?;
            print_json(&serde_json::json!({ "user": user, "access": true }))
        }
        Request::Users => print_json(&rpc.users(user).await?),
        Request::Query { groups, refresh } if groups.is_empty() => {
            let cache = LocalCache::refresh(rpc, user, cache_path, refresh).await?;
            print_json(&cache.ordered_nodes())
        }
        Request::Query { groups, .. } => print_json(&rpc.query(user, &groups).await?),
        Request::Load { file } => {
            let cluster = ClusterFile::load(&file).with_context(|| format!("failed to read {}", file.display()))?;
            print_json(&rpc.load(cluster.to_load_request(user)).await?)
        }
        Request::Delete { groups } => print_json(&rpc.delete(user, &groups).await?),
        Request::Dump => print_json(&serde_json::json!({ "message": rpc.dump(user).await? })),
        Request::Decode => print_json(&serde_json::json!({ "message": rpc.decode(user).await? })),
        Request::Cache => print_json(&serde_json::json!({ "dirty": u8::from(rpc.cache(user).await?) })),
    }
}
