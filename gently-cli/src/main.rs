//! GentlyOS IPFS CLI
//!
//! Drives a running IPFS daemon through gently-ipfs-ops. Every command prints
//! the operation's result envelope as JSON and exits non-zero on failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use gently_ipfs_ops::duration::parse_duration;
use gently_ipfs_ops::{
    DagInput, Envelope, ExportTarget, ImportSource, KeyType, OpsConfig,
    OpsContext, OutputFormat, ProtectionLevel, PublishOptions, PutOptions, ResolveOptions,
};

#[derive(Parser)]
#[command(name = "gently-ipfs")]
#[command(about = "GentlyOS - DHT, DAG, key and IPNS operations against an IPFS daemon")]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config dir>/gently/ipfs-ops.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon API root, e.g. http://127.0.0.1:5001/api/v0
    #[arg(long, global = true)]
    api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Distributed hash table
    Dht {
        #[command(subcommand)]
        command: DhtCommands,
    },

    /// Linked data (DAG) nodes and trees
    Dag {
        #[command(subcommand)]
        command: DagCommands,
    },

    /// Keystore management
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },

    /// IPNS names
    Name {
        #[command(subcommand)]
        command: NameCommands,
    },

    /// Write the effective config as YAML
    Config {
        /// Output file (defaults to the default config path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DhtCommands {
    /// Read a value record
    Get {
        key: String,

        /// Lookup timeout, e.g. 30s
        #[arg(short, long)]
        timeout: Option<String>,
    },

    /// Store a value record
    Put {
        key: String,
        value: String,
    },

    /// Announce this node as a provider
    Provide {
        cid: String,

        #[arg(short, long)]
        recursive: bool,
    },

    /// Find providers for a CID
    Providers {
        cid: String,

        #[arg(short, long, default_value = "20")]
        num: usize,
    },

    /// Find a peer's addresses
    FindPeer {
        peer_id: String,
    },

    /// Peers closest to an id
    Query {
        peer_id: String,
    },

    /// Routing table buckets
    Table,

    /// Routing, swarm and bootstrap overview
    Diag,

    /// Crawl the DHT for peers
    Discover {
        /// Bootstrap multiaddrs (defaults to the daemon's list)
        #[arg(short, long)]
        bootstrap: Vec<String>,

        #[arg(short, long, default_value = "100")]
        max_peers: usize,

        #[arg(short, long, default_value = "60s")]
        timeout: String,
    },
}

#[derive(Subcommand)]
enum DagCommands {
    /// Store a JSON node
    Put {
        /// JSON text
        data: String,

        /// Store codec
        #[arg(long, default_value = "dag-cbor")]
        format: String,

        /// Do not pin
        #[arg(long)]
        no_pin: bool,
    },

    /// Read a node or a path below it
    Get {
        cid: String,

        #[arg(short, long)]
        path: Option<String>,

        /// Return raw bytes
        #[arg(long)]
        raw: bool,
    },

    /// Resolve <cid>/<path> to the node holding it
    Resolve {
        cid_path: String,
    },

    /// Size and block count
    Stat {
        cid: String,
    },

    /// Store nested JSON as a tree of linked nodes
    Tree {
        /// JSON text
        structure: String,
    },

    /// Read a tree back, following links
    View {
        cid: String,

        /// Link depth (-1 for unlimited)
        #[arg(short, long, default_value = "-1", allow_hyphen_values = true)]
        depth: i64,
    },

    /// Link `child` under `name` in `parent`
    Link {
        parent: String,
        name: String,
        child: String,
    },

    /// Drop the link `name` from `parent`
    Unlink {
        parent: String,
        name: String,
    },

    /// Import a CAR file
    Import {
        file: PathBuf,
    },

    /// Export a DAG as CAR
    Export {
        cid: String,

        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// List keys
    List {
        /// Skip the cache
        #[arg(short, long)]
        force: bool,
    },

    /// Generate a key
    Gen {
        name: String,

        /// rsa, ed25519 or secp256k1
        #[arg(short = 't', long = "type", default_value = "ed25519")]
        key_type: KeyType,

        /// RSA bits
        #[arg(short, long)]
        size: Option<u32>,
    },

    /// Export key material
    Export {
        name: String,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Remove a key
    Rm {
        name: String,
    },

    /// Rename a key
    Rename {
        old_name: String,
        new_name: String,

        /// Overwrite an existing key
        #[arg(short, long)]
        force: bool,
    },

    /// Replace a key with a fresh one
    Rotate {
        name: String,

        #[arg(short = 't', long = "type", default_value = "ed25519")]
        key_type: KeyType,

        #[arg(short, long)]
        size: Option<u32>,

        /// Keep the old key as <name>-<timestamp>
        #[arg(long)]
        preserve_old: bool,
    },
}

#[derive(Subcommand)]
enum NameCommands {
    /// Publish a CID under a key
    Publish {
        cid: String,

        #[arg(short, long, default_value = "self")]
        key: String,

        /// Record lifetime, e.g. 24h
        #[arg(short, long)]
        lifetime: Option<String>,

        /// Cache TTL, e.g. 1h
        #[arg(long)]
        ttl: Option<String>,
    },

    /// Resolve a name
    Resolve {
        name: String,

        /// Also fetch the DHT record
        #[arg(long)]
        dht_record: bool,

        #[arg(long)]
        nocache: bool,
    },

    /// Publish a name's current target again
    Republish {
        #[arg(short, long, default_value = "self")]
        key: String,

        /// Name to refresh (defaults to the key's id)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Resolve every key's name
    Records,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.api)?;

    if let Commands::Config { output } = &cli.command {
        return cmd_config(&config, output.clone());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let ctx = OpsContext::new(config).context("Cannot build IPFS operations context")?;
        let result = match cli.command {
            Commands::Dht { command } => cmd_dht(&ctx, command).await,
            Commands::Dag { command } => cmd_dag(&ctx, command).await,
            Commands::Key { command } => cmd_key(&ctx, command).await,
            Commands::Name { command } => cmd_name(&ctx, command).await,
            Commands::Config { .. } => Ok(()),
        };
        ctx.shutdown().await;
        result
    })
}

fn load_config(path: Option<&std::path::Path>, api: Option<String>) -> Result<OpsConfig> {
    let mut config = match path {
        Some(path) => OpsConfig::load(path)
            .with_context(|| format!("Cannot load config from {}", path.display()))?,
        None => OpsConfig::load_default().context("Cannot load default config")?,
    };
    if let Some(api) = api {
        config.connection.base_url = api;
        config
            .connection
            .validate()
            .context("Invalid --api")?;
    }
    tracing::debug!(api = %config.connection.base_url, "Using daemon API");
    Ok(config)
}

fn parse_timeout(text: &str) -> Result<Duration> {
    parse_duration(text).with_context(|| format!("Invalid duration: {}", text))
}

/// Print the envelope; a failed operation becomes a failed command.
fn emit<T: Serialize>(envelope: Envelope<T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&envelope.to_json())?);
    match envelope.into_result() {
        Ok(_) => Ok(()),
        Err(failure) => Err(anyhow::anyhow!(failure)),
    }
}

// ============================================================================
// DHT COMMANDS
// ============================================================================

async fn cmd_dht(ctx: &OpsContext, command: DhtCommands) -> Result<()> {
    match command {
        DhtCommands::Get { key, timeout } => {
            let timeout = timeout.as_deref().map(parse_timeout).transpose()?;
            emit(ctx.dht.get_value(&key, timeout).await)
        }

        DhtCommands::Put { key, value } => {
            emit(ctx.dht.put_value(&key, value.as_bytes(), None).await)
        }

        DhtCommands::Provide { cid, recursive } => {
            emit(ctx.dht.provide(&cid, recursive, None).await)
        }

        DhtCommands::Providers { cid, num } => {
            emit(ctx.dht.find_providers(&cid, Some(num), None).await)
        }

        DhtCommands::FindPeer { peer_id } => emit(ctx.dht.find_peer(&peer_id, None).await),

        DhtCommands::Query { peer_id } => emit(ctx.dht.query(&peer_id, None).await),

        DhtCommands::Table => emit(ctx.dht.get_routing_table().await),

        DhtCommands::Diag => emit(ctx.dht.get_network_diagnostics().await),

        DhtCommands::Discover { bootstrap, max_peers, timeout } => {
            let bootstrap = (!bootstrap.is_empty()).then_some(bootstrap);
            let timeout = parse_timeout(&timeout)?;
            emit(ctx.dht.discover_peers(bootstrap, Some(max_peers), Some(timeout)).await)
        }
    }
}

// ============================================================================
// DAG COMMANDS
// ============================================================================

async fn cmd_dag(ctx: &OpsContext, command: DagCommands) -> Result<()> {
    match command {
        DagCommands::Put { data, format, no_pin } => {
            let value: serde_json::Value =
                serde_json::from_str(&data).context("DAG data must be JSON")?;
            let options = PutOptions::new().format(format).pin(!no_pin);
            emit(ctx.dag.put(DagInput::Json(value), options).await)
        }

        DagCommands::Get { cid, path, raw } => {
            let format = if raw { OutputFormat::Raw } else { OutputFormat::Json };
            emit(ctx.dag.get(&cid, path.as_deref(), format).await)
        }

        DagCommands::Resolve { cid_path } => emit(ctx.dag.resolve(&cid_path).await),

        DagCommands::Stat { cid } => emit(ctx.dag.stat(&cid).await),

        DagCommands::Tree { structure } => {
            let structure: serde_json::Value =
                serde_json::from_str(&structure).context("Tree structure must be JSON")?;
            emit(ctx.dag.create_tree(structure).await)
        }

        DagCommands::View { cid, depth } => emit(ctx.dag.get_tree(&cid, depth).await),

        DagCommands::Link { parent, name, child } => {
            emit(ctx.dag.add_link(&parent, &name, &child).await)
        }

        DagCommands::Unlink { parent, name } => emit(ctx.dag.remove_link(&parent, &name).await),

        DagCommands::Import { file } => {
            let car = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Cannot open {}", file.display()))?;
            emit(ctx.dag.import_data(ImportSource::from(car), true).await)
        }

        DagCommands::Export { cid, output } => {
            emit(ctx.dag.export_data(&cid, ExportTarget::Path(output)).await)
        }
    }
}

// ============================================================================
// KEY COMMANDS
// ============================================================================

async fn cmd_key(ctx: &OpsContext, command: KeyCommands) -> Result<()> {
    match command {
        KeyCommands::List { force } => emit(ctx.keys.list_keys(force).await),

        KeyCommands::Gen { name, key_type, size } => {
            emit(ctx.keys.create_key(&name, key_type, size, ProtectionLevel::Standard).await)
        }

        KeyCommands::Export { name, output } => {
            emit(ctx.keys.export_key(&name, None, Some(output.as_path())).await)
        }

        KeyCommands::Rm { name } => emit(ctx.keys.remove_key(&name).await),

        KeyCommands::Rename { old_name, new_name, force } => {
            emit(ctx.keys.rename_key(&old_name, &new_name, force).await)
        }

        KeyCommands::Rotate { name, key_type, size, preserve_old } => {
            emit(ctx.keys.rotate_key(&name, key_type, size, preserve_old).await)
        }
    }
}

// ============================================================================
// NAME COMMANDS
// ============================================================================

async fn cmd_name(ctx: &OpsContext, command: NameCommands) -> Result<()> {
    match command {
        NameCommands::Publish { cid, key, lifetime, ttl } => {
            let mut options = PublishOptions::new().key(key);
            if let Some(lifetime) = lifetime {
                options = options.lifetime(lifetime);
            }
            if let Some(ttl) = ttl {
                options = options.ttl(ttl);
            }
            emit(ctx.ipns.publish(&cid, options).await)
        }

        NameCommands::Resolve { name, dht_record, nocache } => {
            let options = ResolveOptions::new().dht_record(dht_record).nocache(nocache);
            emit(ctx.ipns.resolve(&name, options).await)
        }

        NameCommands::Republish { key, name } => {
            emit(ctx.ipns.republish(name.as_deref(), &key).await)
        }

        NameCommands::Records => emit(ctx.ipns.get_records().await),
    }
}

fn cmd_config(config: &OpsConfig, output: Option<PathBuf>) -> Result<()> {
    let path = match output.or_else(OpsConfig::default_path) {
        Some(path) => path,
        None => anyhow::bail!("No config directory on this system; pass --output"),
    };
    config
        .save(&path)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    println!("  Config written to {}", path.display());
    Ok(())
}
