//! ipspace CLI
//!
//! Thin wrapper around ipspace-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! ipspace info
//!
//! # Create (or open) a profile
//! ipspace --profile alice profile init
//!
//! # Show and edit user information
//! ipspace --profile alice profile show
//! ipspace --profile alice profile set --username alice --avatar bafy...
//! ipspace --profile alice profile lock
//!
//! # Post to the board and inspect the DAG
//! ipspace --profile alice board post "Hello" "First message"
//! ipspace --profile alice dag show
//!
//! # Encrypt for yourself
//! ipspace --profile alice crypto encrypt-self "secret"
//! ipspace --profile alice crypto decrypt <cid>
//!
//! # Build a peer tree from a peers file
//! ipspace peers load peers.json --search blog
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipspace_core::content::parse_cid;
use ipspace_core::logging::JsonlLayer;
use ipspace_core::peers::{RowKind, TreeRow};
use ipspace_core::pubsub::key::{key_peer_added, key_peer_logout};
use ipspace_core::pubsub::Listener;
use ipspace_core::{
    LocalNode, LocalNodeOptions, MemoryDirectory, MessageBus, NodeHandle, PeerContext, PeerEvent,
    PeerTree, PeersTracker, SpaceConfig, TreeEvent, UserProfile,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

/// ipspace - user profiles over a content-addressed network
#[derive(Parser)]
#[command(name = "ipspace")]
#[command(version = "0.1.0")]
#[command(about = "ipspace - user profiles over a content-addressed network")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.ipspace/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Profile name
    #[arg(short, long, global = true, default_value = "default")]
    profile: String,

    /// RSA modulus size for new keypairs (overrides config.json)
    #[arg(long, global = true)]
    rsa_bits: Option<usize>,

    /// Run the storage node without DAG support
    #[arg(long, global = true)]
    no_dag: bool,

    /// Mirror logs to <data-dir>/logs/raw/<date>_<profile>.jsonl
    #[arg(long, global = true)]
    jsonl_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Message board
    Board {
        #[command(subcommand)]
        action: BoardAction,
    },

    /// User DAG inspection
    Dag {
        #[command(subcommand)]
        action: DagAction,
    },

    /// Encryption with the profile's keypair
    Crypto {
        #[command(subcommand)]
        action: CryptoAction,
    },

    /// Peer directory
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Initialize the profile (idempotent)
    Init,

    /// Show user information
    Show,

    /// Set user information fields
    Set {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        firstname: Option<String>,
        #[arg(long)]
        lastname: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        city: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        #[arg(long)]
        motto: Option<String>,
        /// Avatar CID
        #[arg(long)]
        avatar: Option<String>,
        /// Country as NAME:CODE, e.g. France:FR
        #[arg(long)]
        country: Option<String>,
    },

    /// Lock user information against edits
    Lock,

    /// Unlock user information
    Unlock,
}

#[derive(Subcommand)]
enum BoardAction {
    /// Post a message
    Post {
        /// Message title
        title: String,
        /// Message text
        text: String,
    },
}

#[derive(Subcommand)]
enum DagAction {
    /// Show the DAG root CID and content
    Show {
        /// Also list previous roots
        #[arg(long)]
        history: bool,
    },
}

#[derive(Subcommand)]
enum CryptoAction {
    /// Encrypt text for this profile and store it
    EncryptSelf {
        /// Text to encrypt
        text: String,
    },
    /// Fetch and decrypt an object stored with encrypt-self
    Decrypt {
        /// Object CID
        cid: String,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    /// Announce the peers of a JSON file and print the resulting tree
    Load {
        /// Peers file: array of {peer_id, did, handle, services, contained}
        file: PathBuf,
        /// Only show services and objects matching this query
        #[arg(short, long)]
        search: Option<String>,
        /// Peer ids to log out after loading
        #[arg(long)]
        logout: Vec<String>,
    },
}

/// One peer of a peers file.
#[derive(Deserialize)]
struct PeerFixture {
    #[serde(flatten)]
    ctx: PeerContext,
    #[serde(default)]
    services: Vec<Value>,
    /// Service id to contained objects
    #[serde(default)]
    contained: HashMap<String, Vec<Value>>,
}

fn setup_logging(verbosity: u8, jsonl: Option<(PathBuf, &str)>) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let jsonl = match jsonl {
        Some((logs_dir, profile)) => Some(
            JsonlLayer::new(&logs_dir, profile)
                .with_context(|| format!("Cannot open log directory {}", logs_dir.display()))?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

/// Get the default data directory (~/.ipspace/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ipspace")
        .join("data")
}

fn open_node(data_dir: &Path, no_dag: bool) -> Result<NodeHandle> {
    let node = LocalNode::open_with(
        data_dir.join("node.redb"),
        LocalNodeOptions { dag_enabled: !no_dag },
    )
    .context("Cannot open storage node")?;
    Ok(Arc::new(node))
}

async fn open_profile(cli: &Cli, data_dir: &Path, config: SpaceConfig) -> Result<UserProfile> {
    let node = open_node(data_dir, cli.no_dag)?;
    let profile = UserProfile::new(
        cli.profile.clone(),
        node,
        config,
        ipspace_core::profile::crypto_dir(data_dir),
    );
    profile
        .init()
        .await
        .with_context(|| format!("Cannot initialize profile {}", cli.profile))?;
    Ok(profile)
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn or_unset(s: String) -> String {
    if s.is_empty() {
        "(not set)".to_string()
    } else {
        s
    }
}

async fn print_profile(profile: &UserProfile) -> Result<()> {
    let userinfo = profile
        .userinfo()
        .context("Profile has no user information")?;

    println!("Profile: {}", profile.name());
    println!("  State: {:?}", profile.state());
    if let Some(key) = profile.root_key() {
        println!("  Root key: {} ({})", key.name, key.id);
    }
    println!();
    println!("User information:");
    println!("  UID: {}", userinfo.uid());
    println!("  Username: {}", or_unset(userinfo.username()));
    println!("  Name: {}", or_unset(format!("{} {}", userinfo.firstname(), userinfo.lastname()).trim().to_string()));
    println!("  Email: {}", or_unset(userinfo.email()));
    println!("  Organization: {}", or_unset(userinfo.org()));
    println!("  City: {}", or_unset(userinfo.city()));
    println!(
        "  Country: {}",
        or_unset(match (userinfo.country_name(), userinfo.country_code()) {
            (name, code) if code.is_empty() => name,
            (name, code) => format!("{} ({})", name, code),
        })
    );
    println!("  Bio: {}", or_unset(userinfo.bio()));
    println!("  Avatar: {}", or_unset(userinfo.avatar_cid()));
    println!("  Peer ID: {}", or_unset(userinfo.peer_id()));
    println!("  Locked: {}", yes_no(userinfo.locked()));
    println!("  Created: {}", userinfo.date_created());
    println!("  Modified: {}", userinfo.date_modified());
    println!();

    match profile.dag().and_then(|dag| dag.dag_cid()) {
        Some(cid) => println!("DAG: {}", cid),
        None => println!("DAG: (unavailable)"),
    }
    match profile.resolve().await? {
        Some(path) => println!("Published: {}", path),
        None => println!("Published: (not yet)"),
    }
    Ok(())
}

fn print_rows(rows: &[TreeRow]) {
    for row in rows {
        let indent = "  ".repeat(row.depth + 1);
        let label = match row.kind {
            RowKind::Peer => "peer",
            RowKind::Service => "service",
            RowKind::ServiceObject => "object",
        };
        println!(
            "{}{} {}  [{}]",
            indent,
            label,
            row.display.as_deref().unwrap_or("-"),
            row.ident
        );
    }
}

async fn wait_tree_event(events: &mut broadcast::Receiver<TreeEvent>) -> Result<TreeEvent> {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .context("Timed out waiting for the peer tree")?
        .context("Peer tree closed")
}

async fn load_peers(
    config: &SpaceConfig,
    file: &Path,
    search: Option<&str>,
    logout: &[String],
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Cannot read {}", file.display()))?;
    let fixtures: Vec<PeerFixture> =
        serde_json::from_str(&content).context("Malformed peers file")?;

    let bus = MessageBus::new();
    let directory = Arc::new(MemoryDirectory::new());
    let tree = Arc::new(PeerTree::new(directory.clone()));
    let tracker = Arc::new(PeersTracker::new(directory.clone(), tree.clone()));
    let mut listener = Listener::start(bus.clone(), tracker);
    listener.listen_from_config(&config.ps_keys_listen);

    let mut events = tree.subscribe();
    for fixture in fixtures {
        let peer_id = fixture.ctx.peer_id.clone();
        directory.insert_peer(fixture.ctx);
        directory.set_services(&peer_id, fixture.services);
        for (service_id, objects) in fixture.contained {
            directory.set_contained(&service_id, objects);
        }

        bus.publish(&key_peer_added(), PeerEvent::new(peer_id).to_value());
        wait_tree_event(&mut events).await?;
    }

    for peer_id in logout {
        if tree.peer_lookup(peer_id).await.is_none() {
            println!("Unknown peer: {}", peer_id);
            continue;
        }
        bus.publish(&key_peer_logout(), PeerEvent::new(peer_id.clone()).to_value());
        wait_tree_event(&mut events).await?;
    }

    let rows = match search {
        Some(query) => tree.search(query).await,
        None => tree.rows().await,
    };
    println!("Peers: {}", tree.peer_count().await);
    print_rows(&rows);
    Ok(())
}

fn userinfo_fields(pairs: Vec<(&str, Option<String>)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key.to_string(), Value::String(v))))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let jsonl = cli
        .jsonl_logs
        .then(|| (data_dir.join("logs"), cli.profile.as_str()));
    setup_logging(cli.verbose, jsonl)?;

    let mut config = SpaceConfig::load_from_dir(&data_dir).context("Cannot load config.json")?;
    if let Some(bits) = cli.rsa_bits {
        config.crypto.key_bits = bits;
    }
    tracing::debug!(data_dir = %data_dir.display(), profile = %cli.profile, "Starting");

    match &cli.command {
        Commands::Info => {
            let node = open_node(&data_dir, cli.no_dag)?;
            println!("ipspace v0.1.0");
            println!();
            println!("Node:");
            println!("  ID: {}", node.node_id());
            println!("  DAG support: {}", yes_no(node.has_dag_command().await));
            println!();
            println!("Keys:");
            for name in node.keys_names().await? {
                println!("  {}", name);
            }
            println!();
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Profile { action } => {
            let profile = open_profile(&cli, &data_dir, config).await?;
            match action {
                ProfileAction::Init => {
                    profile.sync().await?;
                    println!("Profile initialized: {}", profile.name());
                    if let Some(key) = profile.root_key() {
                        println!("  Root key: {}", key.name);
                    }
                    if profile.is_degraded() {
                        println!("  Mode: degraded (no DAG support)");
                    }
                }

                ProfileAction::Show => {
                    profile.sync().await?;
                    print_profile(&profile).await?;
                }

                ProfileAction::Set {
                    username,
                    firstname,
                    lastname,
                    email,
                    org,
                    city,
                    bio,
                    motto,
                    avatar,
                    country,
                } => {
                    let userinfo = profile
                        .userinfo()
                        .context("Profile has no user information")?;
                    if userinfo.locked() {
                        anyhow::bail!("User information is locked");
                    }

                    let fields = userinfo_fields(vec![
                        ("username", username.clone()),
                        ("firstname", firstname.clone()),
                        ("lastname", lastname.clone()),
                        ("email", email.clone()),
                        ("org", org.clone()),
                        ("city", city.clone()),
                        ("bio", bio.clone()),
                        ("motto", motto.clone()),
                    ]);
                    if !fields.is_empty() {
                        userinfo.set_infos(&fields);
                    }
                    if let Some(cid) = avatar {
                        userinfo.set_avatar_cid(cid);
                    }
                    if let Some(country) = country {
                        let (name, code) = country.split_once(':').unwrap_or((country.as_str(), ""));
                        userinfo.set_country_info(name, code);
                    }

                    profile.sync().await?;
                    println!("Profile updated.");
                    print_profile(&profile).await?;
                }

                ProfileAction::Lock | ProfileAction::Unlock => {
                    let lock = matches!(action, ProfileAction::Lock);
                    let userinfo = profile
                        .userinfo()
                        .context("Profile has no user information")?;
                    let changed = userinfo.set_lock(lock);
                    profile.sync().await?;
                    let state = if lock { "locked" } else { "unlocked" };
                    if changed {
                        println!("User information {}.", state);
                    } else {
                        println!("User information already {}.", state);
                    }
                }
            }
            profile.shutdown().await;
        }

        Commands::Board { action } => {
            let profile = open_profile(&cli, &data_dir, config).await?;
            match action {
                BoardAction::Post { title, text } => {
                    let cid = profile.post_message(title, text).await?;
                    profile.sync().await?;
                    println!("Message posted.");
                    println!("  DAG: {}", cid);
                }
            }
            profile.shutdown().await;
        }

        Commands::Dag { action } => {
            let profile = open_profile(&cli, &data_dir, config).await?;
            profile.sync().await?;
            match action {
                DagAction::Show { history } => {
                    let dag = profile.dag().context("DAG not available for this profile")?;
                    match dag.dag_cid() {
                        Some(cid) => println!("CID: {}", cid),
                        None => println!("CID: (none)"),
                    }
                    println!("{}", serde_json::to_string_pretty(&dag.root())?);
                    if *history {
                        println!();
                        println!("History:");
                        for entry in dag.history().await {
                            println!("  {}  {}", entry.date, entry.cid);
                        }
                    }
                }
            }
            profile.shutdown().await;
        }

        Commands::Crypto { action } => {
            let profile = open_profile(&cli, &data_dir, config).await?;
            match action {
                CryptoAction::EncryptSelf { text } => {
                    let cid = profile.encrypt_self(text.as_bytes()).await?;
                    println!("{}", cid);
                }
                CryptoAction::Decrypt { cid } => {
                    let cid = parse_cid(cid)?;
                    let data = profile.decrypt_object(&cid).await?;
                    println!("{}", String::from_utf8_lossy(&data));
                }
            }
            profile.sync().await?;
            profile.shutdown().await;
        }

        Commands::Peers { action } => match action {
            PeersAction::Load {
                file,
                search,
                logout,
            } => {
                load_peers(&config, file, search.as_deref(), logout).await?;
            }
        },
    }

    Ok(())
}
