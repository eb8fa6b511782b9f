//! meshsync CLI
//!
//! Thin wrapper around meshsync-core for running and inspecting a node.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! meshsync info
//!
//! # Offer something to the community
//! meshsync listing add "Grain mill" --category tools --location "blue barn"
//!
//! # List what is on offer
//! meshsync listing list
//!
//! # Mark a listing as lent out
//! meshsync listing set-available <record_id> false
//!
//! # Pin trust in a peer met in person
//! meshsync peers verify did:mesh:z...
//!
//! # Run the node on the local network
//! meshsync serve --peer <endpoint-id>@192.168.1.20:4433
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshsync_core::config::DATABASE_FILE;
use meshsync_core::logging::init_logging;
use meshsync_core::transport::IrohBearer;
use meshsync_core::{Did, EngineConfig, Listing, MeshEngine, Model, Profile, RecordId, SyncEvent};
use tracing::info;

/// Config file looked up inside the data directory
const CONFIG_FILE: &str = "meshsync.toml";

/// meshsync - offline-first community mesh node
#[derive(Parser)]
#[command(name = "meshsync")]
#[command(version)]
#[command(about = "Offline-first community database that syncs whenever devices meet")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.meshsync)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/meshsync.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Print the effective configuration as TOML
    Config,

    /// Community listings
    Listing {
        #[command(subcommand)]
        action: ListingAction,
    },

    /// This node's profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Peers met so far
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Bundles carried for store-and-forward delivery
    Bundles {
        #[command(subcommand)]
        action: BundlesAction,
    },

    /// Run the node on the local network until Ctrl+C
    Serve {
        /// Static peer, `<endpoint-id>` or `<endpoint-id>@<ip:port>` (repeatable)
        #[arg(short, long = "peer")]
        peers: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ListingAction {
    /// Offer an item or skill
    Add {
        title: String,
        #[arg(short, long, default_value = "general")]
        category: String,
        #[arg(short, long)]
        description: Option<String>,
        /// Pickup location (verified peers only)
        #[arg(short, long)]
        location: Option<String>,
        /// Private notes (never leave this device)
        #[arg(short, long)]
        notes: Option<String>,
        /// Tag (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    /// List listings
    List {
        /// Include listings that are not available
        #[arg(short, long)]
        all: bool,
    },
    /// Mark a listing available or not
    SetAvailable {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        available: bool,
    },
    /// Add a comment to a listing's thread
    Comment { id: String, text: String },
    /// Withdraw a listing
    Remove { id: String },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show your profile
    Show,
    /// Set profile fields
    Set {
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        bio: Option<String>,
        /// Contact details (verified peers only)
        #[arg(short, long)]
        contact: Option<String>,
        /// Home area (never leaves this device)
        #[arg(long)]
        home_area: Option<String>,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    /// List known peers
    List,
    /// Mark a peer as verified out of band
    Verify { did: String },
    /// Unpin a peer's keys
    Forget { did: String },
}

#[derive(Subcommand)]
enum BundlesAction {
    /// List stored bundles
    List,
    /// Drop expired and exhausted bundles now
    Expire,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meshsync")
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));

    let mut config = if path.exists() {
        EngineConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
    } else if cli.config.is_some() {
        anyhow::bail!("Config file {} does not exist", path.display());
    } else {
        EngineConfig::default()
    };
    // An explicit --data-dir wins over the file; otherwise keep the file's
    // value only when a config file was actually read.
    if cli.data_dir.is_some() || !path.exists() {
        config.node.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}

fn parse_did(s: &str) -> Result<Did> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("Invalid peer id '{}': {}", s, e))
}

fn find_listing(engine: &MeshEngine, id: &str) -> Result<(RecordId, Listing)> {
    let id = RecordId::from(id);
    let listing = engine
        .documents()
        .get::<Listing>(&id)
        .ok_or_else(|| anyhow::anyhow!("Listing {} not found", id))?;
    Ok((id, listing))
}

fn format_millis(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let log_dir = if matches!(cli.command, Commands::Serve { .. }) {
        config.node.log_dir.as_deref()
    } else {
        None
    };
    init_logging(config.node_name(), log_dir, cli.verbose)?;

    let engine = MeshEngine::open_dir(config.clone())?;

    match cli.command {
        Commands::Info => {
            let info = engine.node_info()?;
            let signing_key = info.peer_id.signing_key()?;

            println!("meshsync v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Identity:");
            println!("  DID: {}", info.peer_id);
            println!("  Fingerprint: {}", hex::encode(&signing_key[..8]));
            if let Some(name) = &info.display_name {
                println!("  Name: {}", name);
            }
            println!();
            println!("Document:");
            println!("  Clock: {}", info.clock);
            println!("  Logged changes: {}", info.log_len);
            println!("  Listings: {}", engine.documents().list::<Listing>().len());
            println!();
            println!(
                "Bundles: {} stored ({} bytes)",
                info.stored_bundles, info.stored_bundle_bytes
            );
            println!(
                "Peers: {} known, {} verified",
                info.known_peers, info.verified_peers
            );
            println!();
            println!("Data directory: {}", config.node.data_dir.display());
        }

        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }

        Commands::Listing { action } => match action {
            ListingAction::Add {
                title,
                category,
                description,
                location,
                notes,
                tags,
            } => {
                let id = engine.documents().insert(&Listing {
                    title: title.clone(),
                    description,
                    category,
                    available: true,
                    location,
                    tags,
                    notes,
                    comments: Vec::new(),
                })?;
                println!("Added listing: {}", title);
                println!("  ID: {}", id);
            }

            ListingAction::List { all } => {
                let listings: Vec<_> = engine
                    .documents()
                    .list::<Listing>()
                    .into_iter()
                    .filter(|(_, l)| all || l.available)
                    .collect();
                if listings.is_empty() {
                    println!("No listings found.");
                } else {
                    println!("Listings ({}):", listings.len());
                    println!();
                    for (id, listing) in listings {
                        let mark = if listing.available { "○" } else { "●" };
                        println!("  {} {} [{}]", mark, listing.title, listing.category);
                        println!("    ID: {}", id);
                        if let Some(location) = &listing.location {
                            println!("    Location: {}", location);
                        }
                        if !listing.tags.is_empty() {
                            println!("    Tags: {}", listing.tags.join(", "));
                        }
                        if !listing.comments.is_empty() {
                            println!("    Comments: {}", listing.comments.len());
                        }
                    }
                }
            }

            ListingAction::SetAvailable { id, available } => {
                let (id, listing) = find_listing(&engine, &id)?;
                engine.documents().apply_local_change(|tx| {
                    tx.set(Listing::COLLECTION, &id, "available", available)
                })?;
                println!(
                    "{} is now {}",
                    listing.title,
                    if available { "available" } else { "unavailable" }
                );
            }

            ListingAction::Comment { id, text } => {
                let (id, listing) = find_listing(&engine, &id)?;
                engine.documents().apply_local_change(|tx| {
                    tx.append(Listing::COLLECTION, &id, "comments", text.as_str())
                })?;
                println!("Commented on {}", listing.title);
            }

            ListingAction::Remove { id } => {
                let (id, listing) = find_listing(&engine, &id)?;
                engine.documents().remove::<Listing>(&id)?;
                println!("Removed listing: {}", listing.title);
            }
        },

        Commands::Profile { action } => match action {
            ProfileAction::Show => match engine.own_profile() {
                Some((id, profile)) => {
                    println!("Profile:");
                    println!("  Name: {}", profile.display_name);
                    if let Some(bio) = &profile.bio {
                        println!("  Bio: {}", bio);
                    }
                    if let Some(contact) = &profile.contact {
                        println!("  Contact: {} (verified peers only)", contact);
                    }
                    if let Some(area) = &profile.home_area {
                        println!("  Home area: {} (private)", area);
                    }
                    println!("  ID: {}", id);
                }
                None => println!("No profile set. Use: meshsync profile set --name <name>"),
            },

            ProfileAction::Set {
                name,
                bio,
                contact,
                home_area,
            } => {
                let mut profile = engine
                    .own_profile()
                    .map(|(_, p)| p)
                    .unwrap_or_default();
                if let Some(name) = name {
                    profile.display_name = name;
                }
                if bio.is_some() {
                    profile.bio = bio;
                }
                if contact.is_some() {
                    profile.contact = contact;
                }
                if home_area.is_some() {
                    profile.home_area = home_area;
                }
                if profile.display_name.is_empty() {
                    anyhow::bail!("A profile needs a name (--name)");
                }
                engine.set_profile(&profile)?;
                println!("Profile updated: {}", profile.display_name);
            }
        },

        Commands::Peers { action } => match action {
            PeersAction::List => {
                let peers = engine.registry().list()?;
                if peers.is_empty() {
                    println!("No peers met yet.");
                } else {
                    println!("Peers ({}):", peers.len());
                    println!();
                    for peer in peers {
                        let name = peer.display_name.as_deref().unwrap_or("(unnamed)");
                        println!("  {} {} [{}]", peer.peer_id, name, peer.trust);
                        println!(
                            "    Last seen: {}  Contacts: {}",
                            format_millis(peer.last_seen_at),
                            peer.contact_count
                        );
                    }
                }
            }

            PeersAction::Verify { did } => {
                let record = engine.verify_peer(&parse_did(&did)?)?;
                println!("Verified {}", record.peer_id);
                println!("  Trusted fields will be shared from now on.");
            }

            PeersAction::Forget { did } => {
                let did = parse_did(&did)?;
                if engine.forget_peer(&did)? {
                    println!("Forgot {}", did);
                } else {
                    println!("Peer {} was not known.", did);
                }
            }
        },

        Commands::Bundles { action } => match action {
            BundlesAction::List => {
                let bundles = engine.router().bundles();
                if bundles.is_empty() {
                    println!("No bundles stored.");
                } else {
                    println!("Bundles ({}):", bundles.len());
                    println!();
                    for bundle in bundles {
                        let destination = bundle
                            .destination
                            .as_ref()
                            .map(|d| d.short().to_string())
                            .unwrap_or_else(|| "broadcast".to_string());
                        println!(
                            "  {} [{}] -> {}  hops {}/{}  expires {}",
                            bundle.id,
                            bundle.priority,
                            destination,
                            bundle.hop_count,
                            bundle.max_hops,
                            format_millis(bundle.expires_at)
                        );
                    }
                }
            }

            BundlesAction::Expire => {
                let purged = engine.router().expire()?;
                println!("Expired {} bundle(s).", purged);
            }
        },

        Commands::Serve { peers } => {
            serve(&engine, &config.node.data_dir, peers, &config).await?;
        }
    }

    Ok(())
}

async fn serve(
    engine: &MeshEngine,
    data_dir: &Path,
    peers: Vec<String>,
    config: &EngineConfig,
) -> Result<()> {
    println!("Starting meshsync node...");
    println!();
    println!("Identity:");
    println!("  DID: {}", engine.peer_id());
    println!();

    let mut static_peers = Vec::new();
    for peer in config.discovery.static_peers.iter().chain(peers.iter()) {
        static_peers.push(IrohBearer::parse_peer(peer)?);
    }
    let secret = engine.storage().load_or_create_endpoint_key()?;
    let bearer = IrohBearer::bind(secret, static_peers).await?;
    info!(endpoint = %bearer.endpoint_id(), "Local network bearer bound");
    println!("Local network:");
    println!("  Endpoint: {}", bearer.endpoint_id());
    println!();

    engine.add_bearer(Arc::new(bearer));
    engine.start()?;

    println!("Data directory: {}", data_dir.join(DATABASE_FILE).display());
    println!();
    println!("Node is running. Press Ctrl+C to stop.");
    println!();

    let mut events = engine.subscribe();
    let status_interval = Duration::from_secs(60);
    let mut status = tokio::time::interval(status_interval);
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("[Events] {} event(s) skipped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = status.tick() => {
                let info = engine.node_info()?;
                println!(
                    "[Status] clock {}, {} bundle(s), {} peer(s)",
                    info.clock, info.stored_bundles, info.known_peers
                );
            }
        }
    }

    println!("Shutting down...");
    engine.shutdown().await;
    info!("Node stopped");
    println!("Goodbye.");
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::PeerAuthenticated {
            peer,
            bearer,
            first_contact,
        } => {
            let note = if *first_contact { " (first contact)" } else { "" };
            println!("[Peer] {} authenticated over {}{}", peer.short(), bearer, note);
        }
        SyncEvent::UntrustedPeer { address, reason } => {
            println!("[Peer] rejected {}: {}", address, reason);
        }
        SyncEvent::SyncCompleted {
            peer,
            sent_changes,
            received_changes,
            snapshot,
        } => {
            let mode = if *snapshot { "snapshot" } else { "incremental" };
            println!(
                "[Sync] {} done ({}): sent {}, received {}",
                peer.short(),
                mode,
                sent_changes,
                received_changes
            );
        }
        SyncEvent::SessionTimedOut { address, .. } => {
            println!("[Sync] session with {} timed out", address);
        }
        SyncEvent::BundleDelivered { id, origin } => {
            println!("[Bundle] {} from {} delivered", id, origin.short());
        }
        SyncEvent::DecodeFailure { reason, .. } => {
            println!("[Sync] discarded unit: {}", reason);
        }
        SyncEvent::PeerDiscovered { .. } | SyncEvent::SessionStateChanged { .. } => {}
    }
}
