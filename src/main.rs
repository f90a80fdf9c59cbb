use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use manifest_log::api::{self, middleware::SecurityConfig};
use manifest_log::client::ManifestClient;
use manifest_log::db;
use manifest_log::models::*;
use manifest_log::render;

const DEFAULT_PORT: u16 = 17010;

#[derive(Parser)]
#[command(name = "mlog")]
#[command(about = "Versioned component manifests with forks and live followers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// List manifests
    List,
    /// Create a manifest with an empty first release
    Create { name: String },
    /// Show a release as a tree (latest unless --version is given)
    Show {
        id: Uuid,
        #[arg(short, long)]
        version: Option<u32>,
    },
    /// Show the release history of a manifest
    Log { id: Uuid },
    /// Release components given as a JSON object
    Release {
        id: Uuid,
        components: String,
        /// Slash-separated path to merge the components at
        #[arg(short, long)]
        scope: Option<String>,
    },
    /// Copy the latest release into a new independent manifest
    Fork { id: Uuid, name: String },
    /// Create a manifest that follows another one
    Follow {
        id: Uuid,
        name: String,
        /// JSON object of keys that always win over the source
        #[arg(short = 'o', long = "override")]
        follower_override: Option<String>,
    },
    /// Replace a follower's override (`{}` clears it)
    Override { id: Uuid, follower_override: String },
    /// List the followers of a manifest
    Followers { id: Uuid },
    /// Stop following the source manifest
    Unfollow { id: Uuid },
    /// Re-evaluate a follower against its source
    Sync { id: Uuid },
    /// Delete a manifest and its releases
    Delete { id: Uuid },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "manifest_log=debug,tower_http=debug".into()),
    );

    // Logs go to stderr so command output on stdout stays clean
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_tree(json: &str) -> anyhow::Result<ComponentTree> {
    serde_json::from_str(json).context("Components must be a JSON object")
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_outcome(outcome: &ReleaseOutcome) {
    if outcome.created {
        println!("Cut release v{}", outcome.release.version);
    } else {
        println!("No changes, latest is v{}", outcome.release.version);
    }
    for p in &outcome.propagation {
        match &p.outcome {
            FollowerOutcome::Released { version } => {
                println!("  {} -> v{}", p.follower_id, version)
            }
            FollowerOutcome::Unchanged => println!("  {} unchanged", p.follower_id),
            FollowerOutcome::Failed { error } => println!("  {} failed: {}", p.follower_id, error),
        }
    }
}

async fn serve(port: u16) -> anyhow::Result<()> {
    tracing::info!("Starting manifest-log server on port {}", port);

    let db = db::Database::open_default()?;
    db.migrate()?;

    let app = api::create_router_with_security(db, SecurityConfig::from_env());

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("manifest-log listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let command = cli.command.unwrap_or(Commands::Serve { port: DEFAULT_PORT });
    let client = ManifestClient::from_env();
    if !matches!(command, Commands::Serve { .. }) {
        tracing::debug!("Using API at {}", client.base_url());
    }

    match command {
        Commands::Serve { port } => serve(port).await?,
        Commands::List => {
            for manifest in client.list_manifests().await? {
                match manifest.follows {
                    Some(source) => println!("{}  {}  (follows {})", manifest.id, manifest.name, source),
                    None => println!("{}  {}", manifest.id, manifest.name),
                }
            }
        }
        Commands::Create { name } => {
            let created = client
                .create_manifest(&CreateManifestInput::named(name))
                .await?;
            print_json(&created)?;
        }
        Commands::Show { id, version } => {
            let manifest = client.get_manifest(id).await?;
            let release = match version {
                Some(v) => client.get_release(id, v).await?,
                None => manifest
                    .latest()
                    .cloned()
                    .context("Manifest has no releases")?,
            };
            print!("{}", render::render_release(&manifest.manifest, &release));
        }
        Commands::Log { id } => {
            let manifest = client.get_manifest(id).await?;
            print!("{}", render::render_log(&manifest.releases));
        }
        Commands::Release {
            id,
            components,
            scope,
        } => {
            let input = ReleaseInput {
                components: parse_tree(&components)?,
                scope,
            };
            print_outcome(&client.release(id, &input).await?);
        }
        Commands::Fork { id, name } => {
            let forked = client.fork(id, &CreateManifestInput::named(name)).await?;
            print_json(&forked)?;
        }
        Commands::Follow {
            id,
            name,
            follower_override,
        } => {
            let input = CreateManifestInput {
                name,
                follower_override: follower_override.as_deref().map(parse_tree).transpose()?,
            };
            print_json(&client.add_follower(id, &input).await?)?;
        }
        Commands::Override {
            id,
            follower_override,
        } => {
            let input = UpdateManifestInput {
                name: None,
                follower_override: Some(parse_tree(&follower_override)?),
            };
            print_json(&client.update_manifest(id, &input).await?)?;
        }
        Commands::Followers { id } => {
            for follower in client.list_followers(id).await? {
                println!("{}  {}", follower.id, follower.name);
            }
        }
        Commands::Unfollow { id } => {
            print_json(&client.unfollow(id).await?)?;
        }
        Commands::Sync { id } => {
            print_outcome(&client.sync_follower(id).await?);
        }
        Commands::Delete { id } => {
            client.delete_manifest(id).await?;
            println!("Deleted {}", id);
        }
    }

    Ok(())
}
