//! taskdeck-sync - self-hosted sync for the Taskdeck task manager
//!
//! One binary, two roles: `serve` runs the coordination service that owns the
//! merged todo list; `sync`/`daemon` run a device cycle against a local
//! Taskdeck board.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use taskdeck_sync::client::host::JsonFileHost;
use taskdeck_sync::client::transport::{HttpTransport, Transport};
use taskdeck_sync::client::{CycleOutcome, SyncEngine};
use taskdeck_sync::config::Config;
use taskdeck_sync::server::store::Database;
use taskdeck_sync::server::{api, auth};

#[derive(Parser)]
#[command(name = "taskdeck-sync")]
#[command(about = "Self-hosted sync for the Taskdeck task manager")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync service
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run one device sync cycle
    Sync {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run device sync cycles on a timer
    Daemon {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Seconds between cycles (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Issue a new API token (creates a user on the service database)
    Token {
        /// Name/label for the device or person
        #[arg(short, long)]
        name: Option<String>,

        /// List all users
        #[arg(long)]
        list: bool,

        /// Revoke a token by user name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path (for the database location)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete every synced todo on the service (destructive)
    Reset {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Inspect the device snapshot for mapping anomalies
    Diagnose {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("taskdeck_sync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = load_config(config)?;

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            tokio::runtime::Runtime::new()
                .context("Failed to start async runtime")?
                .block_on(run_server(cfg))
        }

        Commands::Sync { config } => {
            let cfg = load_config(config)?;
            let mut engine = build_engine(&cfg)?;
            run_once(&mut engine)
        }

        Commands::Daemon { config, interval } => {
            let cfg = load_config(config)?;
            let secs = interval.unwrap_or_else(|| {
                cfg.client.as_ref().map(|c| c.interval_secs).unwrap_or(30)
            });
            let mut engine = build_engine(&cfg)?;
            run_daemon(&mut engine, Duration::from_secs(secs))
        }

        Commands::Token {
            name,
            list,
            revoke,
            config,
        } => {
            let cfg = load_config(config)?;
            let db = Database::open(&cfg.database.path).context("Failed to open database")?;

            if list {
                let users = db.list_users()?;
                if users.is_empty() {
                    println!("No users configured.");
                    println!("Issue a token with: taskdeck-sync token --name <device-name>");
                } else {
                    println!("Configured users:");
                    println!();
                    for user in users {
                        // Show truncated hash (first 20 chars)
                        let hash_preview = if user.token_hash.len() > 20 {
                            format!("{}...", &user.token_hash[..20])
                        } else {
                            user.token_hash.clone()
                        };
                        println!("  {} ({}) - {}", user.name, user.id, hash_preview);
                    }
                }
                return Ok(());
            }

            if let Some(user_name) = revoke {
                if db.remove_user(&user_name)? {
                    println!("Revoked token for '{}'.", user_name);
                } else {
                    println!("User '{}' not found.", user_name);
                }
                return Ok(());
            }

            let label = name.unwrap_or_else(|| "default".to_string());
            if db.list_users()?.iter().any(|u| u.name == label) {
                println!(
                    "User '{}' already exists. Use --revoke first to replace it.",
                    label
                );
                return Ok(());
            }

            let token = auth::generate_token();
            let token_hash = auth::hash_token(&token)?;
            let user_id = format!("user-{}", Uuid::new_v4());
            db.create_user(&user_id, &label, &token_hash)?;

            println!("✅ Issued API token for '{}'\n", label);
            println!("Token: {}\n", token);
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("On the device, add to config.toml:\n");
            println!("  [client]");
            println!("  server_url = \"http://YOUR_SERVER_IP:{}\"", cfg.server.port);
            println!("  token = \"{}\"", token);
            println!("  host_file = \"/path/to/taskdeck/board.json\"");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("⚠️  Save this token now - it cannot be retrieved later!");

            Ok(())
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Start the service: taskdeck-sync serve --config {}", path.display());
            println!("  2. Issue a device token: taskdeck-sync token --name my-device");
            println!("  3. On each device, fill in the [client] section and run: taskdeck-sync sync");

            Ok(())
        }

        Commands::Reset { config, yes } => {
            let cfg = load_config(config)?;
            let client = cfg.client()?;
            if !yes {
                println!("This deletes every todo on {} for all devices.", client.server_url);
                println!("Re-run with --yes to confirm.");
                return Ok(());
            }
            let transport = HttpTransport::new(
                &client.server_url,
                &client.token,
                Duration::from_secs(client.http_timeout_secs),
            )?;
            let response = transport.reset()?;
            println!("Deleted {} todo(s) from the service.", response.deleted.todos);
            Ok(())
        }

        Commands::Diagnose { config } => {
            let cfg = load_config(config)?;
            diagnose(&cfg)
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn build_engine(cfg: &Config) -> Result<SyncEngine<JsonFileHost, HttpTransport>> {
    let client = cfg.client()?;
    let transport = HttpTransport::new(
        &client.server_url,
        &client.token,
        Duration::from_secs(client.http_timeout_secs),
    )?;
    let host = JsonFileHost::new(&client.host_file);
    Ok(SyncEngine::new(
        &client.state_dir,
        &client.project,
        host,
        transport,
    ))
}

fn run_once(engine: &mut SyncEngine<JsonFileHost, HttpTransport>) -> Result<()> {
    match engine.run_cycle() {
        Ok(CycleOutcome::Skipped) => {
            println!("Another sync is already running; skipped.");
            Ok(())
        }
        Ok(CycleOutcome::Completed(report)) => {
            if report.new_conflicts > 0 {
                println!(
                    "{} conflict(s) resolved (your edits were older). See conflicts.json in the state directory.",
                    report.new_conflicts
                );
            }
            println!(
                "Synced: pushed {} change(s), pulled {} change(s).",
                report.pushed_upserts + report.pushed_deletes,
                report.pulled_upserts + report.pulled_deletes
            );
            Ok(())
        }
        Err(err) if err.is_fatal() => {
            eprintln!("Sync halted: {err}");
            eprintln!("Run 'taskdeck-sync diagnose' and repair the device state before retrying.");
            bail!("sync halted");
        }
        Err(err) => Err(err).context("sync cycle failed; it will be retried on the next run"),
    }
}

fn run_daemon(
    engine: &mut SyncEngine<JsonFileHost, HttpTransport>,
    interval: Duration,
) -> Result<()> {
    tracing::info!(every = ?interval, "sync daemon started");
    match engine.transport().health() {
        Ok(health) => tracing::info!(status = %health.status, "sync service reachable"),
        Err(err) => tracing::warn!(error = %err, "sync service not reachable yet; cycles will retry"),
    }
    loop {
        match engine.run_cycle() {
            Ok(CycleOutcome::Skipped) => {}
            Ok(CycleOutcome::Completed(report)) => {
                if report.new_conflicts > 0 {
                    tracing::warn!(
                        conflicts = report.new_conflicts,
                        "conflicts resolved against this device; see conflicts.json"
                    );
                }
            }
            Err(err) if err.is_fatal() => {
                eprintln!("Sync halted: {err}");
                eprintln!("Run 'taskdeck-sync diagnose' and repair the device state before retrying.");
                bail!("sync halted");
            }
            Err(err) => {
                tracing::warn!(error = %err, "sync cycle failed; retrying next tick");
            }
        }
        std::thread::sleep(interval);
    }
}

/// List mapping candidates that explain a DuplicateMapping halt, plus any
/// dirty-set entries that point at missing records.
fn diagnose(cfg: &Config) -> Result<()> {
    use std::collections::BTreeMap;

    let client = cfg.client()?;
    let path = client.state_dir.join("state.json");
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("No snapshot at {}; this device has never synced.", path.display());
            return Ok(());
        }
        Err(err) => return Err(err).context("Failed to read snapshot"),
    };

    let doc: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(err) => {
            println!("Snapshot is not valid JSON: {err}");
            println!("Restore {} from its .bak sidecar.", path.display());
            return Ok(());
        }
    };

    let mapping = doc
        .get("serverIdToLocalId")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let todos = doc.get("todos").and_then(|v| v.as_object());

    let mut by_local: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (server_id, local_id) in &mapping {
        by_local.entry(local_id).or_default().push(server_id);
    }

    let mut findings = 0;
    for (local_id, server_ids) in &by_local {
        if server_ids.len() > 1 {
            findings += 1;
            println!(
                "DUPLICATE: local id '{}' is claimed by {} server ids: {}",
                local_id,
                server_ids.len(),
                server_ids.join(", ")
            );
        }
    }

    if let Some(todos) = todos {
        for (server_id, local_id) in &mapping {
            if !todos.contains_key(local_id) {
                findings += 1;
                println!(
                    "DANGLING: mapping {} -> {} has no snapshot record (locally deleted or stale)",
                    server_id, local_id
                );
            }
        }
        if let Some(upserted) = doc
            .pointer("/dirty/upserted")
            .and_then(|v| v.as_array())
        {
            for entry in upserted {
                let local_id = entry.as_str().unwrap_or_default();
                if !todos.contains_key(local_id) {
                    findings += 1;
                    println!("STALE DIRTY: pending upsert for missing record '{local_id}'");
                }
            }
        }
    }

    if findings == 0 {
        println!("Snapshot looks healthy: {} mapping(s), no anomalies.", mapping.len());
    } else {
        println!();
        println!("{findings} anomaly/anomalies found. Typical fixes:");
        println!("  - remove the stale side of a duplicate from serverIdToLocalId");
        println!("  - restore the snapshot from {}.bak", path.display());
    }
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let db = Database::open(&config.database.path).context("Failed to open database")?;

    let state = api::AppState::new(db);
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 taskdeck-sync service listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
