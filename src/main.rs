mod server;

use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use cliproxy_warden::{
    KeyStore, LocatorOverrides, Monitor, MonitorOptions, SearchRoots, UsageClient, compact_count,
    config::{self, ENV_BASE_URL, ENV_CONFIG_PATH, ENV_MANAGEMENT_KEY},
    generate_key, mask_key, service,
};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Supervisor for a local CLIProxyAPI instance")]
struct Cli {
    /// Explicit config.yaml path, tried before the conventional locations.
    #[arg(long, global = true, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// Management API base URL; skips config file discovery entirely.
    #[arg(long, global = true, env = ENV_BASE_URL)]
    base_url: Option<String>,

    /// Management key; takes precedence over the secret in config.yaml.
    #[arg(long, global = true, env = ENV_MANAGEMENT_KEY, hide_env_values = true)]
    management_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the resolved connection settings and whether the proxy is running.
    Status,
    /// Launch the proxy binary next to config.yaml.
    Start,
    /// Stop the proxy listening on the configured port.
    Stop,
    /// Fetch and print the usage summary from the management API.
    Usage {
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Manage the api-keys list in config.yaml.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Run the supervision loop with a local HTTP dashboard API.
    Serve(ServeArgs),
}

#[derive(Debug, Subcommand)]
enum KeysCommand {
    /// List keys with their notes and state.
    List {
        /// Show full keys instead of masked ones.
        #[arg(long)]
        reveal: bool,
    },
    /// Add a key.
    Add { key: String },
    /// Generate and add a random `sk-` key.
    Generate,
    /// Remove a key.
    Remove { key: String },
    /// Set or clear the note attached to a key.
    Note {
        key: String,
        #[arg(default_value = "")]
        note: String,
    },
    /// Re-enable a disabled key.
    Enable { key: String },
    /// Disable a key without removing it.
    Disable { key: String },
}

#[derive(Debug, Parser)]
struct ServeArgs {
    /// Address to bind the dashboard API to.
    #[arg(long, env = "WARDEN_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the dashboard API to.
    #[arg(long, env = "WARDEN_PORT", default_value_t = 8318)]
    port: u16,

    /// Start with usage monitoring paused.
    #[arg(long)]
    no_monitor: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = LocatorOverrides {
        base_url: cli.base_url,
        management_key: cli.management_key,
        config_path: cli.config,
    };
    let roots = SearchRoots::current();

    if let Err(err) = run(cli.command, overrides, roots).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(
    command: Command,
    overrides: LocatorOverrides,
    roots: SearchRoots,
) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = config::resolve(&overrides, &roots);

    match command {
        Command::Status => {
            let status = service::query_status(&resolved).await;
            match resolved.config_path.as_deref() {
                Some(path) => println!("config:   {}", path.display()),
                None => println!("config:   (not found)"),
            }
            println!("base url: {}", resolved.base_url);
            println!("service:  {}", status.summary_line());
        }
        Command::Start => {
            let status = service::start(&resolved).await?;
            println!("local service {}", status.summary_line());
        }
        Command::Stop => {
            service::stop(&resolved).await;
            let status = service::query_status(&resolved).await;
            println!("local service {}", status.summary_line());
        }
        Command::Usage { json } => {
            let client = UsageClient::new()?;
            let summary = client
                .fetch_usage_summary(&resolved.base_url, &resolved.management_key)
                .await
                .map_err(|err| {
                    tracing::debug!(error = %err, "usage fetch failed");
                    err.friendly_message(&resolved.management_key)
                })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "requests: {}  tokens: {}",
                    compact_count(summary.display_requests()),
                    compact_count(summary.display_tokens())
                );
                for usage in &summary.key_usages {
                    println!(
                        "  {:<16} {:>8} ({:.1}%)",
                        usage.label,
                        compact_count(usage.total_requests),
                        summary.share_percent(usage.total_requests)
                    );
                    for call in &usage.model_calls {
                        println!("      {:<40} {}", call.model, call.requests);
                    }
                }
            }
        }
        Command::Keys(action) => run_keys(action, resolved.config_path)?,
        Command::Serve(args) => {
            let mut options = MonitorOptions::new(overrides, roots);
            options.monitor_enabled = !args.no_monitor;
            let monitor = Monitor::spawn(options, UsageClient::new()?);
            let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
            server::serve(addr, monitor).await?;
        }
    }

    Ok(())
}

fn run_keys(
    action: KeysCommand,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = KeyStore::open(config_path.as_deref())?;

    match action {
        KeysCommand::List { reveal } => {
            for record in store.load_entries()? {
                let shown = if reveal {
                    record.key.clone()
                } else {
                    record.masked()
                };
                let state = if record.enabled { "enabled" } else { "disabled" };
                if record.note.is_empty() {
                    println!("{shown}  [{state}]");
                } else {
                    println!("{shown}  [{state}]  {}", record.note);
                }
            }
        }
        KeysCommand::Add { key } => {
            let key = store.add_key(&key)?;
            println!("added {}", mask_key(&key));
        }
        KeysCommand::Generate => {
            let key = store.add_key(&generate_key())?;
            println!("{key}");
        }
        KeysCommand::Remove { key } => report_change(store.remove_key(&key)?, "removed", &key),
        KeysCommand::Note { key, note } => {
            report_change(store.update_note(&key, &note)?, "updated note for", &key)
        }
        KeysCommand::Enable { key } => report_change(store.set_enabled(&key, true)?, "enabled", &key),
        KeysCommand::Disable { key } => {
            report_change(store.set_enabled(&key, false)?, "disabled", &key)
        }
    }

    Ok(())
}

fn report_change(changed: bool, verb: &str, key: &str) {
    if changed {
        println!("{verb} {}", mask_key(key));
    } else {
        println!("no change for {}", mask_key(key));
    }
}
