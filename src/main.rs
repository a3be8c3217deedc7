//! Xenray CLI
//!
//! Command-line front end for the xenray proxy controller.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use xenray::model::{CurrentConnection, Profile, ProfileConfig, ReconnectEvent, ServerConfig};
use xenray::reconnect::{
    AutoReconnectService, EventSink, TcpConnectionTester, TcpNetworkValidator,
};
use xenray::{config, link, process, validate, ConfigStore, Error, Result, XrayManager};

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);
const ADOPTED_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Xenray - configure and supervise a local xray backend
#[derive(Parser)]
#[command(name = "xenray")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration directory (defaults to the per-user config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the backend for the active server and supervise it
    Start {
        /// Path to the backend binary, overriding discovery
        #[arg(long)]
        binary: Option<PathBuf>,
    },

    /// Stop a running backend
    Stop,

    /// Restart the backend for the active server
    Restart {
        #[arg(long)]
        binary: Option<PathBuf>,
    },

    /// Show backend status
    Status,

    /// Manage persisted server entries
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Inspect, import and export backend configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// List stored servers
    List,

    /// Add a server entry
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: i64,
        #[arg(long, default_value = "vless")]
        protocol: String,
        #[arg(long)]
        uuid: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        network: Option<String>,
        #[arg(long)]
        tls: Option<String>,
        #[arg(long)]
        sni: Option<String>,
    },

    /// Remove a server entry
    Remove { id: String },

    /// Select the active server
    Set { id: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the generated backend config for the active server
    Show,

    /// Import share links from an argument or a file of links
    Import { source: String },

    /// Export the generated backend config
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Yaml,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("command failed: {e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let store = match &cli.config_dir {
        Some(dir) => ConfigStore::with_dir(dir)?,
        None => ConfigStore::new()?,
    };

    match cli.command {
        Commands::Start { binary } => cmd_start(store, binary),
        Commands::Stop => cmd_stop(),
        Commands::Restart { binary } => {
            cmd_stop()?;
            cmd_start(store, binary)
        }
        Commands::Status => cmd_status(),
        Commands::Server { command } => match command {
            ServerCommands::List => cmd_server_list(&store),
            ServerCommands::Add {
                id,
                name,
                address,
                port,
                protocol,
                uuid,
                password,
                network,
                tls,
                sni,
            } => cmd_server_add(
                &store, id, name, address, port, protocol, uuid, password, network, tls, sni,
            ),
            ServerCommands::Remove { id } => cmd_server_remove(&store, &id),
            ServerCommands::Set { id } => store.set_last_selected_profile(&id),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd_config_export(&store, ExportFormat::Json, None),
            ConfigCommands::Import { source } => cmd_config_import(&store, &source),
            ConfigCommands::Export { format, output } => {
                cmd_config_export(&store, format, output)
            }
        },
    }
}

/// Emits reconnect events as log lines; the CLI has no richer surface.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &ReconnectEvent) -> Result<()> {
        info!(?event, "reconnect event");
        Ok(())
    }
}

fn cmd_start(store: ConfigStore, binary: Option<PathBuf>) -> Result<()> {
    let mut manager = XrayManager::new(store.clone());
    if let Some(binary) = binary {
        manager = manager.binary(binary);
    }

    if !manager.start(None)? {
        return Err(Error::Process(
            "backend failed to start or is already running".to_string(),
        ));
    }
    let status = manager.get_status();
    println!(
        "backend running (pid {})",
        status.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
    );
    supervise(&store, &manager)
}

/// Foreground supervision: poll the child and, when auto-reconnect is
/// enabled, run the recovery flow on unexpected exits.
fn supervise(store: &ConfigStore, manager: &XrayManager) -> Result<()> {
    let reconnect = AutoReconnectService::new(
        Box::new(TcpNetworkValidator::default()),
        Box::new(TcpConnectionTester::default()),
        Box::new(LogSink),
    );

    let mut last_config_path: Option<PathBuf> = None;
    loop {
        std::thread::sleep(MONITOR_INTERVAL);
        let status = manager.get_status();
        if status.running {
            // Remember the config file while it still exists; by the time
            // an exit is observed the supervisor has already removed it.
            last_config_path = status.config_path.clone().map(PathBuf::from);
            continue;
        }
        if !store.auto_reconnect_enabled() {
            return Err(Error::Process(format!(
                "backend exited (code {:?})",
                status.last_exit
            )));
        }

        warn!(code = ?status.last_exit, "backend exited, attempting recovery");
        if !recover(store, manager, &reconnect, last_config_path.take()) {
            return Err(Error::Process(
                "backend exited and recovery failed".to_string(),
            ));
        }
    }
}

/// One recovery pass for an observed backend exit. The connection is named
/// by the config file that was live before the exit; reconnecting restarts
/// the backend from the persisted selection.
fn recover(
    store: &ConfigStore,
    manager: &XrayManager,
    reconnect: &AutoReconnectService,
    config_path: Option<PathBuf>,
) -> bool {
    let current = CurrentConnection {
        file_path: config_path,
        mode: Some(store.connection_mode()),
    };
    reconnect.handle_failure(
        &current,
        |path| {
            std::fs::read_to_string(path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
        },
        |_, _| manager.start(None).unwrap_or(false),
    )
}

fn cmd_stop() -> Result<()> {
    let pids = process::find_backend_pids();
    if pids.is_empty() {
        println!("backend not running");
        return Ok(());
    }
    for pid in pids {
        if process::terminate_backend(pid, ADOPTED_STOP_TIMEOUT) {
            println!("stopped backend (pid {pid})");
        } else {
            return Err(Error::Process(format!("failed to stop backend pid {pid}")));
        }
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let pids = process::find_backend_pids();
    if pids.is_empty() {
        println!("backend: stopped");
    } else {
        for pid in pids {
            println!("backend: running (pid {pid})");
        }
    }
    Ok(())
}

fn cmd_server_list(store: &ConfigStore) -> Result<()> {
    let selected = store.last_selected_profile();
    for profile in store.list_profiles() {
        let marker = if selected.as_deref() == Some(profile.id.as_str()) {
            "*"
        } else {
            " "
        };
        match profile.config.selected_outbound() {
            Some(server) => println!(
                "{marker} {}  {}  {}://{}:{}",
                profile.id, profile.name, server.protocol, server.address, server.port
            ),
            None => println!("{marker} {}  {}  (no outbound)", profile.id, profile.name),
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_server_add(
    store: &ConfigStore,
    id: String,
    name: String,
    address: String,
    port: i64,
    protocol: String,
    uuid: Option<String>,
    password: Option<String>,
    network: Option<String>,
    tls: Option<String>,
    sni: Option<String>,
) -> Result<()> {
    let port = validate::port(port)?;
    let mut server = ServerConfig::new(&protocol, &address, port);
    server.uuid = uuid;
    server.password = password;
    server.sni = sni;
    if let Some(network) = network {
        server.network = network;
    }
    if let Some(tls) = tls {
        server.tls = tls;
    }

    let saved = store.save_profile(Profile {
        id,
        name,
        config: ProfileConfig {
            outbounds: vec![server],
            ..ProfileConfig::default()
        },
        created_at: 0,
    })?;
    if store.last_selected_profile().is_none() {
        store.set_last_selected_profile(&saved.id)?;
    }
    println!("added server {}", saved.id);
    Ok(())
}

fn cmd_server_remove(store: &ConfigStore, id: &str) -> Result<()> {
    if !store.delete_profile(id)? {
        return Err(Error::NotFound("profile"));
    }
    println!("removed server {id}");
    Ok(())
}

fn cmd_config_import(store: &ConfigStore, source: &str) -> Result<()> {
    let path = PathBuf::from(source);
    let (profiles, errors) = if path.is_file() {
        let body = std::fs::read_to_string(&path)?;
        link::parse_list(&body)
    } else {
        (vec![link::parse(source)?], Vec::new())
    };

    if profiles.is_empty() {
        return Err(Error::Link("no importable links found".to_string()));
    }
    let mut added = 0;
    for profile in profiles {
        let saved = store.save_profile(profile)?;
        if store.last_selected_profile().is_none() {
            store.set_last_selected_profile(&saved.id)?;
        }
        added += 1;
    }
    for message in &errors {
        warn!(%message, "skipped share link");
    }
    println!("imported {added} server(s), {} skipped", errors.len());
    Ok(())
}

fn cmd_config_export(
    store: &ConfigStore,
    format: ExportFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let server = store.active_server().ok_or(Error::NotFound("server"))?;
    let wire_config = config::build(&server, &store.inbound_settings(), &store.build_options())?;

    let rendered = match format {
        ExportFormat::Json => serde_json::to_string_pretty(&wire_config)?,
        ExportFormat::Yaml => render_yaml(&wire_config)?,
    };
    match output {
        Some(path) => std::fs::write(path, rendered)?,
        None => println!("{rendered}"),
    }
    Ok(())
}

fn render_yaml(value: &Value) -> Result<String> {
    serde_yml::to_string(value).map_err(|e| Error::Validation(format!("yaml render: {e}")))
}
