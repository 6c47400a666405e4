//! Command-line interface for DevHub.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devhub_core::{DeviceType, Protocol};
use devhub_devices::{AdapterManager, AdapterRegistry, available_adapters};
use devhub_integration::{
    ChannelBroadcaster, DEFAULT_CONFIG_PATH, DeviceIntegrationService, DeviceRegistration,
    HubConfig, InMemoryDeviceStore,
};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Owner id for devices the CLI registers on its own behalf.
const CLI_USER: &str = "cli";

/// DevHub - IoT device protocol hub.
#[derive(Parser, Debug)]
#[command(name = "devhub")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the hub until Ctrl-C, logging device updates.
    Run,
    /// Discover devices and print them as JSON.
    Discover {
        /// Only query this protocol.
        #[arg(long)]
        protocol: Option<Protocol>,
        /// Only report this device type.
        #[arg(long)]
        device_type: Option<DeviceType>,
    },
    /// Query a device's current status.
    Status {
        /// Device id.
        device_id: String,
    },
    /// Send a command to a device.
    Command {
        /// Device id.
        device_id: String,
        /// Command name, e.g. `turn_on`.
        name: String,
        /// Command parameters as a JSON object.
        #[arg(long)]
        params: Option<String>,
    },
    /// Validate the configuration file.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = HubConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Command::CheckConfig => check_config(&config),
        Command::Run => run(config).await,
        Command::Discover {
            protocol,
            device_type,
        } => discover(config, protocol, device_type).await,
        Command::Status { device_id } => status(config, &device_id).await,
        Command::Command {
            device_id,
            name,
            params,
        } => command(config, &device_id, &name, params.as_deref()).await,
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var("DEVHUB_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directive = if verbose { "devhub=debug" } else { "devhub=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .init();
    }
}

struct Hub {
    manager: Arc<AdapterManager>,
    service: Arc<DeviceIntegrationService>,
    broadcaster: ChannelBroadcaster,
}

impl Hub {
    async fn start(config: HubConfig) -> Result<Self> {
        let broadcaster = ChannelBroadcaster::new(config.integration.broadcast_capacity);
        let manager = Arc::new(AdapterManager::new(
            config.adapters,
            config.manager,
            AdapterRegistry::with_defaults(),
        ));
        let running = manager
            .initialize()
            .await
            .context("initializing adapters")?;
        if running == 0 {
            warn!("no adapter is running; check credentials and enabled protocols");
        }

        let service = Arc::new(DeviceIntegrationService::new(
            manager.clone(),
            Arc::new(InMemoryDeviceStore::new()),
            Arc::new(broadcaster.clone()),
            config.integration,
        ));
        service.start().await;

        Ok(Self {
            manager,
            service,
            broadcaster,
        })
    }

    /// Register a discovered device under the CLI user.
    async fn claim(&self, device_id: &str) -> Result<()> {
        let entry = self
            .manager
            .device_entry(device_id)
            .with_context(|| format!("device {} was not discovered", device_id))?;
        self.service
            .add_device(CLI_USER, DeviceRegistration::new(device_id, entry.protocol))
            .await?;
        Ok(())
    }

    async fn stop(self) {
        self.service.shutdown();
        for (protocol, error) in self.manager.shutdown().await {
            warn!(protocol = %protocol, error = %error, "adapter did not disconnect cleanly");
        }
    }
}

fn check_config(config: &HubConfig) -> Result<()> {
    let compiled = available_adapters();
    for adapter in config.enabled_adapters() {
        if !compiled.contains(&adapter.protocol.as_str()) {
            anyhow::bail!(
                "adapter {} is enabled but not available in this build (available: {:?})",
                adapter.protocol,
                compiled
            );
        }
    }
    println!(
        "Configuration OK: {} adapter(s) enabled",
        config.enabled_adapters().count()
    );
    Ok(())
}

async fn run(config: HubConfig) -> Result<()> {
    let hub = Hub::start(config).await?;
    for (device_id, _) in hub.manager.routed_devices() {
        if let Err(e) = hub.claim(&device_id).await {
            warn!(device_id = %device_id, error = %e, "device not registered");
        }
    }

    let mut updates = hub.broadcaster.subscribe();
    info!(
        devices = hub.manager.routed_devices().len(),
        "hub running, press Ctrl-C to stop"
    );
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => info!(
                    device_id = %update.device_id,
                    status = %update.status,
                    state = %serde_json::Value::Object(update.state),
                    "device update"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "update stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    hub.stop().await;
    Ok(())
}

async fn discover(
    config: HubConfig,
    protocol: Option<Protocol>,
    device_type: Option<DeviceType>,
) -> Result<()> {
    let hub = Hub::start(config).await?;
    let result = hub.service.discover_devices(protocol, device_type).await;
    hub.stop().await;

    let devices = result?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn status(config: HubConfig, device_id: &str) -> Result<()> {
    let hub = Hub::start(config).await?;
    let result = match hub.claim(device_id).await {
        Ok(()) => Ok(hub.service.get_device_status(device_id, CLI_USER, true).await),
        Err(e) => Err(e),
    };
    hub.stop().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn command(
    config: HubConfig,
    device_id: &str,
    name: &str,
    params: Option<&str>,
) -> Result<()> {
    let params: Map<String, Value> = match params {
        Some(raw) => serde_json::from_str(raw).context("--params must be a JSON object")?,
        None => Map::new(),
    };

    let hub = Hub::start(config).await?;
    let result = match hub.claim(device_id).await {
        Ok(()) => Ok(hub
            .service
            .execute_device_command(device_id, CLI_USER, name, params)
            .await),
        Err(e) => Err(e),
    };
    hub.stop().await;

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        anyhow::bail!(
            "command failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
