//! WolfSync - Render Cluster Frame Synchronization
//!
//! Runs a headless render node that drives the cluster frame loop, and
//! helpers for writing and checking cluster configuration files.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::cluster::{ClusterCoordinator, ClusterObserver};
use wolfsync::config::{ClusterConfig, LoggingConfig};
use wolfsync::network::TcpTransport;
use wolfsync::protocol::ServiceKind;
use wolfsync::sync::{ClusterEventJson, ClusterEventListener, TimeData};

/// WolfSync - Render Cluster Frame Synchronization
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, json), overrides the config file
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a headless render node
    Start {
        /// This node's id in the configuration
        #[arg(long)]
        node_id: String,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Target frame duration in milliseconds
        #[arg(long, default_value = "16")]
        frame_ms: u64,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,
    },

    /// Show cluster topology as JSON
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut logging = ClusterConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    init_logging(&logging);

    match cli.command {
        Commands::Start {
            node_id,
            frames,
            frame_ms,
        } => run_start(cli.config, node_id, frames, frame_ms),
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output } => run_init(output),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Logs topology changes seen by this node
struct LogObserver;

impl ClusterObserver for LogObserver {
    fn on_node_failed(&self, node_id: &str) {
        tracing::warn!("Cluster lost node {}", node_id);
    }

    fn on_primary_changed(&self, primary_node_id: &str) {
        tracing::warn!("Cluster primary is now {}", primary_node_id);
    }
}

/// Logs replicated events
struct LogListener;

impl ClusterEventListener for LogListener {
    fn on_cluster_event_json(&self, event: &ClusterEventJson) {
        tracing::info!(
            "Cluster event {}/{}/{}",
            event.category,
            event.event_type,
            event.name
        );
    }
}

/// Start a render node and drive frames until Ctrl+C or the frame limit
fn run_start(
    config_path: PathBuf,
    node_id: String,
    frames: Option<u64>,
    frame_ms: u64,
) -> anyhow::Result<()> {
    tracing::info!("Starting WolfSync node {}...", node_id);

    let config = match ClusterConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e.into());
        }
    };

    let transport = TcpTransport::new(
        Duration::from_millis(config.network.connect_timeout_ms),
        Duration::from_millis(config.network.request_timeout_ms),
    )?;
    let coordinator = ClusterCoordinator::new(Arc::new(transport));
    coordinator.start_session(config, &node_id)?;
    coordinator.add_observer(Arc::new(LogObserver));
    coordinator.add_event_listener(Arc::new(LogListener));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let result = run_frames(&coordinator, &running, frames, Duration::from_millis(frame_ms));
    coordinator.end_session();

    if let Err(e) = &result {
        tracing::error!("Frame loop stopped: {}", e);
    }
    result.map_err(Into::into)
}

fn run_frames(
    coordinator: &ClusterCoordinator,
    running: &AtomicBool,
    frames: Option<u64>,
    frame_duration: Duration,
) -> wolfsync::Result<()> {
    coordinator.wait_for_game_start()?;
    tracing::info!(
        "Game started on {} as {} (services: {:?})",
        coordinator.node_id(),
        coordinator.role(),
        coordinator.local_service_address(ServiceKind::ClusterSync)
    );

    let started = Instant::now();
    let mut last = started;
    let mut frame = 0u64;

    while running.load(Ordering::SeqCst) && frames.map_or(true, |limit| frame < limit) {
        frame += 1;
        let now = Instant::now();
        let delta = now.duration_since(last).as_secs_f64();
        last = now;

        coordinator.start_frame(frame)?;
        coordinator.cache_time_data(TimeData::new(delta, now.duration_since(started).as_secs_f64()))?;
        let time = coordinator.sync_time_data()?;

        coordinator.pre_tick(time.delta_seconds)?;
        coordinator.tick(time.delta_seconds)?;
        coordinator.post_tick(time.delta_seconds)?;
        coordinator.end_frame(frame)?;
        coordinator.synchronize_on_render_barrier()?;

        if frame % 600 == 0 {
            tracing::info!(
                "Frame {} at game time {:.2}s, {} active node(s)",
                frame,
                time.game_time,
                coordinator.active_nodes().len()
            );
        }

        let elapsed = now.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    tracing::info!("Stopped after {} frame(s)", frame);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match ClusterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Primary:        {}", config.primary_node_id);
            println!("  Mode:           {}", config.operation_mode);
            println!("  Nodes:          {}", config.nodes.len());
            println!("  Failover:       {}", config.effective_failover_policy());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Write a sample three node configuration
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    let content = toml::to_string_pretty(&ClusterConfig::sample())?;
    let content = format!("# WolfSync Configuration\n# Generated configuration file\n\n{}", content);

    std::fs::write(&output, content)?;
    println!("Created configuration file: {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the node list and hosts for your cluster");
    println!("  2. Copy the file to every render node");
    println!("  3. Start each node with: wolfsync start --node-id <id>");
    Ok(())
}

/// Show topology and service addresses
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = ClusterConfig::from_file(&config_path)?;

    let nodes: Vec<serde_json::Value> = config
        .nodes
        .iter()
        .map(|node| {
            let services: serde_json::Map<String, serde_json::Value> = ServiceKind::ALL
                .iter()
                .filter_map(|&service| {
                    config
                        .service_address(&node.id, service)
                        .map(|address| (service.name().to_string(), address.into()))
                })
                .collect();

            serde_json::json!({
                "id": node.id,
                "host": node.host,
                "primary": node.id == config.primary_node_id,
                "services": services,
            })
        })
        .collect();

    let info = serde_json::json!({
        "primary_node_id": config.primary_node_id,
        "operation_mode": config.operation_mode,
        "failover_policy": config.effective_failover_policy(),
        "nodes": nodes,
    });

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
