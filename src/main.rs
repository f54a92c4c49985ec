use anyhow::{Context, Result};
use clap::Parser;
use rauc_hawkbit_agent::agent::{AgentOptions, UpdateAgent};
use rauc_hawkbit_agent::bus::EventBridge;
use rauc_hawkbit_agent::config::AgentConfig;
use rauc_hawkbit_agent::ddi::DdiClient;
use rauc_hawkbit_agent::installer::{
    forward_signals, FileLock, LockKeeper, ProcessLock, RaucInstaller,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rauc-hawkbit-agent", version, about = "RAUC hawkBit DDI agent")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/rauc-hawkbit-agent.toml")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,

    /// Poll the server once and exit
    #[arg(long)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load(&args.config)?;

    // Initialize tracing
    let level = if args.debug {
        "debug"
    } else {
        config.agent.log_level.as_str()
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!("Update agent starting: {}", config.server.target_name);

    let client = DdiClient::new(&config.server)?;
    info!("  hawkBit: {}", client.base_url());
    info!("  Bundle: {}", config.agent.bundle_download_location.display());

    let connection = zbus::Connection::system()
        .await
        .context("Failed to connect to the system bus")?;
    let installer = Arc::new(RaucInstaller::connect(&connection).await?);

    // Feed RAUC signals into the bridge
    let bridge = EventBridge::new();
    let pusher = bridge.pusher();
    let bus = connection.clone();
    bridge.attach_source(tokio::spawn(async move {
        if let Err(e) = forward_signals(bus, pusher).await {
            error!("RAUC signal forwarding stopped: {:#}", e);
        }
    }));

    let lock_keeper: Arc<dyn LockKeeper> = match &config.agent.lock_file {
        Some(path) => Arc::new(FileLock::new(path)),
        None => Arc::new(ProcessLock::new()),
    };

    let post_install = config.agent.post_install_command.clone();
    let agent = Arc::new(
        UpdateAgent::new(client, installer, AgentOptions::from_config(&config))
            .with_lock_keeper(lock_keeper)
            .on_completion(move |result| on_install_completed(result, post_install.clone())),
    );
    agent.subscribe(&bridge);

    if args.run_once {
        let sleep = agent.poll_once().await?;
        info!("Server asks for the next poll in {:?}", sleep);
    } else {
        agent
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await;
    }

    bridge.shutdown();
    info!("Update agent stopped");
    Ok(())
}

/// Log the install result and run the post-install command on success
fn on_install_completed(result: i32, command: Option<Vec<String>>) {
    if result != 0 {
        error!("Installation failed with result {}", result);
        return;
    }
    info!("Installation succeeded");

    let Some(command) = command else {
        return;
    };
    tokio::spawn(async move {
        let Some((program, args)) = command.split_first() else {
            return;
        };
        info!("Running post-install command: {}", command.join(" "));
        match tokio::process::Command::new(program).args(args).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("Post-install command exited with {}", status),
            Err(e) => error!("Failed to run post-install command: {}", e),
        }
    });
}
