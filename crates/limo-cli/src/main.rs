//! `limo` – fleet control center.
//!
//! Startup order:
//!
//! 1. Parse flags and load (or create) `limo.toml`.
//! 2. Initialise tracing, then build the multi-threaded runtime.
//! 3. Connect to the store, retrying until the self-test passes.
//! 4. Clear the stale live-robot set and subscribe the fleet channels.
//! 5. Start the heartbeat sweeper and serve the console bridge.
//!
//! **Ctrl-C** cancels the root token; every subscription, sweeper and console
//! connection winds down from it.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use limo_cockpit::CockpitServer;
use limo_kernel::RobotRegistry;
use limo_middleware::{MessageBus, RedisBus, Sinks, UpdateRouter, connect_with_retry};
use limo_types::LimoError;

use crate::config::{Config, ConfigOrigin};

#[derive(Debug, Parser)]
#[command(name = "limo", version, about = "Robot fleet control center")]
struct Args {
    /// Path to the configuration file; created with defaults when missing.
    #[arg(long, env = "LIMO_CONFIG", default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Overwrite the configuration file with defaults before starting.
    #[arg(long)]
    reset_config: bool,

    /// Reach the store at its compose service name instead of the configured host.
    #[arg(long)]
    dockerized: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (mut cfg, origin) = match config::load_or_init(&args.config, args.reset_config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };
    if args.dockerized {
        cfg.redis.host = config::DOCKER_REDIS_HOST.to_string();
    }

    let _otel_guard = telemetry::init_tracing("limo-control-center", cfg.log_format);
    print_banner(&args, &cfg);
    match origin {
        ConfigOrigin::Defaults => info!(path = %args.config.display(), "wrote default configuration"),
        ConfigOrigin::File => info!(path = %args.config.display(), "configuration loaded"),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("limo-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        on_signal.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    match runtime.block_on(run(cfg, shutdown)) {
        Ok(()) => {
            info!("control center stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "control center failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config, shutdown: CancellationToken) -> Result<(), LimoError> {
    let settings = cfg.redis.bus_settings();
    info!(host = %settings.host, port = settings.port, "connecting to store");
    let Some(bus) = connect_with_retry(
        move || RedisBus::connect(&settings),
        cfg.fleet.connect_retry_delay(),
        &shutdown,
    )
    .await
    else {
        info!("shutdown requested before the store came up");
        return Ok(());
    };
    let bus: Arc<dyn MessageBus> = Arc::new(bus);

    let registry = Arc::new(RobotRegistry::with_root_token(
        cfg.fleet.keep_alive_timeout(),
        shutdown.child_token(),
    ));
    let router = UpdateRouter::new(
        registry,
        Arc::new(Sinks::default()),
        bus,
        cfg.fleet.router_settings(),
    )?;

    let starter = Arc::clone(&router);
    let subscription_token = shutdown.child_token();
    let subscription = tokio::task::spawn_blocking(move || starter.start(subscription_token))
        .await
        .map_err(|e| LimoError::Connectivity(format!("subscribe task failed: {e}")))??;
    info!(channels = ?subscription.channels(), "fleet channels subscribed");

    let sweeper = router.spawn_sweeper(cfg.fleet.sweep_interval(), shutdown.child_token());

    let served = CockpitServer::new(&router)
        .with_host(cfg.webserver.host.clone())
        .with_port(cfg.webserver.port)
        .with_settings(cfg.fleet.cockpit_settings())
        .run(shutdown.child_token())
        .await;

    shutdown.cancel();
    subscription.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweeper task ended abnormally");
    }
    served
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(args: &Args, cfg: &Config) {
    println!();
    println!("{}", r#"    __    ______  _______ "#.bold().cyan());
    println!("{}", r#"   / /   /  _/  |/  / __ \"#.bold().cyan());
    println!("{}", r#"  / /    / // /|_/ / / / /"#.bold().cyan());
    println!("{}", r#" / /____/ // /  / / /_/ / "#.bold().cyan());
    println!("{}", r#"/_____/___/_/  /_/\____/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Limo Control Center".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!(
        "  Config {}   Store {}   Consoles {}",
        args.config.display().to_string().bold(),
        format!("{}:{}", cfg.redis.host, cfg.redis.port).bold(),
        format!("{}:{}", cfg.webserver.host, cfg.webserver.port).bold()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from(["limo", "--config", "fleet.toml", "--dockerized"]).unwrap();
        assert_eq!(args.config, PathBuf::from("fleet.toml"));
        assert!(args.dockerized);
        assert!(!args.reset_config);
    }

    #[test]
    fn config_defaults_to_local_file() {
        // SAFETY: no other test in this crate reads this variable.
        unsafe { std::env::remove_var("LIMO_CONFIG") };
        let args = Args::try_parse_from(["limo", "--reset-config"]).unwrap();
        assert_eq!(args.config, PathBuf::from(config::DEFAULT_CONFIG_FILE));
        assert!(args.reset_config);
    }
}
