use std::path::Path;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use meter_core::SecretDigest;
use meter_server::config::MeterConfig;
use meter_server::pipeline::Pipeline;

/// API usage metering pipeline.
#[derive(Parser, Debug)]
#[command(name = "meter-server", about = "Quota enforcement and usage metering")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "meter.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline until SIGINT or SIGTERM. The default.
    Run,
    /// Print the lookup digest of a credential secret read from stdin.
    HashKey,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::HashKey => run_hash_key(),
        Commands::CheckConfig => run_check_config(&cli.config),
        Commands::Run => run(&cli.config).await,
    }
}

async fn run(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (config, found) = MeterConfig::load(Path::new(config_path))?;

    // Needs the loaded config to know whether OTel is enabled.
    let telemetry_guard = meter_server::telemetry::init(&config);

    if !found {
        info!(path = %config_path, "config file not found, using defaults");
    }

    let pipeline = Pipeline::build(config)?;
    info!("meter-server running");

    shutdown_signal().await;

    if let Err(e) = pipeline.shutdown().await {
        error!(error = %e, "pipeline did not shut down cleanly");
    }

    // Flush pending OpenTelemetry spans before exit.
    telemetry_guard.shutdown();

    info!("meter-server shut down");
    Ok(())
}

fn run_hash_key() -> Result<(), Box<dyn std::error::Error>> {
    let mut secret = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut secret)?;
    let secret = secret.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        return Err("no secret on stdin".into());
    }
    println!("{}", SecretDigest::of(secret).as_str());
    Ok(())
}

fn run_check_config(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (config, found) = MeterConfig::load(Path::new(config_path))?;
    config.validate()?;
    if found {
        println!("{config_path}: ok");
    } else {
        println!("{config_path}: not found, defaults are valid");
    }
    println!(
        "quota: {} calls per {} window, thresholds {:?}",
        config.authorizer.quota_limit, config.authorizer.window, config.authorizer.thresholds
    );
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM. A handler that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
