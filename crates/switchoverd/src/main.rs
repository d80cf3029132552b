//! Switchover daemon - zero-downtime PostgreSQL switchover
//!
//! Usage:
//!   # Create bookkeeping tables on both databases
//!   switchoverd --main-url postgres://old/app --next-url postgres://new/app install
//!
//!   # On every application node
//!   switchoverd run
//!
//!   # Operator
//!   switchoverd reset
//!   switchoverd execute
//!   switchoverd status

use clap::Parser;
use std::time::Duration;
use switchoverd::{attach_operator, install, Cli, Command, SwitchoverManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing with configured log level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let main_db = cli.main_config();
    let next_db = cli.next_config();

    match &cli.command {
        Command::Install => install(&main_db, &next_db).await?,
        Command::Status => {
            let (mut operator, databases) =
                attach_operator(&main_db, &next_db, cli.operator_poll()).await?;
            let cluster = operator.refresh().await?;
            let report = serde_json::json!({
                "cluster": cluster,
                "databases": databases,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reset => {
            let (mut operator, _) = attach_operator(&main_db, &next_db, cli.operator_poll()).await?;
            operator.reset().await?;
            eprintln!("Reset requested");
        }
        Command::Execute => {
            let (mut operator, _) = attach_operator(&main_db, &next_db, cli.operator_poll()).await?;
            operator.execute().await?;
            eprintln!("Switchover started; follow progress with `switchoverd status`");
        }
        Command::Cancel => {
            let (mut operator, _) = attach_operator(&main_db, &next_db, cli.operator_poll()).await?;
            operator.cancel().await?;
            eprintln!("Cancel requested");
        }
        Command::Ping => {
            let (mut operator, _) = attach_operator(&main_db, &next_db, cli.operator_poll()).await?;
            let nodes = operator.ping(Duration::from_secs(5)).await?;
            eprintln!("All {} nodes responded", nodes);
        }
        Command::Run(args) => {
            run(&cli, Duration::from_secs(args.shutdown_timeout_secs)).await?;
        }
    }

    Ok(())
}

async fn run(cli: &Cli, shutdown_timeout: Duration) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let manager = SwitchoverManager::start(cli.to_manager_config(), shutdown.clone()).await?;

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");
    shutdown.cancel();

    match tokio::time::timeout(shutdown_timeout, manager.shutdown()).await {
        Ok(Ok(())) => {
            tracing::info!("Node shut down gracefully");
        }
        Ok(Err(e)) => {
            tracing::error!("Error during shutdown: {}", e);
        }
        Err(_) => {
            tracing::warn!(
                "Shutdown timed out after {:?}, forcing exit",
                shutdown_timeout
            );
        }
    }

    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
