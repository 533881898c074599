use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dhcpwire::{Config, DhcpServer, Leases, Result};

const LEASE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "dhcpwire")]
#[command(author, version, about = "A minimal DHCPv4 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured pool until Ctrl-C
    Run,
    /// Print the effective configuration as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            info!(
                "IP pool: {} - {} ({} addresses)",
                config.pool_start,
                config.pool_end,
                config.pool_size()
            );

            let server = DhcpServer::from_config(&config, Leases::new(config.clone()));
            server.start().await?;

            let mut cleanup = tokio::time::interval(LEASE_CLEANUP_INTERVAL);
            let shutdown = tokio::signal::ctrl_c();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = cleanup.tick() => {
                        let count = server.handler().cleanup_expired_leases();
                        if count > 0 {
                            debug!("Expired {} lease(s)", count);
                        }
                    }
                    _ = &mut shutdown => {
                        info!("Received shutdown signal, stopping server...");
                        break;
                    }
                }
            }

            server.stop().await;
            info!(
                "{} active lease(s) discarded",
                server.handler().active_lease_count()
            );
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
