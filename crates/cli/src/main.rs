//! elvisp CLI - Main Entry Point

use clap::{Parser, Subcommand};
use elvisp_cli::client::DaemonClient;
use elvisp_cli::commands::{admin, tunnel};
use elvisp_cli::output::{self, print_error, print_message};

/// elvisp CLI - cjdns IPTunnel address registration
#[derive(Parser)]
#[command(name = "elvisp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Server address
    #[arg(long, env = "ELVISP_SERVER", default_value = "127.0.0.1:4132", global = true)]
    server: String,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Tunnel(tunnel::TunnelCommands),

    /// Administer allocations
    Admin {
        /// Administrator password
        #[arg(long, env = "ELVISP_ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: String,

        #[command(subcommand)]
        command: admin::AdminCommands,
    },

    /// Check server status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = DaemonClient::connect(&cli.server).await?;

    match cli.command {
        Commands::Tunnel(cmd) => tunnel::execute(cmd, client, cli.format).await?,
        Commands::Admin {
            admin_password,
            command,
        } => admin::execute(command, client, &admin_password, cli.format).await?,
        Commands::Status => {
            let mut client = client;
            let version = client.ping().await?;
            print_message(
                &format!("elvisp server v{} is running at {}", version, cli.server),
                cli.format,
            );
        }
    }

    Ok(())
}
