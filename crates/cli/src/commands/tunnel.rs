//! Tunnel Commands
//!
//! What a client runs against the server: obtain, inspect and give up its
//! own lease.

use anyhow::Result;
use clap::{Args, Subcommand};
use elvisp_common::{Allocation, PublicKey};
use std::net::IpAddr;

use crate::client::DaemonClient;
use crate::output::{print_info, print_item, print_success, AllocationDisplay, OutputFormat};

/// Client credential
#[derive(Args, Debug, Clone)]
pub struct ClientAuth {
    /// Public key of this node (the one cjdns will tunnel from)
    #[arg(short = 'k', long, env = "ELVISP_PUBLIC_KEY")]
    pub public_key: PublicKey,

    /// Server password
    #[arg(short, long, env = "ELVISP_PASSWORD", hide_env_values = true)]
    pub password: String,
}

#[derive(Subcommand)]
pub enum TunnelCommands {
    /// Request an address, or renew the one already held
    Register {
        #[command(flatten)]
        auth: ClientAuth,

        /// Ask for a specific address
        #[arg(long)]
        preferred: Option<IpAddr>,
    },

    /// Show the current lease
    Lease {
        #[command(flatten)]
        auth: ClientAuth,
    },

    /// Give up the current lease
    Release {
        #[command(flatten)]
        auth: ClientAuth,
    },
}

pub async fn execute(cmd: TunnelCommands, mut client: DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        TunnelCommands::Register { auth, preferred } => {
            let (allocation, server_key) = client
                .register(&auth.password, auth.public_key, preferred)
                .await?;
            show_lease(&allocation, &server_key, format);
        }
        TunnelCommands::Lease { auth } => {
            let (allocation, server_key) = client.lease(&auth.password, auth.public_key).await?;
            show_lease(&allocation, &server_key, format);
        }
        TunnelCommands::Release { auth } => {
            let allocation = client.release(&auth.password, auth.public_key).await?;
            match format {
                OutputFormat::Table => {
                    print_success(&format!("Released {}", allocation.address))
                }
                _ => print_item(&AllocationDisplay::from(&allocation), format),
            }
        }
    }
    Ok(())
}

fn show_lease(allocation: &Allocation, server_key: &str, format: OutputFormat) {
    print_item(&AllocationDisplay::from(allocation), format);
    if let OutputFormat::Table = format {
        print_info(&format!(
            "Connect with IpTunnel_connectTo {} and route through {}/{}",
            server_key, allocation.address, allocation.prefix
        ));
    }
}
