//! Admin Commands

use anyhow::Result;
use clap::Subcommand;
use elvisp_common::PublicKey;

use crate::client::DaemonClient;
use crate::output::{
    print_item, print_list, print_success, print_warning, AllocationDisplay, OutputFormat,
};

#[derive(Subcommand)]
pub enum AdminCommands {
    /// List all allocations
    List,

    /// Revoke a client's allocation
    Revoke {
        /// Client public key
        public_key: PublicKey,
    },

    /// Push every stored allocation to cjdns again
    Reload,
}

pub async fn execute(
    cmd: AdminCommands,
    mut client: DaemonClient,
    admin_password: &str,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        AdminCommands::List => {
            let allocations = client.list(admin_password).await?;
            let display: Vec<AllocationDisplay> =
                allocations.iter().map(AllocationDisplay::from).collect();
            print_list(&display, format);
        }
        AdminCommands::Revoke { public_key } => {
            let allocation = client.revoke(admin_password, public_key).await?;
            match format {
                OutputFormat::Table => print_success(&format!(
                    "Revoked {} from {}",
                    allocation.address, allocation.client_id
                )),
                _ => print_item(&AllocationDisplay::from(&allocation), format),
            }
        }
        AdminCommands::Reload => {
            if client.reload(admin_password).await? {
                print_warning("A reload was already queued; this request was merged into it");
            } else {
                print_success("Reload scheduled");
            }
        }
    }
    Ok(())
}
