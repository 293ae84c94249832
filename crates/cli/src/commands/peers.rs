//! Peer Commands

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use wgwarden_common::ExpiryDate;

use crate::client::{ConvergenceReport, DaemonClient, Peer};
use crate::output::{print_item, print_list, print_success, print_value, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Create a peer and print (or save) its client config
    Add {
        /// Display name
        name: String,

        /// Last valid day, dd.mm.YYYY
        expires_at: String,

        /// Write the client config here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List active peers
    List,

    /// List archived peers
    Archive,

    /// Archive a peer and take it off the interface
    Remove {
        /// Peer ID
        id: String,
    },

    /// Set a new expiry date, restoring an archived peer
    Edit {
        /// Peer ID
        id: String,

        /// New last valid day, dd.mm.YYYY
        expires_at: String,
    },

    /// Show a peer
    Info {
        /// Peer ID
        id: String,
    },

    /// Print (or save) the client config of an active peer
    Config {
        /// Peer ID
        id: String,

        /// Write the client config here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Permanently delete an archived peer
    Purge {
        /// Peer ID
        id: String,
    },

    /// Archive expired peers and reconcile the interface now
    Reload,
}

/// Peer display wrapper for serialization
#[derive(Serialize)]
pub struct PeerDisplay {
    pub id: String,
    pub name: String,
    pub address: String,
    pub expires_at: String,
    pub created_at: String,
    pub state: String,
    pub public_key: String,
}

impl From<Peer> for PeerDisplay {
    fn from(peer: Peer) -> Self {
        Self {
            id: peer.id,
            name: peer.name,
            address: peer.address,
            expires_at: peer.expires_at,
            created_at: peer.created_at,
            state: peer.state,
            public_key: peer.public_key,
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Address", "Expires", "Created", "State", "Public Key"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.address.clone(),
            self.expires_at.clone(),
            self.created_at.clone(),
            self.state.clone(),
            self.public_key.clone(),
        ]
    }
}

/// Reject malformed dates before they reach the daemon
fn canonical_date(input: &str) -> Result<String> {
    let date = ExpiryDate::parse(input)
        .with_context(|| format!("'{}' is not a date (expected dd.mm.YYYY)", input))?;
    Ok(date.to_string())
}

/// Write a client config readable by the owner only
fn save_config(path: &Path, config: &str) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("cannot write {:?}", path))?;
    file.write_all(config.as_bytes())?;
    Ok(())
}

fn emit_config(config: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            save_config(path, config)?;
            print_success(&format!("Config written to {}", path.display()));
        }
        None => print!("{}", config),
    }
    Ok(())
}

fn print_report(report: &ConvergenceReport, format: OutputFormat) -> Result<()> {
    if !matches!(format, OutputFormat::Table | OutputFormat::Plain) {
        return print_value(report, format);
    }

    print_success(&format!(
        "Reconciled: {} archived, {} applied, {} removed",
        report.archived.len(),
        report.applied.len(),
        report.removed.len()
    ));
    if let Some(error) = &report.observe_error {
        print_warning(&format!("Could not read the interface: {}", error));
    }
    for failure in &report.failures {
        print_warning(&format!(
            "{} {} failed: {}",
            failure.op,
            failure.id.as_deref().unwrap_or(&failure.public_key),
            failure.error
        ));
    }
    Ok(())
}

pub async fn execute(cmd: PeerCommands, client: &DaemonClient, format: OutputFormat) -> Result<()> {
    match cmd {
        PeerCommands::Add { name, expires_at, out } => {
            let expires_at = canonical_date(&expires_at)?;
            let created = client.create_peer(&name, &expires_at).await?;
            if out.is_some() || matches!(format, OutputFormat::Table | OutputFormat::Plain) {
                eprintln!(
                    "Created {} ({}) at {}, valid through {}",
                    created.id, name, created.address, created.expires_at
                );
                emit_config(&created.config, out.as_deref())?;
            } else {
                print_value(&created, format)?;
            }
        }

        PeerCommands::List => {
            let peers: Vec<PeerDisplay> = client.list_peers().await?.into_iter().map(PeerDisplay::from).collect();
            print_list(&peers, format)?;
        }

        PeerCommands::Archive => {
            let peers: Vec<PeerDisplay> = client.list_archive().await?.into_iter().map(PeerDisplay::from).collect();
            print_list(&peers, format)?;
        }

        PeerCommands::Remove { id } => {
            client.remove_peer(&id).await?;
            print_success(&format!("Peer '{}' archived", id));
        }

        PeerCommands::Edit { id, expires_at } => {
            let expires_at = canonical_date(&expires_at)?;
            let peer = client.renew_peer(&id, &expires_at).await?;
            print_success(&format!("Peer '{}' valid through {}", id, peer.expires_at));
            print_item(&PeerDisplay::from(peer), format)?;
        }

        PeerCommands::Info { id } => {
            let peer = client.get_peer(&id).await?;
            print_item(&PeerDisplay::from(peer), format)?;
        }

        PeerCommands::Config { id, out } => {
            let config = client.peer_config(&id).await?;
            emit_config(&config, out.as_deref())?;
        }

        PeerCommands::Purge { id } => {
            client.purge_peer(&id).await?;
            print_success(&format!("Peer '{}' purged", id));
        }

        PeerCommands::Reload => {
            let report = client.reconcile().await?;
            print_report(&report, format)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_canonical_date() {
        assert_eq!(canonical_date("01.07.25").unwrap(), "01.07.2025");
        assert_eq!(canonical_date("2025-07-01").unwrap(), "01.07.2025");
        assert!(canonical_date("soon").is_err());
    }

    #[test]
    fn test_save_config_is_private() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("id1.conf");
        save_config(&path, "[Interface]\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[Interface]\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
