//! Core types for wgwarden

use crate::dates::{ExpiryDate, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Peer identifier, e.g. `id42`
pub type PeerId = String;

/// Operator identity as listed in the admin store
pub type OperatorId = i64;

/// Lifecycle state of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Active,
    Archived,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Active => write!(f, "active"),
            PeerState::Archived => write!(f, "archived"),
        }
    }
}

/// A peer as persisted in `peers.json` / `archive.json`
///
/// The ID is the key of the enclosing JSON object, so it is not part of the
/// serialized body. Field names match the stores written by earlier releases.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    #[serde(skip)]
    pub id: PeerId,
    pub name: String,
    #[serde(rename = "ip")]
    pub address: Ipv4Addr,
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
    #[serde(rename = "deactivate_date", alias = "date", alias = "expires")]
    pub expires_at: ExpiryDate,
    pub created_at: Timestamp,
}

impl PeerRecord {
    /// Allowed-address entry for this peer on the interface
    pub fn allowed_ip(&self) -> String {
        format!("{}/32", self.address)
    }

    pub fn with_id(mut self, id: impl Into<PeerId>) -> Self {
        self.id = id.into();
        self
    }
}

impl fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_field_names() {
        let json = r#"{
            "name": "ivan",
            "ip": "10.8.0.2",
            "private_key": "priv",
            "public_key": "pub",
            "preshared_key": "psk",
            "date": "01.07.25",
            "created_at": "2025-06-01 10:00:00"
        }"#;

        let record: PeerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.address, Ipv4Addr::new(10, 8, 0, 2));
        assert_eq!(record.expires_at.to_string(), "01.07.2025");

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["deactivate_date"], "01.07.2025");
        assert_eq!(written["created_at"], "01.06.2025 10:00:00");
        assert!(written.get("date").is_none());
        assert!(written.get("id").is_none());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let record = PeerRecord {
            id: "id1".to_string(),
            name: "ivan".to_string(),
            address: Ipv4Addr::new(10, 8, 0, 2),
            private_key: "very-secret-private".to_string(),
            public_key: "pub".to_string(),
            preshared_key: "very-secret-psk".to_string(),
            expires_at: ExpiryDate::from_ymd(2025, 7, 1).unwrap(),
            created_at: Timestamp::parse("01.06.2025 10:00:00").unwrap(),
        };

        let debug = format!("{:?}", record);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("id1"));
        assert_eq!(record.allowed_ip(), "10.8.0.2/32");
    }
}
