//! wgwarden Common Library
//!
//! Peer records, persistent stores, allocation, key material, config
//! rendering and lifecycle rules shared by the daemon and the CLI.

pub mod allocator;
pub mod dates;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod store;
pub mod template;
pub mod types;

// Re-export commonly used types
pub use allocator::Allocator;
pub use dates::{ExpiryDate, Timestamp};
pub use error::{Error, Result};
pub use keys::{KeyProvider, KeyProviderKind, KeyTriple, NativeKeyProvider, SyntheticKeyProvider};
pub use lifecycle::{Clock, FixedClock, SystemClock};
pub use store::{AdminSet, CorruptPolicy, RecordStore};
pub use template::ConfigTemplate;
pub use types::*;

/// wgwarden version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file for the daemon
pub fn default_config_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/wgwarden/config.toml")
}

/// Default directory holding the JSON stores
pub fn default_store_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/wgwarden")
}

/// Default address of the daemon's operator API
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7420";
