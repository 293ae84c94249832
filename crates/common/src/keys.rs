//! Peer key material
//!
//! A provider is picked once from configuration. The `wg` toolkit provider
//! lives in the daemon because it shells out; the two here are in-process.

use crate::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use x25519_dalek::{PublicKey, StaticSecret};

/// Private, public and pre-shared key for one peer, all base64
#[derive(Clone, PartialEq, Eq)]
pub struct KeyTriple {
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
}

impl fmt::Debug for KeyTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyTriple")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Which key provider the daemon should construct
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyProviderKind {
    /// `wg genkey` / `wg pubkey` / `wg genpsk`
    #[default]
    Toolkit,
    /// In-process X25519
    Native,
    /// Deterministic placeholders for hosts without WireGuard
    Synthetic,
}

#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &'static str;

    async fn generate(&self) -> Result<KeyTriple>;
}

/// Generates real WireGuard keys with x25519-dalek
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeKeyProvider;

impl NativeKeyProvider {
    pub fn keypair() -> (String, String) {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);

        // Curve25519 clamping, same as `wg genkey`
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;

        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        (STANDARD.encode(private), STANDARD.encode(public.as_bytes()))
    }

    pub fn preshared_key() -> String {
        let mut psk = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut psk);
        STANDARD.encode(psk)
    }
}

#[async_trait]
impl KeyProvider for NativeKeyProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn generate(&self) -> Result<KeyTriple> {
        let (private_key, public_key) = Self::keypair();
        Ok(KeyTriple {
            private_key,
            public_key,
            preshared_key: Self::preshared_key(),
        })
    }
}

/// Deterministic, well-formed but non-functional keys
///
/// The n-th call for a given seed always yields the same triple, which keeps
/// tests and dry runs reproducible.
#[derive(Debug, Default)]
pub struct SyntheticKeyProvider {
    seed: String,
    counter: AtomicU64,
}

impl SyntheticKeyProvider {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            counter: AtomicU64::new(0),
        }
    }

    fn derive(&self, label: &str, n: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(label.as_bytes());
        hasher.update(n.to_le_bytes());
        STANDARD.encode(hasher.finalize())
    }
}

#[async_trait]
impl KeyProvider for SyntheticKeyProvider {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn generate(&self) -> Result<KeyTriple> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(KeyTriple {
            private_key: self.derive("private", n),
            public_key: self.derive("public", n),
            preshared_key: self.derive("psk", n),
        })
    }
}
