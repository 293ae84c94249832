//! Interface reconciliation
//!
//! Drives the live WireGuard interface toward the Active peer set. Commands
//! are at-least-once: an apply for a peer that is already installed, or a
//! remove for one that is already gone, is harmless, so an interrupted pass
//! is finished by simply running another.

use crate::wg::WgTool;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use wgwarden_common::{PeerId, PeerRecord};

/// One peer as seen on the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

/// Observed peer set of the running interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    peers: Vec<LivePeer>,
}

impl InterfaceState {
    pub fn new(peers: Vec<LivePeer>) -> Self {
        Self { peers }
    }

    /// Parse `wg show <iface> dump`
    ///
    /// The first line describes the interface itself. Peer lines are
    /// tab-separated: public key, pre-shared key, endpoint, allowed ips, ...
    pub fn parse_dump(dump: &str) -> Self {
        let peers = dump
            .lines()
            .skip(1)
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let public_key = fields.next()?.trim();
                if public_key.is_empty() {
                    return None;
                }
                let allowed = fields.nth(2).unwrap_or("(none)").trim();
                let allowed_ips = if allowed == "(none)" {
                    Vec::new()
                } else {
                    allowed
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                };
                Some(LivePeer {
                    public_key: public_key.to_string(),
                    allowed_ips,
                })
            })
            .collect();
        Self { peers }
    }

    pub fn get(&self, public_key: &str) -> Option<&LivePeer> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }

    pub fn contains(&self, public_key: &str) -> bool {
        self.get(public_key).is_some()
    }

    pub fn has_allowed_ip(&self, public_key: &str, allowed_ip: &str) -> bool {
        self.get(public_key)
            .map(|p| p.allowed_ips.iter().any(|a| a == allowed_ip))
            .unwrap_or(false)
    }

    pub fn public_keys(&self) -> impl Iterator<Item = &str> {
        self.peers.iter().map(|p| p.public_key.as_str())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// A single converging command
#[derive(Debug, Clone)]
pub enum Action {
    /// Install the peer with its address and pre-shared key
    Apply(PeerRecord),
    /// Remove a public key; `id` is set when the key belongs to a known record
    Remove { id: Option<PeerId>, public_key: String },
}

impl Action {
    pub fn public_key(&self) -> &str {
        match self {
            Action::Apply(r) => &r.public_key,
            Action::Remove { public_key, .. } => public_key,
        }
    }
}

/// Compute the commands that bring `live` to `desired`
///
/// - an Active peer that is missing, or lacks its `address/32`, is applied
/// - any live key that is not Active is removed
/// - every peer in `swept` is removed even if it no longer shows as live
///
/// `known` is only used to attach IDs to removals. At most one action is
/// produced per public key, with applies taking precedence.
pub fn plan(
    desired: &[PeerRecord],
    live: &InterfaceState,
    swept: &[PeerRecord],
    known: &[PeerRecord],
) -> Vec<Action> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut actions = Vec::new();

    for record in desired {
        if !seen.insert(record.public_key.as_str()) {
            continue;
        }
        if !live.has_allowed_ip(&record.public_key, &record.allowed_ip()) {
            actions.push(Action::Apply(record.clone()));
        }
    }

    let id_of = |public_key: &str| {
        known
            .iter()
            .chain(swept)
            .find(|r| r.public_key == public_key)
            .map(|r| r.id.clone())
    };

    let stale = live
        .public_keys()
        .chain(swept.iter().map(|r| r.public_key.as_str()));
    for public_key in stale {
        if seen.insert(public_key) {
            actions.push(Action::Remove {
                id: id_of(public_key),
                public_key: public_key.to_string(),
            });
        }
    }

    actions
}

/// A converging command that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionFailure {
    pub id: Option<PeerId>,
    pub public_key: String,
    pub op: &'static str,
    pub error: String,
}

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvergenceReport {
    /// Peers moved to the archive by the sweep that preceded this pass
    pub archived: Vec<PeerId>,
    /// Peers installed or updated
    pub applied: Vec<PeerId>,
    /// Public keys removed from the interface
    pub removed: Vec<String>,
    pub failures: Vec<ActionFailure>,
    /// Set when the live state could not be read and every Active peer was
    /// applied blind
    pub observe_error: Option<String>,
    pub restarted: bool,
}

impl ConvergenceReport {
    pub fn commands_issued(&self) -> usize {
        self.applied.len() + self.removed.len() + self.failures.len()
    }

    pub fn changed_anything(&self) -> bool {
        !self.applied.is_empty() || !self.removed.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.observe_error.is_none()
    }
}

/// Issues converging commands through [`WgTool`]
#[derive(Clone)]
pub struct Reconciler {
    wg: WgTool,
    max_in_flight: usize,
    restart_after_changes: bool,
}

impl Reconciler {
    pub fn new(wg: WgTool, max_in_flight: usize, restart_after_changes: bool) -> Self {
        Self {
            wg,
            max_in_flight: max_in_flight.max(1),
            restart_after_changes,
        }
    }

    pub fn wg(&self) -> &WgTool {
        &self.wg
    }

    /// Converge the interface to `desired`, removing `swept` at least once
    ///
    /// Failures are collected per peer; one failing command never stops the
    /// others.
    pub async fn converge(
        &self,
        desired: &[PeerRecord],
        swept: &[PeerRecord],
        known: &[PeerRecord],
    ) -> ConvergenceReport {
        let mut report = ConvergenceReport {
            archived: swept.iter().map(|r| r.id.clone()).collect(),
            ..Default::default()
        };

        let live = match self.wg.show().await {
            Ok(live) => live,
            Err(e) => {
                warn!("Cannot read live state of {}: {}; applying blind", self.wg.interface(), e);
                report.observe_error = Some(e.to_string());
                InterfaceState::default()
            }
        };

        let actions = plan(desired, &live, swept, known);
        debug!(
            "Reconciling {}: {} live, {} desired, {} actions",
            self.wg.interface(),
            live.len(),
            desired.len(),
            actions.len()
        );

        let results: Vec<(Action, wgwarden_common::Result<()>)> = stream::iter(actions)
            .map(|action| async move {
                let result = match &action {
                    Action::Apply(record) => self.wg.apply_peer(record).await,
                    Action::Remove { id, public_key } => {
                        self.wg
                            .remove_peer(id.as_deref().unwrap_or("-"), public_key)
                            .await
                    }
                };
                (action, result)
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        for (action, result) in results {
            match (action, result) {
                (Action::Apply(record), Ok(())) => report.applied.push(record.id),
                (Action::Remove { public_key, .. }, Ok(())) => report.removed.push(public_key),
                (action, Err(e)) => {
                    warn!("Reconcile command failed: {}", e);
                    let (id, op) = match &action {
                        Action::Apply(r) => (Some(r.id.clone()), "apply_peer"),
                        Action::Remove { id, .. } => (id.clone(), "remove_peer"),
                    };
                    report.failures.push(ActionFailure {
                        id,
                        public_key: action.public_key().to_string(),
                        op,
                        error: e.to_string(),
                    });
                }
            }
        }
        // Completion order depends on scheduling
        report.applied.sort();
        report.removed.sort();

        if self.restart_after_changes && report.changed_anything() {
            match self.wg.restart_service().await {
                Ok(()) => report.restarted = true,
                Err(e) => warn!("Service restart failed: {}", e),
            }
        }

        if report.commands_issued() > 0 || !report.archived.is_empty() {
            info!(
                "Reconciled {}: {} archived, {} applied, {} removed, {} failed",
                self.wg.interface(),
                report.archived.len(),
                report.applied.len(),
                report.removed.len(),
                report.failures.len()
            );
        }
        report
    }
}
