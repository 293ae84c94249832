//! Peer lifecycle engine
//!
//! Owns the record store and coordinates allocation, key generation,
//! rendering, expiry and interface reconciliation. Store mutations are
//! serialised by the store's transaction lock; reconciliation passes are
//! serialised by the engine so no two passes touch the same peer at once.

use crate::events::{EventSink, PeerEvent, TracingEventSink};
use crate::reconciler::{ConvergenceReport, Reconciler};
use chrono::NaiveDate;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use wgwarden_common::lifecycle::{self, Renewal};
use wgwarden_common::{
    Clock, ConfigTemplate, Error, ExpiryDate, KeyProvider, PeerRecord, PeerState,
    RecordStore, Result, SystemClock, Timestamp,
};

/// Where the client config template comes from
#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// Read on every use, so edits apply without a restart
    File(PathBuf),
    Fixed(ConfigTemplate),
}

impl TemplateSource {
    fn load(&self) -> Result<ConfigTemplate> {
        match self {
            TemplateSource::File(path) => ConfigTemplate::load(path),
            TemplateSource::Fixed(template) => Ok(template.clone()),
        }
    }
}

/// A freshly created peer and its rendered client config
#[derive(Debug, Clone)]
pub struct CreatedPeer {
    pub record: PeerRecord,
    pub config: String,
    /// Where the config was written, if a clients directory is set
    pub config_path: Option<PathBuf>,
}

pub struct PeerEngine {
    store: RecordStore,
    keys: Arc<dyn KeyProvider>,
    reconciler: Reconciler,
    template: TemplateSource,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    clients_dir: Option<PathBuf>,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl PeerEngine {
    pub fn new(
        store: RecordStore,
        keys: Arc<dyn KeyProvider>,
        reconciler: Reconciler,
        template: TemplateSource,
    ) -> Self {
        Self {
            store,
            keys,
            reconciler,
            template,
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
            clients_dir: None,
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clients_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.clients_dir = Some(dir.into());
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn key_provider(&self) -> &str {
        self.keys.name()
    }

    /// Allocate, generate keys, persist and render a new Active peer
    #[instrument(skip(self), fields(op = "create_peer"))]
    pub async fn create_peer(&self, name: &str, expires_at: ExpiryDate) -> Result<CreatedPeer> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidConfig("peer name must not be empty".to_string()));
        }

        // Nothing is allocated until the template and keys are in hand
        let template = self.template.load()?;
        let keys = self.keys.generate().await?;
        let created_at = Timestamp::new(self.clock.now());

        let record = self.store.transact(|txn| {
            let (id, address) = txn.allocate()?;
            let record = PeerRecord {
                id,
                name: name.to_string(),
                address,
                private_key: keys.private_key,
                public_key: keys.public_key,
                preshared_key: keys.preshared_key,
                expires_at,
                created_at,
            };
            txn.put_active(record.clone())?;
            Ok(record)
        })?;

        let config = template.render(record.address, &record.private_key, &record.preshared_key);
        let config_path = match &self.clients_dir {
            Some(dir) => match write_client_config(dir, &record.id, &config) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Could not write client config for {}: {}", record.id, e);
                    None
                }
            },
            None => None,
        };

        self.events.emit(PeerEvent::Created {
            id: record.id.clone(),
            name: record.name.clone(),
            address: record.address.to_string(),
            expires_at,
        });
        Ok(CreatedPeer {
            record,
            config,
            config_path,
        })
    }

    /// Archive an Active peer and take it off the interface
    ///
    /// The interface removal is best effort; if it fails the next
    /// reconciliation removes the key anyway.
    #[instrument(skip(self), fields(op = "remove_peer"))]
    pub async fn remove_peer(&self, id: &str) -> Result<PeerRecord> {
        let record = self.store.transact(|txn| {
            let record = txn
                .remove_active(id)
                .ok_or_else(|| Error::not_found("remove_peer", id))?;
            txn.put_archived(record.clone());
            Ok(record)
        })?;

        self.events.emit(PeerEvent::Archived {
            id: record.id.clone(),
            name: record.name.clone(),
            expires_at: record.expires_at,
        });

        let _pass = self.reconcile_lock.lock().await;
        // A renewal may have restored the peer while we waited
        if self.store.get_archived(&record.id).is_err() {
            debug!("Peer {} is no longer archived; leaving it on the interface", record.id);
            return Ok(record);
        }
        if let Err(e) = self.reconciler.wg().remove_peer(&record.id, &record.public_key).await {
            self.events.emit(PeerEvent::ConvergenceFailed {
                id: Some(record.id.clone()),
                op: "remove_peer".to_string(),
                error: e.to_string(),
            });
        }
        Ok(record)
    }

    /// Set a new expiry, restoring the peer from the archive if needed
    #[instrument(skip(self), fields(op = "renew_peer"))]
    pub async fn renew_peer(&self, id: &str, expires_at: ExpiryDate) -> Result<Renewal> {
        let now = Timestamp::new(self.clock.now());
        let renewal = lifecycle::renew(&self.store, id, expires_at, now)?;

        let event = if renewal.restored() {
            PeerEvent::Restored {
                id: id.to_string(),
                expires_at,
            }
        } else {
            PeerEvent::Renewed {
                id: id.to_string(),
                expires_at,
            }
        };
        self.events.emit(event);
        Ok(renewal)
    }

    pub fn get_peer(&self, id: &str) -> Result<(PeerRecord, PeerState)> {
        self.store.lookup(id).map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found("get_peer", id),
            other => other,
        })
    }

    pub fn list_active(&self) -> Vec<PeerRecord> {
        self.store.list_active()
    }

    pub fn list_archived(&self) -> Vec<PeerRecord> {
        self.store.list_archived()
    }

    /// Render the client config of an Active peer with the current template
    pub fn render_config(&self, id: &str) -> Result<String> {
        let record = self.store.get_active(id).map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found("render_config", id),
            other => other,
        })?;
        let template = self.template.load()?;
        Ok(template.render(record.address, &record.private_key, &record.preshared_key))
    }

    /// Permanently delete an Archived peer
    #[instrument(skip(self), fields(op = "purge_peer"))]
    pub fn purge_peer(&self, id: &str) -> Result<PeerRecord> {
        let record = self.store.transact(|txn| {
            if txn.active().contains(id) {
                return Err(Error::PermissionDenied(format!(
                    "purge_peer: peer {} is active; archive it first",
                    id
                )));
            }
            txn.remove_archived(id)
                .ok_or_else(|| Error::not_found("purge_peer", id))
        })?;

        if let Some(dir) = &self.clients_dir {
            let path = client_config_path(dir, id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not delete {:?}: {}", path, e),
            }
        }

        self.events.emit(PeerEvent::Purged { id: id.to_string() });
        Ok(record)
    }

    /// Archive everything expired as of `today`, then converge the interface
    #[instrument(skip(self), fields(op = "sweep_and_reconcile"))]
    pub async fn sweep_and_reconcile(&self, today: NaiveDate) -> Result<ConvergenceReport> {
        let _pass = self.reconcile_lock.lock().await;

        let swept = lifecycle::sweep_expired(&self.store, today)?;
        for record in &swept {
            self.events.emit(PeerEvent::Archived {
                id: record.id.clone(),
                name: record.name.clone(),
                expires_at: record.expires_at,
            });
        }

        Ok(self.converge(&swept).await)
    }

    /// Converge the interface to the current Active set without sweeping
    #[instrument(skip(self), fields(op = "reconcile"))]
    pub async fn reconcile(&self) -> ConvergenceReport {
        let _pass = self.reconcile_lock.lock().await;
        self.converge(&[]).await
    }

    async fn converge(&self, swept: &[PeerRecord]) -> ConvergenceReport {
        let state = self.store.snapshot();
        let desired = state.active.to_vec();
        let known = state.archived.to_vec();

        let report = self.reconciler.converge(&desired, swept, &known).await;
        for failure in &report.failures {
            self.events.emit(PeerEvent::ConvergenceFailed {
                id: failure.id.clone(),
                op: failure.op.to_string(),
                error: failure.error.clone(),
            });
        }
        report
    }

    /// Announce every Active peer with `0 <= days left < window_days`
    pub fn notify_expiring(&self, today: NaiveDate, window_days: i64) -> Vec<PeerEvent> {
        let events: Vec<PeerEvent> = self
            .store
            .list_active()
            .into_iter()
            .filter_map(|r| {
                let days_left = r.expires_at.days_from(today);
                (0..window_days).contains(&days_left).then(|| PeerEvent::ExpiringSoon {
                    id: r.id,
                    name: r.name,
                    expires_at: r.expires_at,
                    created_at: r.created_at,
                    days_left,
                })
            })
            .collect();

        for event in &events {
            self.events.emit(event.clone());
        }
        if !events.is_empty() {
            info!("{} peer(s) expire within {} days", events.len(), window_days);
        }
        events
    }

    /// The daily job: sweep, converge, then announce upcoming expiries
    pub async fn daily_tick(&self, window_days: i64) -> Result<ConvergenceReport> {
        let today = self.today();
        let report = self.sweep_and_reconcile(today).await?;
        self.notify_expiring(today, window_days);
        Ok(report)
    }
}

fn client_config_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.conf", id))
}

/// Atomically write `<dir>/<id>.conf` with owner-only permissions
fn write_client_config(dir: &Path, id: &str, config: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = client_config_path(dir, id);

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(config.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
    Ok(path)
}
