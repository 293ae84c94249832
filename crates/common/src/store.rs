//! JSON-file record store for peer state
//!
//! One file per collection under the store directory:
//! - `peers.json`   Active peers, `{ "<id>": { ..record.. } }`
//! - `archive.json` Archived peers, same layout
//! - `last_ip.json` `{ "last_ip": "10.8.0.22", "last_id": 22 }`
//! - `admins.json`  `{ "admins": [123456] }`, read-only here
//!
//! All mutations go through [`RecordStore::transact`], which runs under a
//! single write lock, works on a copy of the state and only swaps the copy
//! in after every touched file has been replaced on disk. Files are
//! replaced atomically (temp file in the same directory, then rename).

use crate::allocator::{format_id, id_suffix, max_id_suffix, Allocator};
use crate::types::{OperatorId, PeerId, PeerRecord, PeerState};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const ACTIVE_FILE: &str = "peers.json";
pub const ARCHIVE_FILE: &str = "archive.json";
pub const CURSOR_FILE: &str = "last_ip.json";
pub const ADMINS_FILE: &str = "admins.json";

/// What to do with a store file that fails to parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptPolicy {
    /// Refuse to open the store
    #[default]
    Fail,
    /// Move the file aside as `<name>.corrupt-<timestamp>` and start empty
    Quarantine,
}

// ============================================================================
// Collections
// ============================================================================

/// Insertion-ordered set of peer records keyed by ID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCollection {
    records: Vec<PeerRecord>,
}

impl PeerCollection {
    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Replace the record with the same ID in place, or append it
    pub fn insert(&mut self, record: PeerRecord) {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => *slot = record,
            None => self.records.push(record),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerRecord> {
        let idx = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(idx))
    }

    pub fn find_by_address(&self, address: Ipv4Addr) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.address == address)
    }

    pub fn find_by_public_key(&self, public_key: &str) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.public_key == public_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_vec(&self) -> Vec<PeerRecord> {
        self.records.clone()
    }
}

impl Serialize for PeerCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for record in &self.records {
            map.serialize_entry(&record.id, record)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PeerCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(CollectionVisitor)
    }
}

/// Keeps the file's key order, which is the order peers were added in
struct CollectionVisitor;

impl<'de> Visitor<'de> for CollectionVisitor {
    type Value = PeerCollection;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of peer ID to peer record")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
        let mut collection = PeerCollection {
            records: Vec::with_capacity(access.size_hint().unwrap_or(0)),
        };
        while let Some((id, record)) = access.next_entry::<String, PeerRecord>()? {
            collection.insert(record.with_id(id));
        }
        Ok(collection)
    }
}

/// Contents of `last_ip.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CursorFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_id: Option<u64>,
}

/// Operators allowed to drive lifecycle operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSet {
    #[serde(default)]
    admins: Vec<OperatorId>,
}

impl AdminSet {
    pub fn new(admins: Vec<OperatorId>) -> Self {
        Self { admins }
    }

    pub fn contains(&self, operator: OperatorId) -> bool {
        self.admins.contains(&operator)
    }

    pub fn len(&self) -> usize {
        self.admins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }
}

// ============================================================================
// State and transactions
// ============================================================================

/// Point-in-time view of everything the store owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreState {
    pub active: PeerCollection,
    pub archived: PeerCollection,
    /// Last issued host address
    pub cursor: Ipv4Addr,
    /// Last issued ID counter value
    pub last_id: u64,
}

impl StoreState {
    pub fn lookup(&self, id: &str) -> Option<(&PeerRecord, PeerState)> {
        self.active
            .get(id)
            .map(|r| (r, PeerState::Active))
            .or_else(|| self.archived.get(id).map(|r| (r, PeerState::Archived)))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    active: bool,
    archived: bool,
    cursor: bool,
    active_gained: bool,
    archived_gained: bool,
}

impl Dirty {
    fn any(&self) -> bool {
        self.active || self.archived || self.cursor
    }

    fn all() -> Self {
        Self {
            active: true,
            archived: true,
            cursor: true,
            active_gained: false,
            archived_gained: false,
        }
    }
}

/// Working copy handed to a [`RecordStore::transact`] closure
pub struct StoreTxn<'a> {
    state: StoreState,
    allocator: &'a Allocator,
    dirty: Dirty,
}

impl<'a> StoreTxn<'a> {
    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn active(&self) -> &PeerCollection {
        &self.state.active
    }

    pub fn archived(&self) -> &PeerCollection {
        &self.state.archived
    }

    /// Issue the next ID and address. Both counters are burned even if the
    /// caller later fails, since the cursor is written first. Addresses still
    /// held by an Active or Archived record are skipped.
    pub fn allocate(&mut self) -> Result<(PeerId, Ipv4Addr)> {
        let mut address = self.allocator.next_address(self.state.cursor)?;
        while let Some(holder) = self.holder_of(address) {
            warn!("Cursor {} is behind: {} is held by {}; skipping", self.state.cursor, address, holder);
            address = self.allocator.next_address(address)?;
        }

        self.state.last_id += 1;
        self.state.cursor = address;
        self.dirty.cursor = true;
        Ok((format_id(self.state.last_id), address))
    }

    fn holder_of(&self, address: Ipv4Addr) -> Option<&str> {
        self.state
            .active
            .find_by_address(address)
            .or_else(|| self.state.archived.find_by_address(address))
            .map(|r| r.id.as_str())
    }

    /// Keep the ID counter ahead of any ID written from outside `allocate`
    fn observe_id(&mut self, id: &str) {
        if let Some(n) = id_suffix(id) {
            if n > self.state.last_id {
                self.state.last_id = n;
                self.dirty.cursor = true;
            }
        }
    }

    /// Insert or replace an Active record, dropping any Archived copy
    pub fn put_active(&mut self, record: PeerRecord) -> Result<()> {
        if let Some(holder) = self.state.active.find_by_address(record.address) {
            if holder.id != record.id {
                return Err(Error::InvalidAddress(format!(
                    "{} is already held by active peer {}",
                    record.address, holder.id
                )));
            }
        }
        if self.state.archived.remove(&record.id).is_some() {
            self.dirty.archived = true;
        }
        self.observe_id(&record.id);
        self.state.active.insert(record);
        self.dirty.active = true;
        self.dirty.active_gained = true;
        Ok(())
    }

    /// Insert or replace an Archived record, dropping any Active copy
    pub fn put_archived(&mut self, record: PeerRecord) {
        if self.state.active.remove(&record.id).is_some() {
            self.dirty.active = true;
        }
        self.observe_id(&record.id);
        self.state.archived.insert(record);
        self.dirty.archived = true;
        self.dirty.archived_gained = true;
    }

    pub fn remove_active(&mut self, id: &str) -> Option<PeerRecord> {
        let removed = self.state.active.remove(id);
        self.dirty.active |= removed.is_some();
        removed
    }

    pub fn remove_archived(&mut self, id: &str) -> Option<PeerRecord> {
        let removed = self.state.archived.remove(id);
        self.dirty.archived |= removed.is_some();
        removed
    }
}

// ============================================================================
// Record store
// ============================================================================

struct StoreInner {
    dir: PathBuf,
    allocator: Allocator,
    state: RwLock<StoreState>,
}

/// Durable peer store shared by all engine operations
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

/// Outcome of [`RecordStore::migrate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub active: usize,
    pub archived: usize,
    pub files_rewritten: Vec<String>,
}

impl RecordStore {
    /// Open (or initialise) the store in `dir`
    pub fn open(dir: impl AsRef<Path>, allocator: Allocator, policy: CorruptPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (state, needs_rewrite) = load_state(&dir, &allocator, policy)?;
        let store = Self {
            inner: Arc::new(StoreInner {
                dir,
                allocator,
                state: RwLock::new(state),
            }),
        };

        if needs_rewrite {
            let state = store.inner.state.read().clone();
            store.persist(&state, Dirty::all())?;
        }

        {
            let state = store.inner.state.read();
            info!(
                "Opened peer store at {:?} ({} active, {} archived, cursor {})",
                store.inner.dir,
                state.active.len(),
                state.archived.len(),
                state.cursor
            );
        }
        Ok(store)
    }

    /// Rewrite every store file in canonical form
    ///
    /// Meant to run once, with the daemon stopped, after upgrading from a
    /// release that wrote other date formats or no ID counter.
    pub fn migrate(dir: impl AsRef<Path>, allocator: Allocator, policy: CorruptPolicy) -> Result<MigrationReport> {
        let dir = dir.as_ref();
        let before: Vec<(&str, Option<Vec<u8>>)> = [ACTIVE_FILE, ARCHIVE_FILE, CURSOR_FILE]
            .into_iter()
            .map(|name| (name, std::fs::read(dir.join(name)).ok()))
            .collect();

        let store = Self::open(dir, allocator, policy)?;
        let state = store.snapshot();
        store.persist(&state, Dirty::all())?;

        let mut report = MigrationReport {
            active: state.active.len(),
            archived: state.archived.len(),
            files_rewritten: Vec::new(),
        };
        for (name, old) in before {
            let new = std::fs::read(dir.join(name))?;
            if old.as_deref() != Some(new.as_slice()) {
                report.files_rewritten.push(name.to_string());
            }
        }

        info!(
            "Migrated store at {:?}: {} active, {} archived, rewrote {:?}",
            dir, report.active, report.archived, report.files_rewritten
        );
        Ok(report)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn allocator(&self) -> &Allocator {
        &self.inner.allocator
    }

    /// Consistent copy of the whole state
    pub fn snapshot(&self) -> StoreState {
        self.inner.state.read().clone()
    }

    pub fn cursor(&self) -> Ipv4Addr {
        self.inner.state.read().cursor
    }

    pub fn get_active(&self, id: &str) -> Result<PeerRecord> {
        self.inner
            .state
            .read()
            .active
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("get_active", id))
    }

    pub fn get_archived(&self, id: &str) -> Result<PeerRecord> {
        self.inner
            .state
            .read()
            .archived
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("get_archived", id))
    }

    /// Record and state for `id` in whichever collection holds it
    pub fn lookup(&self, id: &str) -> Result<(PeerRecord, PeerState)> {
        self.inner
            .state
            .read()
            .lookup(id)
            .map(|(r, s)| (r.clone(), s))
            .ok_or_else(|| Error::not_found("lookup", id))
    }

    pub fn list_active(&self) -> Vec<PeerRecord> {
        self.inner.state.read().active.to_vec()
    }

    pub fn list_archived(&self) -> Vec<PeerRecord> {
        self.inner.state.read().archived.to_vec()
    }

    pub fn put_active(&self, record: PeerRecord) -> Result<()> {
        self.transact(|txn| txn.put_active(record))
    }

    pub fn put_archived(&self, record: PeerRecord) -> Result<()> {
        self.transact(|txn| {
            txn.put_archived(record);
            Ok(())
        })
    }

    pub fn remove_active(&self, id: &str) -> Result<PeerRecord> {
        self.transact(|txn| {
            txn.remove_active(id)
                .ok_or_else(|| Error::not_found("remove_active", id))
        })
    }

    pub fn remove_archived(&self, id: &str) -> Result<PeerRecord> {
        self.transact(|txn| {
            txn.remove_archived(id)
                .ok_or_else(|| Error::not_found("remove_archived", id))
        })
    }

    /// Run `f` as one exclusive read-modify-write cycle
    ///
    /// If `f` fails, or a file cannot be written, the in-memory state is left
    /// exactly as it was.
    pub fn transact<R>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.state.write();
        let mut txn = StoreTxn {
            state: guard.clone(),
            allocator: &self.inner.allocator,
            dirty: Dirty::default(),
        };

        let out = f(&mut txn)?;
        if txn.dirty.any() {
            self.persist(&txn.state, txn.dirty)?;
            *guard = txn.state;
        }
        Ok(out)
    }

    /// Current admin list, read fresh from disk
    pub fn admins(&self) -> Result<AdminSet> {
        let path = self.inner.dir.join(ADMINS_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::StoreCorrupt {
                path,
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AdminSet::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the touched files. The cursor goes first so an interrupted
    /// allocation never hands the same address out twice; a collection that
    /// gained a record is written before one that lost it, so an interrupted
    /// move leaves a duplicate (resolved on load) rather than a lost record.
    fn persist(&self, state: &StoreState, dirty: Dirty) -> Result<()> {
        let dir = &self.inner.dir;

        if dirty.cursor {
            let cursor = CursorFile {
                last_ip: Some(state.cursor),
                last_id: Some(state.last_id),
            };
            write_json(&dir.join(CURSOR_FILE), &cursor)?;
        }

        let archived_first = dirty.archived_gained && !dirty.active_gained;
        let mut order = [
            (ACTIVE_FILE, dirty.active, &state.active),
            (ARCHIVE_FILE, dirty.archived, &state.archived),
        ];
        if archived_first {
            order.swap(0, 1);
        }
        for (name, touched, collection) in order {
            if touched {
                write_json(&dir.join(name), collection)?;
            }
        }

        debug!("Persisted store ({:?})", dirty);
        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

fn load_state(dir: &Path, allocator: &Allocator, policy: CorruptPolicy) -> Result<(StoreState, bool)> {
    let mut needs_rewrite = false;

    let mut active: PeerCollection = read_json(&dir.join(ACTIVE_FILE), policy, &mut needs_rewrite)?;
    let mut archived: PeerCollection = read_json(&dir.join(ARCHIVE_FILE), policy, &mut needs_rewrite)?;
    let cursor_file: CursorFile = read_json(&dir.join(CURSOR_FILE), policy, &mut needs_rewrite)?;

    // An ID in both files means a move was interrupted between writes
    let duplicated: Vec<PeerId> = active
        .ids()
        .filter(|id| archived.contains(id))
        .map(str::to_string)
        .collect();
    for id in duplicated {
        let (Some(a), Some(b)) = (active.get(&id), archived.get(&id)) else {
            continue;
        };
        if a.created_at > b.created_at {
            warn!("Peer {} found in both stores; keeping the newer active copy", id);
            archived.remove(&id);
        } else {
            warn!("Peer {} found in both stores; keeping the archived copy", id);
            active.remove(&id);
        }
        needs_rewrite = true;
    }

    let highest_id = max_id_suffix(active.ids().chain(archived.ids()));
    let last_id = match cursor_file.last_id {
        Some(n) if n >= highest_id => n,
        Some(n) => {
            warn!("ID counter {} is behind existing peer id{}; advancing", n, highest_id);
            needs_rewrite = true;
            highest_id
        }
        None => {
            needs_rewrite = true;
            highest_id
        }
    };

    // Never behind an address already handed out in this subnet
    let highest_ip = active
        .iter()
        .chain(archived.iter())
        .map(|r| r.address)
        .filter(|ip| allocator.subnet().contains(*ip))
        .chain(std::iter::once(allocator.first_cursor()))
        .max()
        .unwrap_or_else(|| allocator.first_cursor());
    let cursor = match cursor_file.last_ip {
        Some(ip) if ip >= highest_ip => ip,
        Some(ip) => {
            warn!("Address cursor {} is behind issued address {}; advancing", ip, highest_ip);
            needs_rewrite = true;
            highest_ip
        }
        None => {
            needs_rewrite = true;
            highest_ip
        }
    };

    Ok((
        StoreState {
            active,
            archived,
            cursor,
            last_id,
        },
        needs_rewrite,
    ))
}

fn read_json<T>(path: &Path, policy: CorruptPolicy, needs_rewrite: &mut bool) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            *needs_rewrite = true;
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        *needs_rewrite = true;
        return Ok(T::default());
    }

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(value),
        Err(e) => match policy {
            CorruptPolicy::Fail => Err(Error::StoreCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            CorruptPolicy::Quarantine => {
                let aside = quarantine_path(path);
                std::fs::rename(path, &aside)?;
                error!(
                    "Store file {:?} is corrupt ({}); moved to {:?} and starting empty",
                    path, e, aside
                );
                *needs_rewrite = true;
                Ok(T::default())
            }
        },
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    path.with_file_name(format!("{}.corrupt-{}", name, stamp))
}

/// Replace `path` with the pretty-printed JSON of `value`
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidConfig(format!("store path {:?} has no parent", path)))?;
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    // NamedTempFile is created with mode 0600, which the rename keeps
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
