//! Durable keyed tables.
//!
//! 中文: 持久化的键值表。每张表在内存中由 `DashMap` 承载，
//! 每次写入只向日志追加一行，由后台线程落盘。
//!
//! Every table is an in-memory [`DashMap`]. A durable table additionally
//! hands one journal line per write (`{"op":"put","row":…}` or
//! `{"op":"delete","id":…}`) to a [`Persistence`] backend. The journal is
//! folded into a snapshot once it outgrows the table, so the cost of a write
//! does not depend on the table size. [`Store::memory`] tables keep no
//! journal and serialize nothing.
//!
//! [`FilePersistence`] keeps `<table>.json` (snapshot) and `<table>.jsonl`
//! (journal) under a data directory. File I/O runs on a dedicated writer
//! thread; callers only enqueue. [`Store::flush`] waits until everything
//! enqueued so far is on disk.

use crate::backup::Backup;
use crate::certificate::Certificate;
use crate::cluster::Cluster;
use crate::device::{Device, Session};
use crate::error::StoreError;
use crate::key::Key;
use crate::operation::Operation;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{hash_map, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::{mpsc, oneshot};

/// A journal is folded into a snapshot once it holds this many entries and
/// at least twice as many as the table has rows.
pub const COMPACT_MIN_ENTRIES: usize = 1024;

/// A row type stored in a [`Table`].
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn id(&self) -> &str;
}

/// What a backend holds for one table.
#[derive(Debug, Default)]
pub struct Loaded {
    pub snapshot: Option<String>,
    /// Journal lines written after the snapshot, oldest first.
    pub journal: Vec<String>,
}

/// Where row changes go.
#[async_trait]
pub trait Persistence: Send + Sync + fmt::Debug {
    fn load(&self, table: &'static str) -> Result<Loaded, StoreError>;

    /// Queues one journal line. Must not block on I/O.
    fn append(&self, table: &'static str, line: String) -> Result<(), StoreError>;

    /// Queues a snapshot that replaces the current one and empties the journal.
    fn compact(&self, table: &'static str, snapshot: String) -> Result<(), StoreError>;

    /// Resolves once everything queued before the call is durable, reporting
    /// the first write failure since the last flush.
    async fn flush(&self) -> Result<(), StoreError>;
}

enum Command {
    Append {
        table: &'static str,
        line: String,
    },
    Compact {
        table: &'static str,
        snapshot: String,
    },
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

/// `<table>.json` + `<table>.jsonl` per table under a data directory.
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
    writer: mpsc::UnboundedSender<Command>,
}

impl FilePersistence {
    /// Creates `dir` if needed and starts the writer thread. The thread exits
    /// once the last handle is dropped.
    pub fn open(dir: impl AsRef<Path>, permissions: u32) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let (writer, commands) = mpsc::unbounded_channel();
        let journal = JournalWriter {
            dir: dir.clone(),
            permissions,
            files: HashMap::new(),
            failure: None,
        };
        std::thread::Builder::new()
            .name("seal-hsm-journal".to_string())
            .spawn(move || journal.run(commands))?;
        Ok(Self { dir, writer })
    }

    fn send(&self, command: Command) -> Result<(), StoreError> {
        self.writer
            .send(command)
            .map_err(|_| StoreError::WriterStopped)
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    fn load(&self, table: &'static str) -> Result<Loaded, StoreError> {
        let snapshot = match fs::read_to_string(snapshot_path(&self.dir, table)) {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let journal = match File::open(journal_path(&self.dir, table)) {
            Ok(file) => BufReader::new(file)
                .lines()
                .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
                .collect::<io::Result<Vec<_>>>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Loaded { snapshot, journal })
    }

    fn append(&self, table: &'static str, line: String) -> Result<(), StoreError> {
        self.send(Command::Append { table, line })
    }

    fn compact(&self, table: &'static str, snapshot: String) -> Result<(), StoreError> {
        self.send(Command::Compact { table, snapshot })
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Flush(done))?;
        wait.await.map_err(|_| StoreError::WriterStopped)?
    }
}

fn snapshot_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.json"))
}

fn journal_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.jsonl"))
}

/// Owns the open journal files. Runs on its own thread.
struct JournalWriter {
    dir: PathBuf,
    permissions: u32,
    files: HashMap<&'static str, File>,
    // First failure since the last flush.
    failure: Option<StoreError>,
}

impl JournalWriter {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.blocking_recv() {
            let result = match command {
                Command::Append { table, line } => self.append(table, &line),
                Command::Compact { table, snapshot } => self.compact(table, &snapshot),
                Command::Flush(done) => {
                    let synced = self.sync();
                    let result = match self.failure.take() {
                        Some(e) => Err(e),
                        None => synced,
                    };
                    let _ = done.send(result);
                    continue;
                }
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "journal write failed");
                self.failure.get_or_insert(e);
            }
        }
        tracing::debug!(dir = %self.dir.display(), "journal writer stopped");
    }

    fn journal(&mut self, table: &'static str) -> Result<&mut File, StoreError> {
        match self.files.entry(table) {
            hash_map::Entry::Occupied(open) => Ok(open.into_mut()),
            hash_map::Entry::Vacant(slot) => {
                let path = journal_path(&self.dir, table);
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                set_permissions(&path, self.permissions)?;
                Ok(slot.insert(file))
            }
        }
    }

    fn append(&mut self, table: &'static str, line: &str) -> Result<(), StoreError> {
        let file = self.journal(table)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn compact(&mut self, table: &'static str, snapshot: &str) -> Result<(), StoreError> {
        let path = snapshot_path(&self.dir, table);
        // 中文: 原子写入，防止在写入中断时数据损坏。
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, snapshot)?;
        set_permissions(&temp_path, self.permissions)?;
        fs::rename(&temp_path, &path)?;

        // Replaying a stale journal over the new snapshot is harmless, so a
        // crash between the rename and the truncation loses nothing.
        self.files.remove(table);
        let journal = journal_path(&self.dir, table);
        let file = File::create(&journal)?;
        set_permissions(&journal, self.permissions)?;
        self.files.insert(table, file);
        tracing::debug!(table, "journal compacted");
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StoreError> {
        for file in self.files.values() {
            file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), StoreError> {
    Ok(())
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry<R> {
    Put { row: R },
    Delete { id: String },
}

struct Journal {
    persistence: Arc<dyn Persistence>,
    // Writers hold it shared while they mutate and enqueue; compaction holds
    // it exclusively so its snapshot covers every entry it discards.
    gate: RwLock<()>,
    pending: AtomicUsize,
}

/// A concurrent table of `T` keyed by [`Record::id`].
pub struct Table<T: Record> {
    rows: DashMap<String, T>,
    journal: Option<Journal>,
}

impl<T: Record> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("table", &T::TABLE)
            .field("rows", &self.rows.len())
            .field("durable", &self.journal.is_some())
            .finish()
    }
}

impl<T: Record> Table<T> {
    fn in_memory() -> Self {
        Self {
            rows: DashMap::new(),
            journal: None,
        }
    }

    fn open(persistence: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let Loaded { snapshot, journal } = persistence.load(T::TABLE)?;
        let rows = DashMap::new();
        if let Some(snapshot) = snapshot {
            let loaded: Vec<T> = serde_json::from_str(&snapshot)?;
            for row in loaded {
                rows.insert(row.id().to_string(), row);
            }
        }

        let replayed = journal.len();
        for (index, line) in journal.iter().enumerate() {
            match serde_json::from_str::<JournalEntry<T>>(line) {
                Ok(JournalEntry::Put { row }) => {
                    rows.insert(row.id().to_string(), row);
                }
                Ok(JournalEntry::Delete { id }) => {
                    rows.remove(&id);
                }
                // An append cut short by a crash.
                Err(e) if index + 1 == replayed => {
                    tracing::warn!(table = T::TABLE, error = %e, "discarding torn journal tail");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let table = Self {
            rows,
            journal: Some(Journal {
                persistence,
                gate: RwLock::new(()),
                pending: AtomicUsize::new(replayed),
            }),
        };
        if replayed > 0 {
            table.compact()?;
        }
        tracing::debug!(
            table = T::TABLE,
            rows = table.rows.len(),
            replayed,
            "table loaded"
        );
        Ok(table)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.rows.get(id).map(|row| row.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Inserts or replaces `row`.
    pub fn insert(&self, row: T) -> Result<(), StoreError> {
        {
            let _gate = self.write_gate();
            let line = self.put_line(&row)?;
            let entry = self.rows.entry(row.id().to_string());
            self.append(line)?;
            entry.insert(row);
        }
        self.maybe_compact()
    }

    /// Applies `f` to the row with `id` under its entry lock. Returns the
    /// updated row, or `None` if there is no such row.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Option<T>, StoreError>
    where
        F: FnOnce(&mut T),
    {
        self.try_update(id, |row| {
            f(row);
            Ok::<(), StoreError>(())
        })
    }

    /// Like [`Table::update`], but `f` may reject the change. Nothing is
    /// written when `f` fails.
    pub fn try_update<F, E>(&self, id: &str, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
        E: From<StoreError>,
    {
        let updated = {
            let _gate = self.write_gate();
            match self.rows.get_mut(id) {
                Some(mut row) => {
                    let mut candidate = row.value().clone();
                    f(&mut candidate)?;
                    let line = self.put_line(&candidate)?;
                    self.append(line)?;
                    *row.value_mut() = candidate.clone();
                    Some(candidate)
                }
                None => None,
            }
        };
        if updated.is_some() {
            self.maybe_compact()?;
        }
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<Option<T>, StoreError> {
        let removed = {
            let _gate = self.write_gate();
            match self.rows.entry(id.to_string()) {
                Entry::Occupied(occupied) => {
                    let line = match self.journal {
                        Some(_) => Some(serde_json::to_string(&JournalEntry::<&T>::Delete {
                            id: id.to_string(),
                        })?),
                        None => None,
                    };
                    self.append(line)?;
                    Some(occupied.remove())
                }
                Entry::Vacant(_) => None,
            }
        };
        if removed.is_some() {
            self.maybe_compact()?;
        }
        Ok(removed)
    }

    pub fn values(&self) -> Vec<T> {
        self.rows.iter().map(|row| row.value().clone()).collect()
    }

    pub fn filter<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.rows
            .iter()
            .filter(|row| predicate(row.value()))
            .map(|row| row.value().clone())
            .collect()
    }

    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        self.rows.iter().filter(|row| predicate(row.value())).count()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Folds the journal into a fresh snapshot. No-op for memory tables.
    pub fn compact(&self) -> Result<(), StoreError> {
        match &self.journal {
            Some(journal) => self.compact_if(journal, 0),
            None => Ok(()),
        }
    }

    fn write_gate(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.journal
            .as_ref()
            .map(|journal| journal.gate.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn put_line(&self, row: &T) -> Result<Option<String>, StoreError> {
        match self.journal {
            Some(_) => Ok(Some(serde_json::to_string(&JournalEntry::Put { row })?)),
            None => Ok(None),
        }
    }

    fn append(&self, line: Option<String>) -> Result<(), StoreError> {
        if let (Some(journal), Some(line)) = (&self.journal, line) {
            journal.persistence.append(T::TABLE, line)?;
            journal.pending.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn maybe_compact(&self) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let threshold = COMPACT_MIN_ENTRIES.max(self.rows.len().saturating_mul(2));
        if journal.pending.load(Ordering::Relaxed) < threshold {
            return Ok(());
        }
        self.compact_if(journal, threshold)
    }

    fn compact_if(&self, journal: &Journal, threshold: usize) -> Result<(), StoreError> {
        let _gate = journal
            .gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another writer may have compacted while we waited.
        let pending = journal.pending.load(Ordering::Relaxed);
        if pending < threshold {
            return Ok(());
        }
        let mut rows = self.values();
        rows.sort_by(|a, b| a.id().cmp(b.id()));
        let snapshot = serde_json::to_string(&rows)?;
        journal.persistence.compact(T::TABLE, snapshot)?;
        journal.pending.store(0, Ordering::Relaxed);
        tracing::debug!(table = T::TABLE, rows = rows.len(), folded = pending, "compaction queued");
        Ok(())
    }
}

/// All tables of the subsystem.
#[derive(Debug)]
pub struct Store {
    pub devices: Table<Device>,
    pub keys: Table<Key>,
    pub certificates: Table<Certificate>,
    pub sessions: Table<Session>,
    pub clusters: Table<Cluster>,
    pub operations: Table<Operation>,
    pub backups: Table<Backup>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl Store {
    /// A store that lives and dies with the process. Writes serialize nothing.
    pub fn memory() -> Self {
        Self {
            devices: Table::in_memory(),
            keys: Table::in_memory(),
            certificates: Table::in_memory(),
            sessions: Table::in_memory(),
            clusters: Table::in_memory(),
            operations: Table::in_memory(),
            backups: Table::in_memory(),
            persistence: None,
        }
    }

    /// A file-backed store under `dir`, reloading whatever is there.
    pub fn open(dir: impl AsRef<Path>, permissions: u32) -> Result<Self, StoreError> {
        let persistence = FilePersistence::open(dir, permissions)?;
        Self::with_persistence(Arc::new(persistence))
    }

    pub fn with_persistence(persistence: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        Ok(Self {
            devices: Table::open(persistence.clone())?,
            keys: Table::open(persistence.clone())?,
            certificates: Table::open(persistence.clone())?,
            sessions: Table::open(persistence.clone())?,
            clusters: Table::open(persistence.clone())?,
            operations: Table::open(persistence.clone())?,
            backups: Table::open(persistence.clone())?,
            persistence: Some(persistence),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.persistence.is_some()
    }

    /// Waits until every write made so far is on disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        match &self.persistence {
            Some(persistence) => persistence.flush().await,
            None => Ok(()),
        }
    }
}
