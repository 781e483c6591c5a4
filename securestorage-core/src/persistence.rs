//! Write-through and deferred persistence on top of a [`KeyValueStore`].
//!
//! In deferred mode writes are handed to a single writer thread. Until the writer has applied a
//! write it stays in an ordered overlay, and reads consult the overlay first, so a process always
//! observes its own writes. Order is preserved: the overlay and the writer queue are appended to
//! under one lock.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::{mpsc, oneshot};

use crate::error::{SecureStorageError, SecureStorageResult};
use crate::platform::{KeyValueStore, StoreChangeListener};

const WRITER_THREAD_NAME: &str = "securestorage-writer";

/// When writes reach the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PersistenceMode {
    /// Every write returns after the backing store acknowledged it.
    Synchronous,
    /// Writes return immediately and are persisted in order by a background writer.
    Deferred,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put { name: String, value: String },
    Remove { name: String },
    Clear,
}

impl WriteOp {
    fn apply(&self, store: &dyn KeyValueStore) -> SecureStorageResult<()> {
        match self {
            Self::Put { name, value } => store.put(name.clone(), value.clone()),
            Self::Remove { name } => store.remove(name.clone()),
            Self::Clear => store.clear(),
        }
    }

    /// `Some(value)` if this write decides what `name` reads as, `None` if it is unrelated.
    fn lookup(&self, name: &str) -> Option<Option<&str>> {
        match self {
            Self::Put { name: written, value } if written == name => Some(Some(value.as_str())),
            Self::Remove { name: removed } if removed == name => Some(None),
            Self::Clear => Some(None),
            _ => None,
        }
    }

    fn replay(&self, names: &mut BTreeSet<String>) {
        match self {
            Self::Put { name, .. } => {
                names.insert(name.clone());
            }
            Self::Remove { name } => {
                names.remove(name);
            }
            Self::Clear => names.clear(),
        }
    }
}

enum Command {
    Apply(WriteOp),
    Flush(oneshot::Sender<()>),
}

struct DeferredWriter {
    pending: Arc<Mutex<VecDeque<WriteOp>>>,
    sender: mpsc::UnboundedSender<Command>,
}

/// The backing store as seen by secure storage.
///
/// Values, wrapped keys, IV records and the capability flag all go through the same instance, so
/// they share one ordering.
pub struct PersistentStore {
    backing: Arc<dyn KeyValueStore>,
    deferred: Option<DeferredWriter>,
}

impl PersistentStore {
    /// Wraps `backing` with the given persistence mode.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::Store`] if the writer thread cannot be started.
    pub fn new(
        backing: Arc<dyn KeyValueStore>,
        mode: PersistenceMode,
    ) -> SecureStorageResult<Self> {
        let deferred = match mode {
            PersistenceMode::Synchronous => None,
            PersistenceMode::Deferred => Some(spawn_writer(Arc::clone(&backing))?),
        };
        Ok(Self { backing, deferred })
    }

    /// The mode this store was created with.
    #[must_use]
    pub const fn mode(&self) -> PersistenceMode {
        if self.deferred.is_some() {
            PersistenceMode::Deferred
        } else {
            PersistenceMode::Synchronous
        }
    }

    /// Reads `name`, including writes that are still queued.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn get(&self, name: &str) -> SecureStorageResult<Option<String>> {
        if let Some(deferred) = &self.deferred {
            let pending = deferred.pending.lock().map_err(|_| poisoned())?;
            if let Some(found) = pending.iter().rev().find_map(|op| op.lookup(name)) {
                return Ok(found.map(str::to_string));
            }
        }
        self.backing.get(name.to_string())
    }

    /// Returns `true` if `name` has a value, including queued writes.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn contains(&self, name: &str) -> SecureStorageResult<bool> {
        if let Some(deferred) = &self.deferred {
            let pending = deferred.pending.lock().map_err(|_| poisoned())?;
            if let Some(found) = pending.iter().rev().find_map(|op| op.lookup(name)) {
                return Ok(found.is_some());
            }
        }
        self.backing.contains(name.to_string())
    }

    /// Lists stored names, including queued writes.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn keys(&self) -> SecureStorageResult<Vec<String>> {
        let Some(deferred) = &self.deferred else {
            return self.backing.keys();
        };
        let pending: Vec<WriteOp> = deferred
            .pending
            .lock()
            .map_err(|_| poisoned())?
            .iter()
            .cloned()
            .collect();
        let mut names: BTreeSet<String> = self.backing.keys()?.into_iter().collect();
        // Replaying writes the backing store already applied is idempotent.
        for op in &pending {
            op.replay(&mut names);
        }
        Ok(names.into_iter().collect())
    }

    /// Stores `value` under `name`.
    ///
    /// # Errors
    ///
    /// In synchronous mode propagates backing store failures. In deferred mode failures of the
    /// backing store are logged by the writer.
    pub fn put(&self, name: &str, value: &str) -> SecureStorageResult<()> {
        self.write(WriteOp::Put {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Writes `records`, then `value` under `name`.
    ///
    /// If any of these writes fails, every record is put back to what it held before, so a value
    /// already stored under `name` stays readable together with its records.
    ///
    /// # Errors
    ///
    /// Returns the first failed write, or a read failure while taking the snapshot.
    pub fn put_with_records(
        &self,
        name: &str,
        value: &str,
        records: &[(String, String)],
    ) -> SecureStorageResult<()> {
        let mut previous = Vec::with_capacity(records.len());
        for (record, _) in records {
            previous.push((record.as_str(), self.get(record)?));
        }

        let written = records
            .iter()
            .try_for_each(|(record, content)| self.put(record, content))
            .and_then(|()| self.put(name, value));
        if let Err(err) = written {
            log::warn!("Write of {name} failed, restoring {} records", previous.len());
            for (record, old) in previous {
                let restored = match old {
                    Some(old) => self.put(record, &old),
                    None => self.remove(record),
                };
                if let Err(restore_err) = restored {
                    log::error!("Could not restore {record}: {restore_err}");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes `name`. Absent names are not an error.
    ///
    /// # Errors
    ///
    /// See [`PersistentStore::put`].
    pub fn remove(&self, name: &str) -> SecureStorageResult<()> {
        self.write(WriteOp::Remove {
            name: name.to_string(),
        })
    }

    /// Removes every name.
    ///
    /// # Errors
    ///
    /// See [`PersistentStore::put`].
    pub fn clear(&self) -> SecureStorageResult<()> {
        self.write(WriteOp::Clear)
    }

    /// Blocks until every queued write has been applied to the backing store.
    ///
    /// A no-op in synchronous mode.
    ///
    /// # Errors
    ///
    /// Returns [`SecureStorageError::Store`] if the writer thread is gone.
    pub fn flush(&self) -> SecureStorageResult<()> {
        let Some(deferred) = &self.deferred else {
            return Ok(());
        };
        let (done, wait) = oneshot::channel();
        deferred
            .sender
            .send(Command::Flush(done))
            .map_err(|_| writer_gone())?;
        wait.blocking_recv().map_err(|_| writer_gone())
    }

    /// Registers a change listener on the backing store.
    pub fn register_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.backing.register_change_listener(listener);
    }

    /// Unregisters a change listener from the backing store.
    pub fn unregister_change_listener(&self, listener: Arc<dyn StoreChangeListener>) {
        self.backing.unregister_change_listener(listener);
    }

    fn write(&self, op: WriteOp) -> SecureStorageResult<()> {
        let Some(deferred) = &self.deferred else {
            return op.apply(self.backing.as_ref());
        };
        let mut pending = deferred.pending.lock().map_err(|_| poisoned())?;
        pending.push_back(op.clone());
        if deferred.sender.send(Command::Apply(op)).is_err() {
            pending.pop_back();
            return Err(writer_gone());
        }
        drop(pending);
        Ok(())
    }
}

fn spawn_writer(backing: Arc<dyn KeyValueStore>) -> SecureStorageResult<DeferredWriter> {
    let pending = Arc::new(Mutex::new(VecDeque::new()));
    let (sender, receiver) = mpsc::unbounded_channel();
    let writer_pending = Arc::clone(&pending);
    thread::Builder::new()
        .name(WRITER_THREAD_NAME.to_string())
        .spawn(move || run_writer(backing.as_ref(), &writer_pending, receiver))
        .map_err(|err| {
            SecureStorageError::Store(format!("failed to start writer thread: {err}"))
        })?;
    Ok(DeferredWriter { pending, sender })
}

fn run_writer(
    backing: &dyn KeyValueStore,
    pending: &Mutex<VecDeque<WriteOp>>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    // Ends once every sender is dropped and the queue is drained.
    while let Some(command) = receiver.blocking_recv() {
        match command {
            Command::Apply(op) => {
                if let Err(err) = op.apply(backing) {
                    log::error!("Deferred write failed: {err}");
                }
                match pending.lock() {
                    Ok(mut pending) => {
                        pending.pop_front();
                    }
                    Err(_) => {
                        log::error!("Pending write queue poisoned, stopping writer");
                        return;
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("Deferred writer finished");
}

fn poisoned() -> SecureStorageError {
    SecureStorageError::Store("pending write queue poisoned".to_string())
}

fn writer_gone() -> SecureStorageError {
    SecureStorageError::Store("deferred writer is not running".to_string())
}
