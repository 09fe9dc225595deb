//! Identity store: the persisted sid/nid pairing for one controller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::datastore::{Datastore, DatastoreValue};
use super::twinkey::{TwinKeyDict, TwinKeyError};
use crate::{Error, ErrorKind, Result, GENERATED_ID_PREFIX, SERVICE_NAMESPACE, SYS_OBJECT_KEYS,
            USER_NID_START};

/// Quiet period between a change and its flush.
pub const FLUSH_DELAY: Duration = Duration::from_secs(5);
/// Budget for the final flush on shutdown.
pub const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for writers waiting on the initial load.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// One persisted identity entry
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
struct BlockEntryDoc {
    keys: (String, u16),
    data: Value,
}

#[derive(Default)]
struct FlushState {
    changed: bool,
    stop: bool,
}

/// Wakes the flusher on changes and shutdown.
#[derive(Default)]
struct FlushSignal {
    state: Mutex<FlushState>,
    cond: Condvar,
}

impl FlushSignal {
    fn mark_changed(&self) {
        self.state.lock().expect("flush lock poisoned").changed = true;
        self.cond.notify_all();
    }

    fn request_stop(&self) {
        self.state.lock().expect("flush lock poisoned").stop = true;
        self.cond.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.state.lock().expect("flush lock poisoned").stop
    }

    fn take_changed(&self) -> bool {
        let mut state = self.state.lock().expect("flush lock poisoned");
        std::mem::take(&mut state.changed)
    }

    /// Blocks until a change or stop arrives; returns the stop flag.
    fn wait_for_work(&self) -> bool {
        let mut state = self.state.lock().expect("flush lock poisoned");
        while !state.changed && !state.stop {
            state = self.cond.wait(state).expect("flush lock poisoned");
        }
        state.stop
    }

    /// Sleeps for the quiet period, waking early on stop.
    fn sleep_unless_stopped(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock().expect("flush lock poisoned");
        while !state.stop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .expect("flush lock poisoned");
            state = next;
        }
    }
}

/// Tracks whether the initial load has completed.
#[derive(Default)]
struct ReadyFlag {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ReadyFlag {
    fn set(&self) {
        *self.state.lock().expect("ready lock poisoned") = true;
        self.cond.notify_all();
    }

    fn clear(&self) {
        *self.state.lock().expect("ready lock poisoned") = false;
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.state.lock().expect("ready lock poisoned");
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(ready, deadline - now)
                .expect("ready lock poisoned");
            ready = next;
        }
        true
    }
}

/// Bidirectional, persisted map between block string ids and numeric ids.
///
/// Mutations mark the store dirty; an owned flusher task coalesces dirty
/// events and writes the full document after a quiet period. Reads are
/// lock-free from the caller's perspective (a shared `RwLock` read).
///
/// Default system entries are re-inserted on every load, so lookups for
/// system blocks never fail.
pub struct BlockStore {
    datastore: Arc<dyn Datastore>,
    dict: RwLock<TwinKeyDict<String, u16, Value>>,
    doc_id: Mutex<Option<String>>,
    next_nid: AtomicU32,
    signal: FlushSignal,
    ready: ReadyFlag,
}

impl BlockStore {
    /// Creates a store seeded with the default system entries.
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        let store = Self {
            datastore,
            dict: RwLock::new(TwinKeyDict::new()),
            doc_id: Mutex::new(None),
            next_nid: AtomicU32::new(USER_NID_START as u32),
            signal: FlushSignal::default(),
            ready: ReadyFlag::default(),
        };
        store.seed_defaults();
        store
    }

    fn seed_defaults(&self) {
        let mut dict = self.dict.write().expect("block store lock poisoned");
        for (sid, nid) in SYS_OBJECT_KEYS {
            if !dict.contains(Some(&sid.to_string()), None) && !dict.contains(None, Some(&nid)) {
                let _ = dict.insert(sid.to_string(), nid, Value::Object(Default::default()));
            }
        }
    }

    fn map_twinkey_err(err: TwinKeyError, context: &str) -> Error {
        let kind = match err {
            TwinKeyError::LeftNotFound => ErrorKind::UnknownSid,
            TwinKeyError::RightNotFound => ErrorKind::UnknownNid,
            TwinKeyError::DuplicateLeft => ErrorKind::DuplicateSid,
            TwinKeyError::DuplicateRight => ErrorKind::DuplicateNid,
            TwinKeyError::NullKeys | TwinKeyError::Mismatch => ErrorKind::Failure,
        };
        Error::new(kind, format!("{context}: {err}"))
    }

    /// Blocks until the initial load completed.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        if self.ready.wait(timeout) {
            Ok(())
        } else {
            Err(Error::timeout("block store not ready"))
        }
    }

    /// Loads the identity document for a controller.
    ///
    /// Load errors are not fatal: the store continues with defaults only,
    /// and stays unwritable until a later load succeeds.
    pub fn load(&self, device_id: &str) {
        let doc_id = format!("{device_id}-blocks-db");

        self.ready.clear();
        *self.doc_id.lock().expect("doc id lock poisoned") = None;

        let mut data: Vec<BlockEntryDoc> = vec![];
        match self.datastore.get(SERVICE_NAMESPACE, &doc_id) {
            Ok(doc) => {
                *self.doc_id.lock().expect("doc id lock poisoned") = Some(doc_id);
                if let Some(doc) = doc {
                    data = doc
                        .content
                        .get("data")
                        .cloned()
                        .map(|raw| serde_json::from_value(raw).unwrap_or_default())
                        .unwrap_or_default();
                }
                log::info!("loaded {} block identity entries", data.len());
            }
            Err(err) => log::warn!("block store load error: {err}"),
        }

        {
            let mut dict = self.dict.write().expect("block store lock poisoned");
            dict.clear();
            for entry in data {
                let (sid, nid) = entry.keys;
                if let Err(err) = dict.insert(sid.clone(), nid, entry.data) {
                    log::warn!("dropping stored entry [{sid}, {nid}]: {err}");
                }
            }
        }
        self.seed_defaults();
        self.bump_next_nid();
        self.ready.set();
    }

    fn bump_next_nid(&self) {
        let dict = self.dict.read().expect("block store lock poisoned");
        let highest = dict
            .iter()
            .map(|entry| entry.right as u32 + 1)
            .max()
            .unwrap_or(0);
        let floor = highest.max(USER_NID_START as u32);
        self.next_nid.fetch_max(floor, Ordering::SeqCst);
    }

    /// Writes the full identity document to the datastore.
    pub fn write(&self) -> Result<()> {
        self.wait_ready(READY_TIMEOUT)?;

        let doc_id = self
            .doc_id
            .lock()
            .expect("doc id lock poisoned")
            .clone()
            .ok_or_else(|| Error::failure("block store document id not set, load failed?"))?;

        let entries = self.entries();
        let count = entries.len();

        let mut doc = DatastoreValue::new(SERVICE_NAMESPACE, doc_id);
        doc.content
            .insert("data".into(), serde_json::to_value(entries)?);
        self.datastore.set(&doc)?;

        log::info!("saved {count} block identity entries");
        Ok(())
    }

    fn entries(&self) -> Vec<BlockEntryDoc> {
        let dict = self.dict.read().expect("block store lock poisoned");
        dict.iter()
            .map(|entry| BlockEntryDoc {
                keys: (entry.left.clone(), entry.right),
                data: entry.value.clone(),
            })
            .collect()
    }

    /// Resolves an entry by either or both keys, returning the full pair.
    pub fn access(&self, sid: Option<&str>, nid: Option<u16>) -> Result<(String, u16)> {
        let dict = self.dict.read().expect("block store lock poisoned");
        let sid = sid.map(|s| s.to_string());
        dict.get(sid.as_ref(), nid.as_ref())
            .map(|entry| (entry.left.clone(), entry.right))
            .map_err(|err| Self::map_twinkey_err(err, "identity lookup failed"))
    }

    /// Gets the string id paired with a numeric id.
    pub fn sid_of(&self, nid: u16) -> Option<String> {
        let dict = self.dict.read().expect("block store lock poisoned");
        dict.left_key(&nid).cloned()
    }

    /// Gets the numeric id paired with a string id.
    pub fn nid_of(&self, sid: &str) -> Option<u16> {
        let dict = self.dict.read().expect("block store lock poisoned");
        dict.right_key(&sid.to_string()).copied()
    }

    /// Inserts a new identity pair.
    pub fn insert(&self, sid: &str, nid: u16, data: Value) -> Result<()> {
        {
            let mut dict = self.dict.write().expect("block store lock poisoned");
            dict.insert(sid.to_string(), nid, data)
                .map_err(|err| Self::map_twinkey_err(err, "identity insert failed"))?;
        }
        self.next_nid
            .fetch_max(nid as u32 + 1, Ordering::SeqCst);
        self.signal.mark_changed();
        Ok(())
    }

    /// Assigns a fresh numeric id to a generated string id and stores the pair.
    ///
    /// Assigned ids are drawn from a monotone counter and never drop below
    /// [USER_NID_START].
    pub fn assign_nid(&self, sid: &str) -> Result<u16> {
        if !sid.starts_with(GENERATED_ID_PREFIX) {
            return Err(Error::new(
                ErrorKind::UnknownLink,
                format!("'{sid}' does not name a stored block"),
            ));
        }

        let nid = self.next_nid.fetch_add(1, Ordering::SeqCst);
        let nid = u16::try_from(nid)
            .map_err(|_| Error::new(ErrorKind::OutOfRange, "numeric id space exhausted"))?;

        self.insert(sid, nid, Value::Object(Default::default()))?;
        Ok(nid)
    }

    /// Stores a generated string id for a block first observed by numeric id.
    pub fn register_discovered(&self, nid: u16) -> String {
        if let Some(sid) = self.sid_of(nid) {
            return sid;
        }

        let sid = format!("{GENERATED_ID_PREFIX}{nid}");
        if let Err(err) = self.insert(&sid, nid, Value::Object(Default::default())) {
            log::warn!("could not register discovered block {nid}: {err}");
        }
        sid
    }

    /// Renames an entry; partial keys are permitted on either side.
    pub fn rename(
        &self,
        old: (Option<&str>, Option<u16>),
        new: (Option<&str>, Option<u16>),
    ) -> Result<()> {
        {
            let mut dict = self.dict.write().expect("block store lock poisoned");
            let old_sid = old.0.map(|s| s.to_string());
            let new_sid = new.0.map(|s| s.to_string());
            dict.rename(
                (old_sid.as_ref(), old.1.as_ref()),
                (new_sid.as_ref(), new.1.as_ref()),
            )
            .map_err(|err| Self::map_twinkey_err(err, "identity rename failed"))?;
        }
        self.signal.mark_changed();
        Ok(())
    }

    /// Deletes the entry matched by either key.
    pub fn delete(&self, sid: Option<&str>, nid: Option<u16>) -> Result<()> {
        {
            let mut dict = self.dict.write().expect("block store lock poisoned");
            let sid = sid.map(|s| s.to_string());
            dict.remove(sid.as_ref(), nid.as_ref())
                .map_err(|err| Self::map_twinkey_err(err, "identity delete failed"))?;
        }
        self.signal.mark_changed();
        Ok(())
    }

    /// Removes every user entry, keeping the default system entries.
    pub fn clear(&self) {
        {
            let mut dict = self.dict.write().expect("block store lock poisoned");
            dict.clear();
        }
        self.seed_defaults();
        self.signal.mark_changed();
    }

    /// Gets the number of stored entries.
    pub fn len(&self) -> usize {
        self.dict.read().expect("block store lock poisoned").len()
    }

    /// Gets whether the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests flusher shutdown.
    pub fn shutdown(&self) {
        self.signal.request_stop();
    }

    /// Runs the flusher until [shutdown](Self::shutdown).
    ///
    /// Coalesces dirty events with a quiet period, and issues one final
    /// bounded flush when stopping so a fast shutdown still persists the
    /// latest state.
    pub fn run_flusher(self: &Arc<Self>) {
        loop {
            let stopping = self.signal.wait_for_work();
            if !stopping {
                self.signal.sleep_unless_stopped(FLUSH_DELAY);
            }

            if self.signal.take_changed() {
                if self.signal.stop_requested() {
                    self.final_flush();
                } else if let Err(err) = self.write() {
                    log::warn!("block store flush failed: {err}");
                    self.signal.mark_changed();
                    self.signal.sleep_unless_stopped(FLUSH_DELAY);
                }
            }

            if self.signal.stop_requested() {
                return;
            }
        }
    }

    /// Final flush, shielded from shutdown by its own bounded wait.
    fn final_flush(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let _ = tx.send(store.write());
        });

        match rx.recv_timeout(SHUTDOWN_WRITE_TIMEOUT) {
            Ok(Ok(())) => (),
            Ok(Err(err)) => log::warn!("shutdown flush failed: {err}"),
            Err(_) => log::warn!("shutdown flush timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDatastore;

    fn store_with_doc() -> (Arc<MemDatastore>, BlockStore) {
        let datastore = Arc::new(MemDatastore::new());

        let mut doc = DatastoreValue::new(SERVICE_NAMESPACE, "1234-blocks-db");
        doc.content.insert(
            "data".into(),
            serde_json::json!([
                { "keys": ["kettle-sensor", 100], "data": {} },
                { "keys": ["kettle-pid", 101], "data": {} },
            ]),
        );
        datastore.set(&doc).unwrap();

        let store = BlockStore::new(datastore.clone());
        (datastore, store)
    }

    #[test]
    fn test_defaults_seeded_without_load() {
        let store = BlockStore::new(Arc::new(MemDatastore::new()));
        assert_eq!(store.nid_of("SystemInfo"), Some(2));
        assert_eq!(store.sid_of(19).as_deref(), Some("SparkPins"));
        assert_eq!(store.len(), SYS_OBJECT_KEYS.len());
    }

    #[test]
    fn test_load_merges_defaults() {
        let (_, store) = store_with_doc();
        store.load("1234");

        assert_eq!(store.nid_of("kettle-sensor"), Some(100));
        assert_eq!(store.nid_of("kettle-pid"), Some(101));
        // Defaults re-inserted after replacement
        assert_eq!(store.nid_of("SystemInfo"), Some(2));
        store.wait_ready(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_assign_nid_is_monotone() {
        let (_, store) = store_with_doc();
        store.load("1234");

        let first = store.assign_nid("New|one").unwrap();
        let second = store.assign_nid("New|two").unwrap();
        assert!(first >= USER_NID_START);
        assert!(second > first);

        // Highest loaded nid was 101, so assignment starts above it
        assert!(first > 101);
    }

    #[test]
    fn test_assign_refuses_plain_sids() {
        let store = BlockStore::new(Arc::new(MemDatastore::new()));
        let err = store.assign_nid("kettle").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownLink);
    }

    #[test]
    fn test_rename_collision() {
        let (_, store) = store_with_doc();
        store.load("1234");

        let err = store
            .rename((Some("kettle-sensor"), None), (Some("kettle-pid"), None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateSid);

        // Unchanged on failure
        assert_eq!(store.nid_of("kettle-sensor"), Some(100));
        assert_eq!(store.nid_of("kettle-pid"), Some(101));
    }

    #[test]
    fn test_write_persists_document() {
        let (datastore, store) = store_with_doc();
        store.load("1234");

        store.insert("fridge-sensor", 150, Value::Object(Default::default())).unwrap();
        store.write().unwrap();

        let doc = datastore.get(SERVICE_NAMESPACE, "1234-blocks-db").unwrap().unwrap();
        let entries: Vec<BlockEntryDoc> =
            serde_json::from_value(doc.content["data"].clone()).unwrap();
        assert!(entries
            .iter()
            .any(|e| e.keys == ("fridge-sensor".to_string(), 150)));
    }

    #[test]
    fn test_write_without_load_fails() {
        let store = BlockStore::new(Arc::new(MemDatastore::new()));
        // Ready flag is never set before the first load
        let err = store.wait_ready(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_register_discovered() {
        let (_, store) = store_with_doc();
        store.load("1234");

        let sid = store.register_discovered(142);
        assert_eq!(sid, "New|142");
        assert_eq!(store.nid_of("New|142"), Some(142));

        // Known blocks keep their name
        assert_eq!(store.register_discovered(100), "kettle-sensor");
    }

    #[test]
    fn test_flusher_shutdown_flushes_pending_changes() {
        let (datastore, store) = store_with_doc();
        store.load("1234");
        let store = Arc::new(store);

        let flusher = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.run_flusher())
        };

        store.insert("late-block", 200, Value::Object(Default::default())).unwrap();
        store.shutdown();
        flusher.join().unwrap();

        let doc = datastore.get(SERVICE_NAMESPACE, "1234-blocks-db").unwrap().unwrap();
        let entries: Vec<BlockEntryDoc> =
            serde_json::from_value(doc.content["data"].clone()).unwrap();
        assert!(entries.iter().any(|e| e.keys.0 == "late-block"));
    }

    #[test]
    fn test_clear_keeps_system_entries() {
        let (_, store) = store_with_doc();
        store.load("1234");

        store.clear();
        assert_eq!(store.len(), SYS_OBJECT_KEYS.len());
        assert_eq!(store.nid_of("kettle-sensor"), None);
        assert_eq!(store.nid_of("SystemInfo"), Some(2));
    }
}
