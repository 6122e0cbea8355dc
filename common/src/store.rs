use std::{
    collections::{HashMap, VecDeque},
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use log::debug;

use crate::error::StoreError;

pub enum LoadOutcome {
    Ready(Vec<String>),
    Pending,
}

pub trait TaskStore {
    fn load(&mut self) -> Result<LoadOutcome, StoreError>;

    fn poll_load(&mut self) -> Option<Result<Vec<String>, StoreError>> {
        None
    }

    /// Persists a newly added record. `records` is the full set, newest last.
    fn append(&mut self, records: &[String]) -> Result<(), StoreError> {
        self.save(records)
    }

    fn save(&mut self, records: &[String]) -> Result<(), StoreError>;
}

impl<S: TaskStore + ?Sized> TaskStore for Box<S> {
    fn load(&mut self) -> Result<LoadOutcome, StoreError> {
        (**self).load()
    }

    fn poll_load(&mut self) -> Option<Result<Vec<String>, StoreError>> {
        (**self).poll_load()
    }

    fn append(&mut self, records: &[String]) -> Result<(), StoreError> {
        (**self).append(records)
    }

    fn save(&mut self, records: &[String]) -> Result<(), StoreError> {
        (**self).save(records)
    }
}

pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TaskStore for FileTaskStore {
    fn load(&mut self) -> Result<LoadOutcome, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(LoadOutcome::Ready(
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(LoadOutcome::Ready(Vec::new())),
            Err(err) => Err(err.into()),
        }
    }

    fn append(&mut self, records: &[String]) -> Result<(), StoreError> {
        let Some(record) = records.last() else {
            return Ok(());
        };

        ensure_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{record}")?;
        Ok(())
    }

    fn save(&mut self, records: &[String]) -> Result<(), StoreError> {
        let mut contents = String::new();
        for record in records {
            contents.push_str(record);
            contents.push('\n');
        }
        write_atomic(&self.path, contents.as_bytes())
    }
}

pub type RemoteResult = Result<String, StoreError>;

/// Completion cell for an asynchronous remote read. The transport thread
/// fills it; the control loop takes it on a later tick.
#[derive(Clone, Default)]
pub struct LoadSlot(Arc<Mutex<Option<RemoteResult>>>);

impl LoadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, result: RemoteResult) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    pub fn take(&self) -> Option<RemoteResult> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_ready(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Retained-message reads waiting on a broker, keyed by topic.
///
/// A broker sends nothing for a topic without a retained message, so a read
/// that times out only counts as an empty set once the subscription itself
/// was acknowledged.
#[derive(Clone, Default)]
pub struct RetainedReads(Arc<Mutex<RetainedState>>);

#[derive(Default)]
struct RetainedState {
    reads: HashMap<String, RetainedRead>,
    // Topics whose subscribe packet id is not known yet, in request order.
    unassigned: VecDeque<String>,
    packets: HashMap<u32, String>,
    // Acks that beat `track_packet`, newest last.
    early_acks: VecDeque<u32>,
}

const EARLY_ACK_MEMORY: usize = 8;

struct RetainedRead {
    slot: LoadSlot,
    subscribed: bool,
}

impl RetainedReads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: &str, slot: LoadSlot) {
        self.state().reads.insert(
            topic.to_string(),
            RetainedRead {
                slot,
                subscribed: false,
            },
        );
    }

    pub fn is_pending(&self, topic: &str) -> bool {
        self.state().reads.contains_key(topic)
    }

    /// For clients that report the packet id only once the request is sent.
    /// Every subscribe must be queued, in the order it was issued.
    pub fn queue_subscribe(&self, topic: &str) {
        self.state().unassigned.push_back(topic.to_string());
    }

    pub fn subscribe_sent(&self, packet_id: u32) {
        let mut state = self.state();
        if let Some(topic) = state.unassigned.pop_front() {
            state.packets.insert(packet_id, topic);
        }
    }

    pub fn track_packet(&self, packet_id: u32, topic: &str) {
        let mut state = self.state();
        if let Some(index) = state.early_acks.iter().position(|id| *id == packet_id) {
            state.early_acks.remove(index);
            if let Some(read) = state.reads.get_mut(topic) {
                read.subscribed = true;
            }
            return;
        }
        state.packets.insert(packet_id, topic.to_string());
    }

    pub fn subscribe_acked(&self, packet_id: u32) {
        let mut state = self.state();
        let Some(topic) = state.packets.remove(&packet_id) else {
            if state.early_acks.len() == EARLY_ACK_MEMORY {
                state.early_acks.pop_front();
            }
            state.early_acks.push_back(packet_id);
            return;
        };
        if let Some(read) = state.reads.get_mut(&topic) {
            read.subscribed = true;
        }
    }

    pub fn cancel(&self, topic: &str) {
        let mut state = self.state();
        state.reads.remove(topic);
        if let Some(index) = state.unassigned.iter().rposition(|queued| queued == topic) {
            state.unassigned.remove(index);
        }
    }

    pub fn deliver(&self, topic: &str, result: RemoteResult) -> bool {
        let Some(read) = self.state().reads.remove(topic) else {
            return false;
        };
        read.slot.complete(result);
        true
    }

    pub fn expire(&self, topic: &str, waited_ms: u32) -> bool {
        let Some(read) = self.state().reads.remove(topic) else {
            return false;
        };

        if read.subscribed {
            debug!("no retained value on `{topic}`");
            read.slot.complete(Ok(String::new()));
        } else {
            read.slot.complete(Err(StoreError::Timeout(waited_ms)));
        }
        true
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RetainedState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub trait RemoteDatabase {
    fn get(&mut self, path: &str, slot: LoadSlot) -> Result<(), StoreError>;
    fn set(&mut self, path: &str, value: String) -> Result<(), StoreError>;
    fn remove(&mut self, path: &str) -> Result<(), StoreError>;
}

/// Stores the whole set as one array value, e.g. `["1|7|0|1111111|10-0-5|1|0"]`.
pub struct RemoteTaskStore<D> {
    db: D,
    path: String,
    pending: Option<LoadSlot>,
}

impl<D: RemoteDatabase> RemoteTaskStore<D> {
    pub fn new(db: D, path: impl Into<String>) -> Self {
        Self {
            db,
            path: path.into(),
            pending: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn database(&self) -> &D {
        &self.db
    }
}

impl<D: RemoteDatabase> TaskStore for RemoteTaskStore<D> {
    fn load(&mut self) -> Result<LoadOutcome, StoreError> {
        let slot = LoadSlot::new();
        self.db.get(&self.path, slot.clone())?;
        debug!("requested schedule records from `{}`", self.path);
        self.pending = Some(slot);
        Ok(LoadOutcome::Pending)
    }

    fn poll_load(&mut self) -> Option<Result<Vec<String>, StoreError>> {
        let result = self.pending.as_ref()?.take()?;
        self.pending = None;
        Some(result.and_then(|payload| decode_record_array(&payload)))
    }

    fn save(&mut self, records: &[String]) -> Result<(), StoreError> {
        if records.is_empty() {
            return self.db.remove(&self.path);
        }
        self.db.set(&self.path, encode_record_array(records)?)
    }
}

pub fn encode_record_array(records: &[String]) -> Result<String, StoreError> {
    Ok(serde_json::to_string(records)?)
}

/// An empty or `null` payload is an empty set.
pub fn decode_record_array(payload: &str) -> Result<Vec<String>, StoreError> {
    let payload = payload.trim();
    if payload.is_empty() || payload == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(payload)?)
}

pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    let temp = path.with_extension("tmp");
    fs::write(&temp, contents)?;
    fs::rename(&temp, path)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(fs::create_dir_all(parent)?),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Default)]
    pub struct MemoryStore {
        pub records: Vec<String>,
        pub saves: usize,
        pub appends: usize,
        pub fail_writes: bool,
    }

    impl MemoryStore {
        pub fn with_records(records: &[&str]) -> Self {
            Self {
                records: records.iter().map(|record| record.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    impl TaskStore for MemoryStore {
        fn load(&mut self) -> Result<LoadOutcome, StoreError> {
            Ok(LoadOutcome::Ready(self.records.clone()))
        }

        fn append(&mut self, records: &[String]) -> Result<(), StoreError> {
            self.appends += 1;
            self.save(records)
        }

        fn save(&mut self, records: &[String]) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(std::io::Error::other("flash unavailable").into());
            }
            self.saves += 1;
            self.records = records.to_vec();
            Ok(())
        }
    }

    /// Records every request; tests complete the load slots by hand.
    #[derive(Default)]
    pub struct FakeDatabase {
        pub gets: Vec<(String, LoadSlot)>,
        pub sets: Vec<(String, String)>,
        pub removes: Vec<String>,
    }

    impl FakeDatabase {
        pub fn last_slot(&self) -> &LoadSlot {
            &self.gets.last().expect("no pending get").1
        }
    }

    impl RemoteDatabase for FakeDatabase {
        fn get(&mut self, path: &str, slot: LoadSlot) -> Result<(), StoreError> {
            self.gets.push((path.to_string(), slot));
            Ok(())
        }

        fn set(&mut self, path: &str, value: String) -> Result<(), StoreError> {
            self.sets.push((path.to_string(), value));
            Ok(())
        }

        fn remove(&mut self, path: &str) -> Result<(), StoreError> {
            self.removes.push(path.to_string());
            Ok(())
        }
    }

    pub fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "garden-{name}-{}-{}",
            std::process::id(),
            fastrand::u64(..)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
