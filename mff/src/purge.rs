//! Freeze/chill purge queues, and the optional background worker thread
//! that turns scheduled purges into dictionary erasures off the writer's
//! hot path.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use chronoq_core::Config;

use crate::context::Dictionaries;

/// Tracks which ids are scheduled for eviction at which height, for both
/// the freeze (confirmed) and chill (discarded/invalidated) windows.
#[derive(Debug, Default)]
pub struct PurgeQueues {
    frozen: BTreeMap<u32, Vec<u64>>,
    chilled: BTreeMap<u32, Vec<u64>>,
    cool_height: HashMap<u64, u32>,
}

impl PurgeQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `id` for eviction `freeze_window` blocks after `height`.
    /// Undoes any prior chill first, since freeze supersedes it.
    pub fn freeze(&mut self, id: u64, height: u32) {
        self.thaw(id);
        self.frozen.entry(height).or_default().push(id);
        self.cool_height.insert(id, height);
    }

    /// Schedules `id` for eviction `chill_window` blocks after `height`.
    /// No-op if the id is already cooling (frozen or chilled).
    pub fn chill(&mut self, id: u64, height: u32) {
        if self.cool_height.contains_key(&id) {
            return;
        }
        self.chilled.entry(height).or_default().push(id);
        self.cool_height.insert(id, height);
    }

    /// Restores `id` to live status, dropping it from whichever queue it
    /// was scheduled in.
    pub fn thaw(&mut self, id: u64) {
        if let Some(height) = self.cool_height.remove(&id) {
            if let Some(v) = self.frozen.get_mut(&height) {
                v.retain(|x| *x != id);
                if v.is_empty() {
                    self.frozen.remove(&height);
                }
            }
            if let Some(v) = self.chilled.get_mut(&height) {
                v.retain(|x| *x != id);
                if v.is_empty() {
                    self.chilled.remove(&height);
                }
            }
        }
    }

    /// Advances the purge bound to `height`, removing and returning every
    /// id whose freeze/chill window has now elapsed.
    pub fn advance(&mut self, height: u32, config: &Config) -> Vec<u64> {
        let mut purged = Vec::new();
        if height >= config.freeze_window {
            let bound = height - config.freeze_window;
            let keys: Vec<u32> = self.frozen.range(..=bound).map(|(k, _)| *k).collect();
            for k in keys {
                if let Some(ids) = self.frozen.remove(&k) {
                    for id in ids {
                        self.cool_height.remove(&id);
                        purged.push(id);
                    }
                }
            }
        }
        if height >= config.chill_window {
            let bound = height - config.chill_window;
            let keys: Vec<u32> = self.chilled.range(..=bound).map(|(k, _)| *k).collect();
            for k in keys {
                if let Some(ids) = self.chilled.remove(&k) {
                    for id in ids {
                        self.cool_height.remove(&id);
                        purged.push(id);
                    }
                }
            }
        }
        purged
    }
}

struct PurgeShared {
    batches: Mutex<VecDeque<Vec<u64>>>,
    condvar: Condvar,
    shutdown: Mutex<bool>,
}

/// A background thread that drains batches of ids-to-purge and erases them
/// from the shared dictionaries, so the writer thread never blocks on a
/// dictionary erasure between appends.
pub struct PurgeWorker {
    shared: Arc<PurgeShared>,
    handle: Option<JoinHandle<()>>,
}

impl PurgeWorker {
    pub fn spawn(dictionaries: Arc<Mutex<Dictionaries>>) -> Self {
        let shared = Arc::new(PurgeShared {
            batches: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: Mutex::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || loop {
            let mut batches = worker_shared.batches.lock().unwrap();
            loop {
                if let Some(batch) = batches.pop_front() {
                    drop(batches);
                    let mut dict = dictionaries.lock().unwrap();
                    for id in batch {
                        dict.purge(id);
                    }
                    break;
                }
                if *worker_shared.shutdown.lock().unwrap() {
                    return;
                }
                batches = worker_shared.condvar.wait(batches).unwrap();
            }
        });
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Hands a batch of purge-eligible ids to the worker. Cheap no-op for
    /// an empty batch.
    pub fn submit(&self, batch: Vec<u64>) {
        if batch.is_empty() {
            return;
        }
        let mut batches = self.shared.batches.lock().unwrap();
        batches.push_back(batch);
        self.shared.condvar.notify_one();
    }
}

impl Drop for PurgeWorker {
    fn drop(&mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.condvar.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
