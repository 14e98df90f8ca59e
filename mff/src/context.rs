//! Owns the log's in-memory dictionaries, clock, chain mirror, and purge
//! queues — the state threaded explicitly through every encode/decode
//! call instead of any process-global slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chronoq_core::errors::{ChronoqError, Result};
use chronoq_core::hash::TxHash;
use chronoq_core::Config;
use chronoq_cq::store::Db;

use crate::block::ChainMirror;
use crate::object::TxObject;
use crate::purge::{PurgeQueues, PurgeWorker};

/// Where a live record currently sits relative to the mempool and chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    InMempool,
    Confirmed,
    Discarded,
    Invalid,
}

/// One dictionary-resident record: the object itself plus the bookkeeping
/// needed to decide how it may be referenced and when it falls out of the
/// purge window.
#[derive(Debug, Clone)]
pub struct LiveRecord {
    pub object: TxObject,
    pub sid: u64,
    pub stored_cluster: u64,
    pub location: Location,
    pub cool_height: u32,
}

/// The forward (id → record) and reverse (hash → id) dictionaries. Kept
/// behind a shared lock so the purge worker can erase entries without
/// coordinating through the writer thread directly.
#[derive(Debug, Default)]
pub struct Dictionaries {
    pub forward: HashMap<u64, LiveRecord>,
    pub reverse: HashMap<TxHash, u64>,
}

impl Dictionaries {
    pub fn purge(&mut self, id: u64) {
        if let Some(rec) = self.forward.remove(&id) {
            self.reverse.remove(&rec.object.hash);
        }
    }
}

pub struct SerializationContext {
    pub db: Db,
    pub config: Config,
    pub chain: ChainMirror,
    dictionaries: Arc<Mutex<Dictionaries>>,
    queues: PurgeQueues,
    worker: Option<PurgeWorker>,
    last_time: u64,
}

impl SerializationContext {
    pub fn new(db: Db, config: Config) -> Self {
        let chain = ChainMirror::new(config.max_blocks);
        Self {
            db,
            config,
            chain,
            dictionaries: Arc::new(Mutex::new(Dictionaries::default())),
            queues: PurgeQueues::new(),
            worker: None,
            last_time: 0,
        }
    }

    /// Moves purge-queue erasures onto a background thread instead of
    /// performing them inline on whichever thread calls `purge_to`.
    pub fn spawn_purge_worker(&mut self) {
        self.worker = Some(PurgeWorker::spawn(Arc::clone(&self.dictionaries)));
    }

    pub fn current_time(&self) -> u64 {
        self.last_time
    }

    /// Advances the clock for a write; refuses any timestamp older than
    /// the last persisted one.
    pub fn advance_time_for_write(&mut self, new_time: u64) -> Result<()> {
        if new_time < self.last_time {
            return Err(ChronoqError::invariant(format!(
                "event timestamp {new_time} precedes last persisted timestamp {}",
                self.last_time
            )));
        }
        self.last_time = new_time;
        Ok(())
    }

    /// Advances the clock for a read given a decoded delta; rejects an
    /// implausibly large jump as a corruption signal.
    pub fn advance_time_for_read(&mut self, delta: u64) -> Result<u64> {
        if delta > self.config.future_timestamp_sanity_secs {
            return Err(ChronoqError::format(format!(
                "timestamp delta {delta}s exceeds sanity threshold {}s",
                self.config.future_timestamp_sanity_secs
            )));
        }
        self.last_time += delta;
        Ok(self.last_time)
    }

    pub fn lookup_live(&self, hash: &TxHash) -> Option<u64> {
        self.dictionaries.lock().unwrap().reverse.get(hash).copied()
    }

    pub fn get(&self, id: u64) -> Option<LiveRecord> {
        self.dictionaries.lock().unwrap().forward.get(&id).cloned()
    }

    /// Number of objects currently live in the forward dictionary, for
    /// reporting purposes only.
    pub fn dictionary_len(&self) -> usize {
        self.dictionaries.lock().unwrap().forward.len()
    }

    pub fn register(&mut self, object: TxObject, sid: u64, location: Location) {
        let cluster = self.db.current_cluster();
        let hash = object.hash;
        let mut dict = self.dictionaries.lock().unwrap();
        dict.forward.insert(
            sid,
            LiveRecord {
                object,
                sid,
                stored_cluster: cluster,
                location,
                cool_height: 0,
            },
        );
        dict.reverse.insert(hash, sid);
    }

    pub fn set_location(&mut self, id: u64, location: Location) {
        let mut dict = self.dictionaries.lock().unwrap();
        if let Some(rec) = dict.forward.get_mut(&id) {
            rec.location = location;
        }
    }

    /// Drops `id` from both dictionaries immediately, bypassing the purge
    /// queues. Used when a live object is re-recorded after crossing a
    /// cluster boundary: the old sid can never be referred to again, so
    /// there is no reason to wait for its freeze/chill window to elapse.
    pub fn forget(&mut self, id: u64) {
        self.dictionaries.lock().unwrap().purge(id);
    }

    /// Whether `id` was stored in the currently open cluster — the
    /// condition a "known" reference must satisfy. A transaction that
    /// survived across a cluster boundary must be re-recorded in full
    /// instead.
    pub fn is_known_in_current_cluster(&self, id: u64) -> bool {
        self.dictionaries
            .lock()
            .unwrap()
            .forward
            .get(&id)
            .map(|rec| rec.stored_cluster == self.db.current_cluster())
            .unwrap_or(false)
    }

    pub fn freeze(&mut self, id: u64, height: u32) {
        self.queues.freeze(id, height);
        let mut dict = self.dictionaries.lock().unwrap();
        if let Some(rec) = dict.forward.get_mut(&id) {
            rec.cool_height = height;
        }
    }

    pub fn chill(&mut self, id: u64, height: u32) {
        self.queues.chill(id, height);
        let mut dict = self.dictionaries.lock().unwrap();
        if let Some(rec) = dict.forward.get_mut(&id) {
            if rec.cool_height == 0 {
                rec.cool_height = height;
            }
        }
    }

    pub fn thaw(&mut self, id: u64) {
        self.queues.thaw(id);
        let mut dict = self.dictionaries.lock().unwrap();
        if let Some(rec) = dict.forward.get_mut(&id) {
            rec.cool_height = 0;
        }
    }

    /// Advances the purge bound to `height`, handing newly-eligible ids
    /// off to the background worker if one is running, otherwise erasing
    /// them inline.
    pub fn purge_to(&mut self, height: u32) {
        let purged = self.queues.advance(height, &self.config);
        if purged.is_empty() {
            return;
        }
        match &self.worker {
            Some(worker) => worker.submit(purged),
            None => {
                let mut dict = self.dictionaries.lock().unwrap();
                for id in purged {
                    dict.purge(id);
                }
            }
        }
    }
}
