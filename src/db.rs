//! Database facade and the transaction machinery behind it.
//!
//! Commits follow the intention/after-image protocol. A transaction mutates
//! a private copy-on-write workspace; `commit` serializes its intent (ops +
//! read set) and appends it to the log. A single replay worker consumes
//! intentions in strict log order, decides commit or abort against the
//! committed history, installs the new root, and appends the resulting
//! after-image. A finisher worker pairs each commit with the canonical
//! after-image position observed on the log and publishes the delta into
//! the node cache.
//!
//! Replay is deterministic: post-order serialization, fixed conflict
//! semantics and the log's total order mean any process replaying the same
//! prefix assigns every node the same `(position, offset)` address.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::cache::{CacheError, NodeCache};
use crate::codec::{AfterImage, CodecError, Intention, LogEntry, Op};
use crate::entry::{EntryError, EntryService, IntentionEntry, IntentionQueue, PendingDelta};
use crate::iterator::DbIterator;
use crate::logger::{debug, error, info};
use crate::node::NodePtr;
use crate::storage::{Log, LogError, Position};
use crate::tree::{set_delta_position, PersistentTree, TreeError};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid parameters")]
    InvalidParams,
    /// The transaction lost a conflict check; rebuild and retry.
    #[error("transaction aborted")]
    Aborted,
    #[error("database is shutting down")]
    Stopped,
    #[error("log corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Entry(#[from] EntryError),
}

#[derive(TypedBuilder)]
pub struct DbConfig {
    /// Power of two.
    #[builder(default = 128)]
    pub cache_shards: usize,
    /// Cache memory budget in bytes; the vacuum evicts down to it.
    #[builder(default = 128 * 1024 * 1024)]
    pub cache_low_marker: usize,
    #[builder(default = 16)]
    pub intention_cache_entries: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::builder().build()
    }
}

/// A capture of the canonical root at some commit. Holding it keeps the
/// subgraph reachable; nodes may still be evicted from the cache and are
/// then re-fetched from the log.
#[derive(Clone)]
pub struct Snapshot {
    root: NodePtr,
    cache: Arc<NodeCache>,
}

impl Snapshot {
    pub(crate) fn root(&self) -> &NodePtr {
        &self.root
    }

    pub(crate) fn cache(&self) -> &NodeCache {
        &self.cache
    }
}

/// Token rendezvous between committing threads and the replay worker. A
/// waiter registers its token before appending the intention, so the
/// decision cannot be missed no matter how quickly replay runs.
struct TransactionFinder {
    state: Mutex<FinderState>,
    cond: Condvar,
}

struct FinderState {
    stop: bool,
    // token -> decisions by intention position
    waiters: HashMap<u64, HashMap<Position, bool>>,
}

impl TransactionFinder {
    fn new() -> Self {
        TransactionFinder {
            state: Mutex::new(FinderState {
                stop: false,
                waiters: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn add_waiter(&self, token: u64) {
        self.state.lock().waiters.insert(token, HashMap::new());
    }

    fn remove_waiter(&self, token: u64) {
        self.state.lock().waiters.remove(&token);
    }

    fn notify(&self, token: u64, pos: Position, committed: bool) {
        let mut state = self.state.lock();
        if let Some(results) = state.waiters.get_mut(&token) {
            results.insert(pos, committed);
            self.cond.notify_all();
        }
    }

    fn wait(&self, token: u64, pos: Position) -> Result<bool, DbError> {
        let mut state = self.state.lock();
        loop {
            if let Some(results) = state.waiters.get_mut(&token) {
                if let Some(committed) = results.remove(&pos) {
                    state.waiters.remove(&token);
                    return Ok(committed);
                }
            }
            if state.stop {
                state.waiters.remove(&token);
                return Err(DbError::Stopped);
            }
            self.cond.wait(&mut state);
        }
    }

    fn stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }
}

struct ParkedTree {
    snapshot: Position,
    tree: PersistentTree,
}

struct DbState {
    stop: bool,
    root: NodePtr,
    /// Position of the intention whose commit produced `root`.
    root_intention: Position,
    /// Process-local workspace id generator, always negative.
    rid_counter: i64,
    last_processed: Position,
    /// Write sets of committed intentions, the conflict window.
    committed: BTreeMap<Position, HashSet<Vec<u8>>>,
    /// Pruning the conflict window is unsafe while the reopen roll-forward
    /// may still replay intentions with older snapshots.
    roll_forward_end: Position,
    /// Snapshot positions held by in-flight transactions, refcounted.
    active_snapshots: BTreeMap<Position, usize>,
    /// Workspaces handed over by local committers, keyed by token, for the
    /// replay fast path.
    parked: HashMap<u64, ParkedTree>,
}

struct DbShared {
    cache: Arc<NodeCache>,
    entry: Arc<EntryService>,
    finder: TransactionFinder,
    state: Mutex<DbState>,
    processed_cond: Condvar,
}

impl DbShared {
    fn release_snapshot(&self, snapshot: Position) {
        let mut state = self.state.lock();
        if let Some(count) = state.active_snapshots.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                state.active_snapshots.remove(&snapshot);
            }
        }
    }

    /// A worker hit an unrecoverable error; unblock everyone.
    fn fail(&self) {
        self.state.lock().stop = true;
        self.processed_cond.notify_all();
        self.finder.stop();
        self.entry.matcher.shutdown();
    }
}

pub struct Transaction {
    shared: Arc<DbShared>,
    tree: Option<PersistentTree>,
    intention: Intention,
    snapshot: Position,
    finished: bool,
}

impl Transaction {
    fn tree(&mut self) -> &mut PersistentTree {
        self.tree.as_mut().expect("workspace present until commit")
    }

    /// Read a key; the key joins the read set and participates in conflict
    /// detection.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.intention.read_set.push(key.to_vec());
        let cache = self.shared.cache.clone();
        Ok(self.tree().get(&cache, key)?)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.intention.ops.push(Op::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        let cache = self.shared.cache.clone();
        Ok(self.tree().put(&cache, key, value)?)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), DbError> {
        self.intention.ops.push(Op::Delete { key: key.to_vec() });
        let cache = self.shared.cache.clone();
        Ok(self.tree().delete(&cache, key)?)
    }

    /// Path-copy a key without changing it, promoting a read into the write
    /// set.
    pub fn copy(&mut self, key: &[u8]) -> Result<(), DbError> {
        self.intention.ops.push(Op::Copy { key: key.to_vec() });
        let cache = self.shared.cache.clone();
        Ok(self.tree().copy(&cache, key)?)
    }

    /// Append the intention and block on the replay decision.
    /// `Err(Aborted)` means a conflicting intention committed first; the
    /// caller may rebuild and retry.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.finished = true;

        // a read-only transaction saw a consistent snapshot; nothing to log
        if self.intention.ops.is_empty() {
            self.shared.release_snapshot(self.snapshot);
            return Ok(());
        }

        let token = self.intention.token;
        self.shared.finder.add_waiter(token);

        // park the workspace before appending so replay can reuse it
        {
            let mut state = self.shared.state.lock();
            if state.stop {
                drop(state);
                self.shared.finder.remove_waiter(token);
                self.shared.release_snapshot(self.snapshot);
                return Err(DbError::Stopped);
            }
            let tree = self.tree.take().expect("workspace present until commit");
            state.parked.insert(
                token,
                ParkedTree {
                    snapshot: self.snapshot,
                    tree,
                },
            );
        }

        let pos = match self.shared.entry.append_intention(self.intention.clone()) {
            Ok(pos) => pos,
            Err(e) => {
                self.shared.state.lock().parked.remove(&token);
                self.shared.finder.remove_waiter(token);
                self.shared.release_snapshot(self.snapshot);
                return Err(e.into());
            }
        };
        debug!("intention appended at {pos}");

        let committed = self.shared.finder.wait(token, pos);
        self.shared.release_snapshot(self.snapshot);
        if committed? {
            Ok(())
        } else {
            Err(DbError::Aborted)
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.release_snapshot(self.snapshot);
        }
    }
}

pub struct Db {
    shared: Arc<DbShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Db {
    /// Open a database over a log. An empty log is bootstrapped (when
    /// `create_if_empty`) with an empty intention and its after-image;
    /// otherwise the log is scanned for the most recent committed state and
    /// the replay worker rolls forward through any trailing intentions
    /// before this returns.
    pub fn open(
        log: Arc<dyn Log>,
        create_if_empty: bool,
        config: DbConfig,
    ) -> Result<Db, DbError> {
        let mut tail = log.check_tail()?;
        if tail == 0 {
            if !create_if_empty {
                return Err(DbError::InvalidParams);
            }
            let ipos = log.append(LogEntry::Intention(Intention::default()).encode()?)?;
            let ai = AfterImage {
                intention: ipos,
                tree: Vec::new(),
            };
            log.append(LogEntry::AfterImage(ai).encode()?)?;
            tail = log.check_tail()?;
            info!("bootstrapped empty database, tail {tail}");
        }

        let cache = NodeCache::new(log.clone(), config.cache_shards, config.cache_low_marker);

        // scan the log: committed intentions are those with an after-image;
        // the restore point is the after-image of the newest one
        let mut write_sets: BTreeMap<Position, HashSet<Vec<u8>>> = BTreeMap::new();
        let mut committed_pos: BTreeSet<Position> = BTreeSet::new();
        let mut last_intention: Option<Position> = None;
        let mut restore: Option<(Position, Position, AfterImage)> = None;
        for pos in 0..tail {
            let blob = match log.read(pos) {
                Ok(blob) => blob,
                Err(LogError::NotWritten(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match LogEntry::decode(&blob)? {
                LogEntry::Intention(intention) => {
                    write_sets
                        .insert(pos, intention.write_keys().map(|k| k.to_vec()).collect());
                    last_intention = Some(pos);
                }
                LogEntry::AfterImage(ai) => {
                    // the first after-image observed for an intention is
                    // the canonical one
                    if committed_pos.insert(ai.intention) {
                        cache.set_intention_mapping(ai.intention, pos);
                        if restore
                            .as_ref()
                            .map_or(true, |(ipos, _, _)| ai.intention > *ipos)
                        {
                            restore = Some((ai.intention, pos, ai));
                        }
                    }
                }
            }
        }

        // a crash between the two bootstrap appends leaves a lone empty
        // intention; finish the job
        if restore.is_none() {
            let first = last_intention.ok_or_else(|| {
                DbError::Corrupt("log has neither intentions nor after-images".into())
            })?;
            let entry = LogEntry::decode(&log.read(first)?)?;
            let intention = entry
                .as_intention()
                .ok_or_else(|| DbError::Corrupt("expected an intention".into()))?;
            if first != 0 || !intention.ops.is_empty() {
                return Err(DbError::Corrupt("log contains no after-image".into()));
            }
            let ai = AfterImage {
                intention: first,
                tree: Vec::new(),
            };
            let pos = log.append(LogEntry::AfterImage(ai.clone()).encode()?)?;
            cache.set_intention_mapping(first, pos);
            committed_pos.insert(first);
            tail = log.check_tail()?;
            restore = Some((first, pos, ai));
        }
        let (restore_ipos, restore_ai_pos, restore_ai) =
            restore.expect("restore point established");
        debug!("restoring from intention {restore_ipos}, after-image {restore_ai_pos}");

        let root = cache.cache_after_image(&restore_ai, restore_ai_pos)?;
        let committed: BTreeMap<Position, HashSet<Vec<u8>>> = write_sets
            .into_iter()
            .filter(|(pos, _)| committed_pos.contains(pos))
            .collect();

        let entry = EntryService::new(
            log.clone(),
            config.intention_cache_entries,
            restore_ipos,
        );
        let queue = entry.new_intention_queue(restore_ipos + 1);
        // everything below the tail was just scanned; the reader picks up
        // after-images appended from here on
        entry.start(tail);

        let roll_forward_end = last_intention.unwrap_or(restore_ipos);
        let shared = Arc::new(DbShared {
            cache,
            entry,
            finder: TransactionFinder::new(),
            state: Mutex::new(DbState {
                stop: false,
                root,
                root_intention: restore_ipos,
                rid_counter: 0,
                last_processed: restore_ipos,
                committed,
                roll_forward_end,
                active_snapshots: BTreeMap::new(),
                parked: HashMap::new(),
            }),
            processed_cond: Condvar::new(),
        });

        let mut workers = Vec::new();
        {
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("TransactionProcessor".into())
                    .spawn(move || transaction_processor(shared, queue))
                    .expect("spawn transaction processor"),
            );
        }
        {
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("TransactionFinisher".into())
                    .spawn(move || transaction_finisher(shared))
                    .expect("spawn transaction finisher"),
            );
        }

        let db = Db { shared, workers };
        if roll_forward_end > restore_ipos {
            db.wait_on_intention(roll_forward_end)?;
        }
        Ok(db)
    }

    fn wait_on_intention(&self, pos: Position) -> Result<(), DbError> {
        let mut state = self.shared.state.lock();
        while state.last_processed < pos {
            if state.stop {
                return Err(DbError::Stopped);
            }
            self.shared.processed_cond.wait(&mut state);
        }
        Ok(())
    }

    pub fn begin_transaction(&self) -> Transaction {
        let mut state = self.shared.state.lock();
        state.rid_counter -= 1;
        let snapshot = state.root_intention;
        *state.active_snapshots.entry(snapshot).or_insert(0) += 1;
        Transaction {
            shared: self.shared.clone(),
            tree: Some(PersistentTree::new(state.root.clone(), state.rid_counter)),
            intention: Intention {
                snapshot: Some(snapshot),
                token: rand::random(),
                ops: Vec::new(),
                read_set: Vec::new(),
            },
            snapshot,
            finished: false,
        }
    }

    /// Lookup in the latest committed snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let root = self.shared.state.lock().root.clone();
        let cache = &self.shared.cache;
        let mut trace = Vec::new();
        let mut cur = root.resolve(cache, &mut trace)?;
        let found = loop {
            let Some(node) = cur else { break None };
            match key.cmp(node.key()) {
                std::cmp::Ordering::Equal => break Some(node.val().to_vec()),
                std::cmp::Ordering::Less => cur = node.left.resolve(cache, &mut trace)?,
                std::cmp::Ordering::Greater => cur = node.right.resolve(cache, &mut trace)?,
            }
        };
        cache.update_lru(&mut trace);
        Ok(found)
    }

    pub fn get_snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.shared.state.lock().root.clone(),
            cache: self.shared.cache.clone(),
        }
    }

    pub fn iterator(&self) -> DbIterator {
        DbIterator::new(self.get_snapshot())
    }

    pub fn iterator_at(&self, snapshot: &Snapshot) -> DbIterator {
        DbIterator::new(snapshot.clone())
    }

    /// Red-black validity of the canonical root: black root, no red-red
    /// edges, equal black-heights, keys ordered.
    pub fn validate(&self) -> Result<(), DbError> {
        let snapshot = self.get_snapshot();
        let mut trace = Vec::new();
        if let Some(root) = snapshot.root.resolve(&snapshot.cache, &mut trace)? {
            if root.red() {
                return Err(DbError::Corrupt("red root".into()));
            }
        }
        validate_rb(&snapshot.cache, snapshot.root(), false)?;
        Ok(())
    }

    pub fn cache_used_bytes(&self) -> usize {
        self.shared.cache.used_bytes()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.processed_cond.notify_all();
        self.shared.finder.stop();
        self.shared.entry.stop();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.shared.cache.stop();
    }
}

fn validate_rb(cache: &NodeCache, ptr: &NodePtr, parent_red: bool) -> Result<usize, DbError> {
    let mut trace = Vec::new();
    let Some(node) = ptr.resolve(cache, &mut trace)? else {
        return Ok(1);
    };
    if parent_red && node.red() {
        return Err(DbError::Corrupt("red node with red child".into()));
    }
    for (link, side) in [(&node.left, "left"), (&node.right, "right")] {
        if let Some(child) = link.resolve(cache, &mut trace)? {
            let ordered = match side {
                "left" => child.key() < node.key(),
                _ => child.key() > node.key(),
            };
            if !ordered {
                return Err(DbError::Corrupt(format!("{side} child out of order")));
            }
        }
    }
    let lh = validate_rb(cache, &node.left, node.red())?;
    let rh = validate_rb(cache, &node.right, node.red())?;
    if lh != rh {
        return Err(DbError::Corrupt("unequal black heights".into()));
    }
    Ok(if node.red() { lh } else { lh + 1 })
}

/// Single replay worker: consumes intentions in strict log order, decides
/// commit/abort, installs roots, appends after-images.
fn transaction_processor(shared: Arc<DbShared>, queue: Arc<IntentionQueue>) {
    while let Some(IntentionEntry { pos, intention }) = queue.wait() {
        match process_intention(&shared, pos, &intention) {
            Ok(committed) => {
                debug!(
                    "intention {pos} {}",
                    if committed { "committed" } else { "aborted" }
                );
                {
                    let mut state = shared.state.lock();
                    state.last_processed = pos;
                }
                shared.processed_cond.notify_all();
                shared.finder.notify(intention.token, pos, committed);
            }
            Err(e) => {
                error!("replay failed at {pos}: {e}");
                shared.fail();
                return;
            }
        }
    }
}

fn process_intention(
    shared: &Arc<DbShared>,
    ipos: Position,
    intention: &Intention,
) -> Result<bool, DbError> {
    let parked = shared.state.lock().parked.remove(&intention.token);

    // conflict: any checked key written by a commit in (snapshot, ipos)
    {
        let state = shared.state.lock();
        let lower = match intention.snapshot {
            Some(snapshot) => Bound::Excluded(snapshot),
            None => Bound::Unbounded,
        };
        for (_, write_set) in state.committed.range((lower, Bound::Excluded(ipos))) {
            for key in intention.conflict_keys() {
                if write_set.contains(key) {
                    return Ok(false);
                }
            }
        }
    }

    // fresh own workspace: nothing committed since its snapshot, so the
    // in-memory delta is exactly what replay would rebuild
    let reuse = match (&parked, intention.snapshot) {
        (Some(parked), Some(snapshot)) if parked.snapshot == snapshot => {
            shared.state.lock().root_intention == snapshot
        }
        _ => false,
    };

    let mut tree = if reuse {
        parked.expect("reuse implies a parked workspace").tree
    } else {
        let (root, rid) = {
            let mut state = shared.state.lock();
            state.rid_counter -= 1;
            (state.root.clone(), state.rid_counter)
        };
        let mut tree = PersistentTree::new(root, rid);
        for op in &intention.ops {
            match op {
                Op::Put { key, value } => tree.put(&shared.cache, key, value)?,
                Op::Delete { key } => tree.delete(&shared.cache, key)?,
                Op::Copy { key } => tree.copy(&shared.cache, key)?,
            }
        }
        tree
    };

    let frozen = tree.freeze(&shared.cache, ipos)?;

    {
        let mut state = shared.state.lock();
        state.root = frozen.root.clone();
        state.root_intention = ipos;
        state
            .committed
            .insert(ipos, intention.write_keys().map(|k| k.to_vec()).collect());
        // prune the conflict window below any snapshot still in use; not
        // before roll-forward is done, since replayed intentions may carry
        // snapshots older than anything currently active
        if ipos >= state.roll_forward_end {
            let bound = state
                .active_snapshots
                .keys()
                .next()
                .copied()
                .unwrap_or(ipos);
            state.committed = state.committed.split_off(&bound.saturating_add(1));
        }
    }

    match shared.cache.intention_to_after_image(ipos) {
        Some(ai_pos) => {
            // the after-image already exists on the log (reopen
            // roll-forward); publish synchronously
            set_delta_position(&frozen.delta, ipos, ai_pos);
            let root = shared.cache.apply_after_image_delta(&frozen.delta, ai_pos);
            let mut state = shared.state.lock();
            if state.root_intention == ipos {
                state.root = root;
            }
        }
        None => {
            shared.entry.append_after_image(&frozen.after_image)?;
            shared.entry.matcher.watch(PendingDelta {
                intention: ipos,
                delta: frozen.delta,
                root: frozen.root,
            });
        }
    }
    Ok(true)
}

/// Consumes matched (delta, after-image position) pairs: records the
/// mapping, upgrades self addresses, publishes the delta into the cache,
/// and refreshes the canonical root pointer if it still refers to that
/// commit.
fn transaction_finisher(shared: Arc<DbShared>) {
    while let Some(matched) = shared.entry.matcher.match_next() {
        let intention = matched.pending.intention;
        shared.cache.set_intention_mapping(intention, matched.ai_pos);
        set_delta_position(&matched.pending.delta, intention, matched.ai_pos);
        let root = shared
            .cache
            .apply_after_image_delta(&matched.pending.delta, matched.ai_pos);
        let mut state = shared.state.lock();
        if state.root_intention == intention {
            state.root = root;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finder_decision_survives_early_notify() {
        let finder = TransactionFinder::new();
        finder.add_waiter(7);
        // decision lands before the committer starts waiting
        finder.notify(7, 3, true);
        assert!(finder.wait(7, 3).unwrap());
    }

    #[test]
    fn finder_ignores_unregistered_tokens() {
        let finder = TransactionFinder::new();
        finder.notify(9, 1, true);
        assert!(finder.state.lock().waiters.is_empty());
    }

    #[test]
    fn finder_stop_unblocks_waiters() {
        let finder = Arc::new(TransactionFinder::new());
        finder.add_waiter(1);
        let waiter = {
            let finder = finder.clone();
            std::thread::spawn(move || finder.wait(1, 0))
        };
        finder.stop();
        assert!(matches!(waiter.join().unwrap(), Err(DbError::Stopped)));
    }
}
