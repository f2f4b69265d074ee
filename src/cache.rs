//! Sharded in-memory cache of materialized tree nodes.
//!
//! The cache is the only strong owner of published nodes. It is keyed
//! exclusively by after-image addresses `(position, offset)`; transient
//! intention-kinded addresses are translated through the intention map
//! first. A background vacuum worker applies batched LRU promotions (the
//! traces tree operations leave behind) and evicts least-recently-used
//! nodes once the memory budget is exceeded. Eviction is memory-only: the
//! log still holds every node, so a later traversal just re-fetches.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::codec::{AfterImage, CodecError, LogEntry, PtrRecord};
use crate::logger::trace;
use crate::node::{Node, NodeAddress, NodePtr};
use crate::storage::{Log, LogError, Position};

/// How long a fetch waits for an intention address to learn its after-image
/// position before giving up. The mapping is guaranteed to arrive; the bound
/// only turns a lost worker into an error instead of a hang.
const INTENTION_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_RETRIES: usize = 10;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Log(LogError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("entry at position {0} is not an after-image")]
    NotAnAfterImage(Position),
    #[error("after-image {pos} has no node at offset {off}")]
    BadOffset { pos: Position, off: u16 },
    #[error("intention {0} never resolved to an after-image")]
    UnresolvedIntention(Position),
    #[error("pointer lost its node and carries no address")]
    Unreachable,
}

type ShardKey = (Position, u16);

struct Shard {
    nodes: Mutex<LruCache<ShardKey, Arc<Node>>>,
}

struct VacuumState {
    traces: Vec<Vec<NodeAddress>>,
    stop: bool,
    worker: Option<JoinHandle<()>>,
}

pub struct NodeCache {
    log: Arc<dyn Log>,
    shards: Vec<Shard>,
    used_bytes: AtomicUsize,
    low_marker: usize,
    vacuum: Mutex<VacuumState>,
    vacuum_cond: Condvar,
    imap: Mutex<LruCache<Position, Position>>,
    imap_cond: Condvar,
}

impl NodeCache {
    /// `num_shards` must be a power of two.
    pub fn new(log: Arc<dyn Log>, num_shards: usize, low_marker: usize) -> Arc<Self> {
        assert!(num_shards.is_power_of_two());
        let cache = Arc::new(NodeCache {
            log,
            shards: (0..num_shards)
                .map(|_| Shard {
                    nodes: Mutex::new(LruCache::unbounded()),
                })
                .collect(),
            used_bytes: AtomicUsize::new(0),
            low_marker,
            vacuum: Mutex::new(VacuumState {
                traces: Vec::new(),
                stop: false,
                worker: None,
            }),
            vacuum_cond: Condvar::new(),
            imap: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(100_000).expect("non-zero intention map"),
            )),
            imap_cond: Condvar::new(),
        });
        let worker = {
            let cache = cache.clone();
            std::thread::Builder::new()
                .name("CacheVacuum".into())
                .spawn(move || cache.vacuum_loop())
                .expect("spawn cache vacuum")
        };
        cache.vacuum.lock().worker = Some(worker);
        cache
    }

    pub fn stop(&self) {
        let worker = {
            let mut vacuum = self.vacuum.lock();
            vacuum.stop = true;
            vacuum.worker.take()
        };
        self.vacuum_cond.notify_one();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    fn shard(&self, key: &ShardKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slot = hasher.finish() as usize & (self.shards.len() - 1);
        &self.shards[slot]
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    /// Look up the after-image position of a committed intention, without
    /// blocking.
    pub fn intention_to_after_image(&self, intention: Position) -> Option<Position> {
        self.imap.lock().get(&intention).copied()
    }

    pub fn set_intention_mapping(&self, intention: Position, after_image: Position) {
        self.imap.lock().put(intention, after_image);
        self.imap_cond.notify_all();
    }

    /// Block until the after-image of `intention` has been discovered. The
    /// entry service fills the map as after-images stream off the log.
    fn wait_intention_mapping(&self, intention: Position) -> Result<Position, CacheError> {
        let deadline = Instant::now() + INTENTION_RESOLVE_TIMEOUT;
        let mut imap = self.imap.lock();
        loop {
            if let Some(pos) = imap.get(&intention) {
                return Ok(*pos);
            }
            if self
                .imap_cond
                .wait_until(&mut imap, deadline)
                .timed_out()
            {
                return Err(CacheError::UnresolvedIntention(intention));
            }
        }
    }

    /// Resolve an address to a materialized node, reading the log on a miss.
    ///
    /// The shard lock is never held across the read: a miss drops it,
    /// publishes the caller's trace so LRU quality does not degrade while
    /// the read blocks, performs the I/O, and re-checks under the lock
    /// before inserting.
    pub fn fetch(
        &self,
        trace: &mut Vec<NodeAddress>,
        addr: NodeAddress,
    ) -> Result<Arc<Node>, CacheError> {
        let (pos, off) = match addr {
            NodeAddress::AfterImage { pos, off } => (pos, off),
            NodeAddress::Intention { pos, off } => (self.wait_intention_mapping(pos)?, off),
        };
        let key = (pos, off);
        trace.push(NodeAddress::AfterImage { pos, off });

        {
            let mut nodes = self.shard(&key).nodes.lock();
            if let Some(node) = nodes.get(&key) {
                return Ok(node.clone());
            }
        }

        self.update_lru(trace);

        let ai = self.read_after_image(pos)?;
        let node = self.deserialize_node(&ai, pos, off)?;

        let mut nodes = self.shard(&key).nodes.lock();
        if let Some(existing) = nodes.get(&key) {
            // lost the race with another fetch; keep the first insert
            return Ok(existing.clone());
        }
        self.used_bytes.fetch_add(node.byte_size(), Ordering::Relaxed);
        nodes.put(key, node.clone());
        Ok(node)
    }

    fn read_after_image(&self, pos: Position) -> Result<AfterImage, CacheError> {
        let mut attempt = 0;
        let blob = loop {
            match self.log.read(pos) {
                Ok(blob) => break blob,
                Err(e) => {
                    attempt += 1;
                    if attempt >= READ_RETRIES {
                        return Err(CacheError::Log(e));
                    }
                    std::thread::sleep(Duration::from_millis(1 << attempt.min(6)));
                }
            }
        };
        LogEntry::decode(&blob)?
            .into_after_image()
            .map_err(|_| CacheError::NotAnAfterImage(pos))
    }

    /// Materialize the node at `off` of a decoded after-image. Children keep
    /// their serialized addresses; self references become after-image
    /// addresses of `pos`.
    fn deserialize_node(
        &self,
        ai: &AfterImage,
        pos: Position,
        off: u16,
    ) -> Result<Arc<Node>, CacheError> {
        let rec = ai
            .tree
            .get(off as usize)
            .ok_or(CacheError::BadOffset { pos, off })?;
        let child = |rec: &PtrRecord| match *rec {
            PtrRecord::Nil => NodePtr::nil(),
            PtrRecord::Slf { off } => {
                NodePtr::from_address(NodeAddress::AfterImage { pos, off })
            }
            PtrRecord::Intention { pos, off } => {
                NodePtr::from_address(NodeAddress::Intention { pos, off })
            }
            PtrRecord::AfterImage { pos, off } => {
                NodePtr::from_address(NodeAddress::AfterImage { pos, off })
            }
        };
        let node = Node::new(
            rec.red,
            ai.intention,
            rec.key.clone(),
            rec.val.clone(),
            child(&rec.left),
            child(&rec.right),
        );
        node.set_read_only();
        Ok(Arc::new(node))
    }

    /// Insert every node of a decoded after-image, returning a pointer to
    /// its root. Used when restoring a database from the log.
    pub fn cache_after_image(
        &self,
        ai: &AfterImage,
        pos: Position,
    ) -> Result<NodePtr, CacheError> {
        if ai.tree.is_empty() {
            return Ok(NodePtr::nil());
        }
        let mut root = None;
        for off in 0..ai.tree.len() {
            let off = off as u16;
            let node = self.deserialize_node(ai, pos, off)?;
            let key = (pos, off);
            let mut nodes = self.shard(&key).nodes.lock();
            let node = match nodes.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    self.used_bytes.fetch_add(node.byte_size(), Ordering::Relaxed);
                    nodes.put(key, node.clone());
                    node
                }
            };
            root = Some(node);
        }
        let root = root.expect("non-empty after-image has a root");
        let off = (ai.tree.len() - 1) as u16;
        Ok(NodePtr::new(
            &root,
            Some(NodeAddress::AfterImage { pos, off }),
        ))
    }

    /// Publish a freshly committed delta at its after-image position without
    /// a log round-trip: mark every node read-only and insert it under
    /// `(pos, offset)`. Returns the new root pointer.
    pub fn apply_after_image_delta(&self, delta: &[Arc<Node>], pos: Position) -> NodePtr {
        if delta.is_empty() {
            return NodePtr::nil();
        }
        for (off, node) in delta.iter().enumerate() {
            node.set_read_only();
            let key = (pos, off as u16);
            let mut nodes = self.shard(&key).nodes.lock();
            if nodes.put(key, node.clone()).is_none() {
                self.used_bytes.fetch_add(node.byte_size(), Ordering::Relaxed);
            }
        }
        let root = delta.last().expect("non-empty delta");
        let off = (delta.len() - 1) as u16;
        NodePtr::new(root, Some(NodeAddress::AfterImage { pos, off }))
    }

    /// Queue a trace of touched addresses for batched LRU promotion.
    pub fn update_lru(&self, trace: &mut Vec<NodeAddress>) {
        if trace.is_empty() {
            return;
        }
        let mut vacuum = self.vacuum.lock();
        vacuum.traces.push(std::mem::take(trace));
        self.vacuum_cond.notify_one();
    }

    fn vacuum_loop(&self) {
        loop {
            let traces = {
                let mut vacuum = self.vacuum.lock();
                while vacuum.traces.is_empty()
                    && self.used_bytes() <= self.low_marker
                    && !vacuum.stop
                {
                    self.vacuum_cond.wait(&mut vacuum);
                }
                if vacuum.stop {
                    return;
                }
                std::mem::take(&mut vacuum.traces)
            };

            for trace in traces {
                for addr in trace {
                    let key = (addr.pos(), addr.off());
                    let mut nodes = self.shard(&key).nodes.lock();
                    nodes.promote(&key);
                }
            }

            let used = self.used_bytes();
            if used > self.low_marker {
                let target = (used - self.low_marker) / self.shards.len();
                trace!("vacuum evicting ~{target} bytes per shard");
                for shard in &self.shards {
                    let mut nodes = shard.nodes.lock();
                    let mut left = target as isize;
                    while left > 0 {
                        match nodes.pop_lru() {
                            Some((_, node)) => {
                                let size = node.byte_size();
                                self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                                left -= size as isize;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NodeRecord;
    use crate::storage::MemLog;

    fn ai_entry(intention: Position, keys: &[&[u8]]) -> AfterImage {
        // left-deep chain in post-order: node i's left child is node i-1
        let tree = keys
            .iter()
            .enumerate()
            .map(|(i, key)| NodeRecord {
                red: false,
                key: key.to_vec(),
                val: b"v".to_vec(),
                left: if i == 0 {
                    PtrRecord::Nil
                } else {
                    PtrRecord::Slf {
                        off: (i - 1) as u16,
                    }
                },
                right: PtrRecord::Nil,
            })
            .collect();
        AfterImage { intention, tree }
    }

    #[test]
    fn fetch_reads_through_to_the_log() {
        let log = Arc::new(MemLog::new());
        let ai = ai_entry(0, &[b"a", b"b"]);
        let pos = log
            .append(LogEntry::AfterImage(ai).encode().unwrap())
            .unwrap();

        let cache = NodeCache::new(log, 8, usize::MAX);
        let mut trace = Vec::new();
        let node = cache
            .fetch(&mut trace, NodeAddress::AfterImage { pos, off: 1 })
            .unwrap();
        assert_eq!(node.key(), b"b");
        assert_eq!(node.rid(), 0);
        assert!(node.read_only());

        // the child resolves through its self address
        let child = node.left.resolve(&cache, &mut trace).unwrap().unwrap();
        assert_eq!(child.key(), b"a");
        cache.stop();
    }

    #[test]
    fn intention_addresses_resolve_through_the_map() {
        let log = Arc::new(MemLog::new());
        let ai = ai_entry(4, &[b"k"]);
        let pos = log
            .append(LogEntry::AfterImage(ai).encode().unwrap())
            .unwrap();

        let cache = NodeCache::new(log, 8, usize::MAX);
        cache.set_intention_mapping(4, pos);
        let mut trace = Vec::new();
        let node = cache
            .fetch(&mut trace, NodeAddress::Intention { pos: 4, off: 0 })
            .unwrap();
        assert_eq!(node.key(), b"k");
        cache.stop();
    }

    #[test]
    fn eviction_is_memory_only() {
        let log = Arc::new(MemLog::new());
        let ai = ai_entry(0, &[b"a", b"b", b"c"]);
        let pos = log
            .append(LogEntry::AfterImage(ai.clone()).encode().unwrap())
            .unwrap();

        // low marker of one byte: everything is evictable
        let cache = NodeCache::new(log, 2, 1);
        let root = cache.cache_after_image(&ai, pos).unwrap();
        assert!(cache.used_bytes() > 0);

        // wake the vacuum and wait for it to drain
        let mut empty = Vec::new();
        cache.update_lru(&mut vec![NodeAddress::AfterImage { pos, off: 0 }]);
        for _ in 0..100 {
            if cache.used_bytes() <= 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(cache.used_bytes() <= 1);

        // the tree is still fully readable through the log
        let node = root.resolve(&cache, &mut empty).unwrap().unwrap();
        assert_eq!(node.key(), b"c");
        cache.stop();
    }
}
