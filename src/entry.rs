//! Entry service: streams entries off the log and dispatches them.
//!
//! Two workers run here. The log reader advances a cursor over every
//! position, classifying entries and feeding after-images to the matcher.
//! The intention reader serves *intention queues*, the ordered blocking
//! consumers that want every intention at or beyond a starting position,
//! short-circuiting through a small cache of intentions this process
//! appended itself.
//!
//! The matcher pairs each committed intention with the first after-image
//! observed for it on the log, which is the canonical one: the pairing is
//! what turns transient intention-kinded node addresses into durable
//! after-image addresses.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::codec::{AfterImage, CodecError, Intention, LogEntry};
use crate::logger::{debug, trace, warn};
use crate::node::{Node, NodePtr};
use crate::storage::{Log, LogError, Position};

/// Hole-read rounds before the reader escalates to `Log::fill`.
const HOLE_RETRY_ROUNDS: usize = 100;
const HOLE_RETRY_DELAY: Duration = Duration::from_millis(1);
const IDLE_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum EntryError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// An intention paired with the log position it was appended at.
#[derive(Clone, Debug)]
pub struct IntentionEntry {
    pub pos: Position,
    pub intention: Intention,
}

struct QueueState {
    pos: Position,
    queue: VecDeque<IntentionEntry>,
    stop: bool,
}

/// Ordered blocking consumer of intentions at or beyond a starting
/// position. Pushes must arrive in log order.
pub struct IntentionQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl IntentionQueue {
    fn new(pos: Position) -> Self {
        IntentionQueue {
            state: Mutex::new(QueueState {
                pos,
                queue: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Next position this queue wants.
    pub fn position(&self) -> Position {
        self.state.lock().pos
    }

    pub fn push(&self, entry: IntentionEntry) {
        let mut state = self.state.lock();
        assert!(state.pos <= entry.pos, "intention pushed out of order");
        state.pos = entry.pos + 1;
        state.queue.push_back(entry);
        self.cond.notify_one();
    }

    /// Block for the next intention; `None` means shutdown.
    pub fn wait(&self) -> Option<IntentionEntry> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.queue.pop_front() {
                return Some(entry);
            }
            if state.stop {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }
}

/// FIFO-bounded map of recently appended intentions, letting local replay
/// skip a log read for entries this process just wrote.
struct EntryCache {
    intentions: Mutex<BTreeMap<Position, Intention>>,
    capacity: usize,
}

impl EntryCache {
    fn insert(&self, pos: Position, intention: Intention) {
        let mut intentions = self.intentions.lock();
        while intentions.len() >= self.capacity {
            intentions.pop_first();
        }
        intentions.insert(pos, intention);
    }

    fn find(&self, pos: Position) -> Option<Intention> {
        self.intentions.lock().get(&pos).cloned()
    }
}

/// A committed delta parked by the replay worker until the log reader
/// observes the matching after-image.
pub struct PendingDelta {
    pub intention: Position,
    pub delta: Vec<Arc<Node>>,
    pub root: NodePtr,
}

pub struct MatchedDelta {
    pub pending: PendingDelta,
    pub ai_pos: Position,
}

#[derive(Default)]
struct PrimaryAfterImage {
    // (some, none)  -> after-image seen, no watcher yet
    // (none, some)  -> watcher parked, no after-image yet
    // (none, none)  -> matched; removable by gc
    pos: Option<Position>,
    pending: Option<PendingDelta>,
}

struct MatcherState {
    shutdown: bool,
    matched_watermark: Position,
    index: BTreeMap<Position, PrimaryAfterImage>,
    matched: VecDeque<MatchedDelta>,
}

/// Rendezvous between locally replayed intentions and the after-images the
/// log reader discovers for them.
///
/// Watches MUST arrive in intention log order: the watermark advances over
/// the leading fully-matched prefix, and everything at or below it is
/// complete, so stale after-images can be dropped on sight.
pub struct PrimaryAfterImageMatcher {
    state: Mutex<MatcherState>,
    cond: Condvar,
}

impl PrimaryAfterImageMatcher {
    fn new(watermark: Position) -> Self {
        PrimaryAfterImageMatcher {
            state: Mutex::new(MatcherState {
                shutdown: false,
                matched_watermark: watermark,
                index: BTreeMap::new(),
                matched: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Park a committed delta awaiting its after-image position.
    pub fn watch(&self, pending: PendingDelta) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ipos = pending.intention;
        let entry = state.index.entry(ipos).or_default();
        match entry.pos.take() {
            Some(ai_pos) => {
                state.matched.push_back(MatchedDelta { pending, ai_pos });
                self.cond.notify_one();
            }
            None => {
                debug_assert!(entry.pending.is_none(), "duplicate watch for {ipos}");
                entry.pending = Some(pending);
            }
        }
        Self::gc(state);
    }

    /// The log reader observed an after-image for `intention` at `pos`.
    pub fn push(&self, intention: Position, pos: Position) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if intention <= state.matched_watermark {
            return;
        }
        let entry = state.index.entry(intention).or_default();
        match entry.pending.take() {
            Some(pending) => {
                state.matched.push_back(MatchedDelta {
                    pending,
                    ai_pos: pos,
                });
                self.cond.notify_one();
            }
            None => {
                // first occurrence wins; later duplicates are ignored
                entry.pos.get_or_insert(pos);
            }
        }
        Self::gc(state);
    }

    /// Block for the next matched pair; `None` means shutdown.
    pub fn match_next(&self) -> Option<MatchedDelta> {
        let mut state = self.state.lock();
        loop {
            if let Some(matched) = state.matched.pop_front() {
                return Some(matched);
            }
            if state.shutdown {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    fn gc(state: &mut MatcherState) {
        while let Some((&ipos, entry)) = state.index.first_key_value() {
            debug_assert!(state.matched_watermark < ipos);
            if entry.pos.is_none() && entry.pending.is_none() {
                state.matched_watermark = ipos;
                state.index.remove(&ipos);
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn watermark(&self) -> Position {
        self.state.lock().matched_watermark
    }
}

struct ServiceState {
    stop: bool,
    queues: Vec<Arc<IntentionQueue>>,
    workers: Vec<JoinHandle<()>>,
}

pub struct EntryService {
    log: Arc<dyn Log>,
    state: Mutex<ServiceState>,
    cache: EntryCache,
    pub matcher: PrimaryAfterImageMatcher,
}

impl EntryService {
    pub fn new(log: Arc<dyn Log>, intention_cache_capacity: usize, watermark: Position) -> Arc<Self> {
        Arc::new(EntryService {
            log,
            state: Mutex::new(ServiceState {
                stop: false,
                queues: Vec::new(),
                workers: Vec::new(),
            }),
            cache: EntryCache {
                intentions: Mutex::new(BTreeMap::new()),
                capacity: intention_cache_capacity,
            },
            matcher: PrimaryAfterImageMatcher::new(watermark),
        })
    }

    /// Spawn the log reader (from `reader_pos`) and the intention reader.
    pub fn start(self: &Arc<Self>, reader_pos: Position) {
        let mut workers = Vec::new();
        {
            let service = self.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("LogReader".into())
                    .spawn(move || service.log_reader(reader_pos))
                    .expect("spawn log reader"),
            );
        }
        {
            let service = self.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("IntentionReader".into())
                    .spawn(move || service.intention_reader())
                    .expect("spawn intention reader"),
            );
        }
        self.state.lock().workers = workers;
    }

    pub fn stop(&self) {
        let (queues, workers) = {
            let mut state = self.state.lock();
            state.stop = true;
            (state.queues.clone(), std::mem::take(&mut state.workers))
        };
        self.matcher.shutdown();
        for queue in queues {
            queue.stop();
        }
        for worker in workers {
            let _ = worker.join();
        }
    }

    fn stopped(&self) -> bool {
        self.state.lock().stop
    }

    pub fn new_intention_queue(&self, pos: Position) -> Arc<IntentionQueue> {
        let queue = Arc::new(IntentionQueue::new(pos));
        self.state.lock().queues.push(queue.clone());
        queue
    }

    /// Append an intention, remembering it so local replay can skip the log
    /// read.
    pub fn append_intention(&self, intention: Intention) -> Result<Position, EntryError> {
        let blob = LogEntry::Intention(intention.clone()).encode()?;
        let pos = self.log.append(blob)?;
        self.cache.insert(pos, intention);
        Ok(pos)
    }

    pub fn append_after_image(&self, ai: &AfterImage) -> Result<Position, EntryError> {
        let blob = LogEntry::AfterImage(ai.clone()).encode()?;
        Ok(self.log.append(blob)?)
    }

    /// Walk the log in order, dispatching after-images to the matcher.
    /// Holes get a bounded wait, then a fill request, then more waiting:
    /// progress must not skip a position, since the first after-image
    /// observed for an intention is the canonical one.
    fn log_reader(&self, mut pos: Position) {
        debug!("log reader starting at {pos}");
        let mut hole_rounds = 0usize;
        while !self.stopped() {
            let blob = match self.log.read(pos) {
                Ok(blob) => blob,
                Err(LogError::NotWritten(_)) => {
                    hole_rounds += 1;
                    if hole_rounds == HOLE_RETRY_ROUNDS {
                        warn!("filling hole at {pos}");
                        let _ = self.log.fill(pos);
                    }
                    std::thread::sleep(HOLE_RETRY_DELAY);
                    continue;
                }
                Err(e) => {
                    warn!("log read failed at {pos}: {e}");
                    std::thread::sleep(HOLE_RETRY_DELAY);
                    continue;
                }
            };
            hole_rounds = 0;

            match LogEntry::decode(&blob) {
                Ok(LogEntry::AfterImage(ai)) => {
                    trace!("after-image for {} at {pos}", ai.intention);
                    self.matcher.push(ai.intention, pos);
                }
                Ok(LogEntry::Intention(_)) => {}
                Err(e) => {
                    // log corruption is fatal for the reader
                    panic!("undecodable entry at position {pos}: {e}");
                }
            }
            pos += 1;
        }
    }

    /// Serve the registered intention queues from the minimum requested
    /// position, consulting the local intention cache before the log.
    fn intention_reader(&self) {
        let mut pos: Position = 0;
        let mut last_min: Option<Position> = None;

        loop {
            let min_pos = {
                let state = self.state.lock();
                if state.stop {
                    return;
                }
                match state.queues.iter().map(|q| q.position()).min() {
                    Some(min) => min,
                    None => {
                        drop(state);
                        last_min = None;
                        std::thread::sleep(IDLE_DELAY);
                        continue;
                    }
                }
            };

            match last_min {
                None => {
                    last_min = Some(min_pos);
                    pos = min_pos;
                }
                Some(prev) if min_pos < prev => {
                    // a new queue registered behind the cursor; restart
                    last_min = None;
                    continue;
                }
                _ => last_min = Some(min_pos),
            }

            let intention = match self.cache.find(pos) {
                Some(intention) => Some(intention),
                None => match self.log.read(pos) {
                    Ok(blob) => match LogEntry::decode(&blob) {
                        Ok(LogEntry::Intention(intention)) => Some(intention),
                        Ok(LogEntry::AfterImage(_)) => None,
                        Err(e) => panic!("undecodable entry at position {pos}: {e}"),
                    },
                    Err(LogError::NotWritten(_)) => {
                        std::thread::sleep(IDLE_DELAY);
                        continue;
                    }
                    Err(e) => {
                        warn!("intention read failed at {pos}: {e}");
                        std::thread::sleep(IDLE_DELAY);
                        continue;
                    }
                },
            };

            if let Some(intention) = intention {
                let state = self.state.lock();
                for queue in &state.queues {
                    if pos >= queue.position() {
                        queue.push(IntentionEntry {
                            pos,
                            intention: intention.clone(),
                        });
                    }
                }
            }
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Op;
    use crate::storage::MemLog;

    fn service() -> Arc<EntryService> {
        EntryService::new(Arc::new(MemLog::new()), 16, 0)
    }

    fn intention(token: u64) -> Intention {
        Intention {
            snapshot: Some(0),
            token,
            ops: vec![Op::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
            read_set: Vec::new(),
        }
    }

    fn pending(ipos: Position) -> PendingDelta {
        PendingDelta {
            intention: ipos,
            delta: Vec::new(),
            root: NodePtr::nil(),
        }
    }

    #[test]
    fn queue_is_ordered_and_stoppable() {
        let queue = IntentionQueue::new(5);
        assert_eq!(queue.position(), 5);
        queue.push(IntentionEntry {
            pos: 6,
            intention: intention(1),
        });
        assert_eq!(queue.position(), 7);
        let entry = queue.wait().unwrap();
        assert_eq!(entry.pos, 6);
        queue.stop();
        assert!(queue.wait().is_none());
    }

    #[test]
    fn matcher_pairs_in_either_arrival_order() {
        let matcher = PrimaryAfterImageMatcher::new(0);

        // watch first, after-image second
        matcher.watch(pending(1));
        matcher.push(1, 4);
        let m = matcher.match_next().unwrap();
        assert_eq!((m.pending.intention, m.ai_pos), (1, 4));
        assert_eq!(matcher.watermark(), 1);

        // after-image first, watch second
        matcher.push(2, 5);
        matcher.watch(pending(2));
        let m = matcher.match_next().unwrap();
        assert_eq!((m.pending.intention, m.ai_pos), (2, 5));
        assert_eq!(matcher.watermark(), 2);
    }

    #[test]
    fn matcher_ignores_duplicates_and_stale_pushes() {
        let matcher = PrimaryAfterImageMatcher::new(0);
        matcher.push(1, 3);
        matcher.push(1, 7); // duplicate after-image; first one wins
        matcher.watch(pending(1));
        let m = matcher.match_next().unwrap();
        assert_eq!(m.ai_pos, 3);
        // below the watermark now
        matcher.push(1, 9);
        matcher.shutdown();
        assert!(matcher.match_next().is_none());
    }

    #[test]
    fn matcher_watermark_waits_for_gaps() {
        let matcher = PrimaryAfterImageMatcher::new(0);
        matcher.watch(pending(1));
        matcher.watch(pending(2));
        matcher.push(2, 5);
        // 1 is still unmatched, so the watermark cannot pass it
        assert_eq!(matcher.watermark(), 0);
        matcher.push(1, 6);
        assert_eq!(matcher.watermark(), 2);
    }

    #[test]
    fn intention_reader_feeds_queues_in_order() {
        let service = service();
        let queue = service.new_intention_queue(0);
        service.start(0);

        let mut appended = Vec::new();
        for token in 0..3 {
            appended.push(service.append_intention(intention(token)).unwrap());
        }

        for (token, pos) in appended.iter().enumerate() {
            let entry = queue.wait().unwrap();
            assert_eq!(entry.pos, *pos);
            assert_eq!(entry.intention.token, token as u64);
        }
        service.stop();
    }

    #[test]
    fn log_reader_feeds_the_matcher() {
        let service = service();
        service.start(0);

        // position 0 carries an intention so the interesting one lands at 1,
        // above the initial watermark
        service.append_intention(intention(0)).unwrap();
        let ipos = service.append_intention(intention(1)).unwrap();
        let ai = AfterImage {
            intention: ipos,
            tree: Vec::new(),
        };
        let ai_pos = service.append_after_image(&ai).unwrap();

        service.matcher.watch(pending(ipos));
        let m = service.matcher.match_next().unwrap();
        assert_eq!((m.pending.intention, m.ai_pos), (ipos, ai_pos));
        service.stop();
    }
}
