//! # Driftwood: an ordered key-value store whose entire state lives on a shared append-only log.
//!
//! Driftwood is an embedded, multi-version key-value database with a twist:
//! there is no data file. Every piece of state the database has ever held,
//! including every historical version, is an entry on a single append-only
//! log, and the live database is nothing more than an in-memory view over
//! that log. Opening a database is replaying a log; crash recovery is
//! opening a database. Because the log is the sole source of truth and
//! appends are the only writes, a crash at any instant is safe: whatever the
//! log acknowledged is the database, and whatever it did not acknowledge
//! never happened.
//!
//! The design is built from four layers that decouple the wire
//! representation from the data structure it encodes:
//!
//! - Log backend: the [`storage::Log`] trait captures the contract driftwood
//!   needs from a shared log (totally ordered positions, idempotent reads,
//!   durable appends) and nothing more. The backend owns sequencing and
//!   durability; an in-memory implementation backs tests and volatile
//!   databases.
//!
//! - Index: the committed state is a persistent (copy-on-write) red-black
//!   tree. Mutating a tree produces a new root sharing almost all structure
//!   with the old one, so every commit is a cheap new version and any old
//!   root remains readable forever. Tree nodes live at `(position, offset)`
//!   addresses on the log and are materialized on demand through a sharded,
//!   memory-bounded node cache ([`cache`]).
//!
//! - Commit protocol: a transaction appends an *intention* (its write ops
//!   and read set); a replay worker processes intentions in log order,
//!   decides commit or abort with optimistic concurrency control, and
//!   publishes the committed delta as an *after-image* entry whose
//!   deterministic post-order layout doubles as the node addressing scheme
//!   ([`db`], [`entry`]).
//!
//! - Entry service: background readers stream the log, feed intentions to
//!   the replay worker in order, and pair every committed intention with
//!   the first after-image observed for it, which is how transient
//!   intention-relative node addresses become durable after-image
//!   addresses ([`entry`]).
//!
//! Readers never block writers: [`db::Db::get_snapshot`] captures a root
//! pointer, and iterators over it see a frozen version of the database no
//! matter what commits afterwards.

pub mod cache;
pub mod codec;
pub mod db;
pub mod entry;
pub mod iterator;
pub(crate) mod logger;
pub mod node;
pub mod storage;
pub mod tree;

pub use db::{Db, DbConfig, DbError, Snapshot, Transaction};
pub use iterator::DbIterator;
pub use storage::{Log, LogError, MemLog, Position};
