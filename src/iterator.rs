//! Bidirectional iterator over a snapshot.
//!
//! Position is a stack of ancestors (current node on top) plus the travel
//! direction. Changing direction re-seeks to the current key the other way,
//! which rebuilds the stack so the opposite set of unvisited ancestors is
//! retained.

use std::sync::Arc;

use crate::db::{DbError, Snapshot};
use crate::node::Node;

enum Direction {
    Forward,
    Reverse,
}

pub struct DbIterator {
    snapshot: Snapshot,
    stack: Vec<Arc<Node>>,
    dir: Direction,
}

impl DbIterator {
    pub(crate) fn new(snapshot: Snapshot) -> Self {
        DbIterator {
            snapshot,
            stack: Vec::new(),
            dir: Direction::Forward,
        }
    }

    /// True iff the iterator is positioned at a key/value pair.
    pub fn valid(&self) -> bool {
        !self.stack.is_empty()
    }

    /// REQUIRES: `valid()`
    pub fn key(&self) -> &[u8] {
        self.stack.last().expect("iterator is valid").key()
    }

    /// REQUIRES: `valid()`
    pub fn value(&self) -> &[u8] {
        self.stack.last().expect("iterator is valid").val()
    }

    pub fn seek_to_first(&mut self) -> Result<(), DbError> {
        let mut trace = Vec::new();
        self.stack.clear();
        let cache = self.snapshot.cache();
        let mut node = self.snapshot.root().resolve(cache, &mut trace)?;
        while let Some(n) = node {
            self.stack.push(n.clone());
            node = n.left.resolve(cache, &mut trace)?;
        }
        cache.update_lru(&mut trace);
        self.dir = Direction::Forward;
        Ok(())
    }

    pub fn seek_to_last(&mut self) -> Result<(), DbError> {
        let mut trace = Vec::new();
        self.stack.clear();
        let cache = self.snapshot.cache();
        let mut node = self.snapshot.root().resolve(cache, &mut trace)?;
        while let Some(n) = node {
            self.stack.push(n.clone());
            node = n.right.resolve(cache, &mut trace)?;
        }
        cache.update_lru(&mut trace);
        self.dir = Direction::Reverse;
        Ok(())
    }

    /// Position at the first key at or past `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<(), DbError> {
        let mut trace = Vec::new();
        self.stack.clear();
        let cache = self.snapshot.cache();
        let mut node = self.snapshot.root().resolve(cache, &mut trace)?;
        while let Some(n) = node {
            match target.cmp(n.key()) {
                std::cmp::Ordering::Equal => {
                    self.stack.push(n);
                    break;
                }
                std::cmp::Ordering::Less => {
                    self.stack.push(n.clone());
                    node = n.left.resolve(cache, &mut trace)?;
                }
                std::cmp::Ordering::Greater => {
                    node = n.right.resolve(cache, &mut trace)?;
                }
            }
        }
        cache.update_lru(&mut trace);
        self.dir = Direction::Forward;
        Ok(())
    }

    /// Position at the last key at or before `target`, travelling backwards.
    fn seek_previous(&mut self, target: &[u8]) -> Result<(), DbError> {
        let mut trace = Vec::new();
        self.stack.clear();
        let cache = self.snapshot.cache();
        let mut node = self.snapshot.root().resolve(cache, &mut trace)?;
        while let Some(n) = node {
            match target.cmp(n.key()) {
                std::cmp::Ordering::Equal => {
                    self.stack.push(n);
                    break;
                }
                std::cmp::Ordering::Less => {
                    node = n.left.resolve(cache, &mut trace)?;
                }
                std::cmp::Ordering::Greater => {
                    self.stack.push(n.clone());
                    node = n.right.resolve(cache, &mut trace)?;
                }
            }
        }
        cache.update_lru(&mut trace);
        self.dir = Direction::Reverse;
        Ok(())
    }

    /// REQUIRES: `valid()`
    pub fn next(&mut self) -> Result<(), DbError> {
        assert!(self.valid());
        if matches!(self.dir, Direction::Reverse) {
            // re-orient: the current key still exists in this snapshot
            let key = self.key().to_vec();
            self.seek(&key)?;
        }
        let mut trace = Vec::new();
        let cache = self.snapshot.cache();
        let top = self.stack.pop().expect("iterator is valid");
        let mut node = top.right.resolve(cache, &mut trace)?;
        while let Some(n) = node {
            self.stack.push(n.clone());
            node = n.left.resolve(cache, &mut trace)?;
        }
        cache.update_lru(&mut trace);
        Ok(())
    }

    /// REQUIRES: `valid()`
    pub fn prev(&mut self) -> Result<(), DbError> {
        assert!(self.valid());
        if matches!(self.dir, Direction::Forward) {
            let key = self.key().to_vec();
            self.seek_previous(&key)?;
        }
        let mut trace = Vec::new();
        let cache = self.snapshot.cache();
        let top = self.stack.pop().expect("iterator is valid");
        let mut node = top.left.resolve(cache, &mut trace)?;
        while let Some(n) = node {
            self.stack.push(n.clone());
            node = n.right.resolve(cache, &mut trace)?;
        }
        cache.update_lru(&mut trace);
        Ok(())
    }
}
