//! Tree nodes and the pointers that connect them.
//!
//! A published node is immutable: key, value, color and rid are fixed when
//! the node is frozen out of a transaction workspace. Only its child
//! pointers retain interior mutability, for two narrow purposes: upgrading a
//! transient intention-kinded address to the after-image address once that
//! position is known, and memoizing the in-memory reference after a cache
//! fetch.
//!
//! Strong ownership of nodes lives in the cache (and, for a delta that has
//! not been published yet, in the commit pipeline). Everything else, from
//! child pointers to the canonical root to snapshots, holds a weak
//! reference plus a log address, so evicting a node from the cache never
//! breaks the tree: the next traversal re-fetches it from the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::cache::{CacheError, NodeCache};
use crate::storage::Position;

/// Where a serialized node lives on the log.
///
/// `off` is the post-order index of the node within the after-image that
/// contains it. `Intention`-kinded addresses are transient: they name the
/// commit, and are upgraded to the after-image address once the entry
/// service discovers where the delta landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeAddress {
    Intention { pos: Position, off: u16 },
    AfterImage { pos: Position, off: u16 },
}

impl NodeAddress {
    pub fn pos(&self) -> Position {
        match *self {
            NodeAddress::Intention { pos, .. } | NodeAddress::AfterImage { pos, .. } => pos,
        }
    }

    pub fn off(&self) -> u16 {
        match *self {
            NodeAddress::Intention { off, .. } | NodeAddress::AfterImage { off, .. } => off,
        }
    }

    pub fn is_after_image(&self) -> bool {
        matches!(self, NodeAddress::AfterImage { .. })
    }
}

enum PtrState {
    Nil,
    Live {
        node: Weak<Node>,
        addr: Option<NodeAddress>,
    },
}

impl Clone for PtrState {
    fn clone(&self) -> Self {
        match self {
            PtrState::Nil => PtrState::Nil,
            PtrState::Live { node, addr } => PtrState::Live {
                node: node.clone(),
                addr: *addr,
            },
        }
    }
}

/// Child reference: Nil, or a weak in-memory reference paired with the log
/// address it can be re-fetched from. Either half may be absent, never both
/// once the node is reachable from a published root.
pub struct NodePtr(RwLock<PtrState>);

impl Clone for NodePtr {
    fn clone(&self) -> Self {
        NodePtr(RwLock::new(self.0.read().clone()))
    }
}

impl NodePtr {
    pub fn nil() -> Self {
        NodePtr(RwLock::new(PtrState::Nil))
    }

    pub fn new(node: &Arc<Node>, addr: Option<NodeAddress>) -> Self {
        NodePtr(RwLock::new(PtrState::Live {
            node: Arc::downgrade(node),
            addr,
        }))
    }

    pub fn from_address(addr: NodeAddress) -> Self {
        NodePtr(RwLock::new(PtrState::Live {
            node: Weak::new(),
            addr: Some(addr),
        }))
    }

    pub fn is_nil(&self) -> bool {
        matches!(&*self.0.read(), PtrState::Nil)
    }

    pub fn address(&self) -> Option<NodeAddress> {
        match &*self.0.read() {
            PtrState::Nil => None,
            PtrState::Live { addr, .. } => *addr,
        }
    }

    pub fn set_address(&self, new: NodeAddress) {
        match &mut *self.0.write() {
            PtrState::Nil => unreachable!("nil pointers never carry an address"),
            PtrState::Live { addr, .. } => *addr = Some(new),
        }
    }

    /// Upgrade a self-referential intention address `(intention, off)` to
    /// the after-image address `(ai_pos, off)`, once known.
    pub fn convert_to_after_image(&self, intention: Position, ai_pos: Position) {
        if let PtrState::Live { addr, .. } = &mut *self.0.write() {
            if let Some(NodeAddress::Intention { pos, off }) = *addr {
                if pos == intention {
                    *addr = Some(NodeAddress::AfterImage { pos: ai_pos, off });
                }
            }
        }
    }

    /// Resolve to a materialized node, `None` meaning Nil.
    ///
    /// The weak reference is tried first; a dead reference falls back to the
    /// cache, which may read the log. The fetched reference is memoized so
    /// the next traversal skips the cache lookup.
    pub fn resolve(
        &self,
        cache: &NodeCache,
        trace: &mut Vec<NodeAddress>,
    ) -> Result<Option<Arc<Node>>, CacheError> {
        let addr = {
            let state = self.0.read();
            match &*state {
                PtrState::Nil => return Ok(None),
                PtrState::Live { node, addr } => {
                    if let Some(node) = node.upgrade() {
                        return Ok(Some(node));
                    }
                    match addr {
                        Some(addr) => *addr,
                        None => return Err(CacheError::Unreachable),
                    }
                }
            }
        };
        let node = cache.fetch(trace, addr)?;
        if let PtrState::Live { node: weak, .. } = &mut *self.0.write() {
            *weak = Arc::downgrade(&node);
        }
        Ok(Some(node))
    }

    /// True when both pointers name the same node. Used by the rebalance
    /// logic to find which side of a parent a child hangs from. Address
    /// equality decides when both sides carry one; otherwise both weak
    /// references must be live and identical (two dangling weaks compare
    /// equal through `Weak::ptr_eq`, which must not count).
    pub fn same(&self, other: &NodePtr) -> bool {
        let a = self.0.read();
        let b = other.0.read();
        match (&*a, &*b) {
            (PtrState::Nil, PtrState::Nil) => true,
            (
                PtrState::Live { node: n1, addr: a1 },
                PtrState::Live { node: n2, addr: a2 },
            ) => {
                if a1.is_some() && a1 == a2 {
                    return true;
                }
                match (n1.upgrade(), n2.upgrade()) {
                    (Some(x), Some(y)) => Arc::ptr_eq(&x, &y),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// An immutable tree node, introduced by the commit `rid`.
pub struct Node {
    red: bool,
    rid: Position,
    key: Box<[u8]>,
    val: Box<[u8]>,
    pub left: NodePtr,
    pub right: NodePtr,
    read_only: AtomicBool,
}

impl Node {
    pub fn new(
        red: bool,
        rid: Position,
        key: Vec<u8>,
        val: Vec<u8>,
        left: NodePtr,
        right: NodePtr,
    ) -> Self {
        Node {
            red,
            rid,
            key: key.into(),
            val: val.into(),
            left,
            right,
            read_only: AtomicBool::new(false),
        }
    }

    pub fn red(&self) -> bool {
        self.red
    }

    pub fn rid(&self) -> Position {
        self.rid
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn val(&self) -> &[u8] {
        &self.val
    }

    /// Flag the node as published. Address upgrades are forbidden from here
    /// on; the flag is a debug guard, the type has no other mutators.
    pub fn set_read_only(&self) {
        self.read_only.store(true, Ordering::Relaxed);
    }

    pub fn read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// In-memory footprint charged against the cache budget.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.val.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_pointer_has_no_address() {
        let ptr = NodePtr::nil();
        assert!(ptr.is_nil());
        assert!(ptr.address().is_none());
    }

    #[test]
    fn convert_rewrites_only_matching_intention() {
        let ptr = NodePtr::from_address(NodeAddress::Intention { pos: 5, off: 2 });
        ptr.convert_to_after_image(4, 9);
        assert_eq!(
            ptr.address(),
            Some(NodeAddress::Intention { pos: 5, off: 2 })
        );
        ptr.convert_to_after_image(5, 9);
        assert_eq!(
            ptr.address(),
            Some(NodeAddress::AfterImage { pos: 9, off: 2 })
        );
        // already upgraded; a second conversion is a no-op
        ptr.convert_to_after_image(5, 11);
        assert_eq!(
            ptr.address(),
            Some(NodeAddress::AfterImage { pos: 9, off: 2 })
        );
    }

    #[test]
    fn same_follows_identity_then_address() {
        let node = Arc::new(Node::new(
            false,
            0,
            b"k".to_vec(),
            b"v".to_vec(),
            NodePtr::nil(),
            NodePtr::nil(),
        ));
        let a = NodePtr::new(&node, None);
        let b = a.clone();
        assert!(a.same(&b));
        assert!(!a.same(&NodePtr::nil()));

        let c = NodePtr::from_address(NodeAddress::AfterImage { pos: 1, off: 0 });
        let d = NodePtr::from_address(NodeAddress::AfterImage { pos: 1, off: 0 });
        assert!(c.same(&d));
    }
}
