//! Copy-on-write red-black tree used as the workspace of every transaction
//! and as the replay vehicle for committed intentions.
//!
//! A workspace starts from a published snapshot root and accumulates *fresh*
//! nodes in an arena. Descending, any node that is not already fresh is
//! copied into the arena before modification; fresh nodes are mutated in
//! place. Freezing the workspace converts the arena into the immutable delta
//! that gets serialized as an after-image: nodes in deterministic post-order,
//! fresh-to-fresh child pointers carrying intention-kinded addresses until
//! the after-image position is learned.
//!
//! Insertion and deletion rebalancing are each written once and instantiated
//! for both directions through the `Side` selector pair, the way the
//! original templates its rotations.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{CacheError, NodeCache};
use crate::codec::{AfterImage, NodeRecord, PtrRecord};
use crate::node::{Node, NodeAddress, NodePtr};
use crate::storage::Position;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// A single commit produced more nodes than a u16 offset can address.
    #[error("delta exceeds the after-image offset space")]
    DeltaOverflow,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Side {
    Left,
    Right,
}

/// A child reference inside a workspace: the shared sentinel, a fresh node
/// in the arena, or a published node reachable through its pointer state.
#[derive(Clone)]
enum Child {
    Nil,
    Fresh(usize),
    Extern(NodePtr),
}

impl Child {
    fn from_link(link: &NodePtr) -> Child {
        if link.is_nil() {
            Child::Nil
        } else {
            Child::Extern(link.clone())
        }
    }

    fn is_nil(&self) -> bool {
        matches!(self, Child::Nil)
    }

    fn fresh(&self) -> usize {
        match self {
            Child::Fresh(idx) => *idx,
            _ => unreachable!("rebalance touched a node that was never copied"),
        }
    }
}

struct FreshNode {
    red: bool,
    key: Vec<u8>,
    val: Vec<u8>,
    left: Child,
    right: Child,
}

impl FreshNode {
    fn child(&self, side: Side) -> &Child {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn child_mut(&mut self, side: Side) -> &mut Child {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

/// The frozen product of a committed workspace: the wire after-image, the
/// delta nodes in matching post-order, and a pointer to the new root.
pub struct Frozen {
    pub after_image: AfterImage,
    pub delta: Vec<Arc<Node>>,
    pub root: NodePtr,
}

/// Rewrite self-referential intention addresses `(intention, off)` to the
/// after-image address `(ai_pos, off)` across a delta, once the after-image
/// position is known.
pub fn set_delta_position(delta: &[Arc<Node>], intention: Position, ai_pos: Position) {
    for node in delta {
        node.left.convert_to_after_image(intention, ai_pos);
        node.right.convert_to_after_image(intention, ai_pos);
    }
}

pub struct PersistentTree {
    src_root: NodePtr,
    /// Unique negative workspace id; becomes the intention position on
    /// freeze. Only its uniqueness matters in memory.
    rid: i64,
    root: Option<Child>,
    arena: Vec<FreshNode>,
    trace: Vec<NodeAddress>,
}

impl PersistentTree {
    pub fn new(src_root: NodePtr, rid: i64) -> Self {
        debug_assert!(rid < 0);
        PersistentTree {
            src_root,
            rid,
            root: None,
            arena: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn rid(&self) -> i64 {
        self.rid
    }

    /// True until the first structural change.
    pub fn empty_delta(&self) -> bool {
        self.root.is_none()
    }

    fn base_root(&self) -> Child {
        match &self.root {
            Some(root) => root.clone(),
            None => Child::from_link(&self.src_root),
        }
    }

    fn resolve(&mut self, cache: &NodeCache, ptr: &NodePtr) -> Result<Arc<Node>, TreeError> {
        match ptr.resolve(cache, &mut self.trace)? {
            Some(node) => Ok(node),
            None => Err(CacheError::Unreachable.into()),
        }
    }

    fn child_of(&mut self, cache: &NodeCache, node: &Child, side: Side) -> Result<Child, TreeError> {
        match node {
            // Nil's children refer to itself
            Child::Nil => Ok(Child::Nil),
            Child::Fresh(idx) => Ok(self.arena[*idx].child(side).clone()),
            Child::Extern(ptr) => {
                let node = self.resolve(cache, ptr)?;
                let link = match side {
                    Side::Left => &node.left,
                    Side::Right => &node.right,
                };
                Ok(Child::from_link(link))
            }
        }
    }

    fn is_red(&mut self, cache: &NodeCache, node: &Child) -> Result<bool, TreeError> {
        match node {
            Child::Nil => Ok(false),
            Child::Fresh(idx) => Ok(self.arena[*idx].red),
            Child::Extern(ptr) => Ok(self.resolve(cache, ptr)?.red()),
        }
    }

    fn cmp_key(&mut self, cache: &NodeCache, key: &[u8], node: &Child) -> Result<Ordering, TreeError> {
        match node {
            Child::Nil => unreachable!("key comparison against nil"),
            Child::Fresh(idx) => Ok(key.cmp(&self.arena[*idx].key)),
            Child::Extern(ptr) => {
                let node = self.resolve(cache, ptr)?;
                Ok(key.cmp(node.key()))
            }
        }
    }

    fn same(&self, a: &Child, b: &Child) -> bool {
        match (a, b) {
            (Child::Nil, Child::Nil) => true,
            (Child::Fresh(i), Child::Fresh(j)) => i == j,
            (Child::Extern(p), Child::Extern(q)) => p.same(q),
            _ => false,
        }
    }

    /// Copy-on-write: fresh nodes pass through, published nodes are cloned
    /// into the arena. Nil is never copied.
    fn make_fresh(&mut self, cache: &NodeCache, node: &Child) -> Result<Child, TreeError> {
        match node {
            Child::Nil => Ok(Child::Nil),
            Child::Fresh(idx) => Ok(Child::Fresh(*idx)),
            Child::Extern(ptr) => {
                let src = self.resolve(cache, ptr)?;
                let copy = FreshNode {
                    red: src.red(),
                    key: src.key().to_vec(),
                    val: src.val().to_vec(),
                    left: Child::from_link(&src.left),
                    right: Child::from_link(&src.right),
                };
                self.arena.push(copy);
                Ok(Child::Fresh(self.arena.len() - 1))
            }
        }
    }

    fn make_fresh_idx(&mut self, cache: &NodeCache, node: &Child) -> Result<usize, TreeError> {
        Ok(self.make_fresh(cache, node)?.fresh())
    }

    fn swap_colors(&mut self, a: usize, b: usize) {
        let tmp = self.arena[a].red;
        self.arena[a].red = self.arena[b].red;
        self.arena[b].red = tmp;
    }

    // ---- lookup ----

    pub fn get(&mut self, cache: &NodeCache, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        let mut cur = self.base_root();
        let found = loop {
            if cur.is_nil() {
                break None;
            }
            match self.cmp_key(cache, key, &cur)? {
                Ordering::Equal => {
                    break Some(match &cur {
                        Child::Fresh(idx) => self.arena[*idx].val.clone(),
                        Child::Extern(ptr) => self.resolve(cache, ptr)?.val().to_vec(),
                        Child::Nil => unreachable!(),
                    });
                }
                Ordering::Less => cur = self.child_of(cache, &cur, Side::Left)?,
                Ordering::Greater => cur = self.child_of(cache, &cur, Side::Right)?,
            }
        };
        cache.update_lru(&mut self.trace);
        Ok(found)
    }

    // ---- insertion ----

    fn insert_recursive(
        &mut self,
        cache: &NodeCache,
        path: &mut VecDeque<Child>,
        key: &[u8],
        value: &[u8],
        node: &Child,
    ) -> Result<Option<usize>, TreeError> {
        if node.is_nil() {
            self.arena.push(FreshNode {
                red: true,
                key: key.to_vec(),
                val: value.to_vec(),
                left: Child::Nil,
                right: Child::Nil,
            });
            let idx = self.arena.len() - 1;
            path.push_back(Child::Fresh(idx));
            return Ok(Some(idx));
        }

        let side = match self.cmp_key(cache, key, node)? {
            Ordering::Equal => return Ok(None),
            Ordering::Less => Side::Left,
            Ordering::Greater => Side::Right,
        };

        let next = self.child_of(cache, node, side)?;
        let Some(child) = self.insert_recursive(cache, path, key, value, &next)? else {
            return Ok(None);
        };

        // the copy inherits child pointers with their addresses; the fresh
        // side is relinked here and renumbered at freeze
        let copy = self.make_fresh_idx(cache, node)?;
        *self.arena[copy].child_mut(side) = Child::Fresh(child);
        path.push_back(Child::Fresh(copy));
        Ok(Some(copy))
    }

    fn rotate(
        &mut self,
        cache: &NodeCache,
        parent: &Child,
        child: usize,
        a: Side,
        b: Side,
        root: &mut Child,
    ) -> Result<usize, TreeError> {
        let grand_child = self.arena[child].child(b).clone();
        // rotation pivots are always copied by the caller first
        let gc = grand_child.fresh();
        *self.arena[child].child_mut(b) = self.arena[gc].child(a).clone();

        if self.same(root, &Child::Fresh(child)) {
            *root = Child::Fresh(gc);
        } else {
            let parent_idx = parent.fresh();
            let next = self.child_of(cache, parent, a)?;
            if self.same(&next, &Child::Fresh(child)) {
                *self.arena[parent_idx].child_mut(a) = Child::Fresh(gc);
            } else {
                *self.arena[parent_idx].child_mut(b) = Child::Fresh(gc);
            }
        }

        *self.arena[gc].child_mut(a) = Child::Fresh(child);
        Ok(gc)
    }

    fn insert_balance(
        &mut self,
        cache: &NodeCache,
        parent: &mut Child,
        nn: &mut Child,
        path: &mut VecDeque<Child>,
        a: Side,
        b: Side,
        root: &mut Child,
    ) -> Result<(), TreeError> {
        let grand_parent = path.front().cloned().expect("rebalance ran past the root");
        let gp = grand_parent.fresh();
        let uncle = self.arena[gp].child(b).clone();
        if self.is_red(cache, &uncle)? {
            let uncle = self.make_fresh(cache, &uncle)?;
            *self.arena[gp].child_mut(b) = uncle.clone();
            self.arena[parent.fresh()].red = false;
            self.arena[uncle.fresh()].red = false;
            self.arena[gp].red = true;
            *nn = path.pop_front().expect("grandparent on path");
            *parent = path.pop_front().expect("nil sentinel bounds the path");
        } else {
            let inner = self.child_of(cache, parent, b)?;
            if self.same(&inner, nn) {
                std::mem::swap(nn, parent);
                let front = path.front().cloned().expect("grandparent on path");
                self.rotate(cache, &front, nn.fresh(), a, b, root)?;
            }
            let grand_parent = path.pop_front().expect("grandparent on path");
            let gp = grand_parent.fresh();
            self.swap_colors(gp, parent.fresh());
            let front = path.front().cloned().expect("nil sentinel bounds the path");
            self.rotate(cache, &front, gp, b, a, root)?;
        }
        Ok(())
    }

    pub fn put(&mut self, cache: &NodeCache, key: &[u8], value: &[u8]) -> Result<(), TreeError> {
        let mut path = VecDeque::new();
        let base = self.base_root();
        let inserted = self.insert_recursive(cache, &mut path, key, value, &base)?;
        let mut root = match inserted {
            Some(idx) => Child::Fresh(idx),
            None => {
                // update of an existing key: delete then re-insert
                self.delete(cache, key)?;
                path.clear();
                let base = self.base_root();
                let idx = self
                    .insert_recursive(cache, &mut path, key, value, &base)?
                    .expect("re-insert after delete");
                Child::Fresh(idx)
            }
        };

        path.push_back(Child::Nil);
        debug_assert!(path.len() >= 2);

        let mut nn = path.pop_front().expect("new node on path");
        let mut parent = path.pop_front().expect("nil sentinel bounds the path");

        while self.is_red(cache, &parent)? {
            let grand_parent = path.front().cloned().expect("red parent has a parent");
            let left = self.child_of(cache, &grand_parent, Side::Left)?;
            if self.same(&left, &parent) {
                self.insert_balance(cache, &mut parent, &mut nn, &mut path, Side::Left, Side::Right, &mut root)?;
            } else {
                self.insert_balance(cache, &mut parent, &mut nn, &mut path, Side::Right, Side::Left, &mut root)?;
            }
        }

        self.arena[root.fresh()].red = false;
        self.root = Some(root);
        cache.update_lru(&mut self.trace);
        Ok(())
    }

    // ---- deletion ----

    fn delete_recursive(
        &mut self,
        cache: &NodeCache,
        path: &mut VecDeque<Child>,
        key: &[u8],
        node: &Child,
    ) -> Result<Option<usize>, TreeError> {
        if node.is_nil() {
            return Ok(None);
        }

        let side = match self.cmp_key(cache, key, node)? {
            Ordering::Equal => {
                let copy = self.make_fresh_idx(cache, node)?;
                path.push_back(Child::Fresh(copy));
                return Ok(Some(copy));
            }
            Ordering::Less => Side::Left,
            Ordering::Greater => Side::Right,
        };

        let next = self.child_of(cache, node, side)?;
        let Some(child) = self.delete_recursive(cache, path, key, &next)? else {
            return Ok(None);
        };

        let copy = self.make_fresh_idx(cache, node)?;
        *self.arena[copy].child_mut(side) = Child::Fresh(child);
        path.push_back(Child::Fresh(copy));
        Ok(Some(copy))
    }

    fn transplant(
        &mut self,
        cache: &NodeCache,
        parent: &Child,
        removed: &Child,
        transplanted: Child,
        root: &mut Child,
    ) -> Result<(), TreeError> {
        if parent.is_nil() {
            *root = transplanted;
        } else {
            let parent_idx = parent.fresh();
            let left = self.child_of(cache, parent, Side::Left)?;
            if self.same(&left, removed) {
                *self.arena[parent_idx].child_mut(Side::Left) = transplanted;
            } else {
                *self.arena[parent_idx].child_mut(Side::Right) = transplanted;
            }
        }
        Ok(())
    }

    /// Descend to the minimum of a fresh subtree, copying the left spine and
    /// pushing the ancestors onto the front of the path.
    fn build_min_path(
        &mut self,
        cache: &NodeCache,
        mut node: usize,
        path: &mut VecDeque<Child>,
    ) -> Result<usize, TreeError> {
        loop {
            let left = self.arena[node].child(Side::Left).clone();
            if left.is_nil() {
                return Ok(node);
            }
            let left = self.make_fresh(cache, &left)?;
            *self.arena[node].child_mut(Side::Left) = left.clone();
            path.push_front(Child::Fresh(node));
            node = left.fresh();
        }
    }

    fn mirror_remove_balance(
        &mut self,
        cache: &NodeCache,
        extra_black: &mut Child,
        parent: &mut Child,
        path: &mut VecDeque<Child>,
        a: Side,
        b: Side,
        root: &mut Child,
    ) -> Result<(), TreeError> {
        let parent_idx = parent.fresh();
        let mut brother = self.arena[parent_idx].child(b).clone();

        if self.is_red(cache, &brother)? {
            brother = self.make_fresh(cache, &brother)?;
            *self.arena[parent_idx].child_mut(b) = brother.clone();
            self.swap_colors(brother.fresh(), parent_idx);
            let front = path.front().cloned().unwrap_or(Child::Nil);
            self.rotate(cache, &front, parent_idx, a, b, root)?;
            path.push_front(brother);
            brother = self.arena[parent_idx].child(b).clone();
        }

        let near = self.child_of(cache, &brother, a)?;
        let far = self.child_of(cache, &brother, b)?;

        if !self.is_red(cache, &near)? && !self.is_red(cache, &far)? {
            brother = self.make_fresh(cache, &brother)?;
            *self.arena[parent_idx].child_mut(b) = brother.clone();
            self.arena[brother.fresh()].red = true;
            *extra_black = parent.clone();
            *parent = path.pop_front().expect("nil sentinel bounds the path");
        } else {
            if !self.is_red(cache, &far)? {
                brother = self.make_fresh(cache, &brother)?;
                *self.arena[parent_idx].child_mut(b) = brother.clone();
                let brother_idx = brother.fresh();

                let near = self.arena[brother_idx].child(a).clone();
                let near = self.make_fresh(cache, &near)?;
                *self.arena[brother_idx].child_mut(a) = near.clone();
                self.swap_colors(brother_idx, near.fresh());
                let gc = self.rotate(cache, parent, brother_idx, b, a, root)?;
                brother = Child::Fresh(gc);
            }

            brother = self.make_fresh(cache, &brother)?;
            *self.arena[parent_idx].child_mut(b) = brother.clone();
            let brother_idx = brother.fresh();

            let far = self.arena[brother_idx].child(b).clone();
            let far = self.make_fresh(cache, &far)?;
            *self.arena[brother_idx].child_mut(b) = far.clone();

            self.arena[brother_idx].red = self.arena[parent_idx].red;
            self.arena[parent_idx].red = false;
            self.arena[far.fresh()].red = false;
            let front = path.front().cloned().unwrap_or(Child::Nil);
            self.rotate(cache, &front, parent_idx, a, b, root)?;

            *extra_black = root.clone();
            *parent = Child::Nil;
        }
        Ok(())
    }

    fn balance_delete(
        &mut self,
        cache: &NodeCache,
        mut extra_black: Child,
        path: &mut VecDeque<Child>,
        root: &mut Child,
    ) -> Result<(), TreeError> {
        let mut parent = path.pop_front().expect("parent on deletion path");

        while !self.same(&extra_black, root) && !self.is_red(cache, &extra_black)? {
            let left = self.child_of(cache, &parent, Side::Left)?;
            if self.same(&left, &extra_black) {
                self.mirror_remove_balance(cache, &mut extra_black, &mut parent, path, Side::Left, Side::Right, root)?;
            } else {
                self.mirror_remove_balance(cache, &mut extra_black, &mut parent, path, Side::Right, Side::Left, root)?;
            }
        }

        let new_node = self.make_fresh(cache, &extra_black)?;
        self.transplant(cache, &parent, &extra_black, new_node.clone(), root)?;

        // the extra black may land on Nil, which is already black
        if let Child::Fresh(idx) = new_node {
            self.arena[idx].red = false;
        }
        Ok(())
    }

    pub fn delete(&mut self, cache: &NodeCache, key: &[u8]) -> Result<(), TreeError> {
        let mut path = VecDeque::new();
        let base = self.base_root();
        let Some(root_idx) = self.delete_recursive(cache, &mut path, key, &base)? else {
            cache.update_lru(&mut self.trace);
            return Ok(());
        };
        let mut root = Child::Fresh(root_idx);

        path.push_back(Child::Nil);
        debug_assert!(path.len() >= 2);

        let mut removed = path.front().cloned().expect("removed node on path").fresh();
        debug_assert_eq!(self.arena[removed].key, key);

        let transplanted;
        if self.arena[removed].left.is_nil() {
            transplanted = self.arena[removed].right.clone();
            path.pop_front();
            let front = path.front().cloned().expect("nil sentinel bounds the path");
            self.transplant(cache, &front, &Child::Fresh(removed), transplanted.clone(), &mut root)?;
        } else if self.arena[removed].right.is_nil() {
            transplanted = self.arena[removed].left.clone();
            path.pop_front();
            let front = path.front().cloned().expect("nil sentinel bounds the path");
            self.transplant(cache, &front, &Child::Fresh(removed), transplanted.clone(), &mut root)?;
        } else {
            // two children: the successor is pulled out of the right subtree
            // and its payload moved into the surviving copy
            let temp = removed;
            let right = self.arena[removed].right.clone();
            let right = self.make_fresh(cache, &right)?;
            *self.arena[removed].child_mut(Side::Right) = right.clone();
            removed = self.build_min_path(cache, right.fresh(), &mut path)?;
            transplanted = self.arena[removed].right.clone();

            let key = std::mem::take(&mut self.arena[removed].key);
            let val = std::mem::take(&mut self.arena[removed].val);
            self.arena[temp].key = key;
            self.arena[temp].val = val;

            let front = path.front().cloned().expect("successor parent on path");
            self.transplant(cache, &front, &Child::Fresh(removed), transplanted.clone(), &mut root)?;
        }

        if !self.arena[removed].red {
            self.balance_delete(cache, transplanted, &mut path, &mut root)?;
        }

        self.root = Some(root);
        cache.update_lru(&mut self.trace);
        Ok(())
    }

    // ---- path copy ----

    fn copy_recursive(
        &mut self,
        cache: &NodeCache,
        key: &[u8],
        node: &Child,
    ) -> Result<Option<Child>, TreeError> {
        if node.is_nil() {
            return Ok(None);
        }

        let side = match self.cmp_key(cache, key, node)? {
            Ordering::Equal => {
                return Ok(match node {
                    // already part of this workspace
                    Child::Fresh(_) => None,
                    _ => Some(self.make_fresh(cache, node)?),
                });
            }
            Ordering::Less => Side::Left,
            Ordering::Greater => Side::Right,
        };

        let next = self.child_of(cache, node, side)?;
        let Some(child) = self.copy_recursive(cache, key, &next)? else {
            return Ok(None);
        };

        let copy = self.make_fresh_idx(cache, node)?;
        *self.arena[copy].child_mut(side) = child;
        Ok(Some(Child::Fresh(copy)))
    }

    /// Path-copy without modification: an existing path is replaced by
    /// fresh copies, so no rebalance is necessary.
    pub fn copy(&mut self, cache: &NodeCache, key: &[u8]) -> Result<(), TreeError> {
        let base = self.base_root();
        if let Some(root) = self.copy_recursive(cache, key, &base)? {
            self.root = Some(root);
        }
        cache.update_lru(&mut self.trace);
        Ok(())
    }

    // ---- freezing ----

    fn freeze_link(
        &mut self,
        cache: &NodeCache,
        child: &Child,
        intention: Position,
        records: &mut Vec<NodeRecord>,
        delta: &mut Vec<Arc<Node>>,
    ) -> Result<(PtrRecord, NodePtr), TreeError> {
        match child {
            Child::Nil => Ok((PtrRecord::Nil, NodePtr::nil())),
            Child::Fresh(idx) => {
                let off = self.freeze_node(cache, *idx, intention, records, delta)?;
                let ptr = NodePtr::new(
                    &delta[off as usize],
                    Some(NodeAddress::Intention {
                        pos: intention,
                        off,
                    }),
                );
                Ok((PtrRecord::Slf { off }, ptr))
            }
            Child::Extern(ptr) => {
                let addr = ptr.address().ok_or(CacheError::Unreachable)?;
                let rec = match addr {
                    NodeAddress::AfterImage { pos, off } => PtrRecord::AfterImage { pos, off },
                    NodeAddress::Intention { pos, off } => {
                        // upgrade if the after-image has been discovered by
                        // now; otherwise the transient form goes to the log
                        match cache.intention_to_after_image(pos) {
                            Some(ai) => PtrRecord::AfterImage { pos: ai, off },
                            None => PtrRecord::Intention { pos, off },
                        }
                    }
                };
                Ok((rec, ptr.clone()))
            }
        }
    }

    fn freeze_node(
        &mut self,
        cache: &NodeCache,
        idx: usize,
        intention: Position,
        records: &mut Vec<NodeRecord>,
        delta: &mut Vec<Arc<Node>>,
    ) -> Result<u16, TreeError> {
        let left = self.arena[idx].left.clone();
        let right = self.arena[idx].right.clone();
        let (left_rec, left_ptr) = self.freeze_link(cache, &left, intention, records, delta)?;
        let (right_rec, right_ptr) = self.freeze_link(cache, &right, intention, records, delta)?;

        let off = u16::try_from(delta.len()).map_err(|_| TreeError::DeltaOverflow)?;
        let red = self.arena[idx].red;
        let key = std::mem::take(&mut self.arena[idx].key);
        let val = std::mem::take(&mut self.arena[idx].val);

        records.push(NodeRecord {
            red,
            key: key.clone(),
            val: val.clone(),
            left: left_rec,
            right: right_rec,
        });
        delta.push(Arc::new(Node::new(
            red,
            intention,
            key,
            val,
            left_ptr,
            right_ptr,
        )));
        Ok(off)
    }

    /// Convert the workspace into the immutable delta of the commit at
    /// `intention`: post-order offsets assigned, rid rewritten, fresh child
    /// pointers given intention-kinded addresses.
    ///
    /// A workspace with no structural change republishes a copy of its
    /// source root under the new commit, so every committed intention owns
    /// exactly one after-image (an empty source tree yields an empty one).
    pub fn freeze(&mut self, cache: &NodeCache, intention: Position) -> Result<Frozen, TreeError> {
        let root = match self.base_root() {
            Child::Nil => {
                return Ok(Frozen {
                    after_image: AfterImage {
                        intention,
                        tree: Vec::new(),
                    },
                    delta: Vec::new(),
                    root: NodePtr::nil(),
                })
            }
            root @ Child::Extern(_) => self.make_fresh(cache, &root)?,
            root => root,
        };

        let mut records = Vec::new();
        let mut delta = Vec::new();
        self.freeze_node(cache, root.fresh(), intention, &mut records, &mut delta)?;

        let last = (delta.len() - 1) as u16;
        let root = NodePtr::new(
            &delta[last as usize],
            Some(NodeAddress::Intention {
                pos: intention,
                off: last,
            }),
        );
        cache.update_lru(&mut self.trace);
        Ok(Frozen {
            after_image: AfterImage {
                intention,
                tree: records,
            },
            delta,
            root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemLog;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn test_cache() -> Arc<NodeCache> {
        NodeCache::new(Arc::new(MemLog::new()), 8, usize::MAX)
    }

    fn workspace() -> PersistentTree {
        PersistentTree::new(NodePtr::nil(), -1)
    }

    fn inorder(
        cache: &NodeCache,
        ptr: &NodePtr,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) {
        let mut trace = Vec::new();
        if let Some(node) = ptr.resolve(cache, &mut trace).unwrap() {
            inorder(cache, &node.left, out);
            out.push((node.key().to_vec(), node.val().to_vec()));
            inorder(cache, &node.right, out);
        }
    }

    // black-height, or panic on a red-black violation
    fn check_rb(cache: &NodeCache, ptr: &NodePtr, parent_red: bool) -> usize {
        let mut trace = Vec::new();
        match ptr.resolve(cache, &mut trace).unwrap() {
            None => 1,
            Some(node) => {
                assert!(!(parent_red && node.red()), "red node with red child");
                let lh = check_rb(cache, &node.left, node.red());
                let rh = check_rb(cache, &node.right, node.red());
                assert_eq!(lh, rh, "unequal black heights");
                if node.red() {
                    lh
                } else {
                    lh + 1
                }
            }
        }
    }

    fn freeze_and_check(
        tree: &mut PersistentTree,
        cache: &NodeCache,
        expect: &BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Frozen {
        let frozen = tree.freeze(cache, 0).unwrap();
        let mut trace = Vec::new();
        if let Some(root) = frozen.root.resolve(cache, &mut trace).unwrap() {
            assert!(!root.red(), "root must be black");
        }
        check_rb(cache, &frozen.root, false);
        let mut items = Vec::new();
        inorder(cache, &frozen.root, &mut items);
        let expect: Vec<_> = expect
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(items, expect);
        frozen
    }

    #[test]
    fn empty_tree_get() {
        let cache = test_cache();
        let mut tree = workspace();
        assert_eq!(tree.get(&cache, b"a").unwrap(), None);
        assert!(tree.empty_delta());
        cache.stop();
    }

    #[test]
    fn insert_get_overwrite() {
        let cache = test_cache();
        let mut tree = workspace();
        tree.put(&cache, b"k", b"v1").unwrap();
        assert_eq!(tree.get(&cache, b"k").unwrap(), Some(b"v1".to_vec()));
        tree.put(&cache, b"k", b"v2").unwrap();
        assert_eq!(tree.get(&cache, b"k").unwrap(), Some(b"v2".to_vec()));
        cache.stop();
    }

    #[test]
    fn sorted_insertions_stay_balanced() {
        let cache = test_cache();
        let mut tree = workspace();
        let mut expect = BTreeMap::new();
        for i in 0..128u32 {
            let key = format!("key{i:04}").into_bytes();
            tree.put(&cache, &key, b"v").unwrap();
            expect.insert(key, b"v".to_vec());
        }
        freeze_and_check(&mut tree, &cache, &expect);
        cache.stop();
    }

    #[test]
    fn delete_missing_key_is_a_noop() {
        let cache = test_cache();
        let mut tree = workspace();
        tree.delete(&cache, b"nope").unwrap();
        assert!(tree.empty_delta());
        cache.stop();
    }

    #[test]
    fn delete_down_to_empty() {
        let cache = test_cache();
        let mut tree = workspace();
        for k in [b"b", b"a", b"c"] {
            tree.put(&cache, k, b"v").unwrap();
        }
        for k in [b"a", b"c", b"b"] {
            tree.delete(&cache, k).unwrap();
        }
        assert_eq!(tree.get(&cache, b"b").unwrap(), None);
        let frozen = tree.freeze(&cache, 0).unwrap();
        assert!(frozen.after_image.tree.is_empty());
        assert!(frozen.root.is_nil());
        cache.stop();
    }

    #[test]
    fn randomized_puts_and_deletes_keep_the_invariants() {
        let mut rng = StdRng::seed_from_u64(42);
        for round in 0..20 {
            let cache = test_cache();
            let mut tree = workspace();
            let mut expect = BTreeMap::new();
            for _ in 0..300 {
                let key = format!("k{:03}", rng.gen_range(0..100)).into_bytes();
                if rng.gen_bool(0.3) {
                    tree.delete(&cache, &key).unwrap();
                    expect.remove(&key);
                } else {
                    let val = format!("v{round}").into_bytes();
                    tree.put(&cache, &key, &val).unwrap();
                    expect.insert(key, val);
                }
            }
            for (k, v) in &expect {
                assert_eq!(tree.get(&cache, k).unwrap().as_ref(), Some(v));
            }
            if !expect.is_empty() {
                freeze_and_check(&mut tree, &cache, &expect);
            }
            cache.stop();
        }
    }

    #[test]
    fn freeze_offsets_are_post_order() {
        let cache = test_cache();
        let mut tree = workspace();
        for k in [b"d", b"b", b"f", b"a", b"c", b"e", b"g"] {
            tree.put(&cache, k, b"v").unwrap();
        }
        let frozen = tree.freeze(&cache, 7).unwrap();
        assert_eq!(frozen.after_image.intention, 7);
        assert_eq!(frozen.after_image.tree.len(), frozen.delta.len());
        // children precede parents and the root is last
        for (off, rec) in frozen.after_image.tree.iter().enumerate() {
            for ptr in [&rec.left, &rec.right] {
                if let PtrRecord::Slf { off: child } = ptr {
                    assert!((*child as usize) < off);
                }
            }
        }
        for node in &frozen.delta {
            assert_eq!(node.rid(), 7);
        }
        cache.stop();
    }

    #[test]
    fn empty_delta_freeze_republishes_the_source_root() {
        let cache = test_cache();
        let mut tree = workspace();
        tree.put(&cache, b"x", b"v").unwrap();
        let first = tree.freeze(&cache, 1).unwrap();
        set_delta_position(&first.delta, 1, 2);
        let root = cache.apply_after_image_delta(&first.delta, 2);

        // a workspace over that root with no mutations
        let mut replay = PersistentTree::new(root, -2);
        let frozen = replay.freeze(&cache, 3).unwrap();
        assert_eq!(frozen.after_image.tree.len(), 1);
        assert_eq!(frozen.delta[0].rid(), 3);
        assert_eq!(frozen.delta[0].key(), b"x");
        cache.stop();
    }

    #[test]
    fn set_delta_position_upgrades_self_pointers() {
        let cache = test_cache();
        let mut tree = workspace();
        for k in [b"a", b"b", b"c"] {
            tree.put(&cache, k, b"v").unwrap();
        }
        let frozen = tree.freeze(&cache, 5).unwrap();
        set_delta_position(&frozen.delta, 5, 9);
        for node in &frozen.delta {
            for link in [&node.left, &node.right] {
                if let Some(addr) = link.address() {
                    assert!(addr.is_after_image());
                    assert_eq!(addr.pos(), 9);
                }
            }
        }
        cache.stop();
    }
}
