//! Handle arena
//!
//! Every engine transaction a connection has open lives in one slot of the
//! connection's arena. Slots record the parent slot and a count of open
//! children, which is all the coordinator needs to answer "does this handle
//! still have something nested under it" and to resolve a subtree deepest
//! first.
//!
//! Slot ids carry a generation so an id kept past the removal of its slot
//! never aliases whatever is stored there next.

use keel_core::TxnHandle;

/// Generation-checked index into a [`HandleArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

/// One open engine transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnNode {
    /// Environment handle
    pub handle: TxnHandle,
    /// Slot of the parent transaction, if nested
    pub parent: Option<SlotId>,
    /// Number of live slots whose parent is this one
    pub open_children: usize,
    /// True once the environment has prepared the handle
    pub prepared: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<TxnNode>,
}

/// Arena of the transactions open on one connection
#[derive(Debug, Default)]
pub struct HandleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl HandleArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle, nested under `parent` when given.
    ///
    /// A stale parent id is ignored and the node is stored as top-level.
    pub fn insert(&mut self, handle: TxnHandle, parent: Option<SlotId>) -> SlotId {
        let parent = parent.filter(|p| self.contains(*p));
        if let Some(p) = parent {
            if let Some(node) = self.get_mut(p) {
                node.open_children += 1;
            }
        }
        let node = TxnNode {
            handle,
            parent,
            open_children: 0,
            prepared: false,
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                SlotId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                SlotId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// Node stored at `id`, if still live
    pub fn get(&self, id: SlotId) -> Option<&TxnNode> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    /// Mutable node stored at `id`, if still live
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut TxnNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// True if `id` names a live slot
    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Handle stored at `id`
    pub fn handle(&self, id: SlotId) -> Option<TxnHandle> {
        self.get(id).map(|n| n.handle)
    }

    /// True if a live slot is nested directly under `id`
    pub fn has_open_child(&self, id: SlotId) -> bool {
        self.get(id).map(|n| n.open_children > 0).unwrap_or(false)
    }

    /// Remove a slot, releasing it in its parent's child count.
    ///
    /// The caller removes children first; a slot removed while it still has
    /// children leaves them as orphans with a dangling parent id.
    pub fn remove(&mut self, id: SlotId) -> Option<TxnNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        if let Some(p) = node.parent {
            if let Some(parent) = self.get_mut(p) {
                parent.open_children = parent.open_children.saturating_sub(1);
            }
        }
        Some(node)
    }

    /// Nesting depth of `id` (top-level is zero)
    pub fn depth(&self, id: SlotId) -> usize {
        let mut depth = 0;
        let mut cursor = self.get(id).and_then(|n| n.parent);
        while let Some(p) = cursor {
            depth += 1;
            cursor = self.get(p).and_then(|n| n.parent);
        }
        depth
    }

    /// True if `ancestor` is a strict ancestor of `id`
    pub fn is_ancestor(&self, ancestor: SlotId, id: SlotId) -> bool {
        let mut cursor = self.get(id).and_then(|n| n.parent);
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = self.get(p).and_then(|n| n.parent);
        }
        false
    }

    /// Every live descendant of `id`, deepest first.
    ///
    /// Resolving the returned slots in order never leaves a parent resolved
    /// before its children.
    pub fn descendants_deepest_first(&self, id: SlotId) -> Vec<SlotId> {
        let mut found: Vec<(usize, SlotId)> = self
            .iter()
            .filter(|(slot, _)| self.is_ancestor(id, *slot))
            .map(|(slot, _)| (self.depth(slot), slot))
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Iterate live slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &TxnNode)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|node| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    node,
                )
            })
        })
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.live
    }

    /// True when no slot is live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop every slot
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.live = 0;
    }
}
