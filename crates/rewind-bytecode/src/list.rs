//! Instruction arena
//!
//! `InsnList` stores instructions in a stable backing `Vec` and threads them
//! into program order with `prev`/`next` indices. An [`InsnId`] stays valid
//! for the life of the list: inserting, removing or relocating other
//! instructions never changes what an id refers to, so analyses keyed by id
//! survive rewriting.

use crate::insn::{Insn, LabelId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable handle to an instruction in an [`InsnList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnId(u32);

impl InsnId {
    /// Raw arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for InsnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Node {
    insn: Insn,
    prev: Option<InsnId>,
    next: Option<InsnId>,
    linked: bool,
}

/// Ordered instruction sequence backed by an arena
#[derive(Debug, Clone, Default)]
pub struct InsnList {
    nodes: Vec<Node>,
    head: Option<InsnId>,
    tail: Option<InsnId>,
    len: usize,
}

impl InsnList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked instructions
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no instructions are linked
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First instruction in program order
    pub fn first(&self) -> Option<InsnId> {
        self.head
    }

    /// Last instruction in program order
    pub fn last(&self) -> Option<InsnId> {
        self.tail
    }

    /// Instruction following `id`
    pub fn next(&self, id: InsnId) -> Option<InsnId> {
        self.nodes[id.index()].next
    }

    /// Instruction preceding `id`
    pub fn prev(&self, id: InsnId) -> Option<InsnId> {
        self.nodes[id.index()].prev
    }

    /// Whether `id` is currently part of the sequence
    pub fn contains(&self, id: InsnId) -> bool {
        self.nodes.get(id.index()).is_some_and(|n| n.linked)
    }

    /// Instruction behind `id`
    pub fn get(&self, id: InsnId) -> &Insn {
        &self.nodes[id.index()].insn
    }

    /// Mutable instruction behind `id`
    pub fn get_mut(&mut self, id: InsnId) -> &mut Insn {
        &mut self.nodes[id.index()].insn
    }

    fn alloc(&mut self, insn: Insn) -> InsnId {
        let id = InsnId(self.nodes.len() as u32);
        self.nodes.push(Node {
            insn,
            prev: None,
            next: None,
            linked: false,
        });
        id
    }

    fn link_after(&mut self, at: Option<InsnId>, id: InsnId) {
        let next = match at {
            Some(at) => self.nodes[at.index()].next,
            None => self.head,
        };
        {
            let node = &mut self.nodes[id.index()];
            node.prev = at;
            node.next = next;
            node.linked = true;
        }
        match at {
            Some(at) => self.nodes[at.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => self.nodes[next.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    fn unlink(&mut self, id: InsnId) {
        let (prev, next) = {
            let node = &mut self.nodes[id.index()];
            debug_assert!(node.linked, "unlinking detached instruction {}", id);
            node.linked = false;
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.nodes[prev.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next.index()].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Append an instruction
    pub fn push(&mut self, insn: Insn) -> InsnId {
        let id = self.alloc(insn);
        self.link_after(self.tail, id);
        id
    }

    /// Insert `insn` directly before `at`
    pub fn insert_before(&mut self, at: InsnId, insn: Insn) -> InsnId {
        let id = self.alloc(insn);
        let prev = self.prev(at);
        self.link_after(prev, id);
        id
    }

    /// Insert `insn` directly after `at`
    pub fn insert_after(&mut self, at: InsnId, insn: Insn) -> InsnId {
        let id = self.alloc(insn);
        self.link_after(Some(at), id);
        id
    }

    /// Insert a sequence before `at`, keeping its order
    pub fn insert_all_before(&mut self, at: InsnId, insns: impl IntoIterator<Item = Insn>) -> Vec<InsnId> {
        insns.into_iter().map(|insn| self.insert_before(at, insn)).collect()
    }

    /// Detach `id` from the sequence and return its instruction
    ///
    /// The slot keeps a `Nop` so the id is never reused.
    pub fn remove(&mut self, id: InsnId) -> Insn {
        self.unlink(id);
        std::mem::replace(&mut self.nodes[id.index()].insn, Insn::Nop)
    }

    /// Move an already linked instruction so it directly precedes `at`
    pub fn relocate_before(&mut self, id: InsnId, at: InsnId) {
        if id == at {
            return;
        }
        self.unlink(id);
        let prev = self.prev(at);
        self.link_after(prev, id);
    }

    /// Replace the instruction behind `id`, returning the old one
    pub fn replace(&mut self, id: InsnId, insn: Insn) -> Insn {
        std::mem::replace(&mut self.nodes[id.index()].insn, insn)
    }

    /// Iterate `(id, insn)` in program order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Instruction ids in program order
    pub fn ids(&self) -> Vec<InsnId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Map from label to the id of its `Label` instruction
    pub fn label_index(&self) -> FxHashMap<LabelId, InsnId> {
        self.iter()
            .filter_map(|(id, insn)| match insn {
                Insn::Label(label) => Some((*label, id)),
                _ => None,
            })
            .collect()
    }

    /// Clone the instructions into a plain vector, in program order
    pub fn to_vec(&self) -> Vec<Insn> {
        self.iter().map(|(_, insn)| insn.clone()).collect()
    }

    /// Move the instructions out, in program order
    pub fn into_vec(self) -> Vec<Insn> {
        let mut nodes: Vec<Option<Node>> = self.nodes.into_iter().map(Some).collect();
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = nodes[id.index()].take();
            match node {
                Some(node) => {
                    cursor = node.next;
                    out.push(node.insn);
                }
                None => break,
            }
        }
        out
    }
}

impl FromIterator<Insn> for InsnList {
    fn from_iter<I: IntoIterator<Item = Insn>>(iter: I) -> Self {
        let mut list = InsnList::new();
        for insn in iter {
            list.push(insn);
        }
        list
    }
}

impl Extend<Insn> for InsnList {
    fn extend<I: IntoIterator<Item = Insn>>(&mut self, iter: I) {
        for insn in iter {
            self.push(insn);
        }
    }
}

/// Program-order iterator over an [`InsnList`]
pub struct Iter<'a> {
    list: &'a InsnList,
    cursor: Option<InsnId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (InsnId, &'a Insn);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = &self.list.nodes[id.index()];
        self.cursor = node.next;
        Some((id, &node.insn))
    }
}

impl Serialize for InsnList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|(_, insn)| insn))
    }
}

impl<'de> Deserialize<'de> for InsnList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let insns = Vec::<Insn>::deserialize(deserializer)?;
        Ok(insns.into_iter().collect())
    }
}

impl PartialEq for InsnList {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().zip(other.iter()).all(|((_, a), (_, b))| a == b)
    }
}
