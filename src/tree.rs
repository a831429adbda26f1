//! Hierarchical block tree built from the flat tag directory.
//!
//! Structural BLOCK_START / BLOCK_END tags bracket nested regions; a
//! single forward scan with explicit recursion turns the directory into
//! an arena of nodes. Children are owned top-down through indices and the
//! parent is a plain back-index, so there are no ownership cycles.
//!
//! Payloads are not read during construction except for the block type
//! carried by the structural tags and the identity tags, which keeps the
//! build O(records).

use std::io::{Read, Seek};

use crate::error::Result;
use crate::tags::{kind, BlockId, TagRecord, TagStore, Tag};

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct BlockNode {
    pub block_type: i32,
    pub id: Option<BlockId>,
    pub parent_id: Option<BlockId>,
    /// Tags belonging directly to this block.
    pub entries: Vec<TagRecord>,
    /// Direct entry count.
    pub nent: usize,
    /// Records scanned at this level, including structural markers.
    pub nent_tree: usize,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Directory index range `[first, last]` covered by this subtree.
    pub span: (usize, usize),
}

impl BlockNode {
    fn new(block_type: i32, start: usize) -> Self {
        Self {
            block_type,
            id: None,
            parent_id: None,
            entries: Vec::new(),
            nent: 0,
            nent_tree: 0,
            parent: None,
            children: Vec::new(),
            span: (start, start),
        }
    }

    /// Search this node's own entries (not recursive) for a tag kind.
    pub fn entry_of_kind(&self, findkind: i32) -> Option<&TagRecord> {
        self.entries.iter().find(|rec| rec.kind == findkind)
    }

    pub fn has_entry(&self, findkind: i32) -> bool {
        self.entry_of_kind(findkind).is_some()
    }
}

pub struct BlockTree {
    nodes: Vec<BlockNode>,
    root: NodeId,
}

impl BlockTree {
    /// Build the tree from the store's directory. Truncated or unbalanced
    /// input yields a partial tree rather than an error; callers decide
    /// whether a missing tag is fatal.
    pub fn build<R: Read + Seek>(store: &mut TagStore<R>) -> Result<Self> {
        let dir: Vec<TagRecord> = store.directory().to_vec();
        let mut nodes = Vec::new();
        let root = Self::make_subtree(store, &dir, &mut nodes, 0)?.0;
        Ok(Self { nodes, root })
    }

    fn make_subtree<R: Read + Seek>(
        store: &mut TagStore<R>,
        dir: &[TagRecord],
        nodes: &mut Vec<BlockNode>,
        start: usize,
    ) -> Result<(NodeId, usize)> {
        let block_type = if !dir.is_empty() && dir[start].kind == kind::BLOCK_START {
            store.read_at(dir[start].pos)?.as_i32()?
        } else {
            0
        };

        let id = nodes.len();
        nodes.push(BlockNode::new(block_type, start));

        let mut current = start;
        while current < dir.len() {
            nodes[id].nent_tree += 1;
            let rec = dir[current];
            if rec.kind == kind::BLOCK_START {
                if current != start {
                    let (child, stopped) = Self::make_subtree(store, dir, nodes, current)?;
                    nodes[child].parent = Some(id);
                    nodes[id].children.push(child);
                    current = stopped;
                }
            } else if rec.kind == kind::BLOCK_END {
                // Stop only when this end matches the open block; a stray
                // end tag is kept as an ordinary entry.
                if store.read_at(rec.pos)?.as_i32()? == nodes[id].block_type {
                    break;
                }
                nodes[id].nent += 1;
                nodes[id].entries.push(rec);
            } else {
                nodes[id].nent += 1;
                nodes[id].entries.push(rec);
                Self::capture_identity(store, &mut nodes[id], block_type, &rec)?;
            }
            current += 1;
        }

        if nodes[id].nent == 0 {
            nodes[id].entries.clear();
        }
        nodes[id].span = (start, current.min(dir.len().saturating_sub(1)));
        Ok((id, current))
    }

    fn capture_identity<R: Read + Seek>(
        store: &mut TagStore<R>,
        node: &mut BlockNode,
        block_type: i32,
        rec: &TagRecord,
    ) -> Result<()> {
        if block_type == 0 {
            if rec.kind == kind::FILE_ID {
                node.id = Some(store.read_at(rec.pos)?.as_id()?);
            }
        } else if rec.kind == kind::BLOCK_ID {
            node.id = Some(store.read_at(rec.pos)?.as_id()?);
        } else if rec.kind == kind::PARENT_BLOCK_ID {
            node.parent_id = Some(store.read_at(rec.pos)?.as_id()?);
        }
        Ok(())
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &BlockNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first search for nodes of a block type, including `from`.
    pub fn find_by_type(&self, from: NodeId, block_type: i32) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_by_type(from, block_type, &mut out);
        out
    }

    fn collect_by_type(&self, at: NodeId, block_type: i32, out: &mut Vec<NodeId>) {
        if self.nodes[at].block_type == block_type {
            out.push(at);
        }
        for &child in &self.nodes[at].children {
            self.collect_by_type(child, block_type, out);
        }
    }

    /// Whether a block of the given type exists anywhere under `from`.
    pub fn has_type(&self, from: NodeId, block_type: i32) -> bool {
        if self.nodes[from].block_type == block_type {
            return true;
        }
        self.nodes[from]
            .children
            .iter()
            .any(|&child| self.has_type(child, block_type))
    }

    /// Read the first tag of the given kind among a node's own entries.
    pub fn find_tag<R: Read + Seek>(
        &self,
        store: &mut TagStore<R>,
        node: NodeId,
        findkind: i32,
    ) -> Result<Option<Tag>> {
        match self.nodes[node].entry_of_kind(findkind) {
            Some(rec) => Ok(Some(store.read_at(rec.pos)?)),
            None => Ok(None),
        }
    }
}
