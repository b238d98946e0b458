use crate::error::{Error, Result};
use std::fmt::{Display, Formatter};

pub mod cluster;
pub mod collapse;
pub mod flat;
mod tip;

pub use tip::AttachmentLedger;

/// An index into the tree's node arena. The newtype ensures node indices and
/// haplotype identifiers aren't mixed up.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct NodeId(u32);

impl NodeId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    /// Get the underlying value of the node index.
    pub fn unwrap(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a haplotype. Haplotypes share the tip index space: tip `i`
/// represents haplotype `i`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct HaploId(u32);

impl HaploId {
    pub fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn unwrap(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }

    /// The tip node representing this haplotype.
    pub fn tip(&self) -> NodeId {
        NodeId(self.0)
    }
}

impl Display for HaploId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node of the quasi-species tree. Tips carry an [`AttachmentLedger`] and a
/// taxon label; internal nodes carry neither. All nodes carry the haplotype
/// annotations derived after construction: `haplo_above` marks the branch
/// above this node as the start of a haplotype's lineage, `continuing_haplo`
/// marks a haplotype passing through this node without branching.
#[derive(Clone, Debug, PartialEq)]
pub struct QuasiSpeciesNode {
    pub(crate) height: f64,
    pub(crate) parent: Option<NodeId>,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    pub(crate) haplo_above: Option<HaploId>,
    pub(crate) continuing_haplo: Option<HaploId>,
    pub(crate) start_branch_count: usize,
    pub(crate) dirty: bool,
    pub(crate) ledger: Option<AttachmentLedger>,
    pub(crate) label: Option<String>,
}

impl QuasiSpeciesNode {
    pub(crate) fn tip(height: f64, label: String, ledger: AttachmentLedger) -> Self {
        Self {
            height,
            parent: None,
            left: None,
            right: None,
            haplo_above: None,
            continuing_haplo: None,
            start_branch_count: 0,
            dirty: true,
            ledger: Some(ledger),
            label: Some(label),
        }
    }

    pub(crate) fn internal(height: f64, left: NodeId, right: NodeId) -> Self {
        Self {
            height,
            parent: None,
            left: Some(left),
            right: Some(right),
            haplo_above: None,
            continuing_haplo: None,
            start_branch_count: 0,
            dirty: true,
            ledger: None,
            label: None,
        }
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn left(&self) -> Option<NodeId> {
        self.left
    }

    pub fn right(&self) -> Option<NodeId> {
        self.right
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none()
    }

    pub fn haplo_above(&self) -> Option<HaploId> {
        self.haplo_above
    }

    pub fn continuing_haplo(&self) -> Option<HaploId> {
        self.continuing_haplo
    }

    /// Number of lineage branches of the continuing haplotype on which a
    /// subtree could attach below this node. Consumed by proposal mechanisms,
    /// not by the likelihood.
    pub fn start_branch_count(&self) -> usize {
        self.start_branch_count
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn ledger(&self) -> Option<&AttachmentLedger> {
        self.ledger.as_ref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// A quasi-species tree: tips are unique haplotypes, duplicate samples are
/// folded into the per-tip [`AttachmentLedger`]s. The arena keeps a shadow
/// copy of every node so that proposal-driven mutation is reversible with a
/// bulk copy on [`store`](Self::store) and a swap on
/// [`restore`](Self::restore).
///
/// Tips occupy indices `0..leaf_count`; internal nodes are numbered in
/// post-order with the root holding the largest index.
#[derive(Clone, Debug)]
pub struct QuasiSpeciesTree {
    nodes: Vec<QuasiSpeciesNode>,
    stored_nodes: Vec<QuasiSpeciesNode>,
    root: NodeId,
    origin: f64,
    leaf_count: usize,
}

impl QuasiSpeciesTree {
    /// Assemble a tree from a finished node arena. The caller guarantees the
    /// numbering convention (tips first, internal nodes post-order); the
    /// annotation passes are run here.
    ///
    /// Returns [`Error::OriginBelowRoot`] if the origin does not lie strictly
    /// above the root.
    pub(crate) fn from_arena(
        nodes: Vec<QuasiSpeciesNode>,
        root: NodeId,
        leaf_count: usize,
        origin: f64,
    ) -> Result<Self> {
        let root_height = nodes[root.index()].height;
        if origin <= root_height {
            return Err(Error::OriginBelowRoot {
                origin,
                root_height,
            });
        }
        let stored_nodes = nodes.clone();
        let mut tree = Self {
            nodes,
            stored_nodes,
            root,
            origin,
            leaf_count,
        };
        tree.assign_continuing_and_haplo_above();
        tree.fill_parent_haplo();
        tree.count_start_branches();
        tree.store();
        Ok(tree)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn internal_count(&self) -> usize {
        self.nodes.len() - self.leaf_count
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn origin(&self) -> f64 {
        self.origin
    }

    pub fn root_height(&self) -> f64 {
        self.nodes[self.root.index()].height
    }

    pub fn node(&self, id: NodeId) -> &QuasiSpeciesNode {
        &self.nodes[id.index()]
    }

    /// All haplotype identifiers of the tree.
    pub fn haplotypes(&self) -> impl Iterator<Item = HaploId> {
        (0..self.leaf_count).map(HaploId::from_usize)
    }

    pub fn ledger(&self, haplo: HaploId) -> &AttachmentLedger {
        self.nodes[haplo.index()]
            .ledger
            .as_ref()
            .expect("tip node carries no ledger")
    }

    /// Total sample count of a haplotype. Equals the length of its
    /// attachment-times list outside transient construction.
    pub fn haplo_count(&self, haplo: HaploId) -> usize {
        self.ledger(haplo).total_count()
    }

    /// Number of duplicate attachment events across all haplotypes (total
    /// samples minus one lineage start per haplotype).
    pub fn total_attachment_counts(&self) -> usize {
        self.haplotypes()
            .map(|h| self.haplo_count(h) - 1)
            .sum()
    }

    /// Update a node height, marking the node and its children dirty (their
    /// branch transition matrices depend on this height).
    pub fn set_height(&mut self, id: NodeId, height: f64) {
        self.nodes[id.index()].height = height;
        self.nodes[id.index()].dirty = true;
        let (left, right) = (self.nodes[id.index()].left, self.nodes[id.index()].right);
        if let Some(c) = left {
            self.nodes[c.index()].dirty = true;
        }
        if let Some(c) = right {
            self.nodes[c.index()].dirty = true;
        }
    }

    /// Mutable access to a haplotype's ledger. Marks the tip and the node
    /// carrying the haplotype's start branch dirty, since the lineage-start
    /// height feeds both transition matrices.
    pub fn ledger_mut(&mut self, haplo: HaploId) -> &mut AttachmentLedger {
        self.nodes[haplo.index()].dirty = true;
        if let Some(start) = self.haplo_start_node(haplo) {
            self.nodes[start.index()].dirty = true;
        }
        self.nodes[haplo.index()]
            .ledger
            .as_mut()
            .expect("tip node carries no ledger")
    }

    /// The node whose branch above carries the haplotype's lineage start.
    pub fn haplo_start_node(&self, haplo: HaploId) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.haplo_above == Some(haplo))
            .map(NodeId::from_usize)
    }

    pub fn make_all_dirty(&mut self) {
        for node in &mut self.nodes {
            node.dirty = true;
        }
    }

    pub fn make_all_clean(&mut self) {
        for node in &mut self.nodes {
            node.dirty = false;
        }
    }

    /// Snapshot the current node arena into the shadow arena (bulk copy).
    pub fn store(&mut self) {
        self.stored_nodes.clone_from(&self.nodes);
    }

    /// Discard the current node arena in favor of the last stored snapshot
    /// (swap, no allocation). Everything is clean afterwards: the numerical
    /// buffers are restored alongside by the engine.
    pub fn restore(&mut self) {
        std::mem::swap(&mut self.nodes, &mut self.stored_nodes);
        self.make_all_clean();
    }

    /// Node indices in post-order (children before parents, root last).
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded || self.nodes[id.index()].is_leaf() {
                order.push(id);
            } else {
                stack.push((id, true));
                if let Some(r) = self.nodes[id.index()].right {
                    stack.push((r, false));
                }
                if let Some(l) = self.nodes[id.index()].left {
                    stack.push((l, false));
                }
            }
        }
        order
    }

    /// Walk upward from each tip while the parent lies strictly below the
    /// tip's lineage-start height, marking the haplotype as continuing
    /// through every visited node; the first node whose parent reaches the
    /// start height (or the root) receives the haplo-above mark.
    pub(crate) fn assign_continuing_and_haplo_above(&mut self) {
        for node in &mut self.nodes {
            node.haplo_above = None;
            node.continuing_haplo = None;
        }
        for tip in 0..self.leaf_count {
            let haplo = HaploId::from_usize(tip);
            let start = self.ledger(haplo).lineage_start();
            let mut current = NodeId::from_usize(tip);
            loop {
                self.nodes[current.index()].continuing_haplo = Some(haplo);
                match self.nodes[current.index()].parent {
                    Some(parent) if self.nodes[parent.index()].height < start => current = parent,
                    _ => break,
                }
            }
            self.nodes[current.index()].haplo_above = Some(haplo);
        }
    }

    /// Pre-order pass from the root assigning each haplotype the haplotype
    /// it arises from: the haplotype carried on the branch directly above
    /// its start branch, or none for a haplotype starting on the
    /// root-origin branch.
    pub(crate) fn fill_parent_haplo(&mut self) {
        let mut stack = vec![(self.root, None::<HaploId>)];
        while let Some((id, mut current)) = stack.pop() {
            if let Some(haplo) = self.nodes[id.index()].haplo_above {
                self.nodes[haplo.index()]
                    .ledger
                    .as_mut()
                    .expect("tip node carries no ledger")
                    .set_parent_haplo(current);
                current = Some(haplo);
            }
            if let Some(l) = self.nodes[id.index()].left {
                stack.push((l, current));
            }
            if let Some(r) = self.nodes[id.index()].right {
                stack.push((r, current));
            }
        }
    }

    /// Cache, per internal node, the number of continuing-haplotype branches
    /// a subtree could attach to below it: the duplicate count of sampling
    /// events below the node's height, or one where no haplotype continues.
    pub(crate) fn count_start_branches(&mut self) {
        for i in self.leaf_count..self.nodes.len() {
            let count = match self.nodes[i].continuing_haplo {
                Some(haplo) => self
                    .ledger(haplo)
                    .count_possible_attachment_branches(0.0, self.nodes[i].height),
                None => 1,
            };
            self.nodes[i].start_branch_count = count;
        }
    }
}
