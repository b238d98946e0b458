//! Collapsing a fully-resolved sample tree into the haplotype-tip
//! representation: tips with character-identical sequences are folded into a
//! single tip whose ledger records the sampling times, duplicate counts and
//! the heights at which the duplicate lineages rejoin the haplotype branch.

use crate::alignment::Alignment;
use crate::error::{Error, Result};
use crate::tree::{AttachmentLedger, NodeId, QuasiSpeciesNode, QuasiSpeciesTree};
use std::collections::HashMap;
use tracing::debug;

/// A fully-resolved input topology over individual samples: the backbone from
/// which the quasi-species tree is collapsed. Built bottom-up with
/// [`leaf`](Self::leaf) and [`join`](Self::join); the last join becomes the
/// root.
#[derive(Clone, Debug, Default)]
pub struct Backbone {
    heights: Vec<f64>,
    children: Vec<Option<(usize, usize)>>,
    labels: Vec<Option<String>>,
    root: usize,
}

impl Backbone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sampled tip at the given height. Returns its backbone index.
    pub fn leaf(&mut self, label: &str, height: f64) -> usize {
        self.heights.push(height);
        self.children.push(None);
        self.labels.push(Some(label.to_string()));
        self.root = self.heights.len() - 1;
        self.root
    }

    /// Join two subtrees at the given height. Returns the new node's index.
    pub fn join(&mut self, left: usize, right: usize, height: f64) -> usize {
        self.heights.push(height);
        self.children.push(Some((left, right)));
        self.labels.push(None);
        self.root = self.heights.len() - 1;
        self.root
    }

    fn label(&self, node: usize) -> &str {
        self.labels[node].as_deref().expect("backbone leaf has no label")
    }
}

/// Result of collapsing one backbone subtree: the highest genuine node of the
/// collapsed subtree (none if the subtree dissolved entirely into a
/// previously seen haplotype), the haplotypes present in the subtree, and the
/// haplotype the subtree is a duplicate of, if any.
struct Collapsed {
    node: Option<usize>,
    haplos: Vec<usize>,
    fake: Option<usize>,
}

/// Scratch state threaded through the post-order collapse.
struct Collapser<'a> {
    backbone: &'a Backbone,
    alignment: &'a Alignment,
    counts: Option<&'a HashMap<String, usize>>,
    distances: Vec<Vec<f64>>,
    /// Scratch arena of quasi-species nodes; parent links are kept live so
    /// splicing can walk upward.
    arena: Vec<QuasiSpeciesNode>,
    /// Scratch indices of the unique-haplotype tips, in discovery order.
    tips: Vec<usize>,
    /// Alignment row of each discovered haplotype, parallel to `tips`.
    seen_rows: Vec<usize>,
}

impl QuasiSpeciesTree {
    /// Collapse a fully-resolved backbone tree into a quasi-species tree.
    ///
    /// With `counts = None` every backbone tip is a single sample and
    /// repeated sampling times of a haplotype accumulate into its duplicate
    /// counts. With explicit per-taxon counts, each backbone tip already
    /// stands for that many samples; two character-identical tips at the same
    /// height are then rejected ([`Error::DuplicateAtIdenticalHeight`]), and
    /// the latent attachment heights are synthesized from the counts instead
    /// of read off the backbone join heights.
    ///
    /// Fails with [`Error::NonMonophyletic`] if a haplotype's samples do not
    /// form one uninterrupted lineage in the backbone.
    pub fn collapse_backbone(
        backbone: &Backbone,
        alignment: &Alignment,
        counts: Option<&HashMap<String, usize>>,
        origin: f64,
    ) -> Result<Self> {
        let mut collapser = Collapser {
            backbone,
            alignment,
            counts,
            distances: alignment.distance_matrix(),
            arena: Vec::new(),
            tips: Vec::new(),
            seen_rows: Vec::new(),
        };
        let result = collapser.collapse(backbone.root)?;
        let root = result
            .node
            .expect("collapse must yield at least one genuine node");
        debug!(
            haplotypes = collapser.tips.len(),
            samples = backbone.labels.iter().filter(|l| l.is_some()).count(),
            "collapsed backbone"
        );
        collapser.finish_ledgers(root, origin);
        collapser.into_tree(root, origin)
    }
}

impl Collapser<'_> {
    /// Post-order collapse of one backbone subtree.
    fn collapse(&mut self, node: usize) -> Result<Collapsed> {
        match self.backbone.children[node] {
            None => self.collapse_leaf(node),
            Some((left, right)) => self.collapse_internal(node, left, right),
        }
    }

    fn collapse_leaf(&mut self, node: usize) -> Result<Collapsed> {
        let label = self.backbone.label(node);
        let height = self.backbone.heights[node];
        let row = self.alignment.taxon_index(label)?;

        // a zero pairwise distance to a seen haplotype makes this tip a
        // duplicate of it
        for i in 0..self.seen_rows.len() {
            if self.distances[row][self.seen_rows[i]] != 0.0 {
                continue;
            }
            let tip = &mut self.arena[self.tips[i]];
            // the representative tip is the most recently sampled one, with
            // the lexicographically smallest label as tie breaker
            if height < tip.height
                || (height == tip.height && tip.label.as_deref() > Some(label))
            {
                tip.height = height;
                tip.label = Some(label.to_string());
            }
            let ledger = tip.ledger.as_mut().expect("tip node carries no ledger");
            if let Some(counts) = self.counts {
                if !ledger.push_tip_time(height, *counts.get(label).unwrap_or(&1)) {
                    return Err(Error::DuplicateAtIdenticalHeight {
                        first: tip.label.clone().unwrap_or_default(),
                        second: label.to_string(),
                        height,
                    });
                }
            } else {
                ledger.bump_tip_time(height);
            }
            return Ok(Collapsed {
                node: None,
                haplos: vec![i],
                fake: Some(i),
            });
        }

        // a new haplotype: the attachment list gets one slot per
        // character-identical row of the alignment
        let group_size = self.distances[row].iter().filter(|&&d| d == 0.0).count();
        let initial_count = match self.counts {
            Some(counts) => *counts.get(label).unwrap_or(&1),
            None => 1,
        };
        let ledger = AttachmentLedger::new(group_size, height, initial_count);
        let scratch = self.arena.len();
        self.arena
            .push(QuasiSpeciesNode::tip(height, label.to_string(), ledger));
        let index = self.tips.len();
        self.tips.push(scratch);
        self.seen_rows.push(row);
        Ok(Collapsed {
            node: Some(scratch),
            haplos: vec![index],
            fake: None,
        })
    }

    fn collapse_internal(&mut self, node: usize, left: usize, right: usize) -> Result<Collapsed> {
        let left_out = self.collapse(left)?;
        let right_out = self.collapse(right)?;
        let height = self.backbone.heights[node];

        let shared: Vec<usize> = left_out
            .haplos
            .iter()
            .copied()
            .filter(|h| right_out.haplos.contains(h))
            .collect();

        if shared.len() > 1 {
            return Err(Error::NonMonophyletic {
                haplotypes: shared.iter().map(|&h| h as u32).collect(),
                height,
            });
        }

        if let Some(&haplo) = shared.first() {
            // a duplicate lineage rejoins its haplotype here: record the
            // join height and dissolve the node
            self.arena[self.tips[haplo]]
                .ledger
                .as_mut()
                .expect("tip node carries no ledger")
                .record_attachment(height);

            let mut haplos = left_out.haplos;
            haplos.extend(right_out.haplos);
            let first = haplos.iter().position(|&h| h == haplo).unwrap();
            haplos.remove(first);

            let result = match (left_out.node, right_out.node) {
                (None, None) => None,
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (Some(l), Some(r)) => {
                    if self.arena[l].height > self.arena[r].height {
                        Some(l)
                    } else {
                        Some(r)
                    }
                }
            };
            let fake = match (left_out.fake, right_out.fake) {
                (None, Some(f)) | (Some(f), None) if f == haplo => None,
                (Some(l), Some(r)) if l == haplo && r == haplo => Some(haplo),
                // a second haplotype's duplicates thread through this join,
                // so at least one of them is interrupted
                _ => {
                    return Err(Error::NonMonophyletic {
                        haplotypes: vec![haplo as u32],
                        height,
                    })
                }
            };
            return Ok(Collapsed {
                node: result,
                haplos,
                fake,
            });
        }

        // genuine branch point
        let mut haplos = left_out.haplos;
        haplos.extend(right_out.haplos);

        if let Some((fake, to_place)) = match (left_out.fake, right_out.fake) {
            (Some(f), _) => Some((f, right_out.node)),
            (None, Some(f)) => Some((f, left_out.node)),
            (None, None) => None,
        } {
            // one side fully dissolved into a seen haplotype: splice the
            // other side onto that haplotype's lineage branch at the
            // height-ordered insertion point
            let Some(to_place) = to_place else {
                // both sides dissolved, into different haplotypes; neither
                // lineage runs uninterrupted through this branch point
                let haplotypes = [left_out.fake, right_out.fake]
                    .into_iter()
                    .flatten()
                    .map(|h| h as u32)
                    .collect();
                return Err(Error::NonMonophyletic { haplotypes, height });
            };
            let mut above = Some(self.tips[fake]);
            let mut below = self.tips[fake];
            while let Some(current) = above {
                if self.arena[current].height >= height {
                    break;
                }
                below = current;
                above = self.arena[current].parent.map(|p| p.index());
            }
            let spliced = self.arena.len();
            let mut internal = QuasiSpeciesNode::internal(
                height,
                NodeId::from_usize(below),
                NodeId::from_usize(to_place),
            );
            internal.parent = above.map(NodeId::from_usize);
            self.arena.push(internal);
            self.arena[below].parent = Some(NodeId::from_usize(spliced));
            self.arena[to_place].parent = Some(NodeId::from_usize(spliced));
            if let Some(parent) = above {
                if self.arena[parent].left == Some(NodeId::from_usize(below)) {
                    self.arena[parent].left = Some(NodeId::from_usize(spliced));
                } else {
                    self.arena[parent].right = Some(NodeId::from_usize(spliced));
                }
                // the spliced subtree hangs below the walked-to ancestor;
                // nothing new to report upward
                Ok(Collapsed {
                    node: None,
                    haplos,
                    fake: Some(fake),
                })
            } else {
                Ok(Collapsed {
                    node: Some(spliced),
                    haplos,
                    fake: Some(fake),
                })
            }
        } else {
            let (l, r) = (
                left_out.node.expect("genuine subtree without node"),
                right_out.node.expect("genuine subtree without node"),
            );
            let scratch = self.arena.len();
            self.arena.push(QuasiSpeciesNode::internal(
                height,
                NodeId::from_usize(l),
                NodeId::from_usize(r),
            ));
            self.arena[l].parent = Some(NodeId::from_usize(scratch));
            self.arena[r].parent = Some(NodeId::from_usize(scratch));
            Ok(Collapsed {
                node: Some(scratch),
                haplos,
                fake: None,
            })
        }
    }

    /// Bring every ledger into its invariant form. With explicit counts the
    /// attachment heights recorded off the backbone are discarded and
    /// re-synthesized from the duplicate counts; without counts the join
    /// heights are kept and the remaining placeholder becomes the lineage
    /// start.
    fn finish_ledgers(&mut self, root: usize, origin: f64) {
        let single_tip = self.tips.len() == 1 && self.arena[root].is_leaf();
        for &tip in &self.tips {
            let enclosing = match self.arena[tip].parent {
                Some(parent) if !single_tip => self.arena[parent.index()].height,
                _ => origin,
            };
            let ledger = self.arena[tip]
                .ledger
                .as_mut()
                .expect("tip node carries no ledger");
            ledger.sort_tip_times();
            if self.counts.is_some() {
                ledger.synthesize_attachment_times(enclosing);
            } else {
                ledger.set_first_entry_and_sort();
            }
        }
    }

    /// Renumber the scratch arena into the tree convention (tips in
    /// discovery order, internal nodes post-order with the root largest) and
    /// assemble the tree.
    fn into_tree(self, root: usize, origin: f64) -> Result<QuasiSpeciesTree> {
        let leaf_count = self.tips.len();
        let mut mapping = vec![usize::MAX; self.arena.len()];
        for (index, &tip) in self.tips.iter().enumerate() {
            mapping[tip] = index;
        }
        let mut next_internal = leaf_count;
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if self.arena[id].is_leaf() {
                continue;
            }
            if expanded {
                mapping[id] = next_internal;
                next_internal += 1;
            } else {
                stack.push((id, true));
                if let Some(r) = self.arena[id].right {
                    stack.push((r.index(), false));
                }
                if let Some(l) = self.arena[id].left {
                    stack.push((l.index(), false));
                }
            }
        }

        let remap = |id: Option<NodeId>| id.map(|n| NodeId::from_usize(mapping[n.index()]));
        let mut nodes = vec![None; next_internal];
        for (scratch, node) in self.arena.into_iter().enumerate() {
            let target = mapping[scratch];
            if target == usize::MAX {
                continue;
            }
            let mut node = node;
            node.parent = remap(node.parent);
            node.left = remap(node.left);
            node.right = remap(node.right);
            nodes[target] = Some(node);
        }
        let nodes: Vec<QuasiSpeciesNode> = nodes
            .into_iter()
            .map(|n| n.expect("renumbering left a hole in the arena"))
            .collect();
        QuasiSpeciesTree::from_arena(
            nodes,
            NodeId::from_usize(mapping[root]),
            leaf_count,
            origin,
        )
    }
}
